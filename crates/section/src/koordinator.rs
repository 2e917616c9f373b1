//! SectionCoordinator – Bindet Sektion, Kanalsatz, Hub-Gruppe und Worker
//!
//! Der Koordinator fuehrt jede Sektion durch ihren Lebenszyklus (siehe
//! [`SektionZustand`]): Kanal-Bereitstellung, Token-Erwerb, gestaffelter
//! Worker-Start, das Aktiv-Gate am Hub, gezielte Reparatur bei
//! Rollenverlust und das idempotente Stoppen. Nach aussen spricht er nur
//! ueber [`RundfunkEvent`]s.
//!
//! ## Fehler-Weitergabe
//! - Bereitstellungsfehler und Token-Erschoepfung einer Pflichtrolle sind
//!   die einzigen harten Startfehler
//! - Teilkapazitaet und endgueltige Receiver-Verluste sind Hinweise, keine
//!   Fehler
//! - Nur ein Forwarder-Verlust jenseits der Neustart-Policy degradiert
//!   die Sektion

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use rundfunk_core::{
    KanalSatz, Result, RundfunkError, RundfunkEvent, SectionId, WorkerId, WorkerRolle,
};
use rundfunk_relay::{HubEreignis, RelayHub};
use rundfunk_supervisor::{ProcessSupervisor, SpawnKontext, SupervisorEreignis, WorkerToken};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::provisioner::ChannelProvisioner;
use crate::zustand::{uebergang, SektionZustand};

// ---------------------------------------------------------------------------
// Einstellungen
// ---------------------------------------------------------------------------

/// Laufzeit-Einstellungen des Koordinators
#[derive(Debug, Clone)]
pub struct SektionEinstellungen {
    /// Receiver-Anzahl wenn der Aufrufer keine nennt
    pub standard_empfaenger: usize,
    /// Receiver-Starts pro Staffel
    pub batch_groesse: usize,
    /// Pause zwischen zwei Staffeln
    pub batch_pause: Duration,
    /// Frist vom Worker-Start bis zum Aktiv-Gate (Forwarder + 1 Receiver
    /// am Hub registriert)
    pub start_frist: Duration,
    /// Relay-Endpunkt der den Workern mitgegeben wird
    pub relay_adresse: String,
}

impl Default for SektionEinstellungen {
    fn default() -> Self {
        Self {
            standard_empfaenger: 2,
            batch_groesse: 10,
            batch_pause: Duration::from_secs(2),
            start_frist: Duration::from_secs(30),
            relay_adresse: "127.0.0.1:7400".into(),
        }
    }
}

/// Abtastintervall des Aktiv-Gates
const GATE_INTERVALL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Sektionsbestand
// ---------------------------------------------------------------------------

/// Eine Sektion im aktiven Bestand (nur der Koordinator mutiert sie)
struct Sektion {
    name: String,
    zustand: SektionZustand,
    gewuenschte_empfaenger: usize,
    kanaele: Option<KanalSatz>,
    erstellt_um: DateTime<Utc>,
    forwarder: Option<WorkerId>,
    empfaenger: Vec<WorkerId>,
    /// Bricht laufende Erwerb-/Startvorgaenge dieser Sektion ab
    stop_tx: watch::Sender<bool>,
}

/// Momentaufnahme einer Sektion fuer Kommando-Schicht und Tests
#[derive(Debug, Clone)]
pub struct SektionInfo {
    pub id: SectionId,
    pub name: String,
    pub zustand: SektionZustand,
    pub gewuenschte_empfaenger: usize,
    pub forwarder: Option<WorkerId>,
    pub empfaenger: Vec<WorkerId>,
    /// Am Hub registrierte, verbundene Receiver
    pub empfaenger_aktiv: usize,
    pub forwarder_aktiv: bool,
    pub erstellt_um: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SectionCoordinator
// ---------------------------------------------------------------------------

struct KoordinatorInner {
    einstellungen: SektionEinstellungen,
    sektionen: DashMap<SectionId, Sektion>,
    hub: RelayHub,
    supervisor: ProcessSupervisor,
    provisioner: Arc<dyn ChannelProvisioner>,
    ereignis_tx: mpsc::UnboundedSender<RundfunkEvent>,
}

/// Oberste Zustandsmaschine ueber allen Sektionen
///
/// Thread-safe und `Clone`-faehig (innerer Arc). Hub und Supervisor
/// werden als Referenzen hereingereicht, nicht als Singletons gezogen.
#[derive(Clone)]
pub struct SectionCoordinator {
    inner: Arc<KoordinatorInner>,
}

impl SectionCoordinator {
    /// Erstellt einen Koordinator samt Ereigniskanal
    pub fn neu(
        hub: RelayHub,
        supervisor: ProcessSupervisor,
        provisioner: Arc<dyn ChannelProvisioner>,
        einstellungen: SektionEinstellungen,
    ) -> (Self, mpsc::UnboundedReceiver<RundfunkEvent>) {
        let (ereignis_tx, ereignis_rx) = mpsc::unbounded_channel();
        let koordinator = Self {
            inner: Arc::new(KoordinatorInner {
                einstellungen,
                sektionen: DashMap::new(),
                hub,
                supervisor,
                provisioner,
                ereignis_tx,
            }),
        };
        (koordinator, ereignis_rx)
    }

    // -----------------------------------------------------------------------
    // Erstellen & Starten
    // -----------------------------------------------------------------------

    /// Legt eine Sektion an und fuehrt sie bis ACTIVE
    ///
    /// Ablauf: CREATED -> PROVISIONING (externer Kanalsatz) -> STARTING
    /// (Token-Erwerb, gestaffelte Worker-Starts) -> ACTIVE sobald der
    /// Forwarder und mindestens ein Receiver am Hub registriert sind.
    ///
    /// Gibt es weniger freie Receiver-Tokens als gewuenscht, startet die
    /// Sektion mit reduzierter Anzahl und meldet Teilkapazitaet; nur null
    /// verfuegbare Tokens einer Pflichtrolle sind ein harter Fehler.
    pub async fn sektion_erstellen(
        &self,
        name: impl Into<String>,
        empfaenger_anzahl: Option<usize>,
    ) -> Result<SectionId> {
        let name = name.into();
        let gewuenscht = empfaenger_anzahl
            .unwrap_or(self.inner.einstellungen.standard_empfaenger)
            .max(1);

        let sektion_id = SectionId::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        self.inner.sektionen.insert(
            sektion_id,
            Sektion {
                name: name.clone(),
                zustand: SektionZustand::Created,
                gewuenschte_empfaenger: gewuenscht,
                kanaele: None,
                erstellt_um: Utc::now(),
                forwarder: None,
                empfaenger: Vec::new(),
                stop_tx,
            },
        );
        tracing::info!(sektion = %sektion_id, name, gewuenscht, "Sektion angelegt");
        self.melden(RundfunkEvent::SektionErstellt {
            sektion_id,
            name: name.clone(),
        });

        match self.hochfahren(sektion_id, &name, gewuenscht, stop_rx).await {
            Ok(()) => Ok(sektion_id),
            Err(e) => {
                self.abbruch_beim_start(sektion_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// PROVISIONING bis ACTIVE; Fehler raeumt der Aufrufer auf
    async fn hochfahren(
        &self,
        sektion_id: SectionId,
        name: &str,
        gewuenscht: usize,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        // PROVISIONING: externer Kanalsatz
        self.zustand_setzen(&sektion_id, SektionZustand::Provisioning)?;
        let kanaele = self
            .inner
            .provisioner
            .bereitstellen(sektion_id, name)
            .await
            .map_err(|e| RundfunkError::Bereitstellung(e.to_string()))?;
        {
            let mut eintrag = self.eintrag(&sektion_id)?;
            eintrag.kanaele = Some(kanaele);
        }
        self.stop_pruefen(&stop_rx)?;

        // STARTING: Tokens erwerben, Worker staffeln
        self.zustand_setzen(&sektion_id, SektionZustand::Starting)?;
        self.inner.hub.sektion_anlegen(sektion_id, gewuenscht);

        let forwarder_token = self
            .inner
            .supervisor
            .token_erwerben(WorkerRolle::Forwarder)?;

        let mut empfaenger_tokens = Vec::with_capacity(gewuenscht);
        while empfaenger_tokens.len() < gewuenscht {
            match self.inner.supervisor.token_erwerben(WorkerRolle::Receiver) {
                Ok(token) => empfaenger_tokens.push(token),
                Err(RundfunkError::TokensErschoepft(_)) => break,
                Err(e) => {
                    self.tokens_zurueckgeben(Some(forwarder_token), empfaenger_tokens);
                    return Err(e);
                }
            }
        }
        if empfaenger_tokens.is_empty() {
            self.inner.supervisor.token_zurueckgeben(forwarder_token);
            return Err(RundfunkError::TokensErschoepft(WorkerRolle::Receiver));
        }
        let erhalten = empfaenger_tokens.len();
        if erhalten < gewuenscht {
            tracing::warn!(
                sektion = %sektion_id,
                gewuenscht,
                erhalten,
                "Teilkapazitaet – Sektion startet mit weniger Receivern"
            );
            self.melden(RundfunkEvent::Teilkapazitaet {
                sektion_id,
                gewuenscht,
                erhalten,
            });
        }

        // Forwarder starten (ein Spawn-Fehlversuch wird wiederholt)
        let forwarder_id = match self.worker_starten_mit_wiederholung(
            forwarder_token,
            self.spawn_kontext(sektion_id, WorkerRolle::Forwarder, kanaele),
        ) {
            Ok(id) => id,
            Err(e) => {
                self.tokens_zurueckgeben(None, empfaenger_tokens);
                return Err(e);
            }
        };
        {
            let mut eintrag = self.eintrag(&sektion_id)?;
            eintrag.forwarder = Some(forwarder_id);
        }

        // Receiver gestaffelt starten, eine Wiederholungsrunde fuer
        // fehlgeschlagene Spawns. Gestartete Worker landen sofort im
        // Bestand, damit ein Abbruch sie beim Abbau findet.
        let batch_groesse = self.inner.einstellungen.batch_groesse.max(1);
        let mut gestartet = 0usize;
        let mut fehlgeschlagen = 0usize;
        let mut rest = empfaenger_tokens;
        while !rest.is_empty() {
            let staffel: Vec<WorkerToken> =
                rest.drain(..batch_groesse.min(rest.len())).collect();
            for token in staffel {
                let kontext = self.spawn_kontext(sektion_id, WorkerRolle::Receiver, kanaele);
                match self.inner.supervisor.worker_starten(token, kontext) {
                    Ok(id) => {
                        self.eintrag(&sektion_id)?.empfaenger.push(id);
                        gestartet += 1;
                    }
                    Err(e) => {
                        tracing::warn!(sektion = %sektion_id, fehler = %e, "Receiver-Spawn fehlgeschlagen");
                        fehlgeschlagen += 1;
                    }
                }
            }
            if !rest.is_empty() {
                if let Err(e) = self
                    .pause_mit_stop(self.inner.einstellungen.batch_pause, &stop_rx)
                    .await
                {
                    // Noch nicht gespawnte Tokens gehen direkt zurueck
                    self.tokens_zurueckgeben(None, rest);
                    return Err(e);
                }
            }
        }

        // Wiederholungsrunde: Tokens der Fehlversuche liegen wieder im Pool
        for _ in 0..fehlgeschlagen {
            let Ok(token) = self.inner.supervisor.token_erwerben(WorkerRolle::Receiver) else {
                break;
            };
            let kontext = self.spawn_kontext(sektion_id, WorkerRolle::Receiver, kanaele);
            match self.inner.supervisor.worker_starten(token, kontext) {
                Ok(id) => {
                    self.eintrag(&sektion_id)?.empfaenger.push(id);
                    gestartet += 1;
                }
                Err(e) => {
                    tracing::warn!(sektion = %sektion_id, fehler = %e, "Receiver-Spawn erneut fehlgeschlagen");
                }
            }
        }
        if gestartet == 0 {
            return Err(RundfunkError::ProzessStart(
                "Kein Receiver-Prozess kam hoch".into(),
            ));
        }

        // Aktiv-Gate: Forwarder und mindestens ein Receiver am Hub
        self.aktiv_gate(&sektion_id, &stop_rx).await?;

        // ACTIVE; Flag-Pruefung und Uebergang unter demselben Eintrags-Lock,
        // damit ein paralleles Stoppen nicht zwischen beide faellt
        let empfaenger_aktiv = {
            let mut eintrag = self.eintrag(&sektion_id)?;
            self.stop_pruefen(&stop_rx)?;
            uebergang(&mut eintrag.zustand, SektionZustand::Active)?;
            drop(eintrag);
            self.inner
                .hub
                .sektion_status(&sektion_id)
                .map(|s| s.empfaenger_aktiv)
                .unwrap_or(0)
        };

        tracing::info!(
            sektion = %sektion_id,
            empfaenger_aktiv,
            gewuenscht,
            "Sektion aktiv"
        );
        self.melden(RundfunkEvent::SektionAktiv {
            sektion_id,
            empfaenger_aktiv,
            empfaenger_gewuenscht: gewuenscht,
        });
        Ok(())
    }

    /// Wartet bis Forwarder + >=1 Receiver am Hub registriert sind
    async fn aktiv_gate(
        &self,
        sektion_id: &SectionId,
        stop_rx: &watch::Receiver<bool>,
    ) -> Result<()> {
        let frist = tokio::time::Instant::now() + self.inner.einstellungen.start_frist;
        loop {
            self.stop_pruefen(stop_rx)?;
            if let Some(status) = self.inner.hub.sektion_status(sektion_id) {
                if status.forwarder_aktiv && status.empfaenger_aktiv >= 1 {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= frist {
                tracing::error!(
                    sektion = %sektion_id,
                    frist_s = self.inner.einstellungen.start_frist.as_secs(),
                    "Aktiv-Gate nicht erreicht"
                );
                return Err(RundfunkError::Zeitlimit(
                    "Worker haben sich nicht rechtzeitig am Hub registriert".into(),
                ));
            }
            tokio::time::sleep(GATE_INTERVALL).await;
        }
    }

    // -----------------------------------------------------------------------
    // Stoppen
    // -----------------------------------------------------------------------

    /// Stoppt eine Sektion; idempotent
    ///
    /// Ein zweiter Aufruf, oder ein Aufruf fuer eine unbekannte Sektion,
    /// ist ein No-Op mit Ok. Laeuft gerade ein Start, wird er abgebrochen
    /// und der Start-Pfad raeumt selbst auf.
    pub async fn sektion_stoppen(&self, sektion_id: &SectionId) -> Result<()> {
        let zustand = {
            let Some(eintrag) = self.inner.sektionen.get(sektion_id) else {
                return Ok(());
            };
            // Signal zuerst, Zustand danach lesen: ein Start der das Signal
            // verpasst hat ist bereits ACTIVE und wird hier direkt gestoppt
            let _ = eintrag.stop_tx.send(true);
            eintrag.zustand
        };

        match zustand {
            SektionZustand::Active | SektionZustand::Degraded => {
                self.stoppen_intern(sektion_id).await;
                Ok(())
            }
            SektionZustand::Stopping | SektionZustand::Terminated => Ok(()),
            // Start laeuft noch; der Start-Pfad sieht das Signal und baut ab
            SektionZustand::Created
            | SektionZustand::Provisioning
            | SektionZustand::Starting => Ok(()),
        }
    }

    /// Stoppt alle Sektionen (Server-Shutdown)
    pub async fn alle_stoppen(&self) {
        let ids: Vec<SectionId> = self.inner.sektionen.iter().map(|e| *e.key()).collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(sektionen = ids.len(), "Alle Sektionen werden gestoppt");
        join_all(ids.iter().map(|id| self.sektion_stoppen(id))).await;
    }

    /// STOPPING -> TERMINATED: Worker, Hub-Gruppe und Kanalsatz abbauen
    async fn stoppen_intern(&self, sektion_id: &SectionId) {
        let (worker, kanaele) = {
            let Some(mut eintrag) = self.inner.sektionen.get_mut(sektion_id) else {
                return;
            };
            if eintrag.zustand.ist_am_ende() {
                return;
            }
            if uebergang(&mut eintrag.zustand, SektionZustand::Stopping).is_err() {
                return;
            }
            let mut worker: Vec<WorkerId> = eintrag.empfaenger.drain(..).collect();
            if let Some(f) = eintrag.forwarder.take() {
                worker.push(f);
            }
            (worker, eintrag.kanaele.take())
        };

        tracing::info!(sektion = %sektion_id, worker = worker.len(), "Sektion wird gestoppt");

        // Worker parallel stoppen; Tokens kommen dabei in den Pool zurueck
        join_all(
            worker
                .iter()
                .map(|id| self.inner.supervisor.worker_stoppen(id)),
        )
        .await;
        self.inner.hub.sektion_entfernen(sektion_id);

        if let Some(kanaele) = kanaele {
            if let Err(e) = self.inner.provisioner.abbauen(*sektion_id, kanaele).await {
                tracing::warn!(sektion = %sektion_id, fehler = %e, "Kanal-Abbau fehlgeschlagen");
            }
        }

        if let Some(mut eintrag) = self.inner.sektionen.get_mut(sektion_id) {
            let _ = uebergang(&mut eintrag.zustand, SektionZustand::Terminated);
        }
        self.inner.sektionen.remove(sektion_id);
        self.melden(RundfunkEvent::SektionBeendet {
            sektion_id: *sektion_id,
        });
        tracing::info!(sektion = %sektion_id, "Sektion beendet");
    }

    /// Abbau nach einem fehlgeschlagenen oder abgebrochenen Start
    async fn abbruch_beim_start(&self, sektion_id: SectionId, grund: &str) {
        tracing::warn!(sektion = %sektion_id, grund, "Sektionsstart abgebrochen");
        let zustand = self
            .inner
            .sektionen
            .get(&sektion_id)
            .map(|e| e.zustand);
        match zustand {
            None => {}
            Some(SektionZustand::Created | SektionZustand::Provisioning) => {
                // Noch keine Worker und keine Hub-Gruppe; nur austragen
                let kanaele = self
                    .inner
                    .sektionen
                    .remove(&sektion_id)
                    .and_then(|(_, s)| s.kanaele);
                if let Some(kanaele) = kanaele {
                    if let Err(e) = self.inner.provisioner.abbauen(sektion_id, kanaele).await {
                        tracing::warn!(sektion = %sektion_id, fehler = %e, "Kanal-Abbau fehlgeschlagen");
                    }
                }
                self.melden(RundfunkEvent::SektionBeendet { sektion_id });
            }
            Some(_) => self.stoppen_intern(&sektion_id).await,
        }
    }

    /// Degradiert eine Sektion und stoesst ihr Stoppen an
    async fn degradieren(&self, sektion_id: &SectionId, grund: &str) {
        {
            let Some(mut eintrag) = self.inner.sektionen.get_mut(sektion_id) else {
                return;
            };
            if uebergang(&mut eintrag.zustand, SektionZustand::Degraded).is_err() {
                return;
            }
        }
        tracing::error!(sektion = %sektion_id, grund, "Sektion degradiert");
        self.melden(RundfunkEvent::SektionDegradiert {
            sektion_id: *sektion_id,
            grund: grund.into(),
        });
        self.stoppen_intern(sektion_id).await;
    }

    // -----------------------------------------------------------------------
    // Ereignis-Pumpe
    // -----------------------------------------------------------------------

    /// Verarbeitet Hub- und Supervisor-Ereignisse bis zum Shutdown
    ///
    /// Wird vom Server als eigener Task gestartet. Herzschlaege aus dem
    /// Hub speisen die Supervisor-Ueberwachung; Rollenverluste werden
    /// gezielt repariert statt die Sektion abzubauen.
    pub async fn pumpe(
        self,
        mut hub_rx: mpsc::UnboundedReceiver<HubEreignis>,
        mut supervisor_rx: mpsc::UnboundedReceiver<SupervisorEreignis>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                ereignis = hub_rx.recv() => {
                    match ereignis {
                        Some(e) => self.hub_ereignis(e).await,
                        None => return,
                    }
                }
                ereignis = supervisor_rx.recv() => {
                    match ereignis {
                        Some(e) => self.supervisor_ereignis(e).await,
                        None => return,
                    }
                }
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("Koordinator-Pumpe beendet");
                        return;
                    }
                }
            }
        }
    }

    async fn hub_ereignis(&self, ereignis: HubEreignis) {
        match ereignis {
            HubEreignis::Herzschlag { worker_id, .. } => {
                self.inner.supervisor.herzschlag_melden(&worker_id);
            }
            HubEreignis::Registriert {
                sektion_id,
                rolle,
                worker_id,
            } => {
                tracing::debug!(
                    sektion = %sektion_id,
                    worker = %worker_id,
                    rolle = %rolle,
                    "Worker am Hub registriert"
                );
            }
            HubEreignis::VerbindungGetrennt {
                sektion_id,
                rolle,
                worker_id,
            } => {
                // Karenzzeit laeuft; lokal behandeln, nichts nach aussen
                tracing::info!(
                    sektion = %sektion_id,
                    worker = %worker_id,
                    rolle = %rolle,
                    "Verbindung getrennt, Karenzzeit laeuft"
                );
            }
            HubEreignis::RolleVerloren {
                sektion_id,
                rolle,
                worker_id,
            } => {
                self.rolle_reparieren(sektion_id, rolle, worker_id).await;
            }
        }
    }

    async fn supervisor_ereignis(&self, ereignis: SupervisorEreignis) {
        match ereignis {
            SupervisorEreignis::WorkerNeugestartet {
                sektion_id,
                rolle,
                worker_id,
                versuch,
            } => {
                tracing::info!(
                    sektion = %sektion_id,
                    worker = %worker_id,
                    rolle = %rolle,
                    versuch,
                    "Worker neu gestartet"
                );
            }
            SupervisorEreignis::RolleVerloren {
                sektion_id,
                rolle,
                worker_id,
                grund,
            } => {
                // Neustart-Policy erschoepft; Token ist bereits frei
                self.rollenverlust_endgueltig(sektion_id, rolle, worker_id, &grund)
                    .await;
            }
        }
    }

    /// Gezielte Reparatur nach abgelaufener Karenzzeit am Hub
    ///
    /// Der Prozess kann noch leben (haengender Worker): erst stoppen,
    /// dann mit frischem Token derselben Rolle neu besetzen. Schlaegt die
    /// Neubesetzung fuer den Forwarder fehl, degradiert die Sektion.
    async fn rolle_reparieren(
        &self,
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
    ) {
        if !self.worker_austragen(&sektion_id, &worker_id) {
            // Nicht (mehr) unser Worker; z.B. schon vom Supervisor eskaliert
            return;
        }
        tracing::warn!(
            sektion = %sektion_id,
            worker = %worker_id,
            rolle = %rolle,
            "Rolle am Hub verloren – Worker wird ersetzt"
        );
        if let Err(e) = self.inner.supervisor.worker_stoppen(&worker_id).await {
            tracing::warn!(worker = %worker_id, fehler = %e, "Stopp des verlorenen Workers");
        }
        match self.rolle_neu_besetzen(&sektion_id, rolle).await {
            Ok(neuer) => {
                self.melden(RundfunkEvent::RolleVerloren {
                    sektion_id,
                    rolle,
                    worker_id,
                    endgueltig: false,
                });
                tracing::info!(
                    sektion = %sektion_id,
                    alt = %worker_id,
                    neu = %neuer,
                    rolle = %rolle,
                    "Rolle neu besetzt"
                );
            }
            Err(e) => {
                self.rollenverlust_endgueltig(sektion_id, rolle, worker_id, &e.to_string())
                    .await;
            }
        }
    }

    /// Endgueltiger Rollenverlust: Forwarder degradiert, Receiver wird
    /// als Kapazitaetsverlust gemeldet
    async fn rollenverlust_endgueltig(
        &self,
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
        grund: &str,
    ) {
        self.worker_austragen(&sektion_id, &worker_id);
        let relevant = self
            .inner
            .sektionen
            .get(&sektion_id)
            .is_some_and(|e| !e.zustand.ist_am_ende());
        if !relevant {
            return;
        }
        self.melden(RundfunkEvent::RolleVerloren {
            sektion_id,
            rolle,
            worker_id,
            endgueltig: true,
        });
        if rolle.ist_forwarder() {
            self.degradieren(&sektion_id, grund).await;
        } else {
            tracing::warn!(
                sektion = %sektion_id,
                worker = %worker_id,
                grund,
                "Receiver endgueltig verloren – Sektion laeuft weiter"
            );
        }
    }

    /// Erwirbt ein frisches Token der Rolle und startet einen Ersatz-Worker
    async fn rolle_neu_besetzen(
        &self,
        sektion_id: &SectionId,
        rolle: WorkerRolle,
    ) -> Result<WorkerId> {
        let kanaele = {
            let eintrag = self.eintrag(sektion_id)?;
            if eintrag.zustand.ist_am_ende() {
                return Err(RundfunkError::SektionNichtGefunden(*sektion_id));
            }
            eintrag
                .kanaele
                .ok_or_else(|| RundfunkError::intern("Sektion ohne Kanalsatz"))?
        };

        let token = self.inner.supervisor.token_erwerben(rolle)?;
        let kontext = self.spawn_kontext(*sektion_id, rolle, kanaele);
        let neuer = self
            .worker_starten_mit_wiederholung(token, kontext)?;

        let mut eintrag = self.eintrag(sektion_id)?;
        match rolle {
            WorkerRolle::Forwarder => eintrag.forwarder = Some(neuer),
            WorkerRolle::Receiver => eintrag.empfaenger.push(neuer),
        }
        Ok(neuer)
    }

    // -----------------------------------------------------------------------
    // Introspektion
    // -----------------------------------------------------------------------

    /// Momentaufnahme einer Sektion
    pub fn sektion_info(&self, sektion_id: &SectionId) -> Option<SektionInfo> {
        let eintrag = self.inner.sektionen.get(sektion_id)?;
        let status = self.inner.hub.sektion_status(sektion_id);
        Some(SektionInfo {
            id: *sektion_id,
            name: eintrag.name.clone(),
            zustand: eintrag.zustand,
            gewuenschte_empfaenger: eintrag.gewuenschte_empfaenger,
            forwarder: eintrag.forwarder,
            empfaenger: eintrag.empfaenger.clone(),
            empfaenger_aktiv: status.map(|s| s.empfaenger_aktiv).unwrap_or(0),
            forwarder_aktiv: status.map(|s| s.forwarder_aktiv).unwrap_or(false),
            erstellt_um: eintrag.erstellt_um,
        })
    }

    /// Alle Sektionen im aktiven Bestand
    pub fn sektionen_auflisten(&self) -> Vec<SektionInfo> {
        self.inner
            .sektionen
            .iter()
            .map(|e| *e.key())
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|id| self.sektion_info(&id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Hilfen
    // -----------------------------------------------------------------------

    fn spawn_kontext(
        &self,
        sektion_id: SectionId,
        rolle: WorkerRolle,
        kanaele: KanalSatz,
    ) -> SpawnKontext {
        SpawnKontext {
            sektion_id,
            rolle,
            kanaele,
            relay_adresse: self.inner.einstellungen.relay_adresse.clone(),
        }
    }

    /// Ein Spawn-Fehlversuch wird einmal wiederholt (Token liegt nach dem
    /// Fehlversuch wieder im Pool)
    fn worker_starten_mit_wiederholung(
        &self,
        token: WorkerToken,
        kontext: SpawnKontext,
    ) -> Result<WorkerId> {
        let rolle = token.rolle;
        match self.inner.supervisor.worker_starten(token, kontext.clone()) {
            Ok(id) => Ok(id),
            Err(erster) => {
                tracing::warn!(fehler = %erster, rolle = %rolle, "Spawn fehlgeschlagen, wiederhole");
                let token = self.inner.supervisor.token_erwerben(rolle)?;
                self.inner.supervisor.worker_starten(token, kontext)
            }
        }
    }

    /// Entfernt einen Worker aus dem Sektionsbestand; false wenn unbekannt
    fn worker_austragen(&self, sektion_id: &SectionId, worker_id: &WorkerId) -> bool {
        let Some(mut eintrag) = self.inner.sektionen.get_mut(sektion_id) else {
            return false;
        };
        if eintrag.forwarder == Some(*worker_id) {
            eintrag.forwarder = None;
            return true;
        }
        let vorher = eintrag.empfaenger.len();
        eintrag.empfaenger.retain(|id| id != worker_id);
        eintrag.empfaenger.len() != vorher
    }

    fn eintrag(
        &self,
        sektion_id: &SectionId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, SectionId, Sektion>> {
        self.inner
            .sektionen
            .get_mut(sektion_id)
            .ok_or(RundfunkError::SektionNichtGefunden(*sektion_id))
    }

    fn zustand_setzen(&self, sektion_id: &SectionId, nach: SektionZustand) -> Result<()> {
        let mut eintrag = self.eintrag(sektion_id)?;
        uebergang(&mut eintrag.zustand, nach)
    }

    fn stop_pruefen(&self, stop_rx: &watch::Receiver<bool>) -> Result<()> {
        if *stop_rx.borrow() {
            Err(RundfunkError::VerbindungVerloren(
                "Sektion wurde waehrend des Starts gestoppt".into(),
            ))
        } else {
            Ok(())
        }
    }

    async fn pause_mit_stop(
        &self,
        dauer: Duration,
        stop_rx: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut stop_rx = stop_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(dauer) => Ok(()),
            Ok(()) = stop_rx.changed() => self.stop_pruefen(&stop_rx),
        }
    }

    fn tokens_zurueckgeben(&self, forwarder: Option<WorkerToken>, empfaenger: Vec<WorkerToken>) {
        if let Some(token) = forwarder {
            self.inner.supervisor.token_zurueckgeben(token);
        }
        for token in empfaenger {
            self.inner.supervisor.token_zurueckgeben(token);
        }
    }

    fn melden(&self, ereignis: RundfunkEvent) {
        // Ohne Kommando-Schicht (Tests, Standalone) verpuffen Ereignisse
        let _ = self.inner.ereignis_tx.send(ereignis);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::NoOpProvisioner;
    use async_trait::async_trait;
    use rundfunk_relay::{RelayEinstellungen, RelayHub};
    use rundfunk_supervisor::{SupervisorEinstellungen, TokenPool};

    /// Provisioner der immer scheitert
    struct KaputterProvisioner;

    #[async_trait]
    impl ChannelProvisioner for KaputterProvisioner {
        async fn bereitstellen(
            &self,
            _sektion_id: SectionId,
            _name: &str,
        ) -> Result<KanalSatz> {
            Err(RundfunkError::Bereitstellung("Plattform nicht erreichbar".into()))
        }

        async fn abbauen(&self, _sektion_id: SectionId, _kanaele: KanalSatz) -> Result<()> {
            Ok(())
        }
    }

    fn test_supervisor(
        forwarder: usize,
        receiver: usize,
    ) -> (ProcessSupervisor, TokenPool) {
        let pool = TokenPool::aus_anzahl(forwarder, receiver);
        let einstellungen = SupervisorEinstellungen {
            worker_befehl: "/bin/sh".into(),
            worker_argumente: vec!["-c".into(), "while read z; do :; done".into()],
            herzschlag_intervall: Duration::from_secs(120),
            ..SupervisorEinstellungen::default()
        };
        let (supervisor, _ereignisse) = ProcessSupervisor::neu(pool.clone(), einstellungen);
        (supervisor, pool)
    }

    fn test_koordinator(
        forwarder: usize,
        receiver: usize,
        provisioner: Arc<dyn ChannelProvisioner>,
    ) -> (
        SectionCoordinator,
        mpsc::UnboundedReceiver<RundfunkEvent>,
        TokenPool,
    ) {
        let (hub, _hub_ereignisse) = RelayHub::neu(RelayEinstellungen::default());
        let (supervisor, pool) = test_supervisor(forwarder, receiver);
        let einstellungen = SektionEinstellungen {
            start_frist: Duration::from_millis(300),
            batch_pause: Duration::from_millis(10),
            ..SektionEinstellungen::default()
        };
        let (koordinator, ereignisse) =
            SectionCoordinator::neu(hub, supervisor, provisioner, einstellungen);
        (koordinator, ereignisse, pool)
    }

    fn gesammelt(rx: &mut mpsc::UnboundedReceiver<RundfunkEvent>) -> Vec<RundfunkEvent> {
        let mut ereignisse = Vec::new();
        while let Ok(e) = rx.try_recv() {
            ereignisse.push(e);
        }
        ereignisse
    }

    #[tokio::test]
    async fn bereitstellungsfehler_beendet_sektion_sofort() {
        let (koordinator, mut ereignisse, pool) =
            test_koordinator(1, 2, Arc::new(KaputterProvisioner));

        let fehler = koordinator
            .sektion_erstellen("kaputt", Some(2))
            .await
            .unwrap_err();
        assert!(matches!(fehler, RundfunkError::Bereitstellung(_)));

        // Keine Sektion im Bestand, keine Tokens verbraucht
        assert!(koordinator.sektionen_auflisten().is_empty());
        assert_eq!(pool.verfuegbar(WorkerRolle::Forwarder), 1);
        assert_eq!(pool.verfuegbar(WorkerRolle::Receiver), 2);

        let arten = gesammelt(&mut ereignisse);
        assert!(matches!(arten.first(), Some(RundfunkEvent::SektionErstellt { .. })));
        assert!(matches!(arten.last(), Some(RundfunkEvent::SektionBeendet { .. })));
    }

    #[tokio::test]
    async fn ohne_forwarder_token_schlaegt_start_fehl() {
        let (koordinator, _ereignisse, pool) =
            test_koordinator(0, 2, Arc::new(NoOpProvisioner));

        let fehler = koordinator
            .sektion_erstellen("keine-tokens", Some(2))
            .await
            .unwrap_err();
        assert!(matches!(
            fehler,
            RundfunkError::TokensErschoepft(WorkerRolle::Forwarder)
        ));
        assert_eq!(pool.verfuegbar(WorkerRolle::Receiver), 2, "Receiver-Tokens unberuehrt");
        assert!(koordinator.sektionen_auflisten().is_empty());
    }

    #[tokio::test]
    async fn ohne_receiver_tokens_schlaegt_start_fehl() {
        let (koordinator, _ereignisse, pool) =
            test_koordinator(1, 0, Arc::new(NoOpProvisioner));

        let fehler = koordinator
            .sektion_erstellen("leer", Some(3))
            .await
            .unwrap_err();
        assert!(matches!(
            fehler,
            RundfunkError::TokensErschoepft(WorkerRolle::Receiver)
        ));
        assert_eq!(
            pool.verfuegbar(WorkerRolle::Forwarder),
            1,
            "Forwarder-Token muss zurueckgegeben sein"
        );
    }

    #[tokio::test]
    async fn teilkapazitaet_wird_gemeldet_und_tokens_aufgeraeumt() {
        // 3 Receiver-Tokens bei 5 gewuenschten; /bin/sh-Worker registrieren
        // sich nie am Hub, das Aktiv-Gate laeuft also in die Frist
        let (koordinator, mut ereignisse, pool) =
            test_koordinator(1, 3, Arc::new(NoOpProvisioner));

        let fehler = koordinator
            .sektion_erstellen("teilweise", Some(5))
            .await
            .unwrap_err();
        assert!(matches!(fehler, RundfunkError::Zeitlimit(_)));

        let arten = gesammelt(&mut ereignisse);
        assert!(
            arten.iter().any(|e| matches!(
                e,
                RundfunkEvent::Teilkapazitaet { gewuenscht: 5, erhalten: 3, .. }
            )),
            "Teilkapazitaet muss gemeldet werden: {arten:?}"
        );

        // Abbruch hat alle Tokens zurueckgebracht
        assert_eq!(pool.verfuegbar(WorkerRolle::Forwarder), 1);
        assert_eq!(pool.verfuegbar(WorkerRolle::Receiver), 3);
        assert!(koordinator.sektionen_auflisten().is_empty());
    }

    #[tokio::test]
    async fn stop_unbekannter_sektion_ist_noop() {
        let (koordinator, _ereignisse, _pool) =
            test_koordinator(1, 1, Arc::new(NoOpProvisioner));
        koordinator.sektion_stoppen(&SectionId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn start_wird_durch_stop_abgebrochen() {
        let (koordinator, _ereignisse, pool) =
            test_koordinator(1, 1, Arc::new(NoOpProvisioner));

        let k = koordinator.clone();
        let start = tokio::spawn(async move { k.sektion_erstellen("abbruch", Some(1)).await });

        // Warten bis die Sektion im Bestand ist, dann stoppen
        let sektion_id = loop {
            if let Some(info) = koordinator.sektionen_auflisten().first() {
                break info.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        koordinator.sektion_stoppen(&sektion_id).await.unwrap();

        let ergebnis = start.await.unwrap();
        assert!(ergebnis.is_err(), "Abgebrochener Start darf nicht Ok liefern");

        // Aufgeraeumt: Bestand leer, Tokens zurueck
        assert!(koordinator.sektionen_auflisten().is_empty());
        assert_eq!(pool.verfuegbar(WorkerRolle::Forwarder), 1);
        assert_eq!(pool.verfuegbar(WorkerRolle::Receiver), 1);
    }
}
