//! ProcessSupervisor – Lebenszyklus aller Worker-Prozesse
//!
//! Der Supervisor besitzt den Token-Pool und die Menge laufender
//! Prozess-Handles. Pro Worker laeuft ein Monitor-Task der Prozessende,
//! Herzschlag-Frist und Stopp-Signal multiplexed. Bei Ausfall greift die
//! Neustart-Policy: bis zu R Neustarts mit exponentiellem Backoff und
//! demselben Token; danach wird das Token freigegeben und der Verlust an
//! den Koordinator eskaliert.
//!
//! ## Invarianten
//! - Nie mehr laufende Prozesse als Tokens im Pool
//! - Jeder Austrittspfad eines Workers gibt sein Token zurueck
//! - `worker_stoppen` ist idempotent; unbekannte Worker sind ein No-Op

use dashmap::DashMap;
use parking_lot::Mutex;
use rundfunk_core::{Result, RundfunkError, SectionId, WorkerId, WorkerRolle};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::prozess::{SpawnKontext, WorkerProzess};
use crate::token::{TokenPool, WorkerToken};

// ---------------------------------------------------------------------------
// Einstellungen & Ereignisse
// ---------------------------------------------------------------------------

/// Laufzeit-Einstellungen des Supervisors
#[derive(Debug, Clone)]
pub struct SupervisorEinstellungen {
    /// Programm das pro Worker gespawnt wird
    pub worker_befehl: String,
    /// Feste Argumente fuer jeden Worker
    pub worker_argumente: Vec<String>,
    /// Erwartetes Herzschlag-Intervall der Worker
    pub herzschlag_intervall: Duration,
    /// K: so viele verpasste Herzschlaege gelten als Ausfall
    pub max_fehlende_herzschlaege: u32,
    /// R: maximale Neustarts bevor die Rolle als verloren eskaliert wird
    pub max_neustarts: u32,
    /// Basis des exponentiellen Backoffs zwischen Neustarts
    pub backoff_basis: Duration,
    /// Obergrenze des Backoffs
    pub backoff_max: Duration,
    /// Frist fuer freiwilliges Beenden bevor gekillt wird
    pub stop_frist: Duration,
}

impl Default for SupervisorEinstellungen {
    fn default() -> Self {
        Self {
            worker_befehl: "rundfunk-worker".into(),
            worker_argumente: Vec::new(),
            herzschlag_intervall: Duration::from_secs(10),
            max_fehlende_herzschlaege: 3,
            max_neustarts: 3,
            backoff_basis: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            stop_frist: Duration::from_secs(5),
        }
    }
}

/// Ereignisse die der Supervisor an den Koordinator meldet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEreignis {
    /// Ein Worker wurde nach einem Ausfall neu gestartet (gleiches Token)
    WorkerNeugestartet {
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
        versuch: u32,
    },
    /// Neustart-Policy erschoepft; Token freigegeben, Rolle endgueltig weg
    RolleVerloren {
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
        grund: String,
    },
}

/// Momentaufnahme eines laufenden Workers
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub sektion_id: SectionId,
    pub rolle: WorkerRolle,
    pub neustarts: u32,
    pub letzter_herzschlag_vor: Duration,
}

/// Berechnet die Backoff-Dauer fuer den n-ten Neustartversuch (1-basiert)
///
/// Verdoppelung pro Versuch, gedeckelt, plus bis zu 25% zufaelliger
/// Jitter damit mehrere ausgefallene Worker nicht im Gleichtakt
/// wiederkommen.
fn backoff_fuer_versuch(
    versuch: u32,
    basis: Duration,
    max: Duration,
) -> Duration {
    let faktor = 2u32.saturating_pow(versuch.saturating_sub(1));
    let roh = basis.saturating_mul(faktor).min(max);
    let jitter_ms = if roh.as_millis() > 0 {
        use rand::RngExt;
        rand::rng().random_range(0..=(roh.as_millis() as u64 / 4))
    } else {
        0
    };
    roh + Duration::from_millis(jitter_ms)
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

/// Warum die Laufphase eines Workers endete
enum AusfallGrund {
    /// Prozess hat sich unerwartet beendet
    Beendet(String),
    /// K Herzschlaege in Folge verpasst
    HerzschlagVerloren,
}

struct WorkerEintrag {
    sektion_id: SectionId,
    rolle: WorkerRolle,
    kontext: SpawnKontext,
    letzter_herzschlag: Mutex<Instant>,
    neustarts: AtomicU32,
    /// Stopp-Signal an den Monitor-Task
    stop_tx: watch::Sender<bool>,
    /// Signalisiert dem Aufrufer von `worker_stoppen` das Ende
    beendet_tx: watch::Sender<bool>,
}

struct SupervisorInner {
    einstellungen: SupervisorEinstellungen,
    pool: TokenPool,
    worker: DashMap<WorkerId, Arc<WorkerEintrag>>,
    ereignis_tx: mpsc::UnboundedSender<SupervisorEreignis>,
}

/// Besitzt Token-Pool und Prozess-Handles, ueberwacht und startet neu
///
/// Thread-safe und `Clone`-faehig (innerer Arc). Ereignisse gehen ueber
/// den bei [`ProcessSupervisor::neu`] zurueckgegebenen Kanal an den
/// Koordinator.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ProcessSupervisor {
    /// Erstellt einen Supervisor ueber dem gegebenen Token-Pool
    pub fn neu(
        pool: TokenPool,
        einstellungen: SupervisorEinstellungen,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEreignis>) {
        let (ereignis_tx, ereignis_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                einstellungen,
                pool,
                worker: DashMap::new(),
                ereignis_tx,
            }),
        };
        (supervisor, ereignis_rx)
    }

    /// Zugriff auf den Token-Pool
    pub fn pool(&self) -> &TokenPool {
        &self.inner.pool
    }

    /// Entnimmt ein freies Token der gewuenschten Rolle
    pub fn token_erwerben(&self, rolle: WorkerRolle) -> Result<WorkerToken> {
        self.inner.pool.erwerben(rolle)
    }

    /// Gibt ein ungenutztes Token in den Pool zurueck
    pub fn token_zurueckgeben(&self, token: WorkerToken) {
        self.inner.pool.zurueckgeben(token);
    }

    // -----------------------------------------------------------------------
    // Starten
    // -----------------------------------------------------------------------

    /// Spawnt einen Worker-Prozess fuer das Token und beginnt die Ueberwachung
    ///
    /// Bei Spawn-Fehler geht das Token sofort in den Pool zurueck und der
    /// Fehler wird gemeldet; der Aufrufer entscheidet ueber eine
    /// Wiederholungsrunde.
    pub fn worker_starten(&self, token: WorkerToken, kontext: SpawnKontext) -> Result<WorkerId> {
        let einstellungen = &self.inner.einstellungen;
        let prozess = match WorkerProzess::starten(
            &einstellungen.worker_befehl,
            &einstellungen.worker_argumente,
            &token,
            &kontext,
        ) {
            Ok(p) => p,
            Err(e) => {
                // Token nicht verbrennen: zurueck in den Pool
                self.inner.pool.zurueckgeben(token);
                return Err(e);
            }
        };

        let worker_id = token.worker_id;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (beendet_tx, _beendet_rx) = watch::channel(false);
        let eintrag = Arc::new(WorkerEintrag {
            sektion_id: kontext.sektion_id,
            rolle: token.rolle,
            kontext,
            letzter_herzschlag: Mutex::new(Instant::now()),
            neustarts: AtomicU32::new(0),
            stop_tx,
            beendet_tx,
        });
        self.inner.worker.insert(worker_id, Arc::clone(&eintrag));

        tokio::spawn(self.clone().ueberwachen(token, eintrag, prozess, stop_rx));
        Ok(worker_id)
    }

    // -----------------------------------------------------------------------
    // Herzschlag
    // -----------------------------------------------------------------------

    /// Verbucht ein Lebenszeichen eines Workers
    ///
    /// Gespeist aus den Hub-Ereignissen (Registrierung und Pongs); ein
    /// eigener Herzschlag-Kanal existiert nicht. Unbekannte Worker werden
    /// ignoriert (z.B. Lebenszeichen nach dem Stopp).
    pub fn herzschlag_melden(&self, worker_id: &WorkerId) -> bool {
        match self.inner.worker.get(worker_id) {
            Some(eintrag) => {
                *eintrag.letzter_herzschlag.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Stoppen
    // -----------------------------------------------------------------------

    /// Stoppt einen Worker und wartet auf sein Ende
    ///
    /// Erst freiwillig (stdin EOF), nach der Stopp-Frist zwangsweise; das
    /// Token geht in jedem Fall zurueck in den Pool. Idempotent: ein
    /// unbekannter oder bereits gestoppter Worker ist ein No-Op.
    pub async fn worker_stoppen(&self, worker_id: &WorkerId) -> Result<()> {
        let Some(eintrag) = self.inner.worker.get(worker_id).map(|e| Arc::clone(&e)) else {
            return Ok(());
        };
        let mut beendet_rx = eintrag.beendet_tx.subscribe();
        let _ = eintrag.stop_tx.send(true);
        drop(eintrag);

        // Monitor beendet den Prozess und gibt das Token zurueck; grosszuegige
        // Frist oberhalb der Stopp-Frist, damit ein Kill noch hineinpasst
        let frist = self.inner.einstellungen.stop_frist + Duration::from_secs(5);
        let ergebnis = match tokio::time::timeout(frist, beendet_rx.wait_for(|b| *b)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RundfunkError::Zeitlimit(format!(
                "Worker {worker_id} hat den Stopp nicht quittiert"
            ))),
        };
        ergebnis
    }

    // -----------------------------------------------------------------------
    // Introspektion
    // -----------------------------------------------------------------------

    /// Gibt true zurueck wenn der Worker laeuft (oder gerade neu startet)
    pub fn laeuft(&self, worker_id: &WorkerId) -> bool {
        self.inner.worker.contains_key(worker_id)
    }

    /// Anzahl laufender Worker
    pub fn anzahl_laufend(&self) -> usize {
        self.inner.worker.len()
    }

    /// Alle Worker einer Sektion
    pub fn sektion_worker(&self, sektion_id: &SectionId) -> Vec<WorkerId> {
        self.inner
            .worker
            .iter()
            .filter(|e| &e.value().sektion_id == sektion_id)
            .map(|e| *e.key())
            .collect()
    }

    /// Momentaufnahme eines Workers
    pub fn worker_info(&self, worker_id: &WorkerId) -> Option<WorkerInfo> {
        self.inner.worker.get(worker_id).map(|eintrag| WorkerInfo {
            worker_id: *worker_id,
            sektion_id: eintrag.sektion_id,
            rolle: eintrag.rolle,
            neustarts: eintrag.neustarts.load(Ordering::Relaxed),
            letzter_herzschlag_vor: eintrag.letzter_herzschlag.lock().elapsed(),
        })
    }

    // -----------------------------------------------------------------------
    // Monitor-Task
    // -----------------------------------------------------------------------

    /// Ueberwacht einen Worker bis zu seinem endgueltigen Ende
    ///
    /// Laufphase: multiplext Prozessende, Herzschlag-Pruefung und
    /// Stopp-Signal. Ausfallphase: Backoff, dann Neustart mit demselben
    /// Token; nach R Fehlversuchen Eskalation an den Koordinator.
    async fn ueberwachen(
        self,
        token: WorkerToken,
        eintrag: Arc<WorkerEintrag>,
        mut prozess: WorkerProzess,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let einstellungen = self.inner.einstellungen.clone();
        let worker_id = token.worker_id;
        let herzschlag_frist = einstellungen
            .herzschlag_intervall
            .saturating_mul(einstellungen.max_fehlende_herzschlaege.max(1));

        loop {
            // Laufphase
            let ausfall = loop {
                tokio::select! {
                    status = prozess.warten() => {
                        let beschreibung = match status {
                            Ok(s) => s.to_string(),
                            Err(e) => format!("wait fehlgeschlagen: {e}"),
                        };
                        break AusfallGrund::Beendet(beschreibung);
                    }

                    _ = tokio::time::sleep(einstellungen.herzschlag_intervall) => {
                        let seit = eintrag.letzter_herzschlag.lock().elapsed();
                        if seit >= herzschlag_frist {
                            tracing::warn!(
                                worker = %worker_id,
                                sektion = %eintrag.sektion_id,
                                seit_ms = seit.as_millis() as u64,
                                "Herzschlag-Frist verstrichen"
                            );
                            break AusfallGrund::HerzschlagVerloren;
                        }
                    }

                    Ok(()) = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            prozess.stoppen(einstellungen.stop_frist).await;
                            self.austragen(worker_id, token);
                            let _ = eintrag.beendet_tx.send(true);
                            tracing::info!(
                                worker = %worker_id,
                                sektion = %eintrag.sektion_id,
                                "Worker gestoppt"
                            );
                            return;
                        }
                    }
                }
            };

            // Haengende Prozesse nach Herzschlag-Verlust nicht weiterlaufen lassen
            if matches!(ausfall, AusfallGrund::HerzschlagVerloren) {
                prozess.stoppen(einstellungen.stop_frist).await;
            }

            let grund = match &ausfall {
                AusfallGrund::Beendet(status) => format!("Prozess beendet ({status})"),
                AusfallGrund::HerzschlagVerloren => "Herzschlag verloren".into(),
            };

            // Ausfallphase: Neustart-Policy
            match self
                .neustart_versuchen(&token, &eintrag, &mut stop_rx, &grund)
                .await
            {
                NeustartErgebnis::Gestartet(neuer) => {
                    prozess = neuer;
                }
                NeustartErgebnis::Gestoppt => {
                    self.austragen(worker_id, token);
                    let _ = eintrag.beendet_tx.send(true);
                    return;
                }
                NeustartErgebnis::Erschoepft => {
                    self.austragen(worker_id, token);
                    let _ = eintrag.beendet_tx.send(true);
                    tracing::error!(
                        worker = %worker_id,
                        sektion = %eintrag.sektion_id,
                        rolle = %eintrag.rolle,
                        grund,
                        "Neustart-Policy erschoepft – Rolle verloren"
                    );
                    self.melden(SupervisorEreignis::RolleVerloren {
                        sektion_id: eintrag.sektion_id,
                        rolle: eintrag.rolle,
                        worker_id,
                        grund,
                    });
                    return;
                }
            }
        }
    }

    /// Versucht Neustarts mit Backoff bis einer gelingt oder R erreicht ist
    async fn neustart_versuchen(
        &self,
        token: &WorkerToken,
        eintrag: &Arc<WorkerEintrag>,
        stop_rx: &mut watch::Receiver<bool>,
        grund: &str,
    ) -> NeustartErgebnis {
        let einstellungen = &self.inner.einstellungen;
        let worker_id = token.worker_id;

        loop {
            let versuch = eintrag.neustarts.load(Ordering::Relaxed) + 1;
            if versuch > einstellungen.max_neustarts {
                return NeustartErgebnis::Erschoepft;
            }
            eintrag.neustarts.store(versuch, Ordering::Relaxed);

            let pause = backoff_fuer_versuch(
                versuch,
                einstellungen.backoff_basis,
                einstellungen.backoff_max,
            );
            tracing::info!(
                worker = %worker_id,
                sektion = %eintrag.sektion_id,
                versuch,
                max = einstellungen.max_neustarts,
                pause_ms = pause.as_millis() as u64,
                grund,
                "Worker wird neu gestartet"
            );

            // Backoff abwarten, dabei auf ein Stopp-Signal reagieren
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                Ok(()) = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return NeustartErgebnis::Gestoppt;
                    }
                }
            }

            match WorkerProzess::starten(
                &einstellungen.worker_befehl,
                &einstellungen.worker_argumente,
                token,
                &eintrag.kontext,
            ) {
                Ok(prozess) => {
                    *eintrag.letzter_herzschlag.lock() = Instant::now();
                    self.melden(SupervisorEreignis::WorkerNeugestartet {
                        sektion_id: eintrag.sektion_id,
                        rolle: eintrag.rolle,
                        worker_id,
                        versuch,
                    });
                    return NeustartErgebnis::Gestartet(prozess);
                }
                Err(e) => {
                    // Spawn-Fehler zaehlt als verbrauchter Versuch
                    tracing::warn!(
                        worker = %worker_id,
                        versuch,
                        fehler = %e,
                        "Neustart fehlgeschlagen"
                    );
                }
            }
        }
    }

    /// Entfernt den Handle und gibt das Token zurueck
    fn austragen(&self, worker_id: WorkerId, token: WorkerToken) {
        self.inner.worker.remove(&worker_id);
        self.inner.pool.zurueckgeben(token);
    }

    fn melden(&self, ereignis: SupervisorEreignis) {
        // Ohne Koordinator (Tests, Standalone) verpuffen Ereignisse
        let _ = self.inner.ereignis_tx.send(ereignis);
    }
}

enum NeustartErgebnis {
    Gestartet(WorkerProzess),
    Gestoppt,
    Erschoepft,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
