//! RelayHub – Verbindungs-Broker fuer Audio-Fan-Out
//!
//! Der Hub gruppiert registrierte Verbindungen nach (Sektion, Rolle) und
//! leitet Frames vom Forwarder einer Sektion an alle aktiven Receiver
//! derselben Sektion weiter. Frames einer Sektion erreichen niemals
//! Receiver einer anderen Sektion.
//!
//! ## Design
//! - DashMap ueber Sektionen: Registry-Aenderungen zweier Sektionen
//!   kontendieren nie miteinander (Lock pro Eintrag)
//! - Pro Receiver-Slot ein [`FrameBuffer`]; der Verbindungs-Task haelt
//!   einen Klon und konsumiert daraus, der Hub produziert hinein
//! - Getrennte Slots bleiben fuer eine Karenzzeit reserviert: dieselbe
//!   Worker-Identitaet darf sich neu anbinden und der Empfang laeuft
//!   beim naechsten Frame weiter, ohne dass die Sektion etwas merkt
//! - Jede Registrierung traegt eine Generationsnummer, damit ein spaet
//!   aufraeumender alter Verbindungs-Task keinen frisch angebundenen
//!   Slot trennt

use dashmap::DashMap;
use rundfunk_audio::FrameBuffer;
use rundfunk_core::{AudioFrame, Result, RundfunkError, SectionId, WorkerId, WorkerRolle};
use rundfunk_protocol::RelayMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

// ---------------------------------------------------------------------------
// Einstellungen
// ---------------------------------------------------------------------------

/// Laufzeit-Einstellungen des Relays
///
/// Alle Zeitfenster sind konfigurierbar; die Defaults sind auf realen
/// Sprachbetrieb ausgelegt (Sekunden-Skala).
#[derive(Debug, Clone)]
pub struct RelayEinstellungen {
    /// Intervall in dem der Hub Pings an Verbindungen sendet
    pub ping_intervall: Duration,
    /// Ohne Pong nach dieser Dauer gilt eine Verbindung als veraltet
    pub veraltet_schwelle: Duration,
    /// Ohne Pong nach dieser Dauer wird die Verbindung getrennt
    pub getrennt_schwelle: Duration,
    /// Karenzzeit in der ein getrennter Slot fuer seine Worker-Identitaet
    /// reserviert bleibt
    pub karenzzeit: Duration,
    /// Kapazitaet der Receiver-Frame-Puffer
    pub puffer_kapazitaet: usize,
    /// Frist fuer die Register-Nachricht nach TCP-Accept
    pub handshake_frist: Duration,
    /// Maximale Nachrichtengroesse auf dem Draht
    pub max_nachricht_groesse: usize,
    /// Maximale Anzahl gleichzeitiger TCP-Verbindungen
    pub max_verbindungen: usize,
}

impl Default for RelayEinstellungen {
    fn default() -> Self {
        Self {
            ping_intervall: Duration::from_secs(10),
            veraltet_schwelle: Duration::from_secs(20),
            getrennt_schwelle: Duration::from_secs(30),
            karenzzeit: Duration::from_secs(30),
            puffer_kapazitaet: rundfunk_audio::STANDARD_KAPAZITAET,
            handshake_frist: Duration::from_secs(5),
            max_nachricht_groesse: rundfunk_protocol::DEFAULT_MAX_MESSAGE_SIZE,
            max_verbindungen: 100,
        }
    }
}

/// Intervall der Karenzzeit-Pruefung
const KARENZ_PRUEF_INTERVALL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Verbindungszustand
// ---------------------------------------------------------------------------

/// Zustand eines registrierten Slots aus Sicht des Hubs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbindungsZustand {
    /// Registriert und antwortet auf Pings
    Aktiv,
    /// Registriert, aber seit der Veraltet-Schwelle ohne Pong
    Veraltet,
    /// Verbindung weg; Slot in Karenzzeit
    Getrennt,
}

// ---------------------------------------------------------------------------
// Hub-Ereignisse
// ---------------------------------------------------------------------------

/// Ereignisse die der Hub an den Koordinator meldet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEreignis {
    /// Ein Worker hat sich (neu oder wieder) registriert
    Registriert {
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
    },
    /// Eine Verbindung ist weggefallen; der Slot ist in Karenzzeit
    VerbindungGetrennt {
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
    },
    /// Karenzzeit abgelaufen; die Rolle ist endgueltig frei
    RolleVerloren {
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
    },
    /// Lebenszeichen eines Workers (Registrierung oder Pong)
    Herzschlag {
        sektion_id: SectionId,
        worker_id: WorkerId,
    },
}

// ---------------------------------------------------------------------------
// Slots & Sektionsgruppen
// ---------------------------------------------------------------------------

/// Ein registrierter (Sektion, Rolle, Worker)-Slot
struct WorkerSlot {
    worker_id: WorkerId,
    rolle: WorkerRolle,
    zustand: VerbindungsZustand,
    /// Generationsnummer der aktuellen Anbindung
    generation: u64,
    registriert_um: Instant,
    letzter_pong: Instant,
    getrennt_seit: Option<Instant>,
    /// Frame-Puffer; nur Receiver-Slots besitzen einen
    puffer: Option<FrameBuffer>,
    /// Kanal zum Verbindungs-Task; None waehrend der Karenzzeit
    steuer_tx: Option<mpsc::UnboundedSender<RelayMessage>>,
    /// Hoechste gesehene Sequenznummer (nur Forwarder)
    letzte_sequenz: u64,
}

impl WorkerSlot {
    fn neu(
        worker_id: WorkerId,
        rolle: WorkerRolle,
        generation: u64,
        puffer: Option<FrameBuffer>,
        steuer_tx: mpsc::UnboundedSender<RelayMessage>,
    ) -> Self {
        let jetzt = Instant::now();
        Self {
            worker_id,
            rolle,
            zustand: VerbindungsZustand::Aktiv,
            generation,
            registriert_um: jetzt,
            letzter_pong: jetzt,
            getrennt_seit: None,
            puffer,
            steuer_tx: Some(steuer_tx),
            letzte_sequenz: 0,
        }
    }

    /// Bindet den Slot an eine neue Verbindung (Wiederanbindung in Karenzzeit)
    fn wiederanbinden(&mut self, generation: u64, steuer_tx: mpsc::UnboundedSender<RelayMessage>) {
        self.zustand = VerbindungsZustand::Aktiv;
        self.generation = generation;
        self.registriert_um = Instant::now();
        self.letzter_pong = Instant::now();
        self.getrennt_seit = None;
        self.steuer_tx = Some(steuer_tx);
    }

    fn ist_verbunden(&self) -> bool {
        self.zustand != VerbindungsZustand::Getrennt
    }
}

/// Alle Slots einer Sektion
///
/// Wird als Ganzes hinter dem DashMap-Eintrag gesperrt; damit sind
/// Gruppeninvarianten (hoechstens ein Forwarder, Receiver-Limit) ohne
/// weitere Synchronisation pruefbar.
struct SektionGruppe {
    max_empfaenger: usize,
    forwarder: Option<WorkerSlot>,
    empfaenger: HashMap<WorkerId, WorkerSlot>,
    naechste_generation: u64,
}

impl SektionGruppe {
    fn neu(max_empfaenger: usize) -> Self {
        Self {
            max_empfaenger,
            forwarder: None,
            empfaenger: HashMap::new(),
            naechste_generation: 0,
        }
    }

    fn slot_mut(&mut self, worker_id: &WorkerId) -> Option<&mut WorkerSlot> {
        if let Some(f) = self.forwarder.as_mut() {
            if &f.worker_id == worker_id {
                return Some(f);
            }
        }
        self.empfaenger.get_mut(worker_id)
    }

    fn verbundene(&self) -> usize {
        let f = usize::from(self.forwarder.as_ref().is_some_and(|s| s.ist_verbunden()));
        f + self.empfaenger.values().filter(|s| s.ist_verbunden()).count()
    }

    fn getrennte(&self) -> usize {
        let f = usize::from(self.forwarder.as_ref().is_some_and(|s| !s.ist_verbunden()));
        f + self
            .empfaenger
            .values()
            .filter(|s| !s.ist_verbunden())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Status & Statistik
// ---------------------------------------------------------------------------

/// Momentaufnahme einer Sektionsgruppe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SektionStatus {
    /// Ist der Forwarder-Slot belegt und verbunden?
    pub forwarder_aktiv: bool,
    /// Verbundene Receiver (ohne Karenzzeit-Slots)
    pub empfaenger_aktiv: usize,
    /// Belegte Receiver-Slots inklusive Karenzzeit
    pub empfaenger_gesamt: usize,
    /// Konfiguriertes Receiver-Limit
    pub max_empfaenger: usize,
}

/// Kumulative Hub-Statistik
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStatistik {
    pub sektionen: usize,
    pub verbindungen_aktiv: usize,
    pub verbindungen_getrennt: usize,
    pub frames_empfangen: u64,
    pub frames_weitergeleitet: u64,
    pub frames_abgelehnt: u64,
    pub sequenz_verletzungen: u64,
}

// ---------------------------------------------------------------------------
// RelayHub
// ---------------------------------------------------------------------------

/// Ergebnis einer erfolgreichen Registrierung
#[derive(Debug)]
pub struct Registrierung {
    /// Puffer aus dem der Verbindungs-Task Frames zustellt (nur Receiver)
    pub puffer: Option<FrameBuffer>,
    /// Generationsnummer dieser Anbindung
    pub generation: u64,
}

struct HubInner {
    einstellungen: RelayEinstellungen,
    sektionen: DashMap<SectionId, SektionGruppe>,
    ereignis_tx: mpsc::UnboundedSender<HubEreignis>,
    frames_empfangen: AtomicU64,
    frames_weitergeleitet: AtomicU64,
    frames_abgelehnt: AtomicU64,
    sequenz_verletzungen: AtomicU64,
}

/// Zentraler Verbindungs-Broker
///
/// Thread-safe und `Clone`-faehig (innerer Arc). Ereignisse gehen ueber
/// den bei [`RelayHub::neu`] zurueckgegebenen Kanal an den Koordinator.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl RelayHub {
    /// Erstellt einen neuen Hub samt Ereigniskanal
    pub fn neu(einstellungen: RelayEinstellungen) -> (Self, mpsc::UnboundedReceiver<HubEreignis>) {
        let (ereignis_tx, ereignis_rx) = mpsc::unbounded_channel();
        let hub = Self {
            inner: Arc::new(HubInner {
                einstellungen,
                sektionen: DashMap::new(),
                ereignis_tx,
                frames_empfangen: AtomicU64::new(0),
                frames_weitergeleitet: AtomicU64::new(0),
                frames_abgelehnt: AtomicU64::new(0),
                sequenz_verletzungen: AtomicU64::new(0),
            }),
        };
        (hub, ereignis_rx)
    }

    /// Gibt die Hub-Einstellungen zurueck
    pub fn einstellungen(&self) -> &RelayEinstellungen {
        &self.inner.einstellungen
    }

    // -----------------------------------------------------------------------
    // Sektionsverwaltung
    // -----------------------------------------------------------------------

    /// Legt eine Sektionsgruppe an (Aufruf durch den Koordinator vor dem
    /// Start der Worker). Wiederholter Aufruf ist ein No-Op.
    pub fn sektion_anlegen(&self, sektion_id: SectionId, max_empfaenger: usize) {
        self.inner
            .sektionen
            .entry(sektion_id)
            .or_insert_with(|| SektionGruppe::neu(max_empfaenger.max(1)));
        tracing::debug!(sektion = %sektion_id, max_empfaenger, "Sektionsgruppe angelegt");
    }

    /// Entfernt eine Sektionsgruppe und trennt alle zugehoerigen Verbindungen
    ///
    /// Die Steuerkanaele der Verbindungs-Tasks fallen mit der Gruppe weg;
    /// die Tasks beenden sich daraufhin von selbst. Es werden keine
    /// Karenzzeit- oder Verlust-Ereignisse mehr gemeldet.
    pub fn sektion_entfernen(&self, sektion_id: &SectionId) -> usize {
        if let Some((_, gruppe)) = self.inner.sektionen.remove(sektion_id) {
            let abschied = RelayMessage::fehler(
                rundfunk_protocol::RelayErrorCode::SectionUnknown,
                "Sektion wird beendet",
            );
            let mut getrennt = 0usize;
            let slots = gruppe
                .forwarder
                .iter()
                .chain(gruppe.empfaenger.values());
            for slot in slots {
                if let Some(tx) = &slot.steuer_tx {
                    let _ = tx.send(abschied.clone());
                    getrennt += 1;
                }
            }
            tracing::info!(
                sektion = %sektion_id,
                verbindungen = getrennt,
                "Sektionsgruppe entfernt"
            );
            getrennt
        } else {
            0
        }
    }

    /// Momentaufnahme einer Sektionsgruppe
    pub fn sektion_status(&self, sektion_id: &SectionId) -> Option<SektionStatus> {
        self.inner.sektionen.get(sektion_id).map(|gruppe| {
            let empfaenger_aktiv = gruppe
                .empfaenger
                .values()
                .filter(|s| s.ist_verbunden())
                .count();
            SektionStatus {
                forwarder_aktiv: gruppe
                    .forwarder
                    .as_ref()
                    .is_some_and(|s| s.ist_verbunden()),
                empfaenger_aktiv,
                empfaenger_gesamt: gruppe.empfaenger.len(),
                max_empfaenger: gruppe.max_empfaenger,
            }
        })
    }

    // -----------------------------------------------------------------------
    // Registrierung & Abmeldung
    // -----------------------------------------------------------------------

    /// Registriert einen Worker fuer eine Sektion und Rolle
    ///
    /// Regeln:
    /// - Die Sektion muss angelegt sein, sonst [`RundfunkError::SektionNichtGefunden`]
    /// - Eine zweite Forwarder-Registrierung bei verbundenem Forwarder wird
    ///   mit [`RundfunkError::DoppelteRolle`] abgelehnt; die bestehende
    ///   Registrierung bleibt unberuehrt
    /// - Ein Slot in Karenzzeit gehoert weiter seiner Worker-Identitaet:
    ///   dieselbe Identitaet bindet sich wieder an (Puffer bleibt erhalten),
    ///   eine fremde Identitaet wird abgelehnt
    /// - Neue Receiver-Identitaeten brauchen einen freien Slot unterhalb
    ///   des Receiver-Limits
    pub fn registrieren(
        &self,
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
        steuer_tx: mpsc::UnboundedSender<RelayMessage>,
    ) -> Result<Registrierung> {
        let mut gruppe = self
            .inner
            .sektionen
            .get_mut(&sektion_id)
            .ok_or(RundfunkError::SektionNichtGefunden(sektion_id))?;

        let generation = gruppe.naechste_generation;
        gruppe.naechste_generation += 1;

        let puffer = match rolle {
            WorkerRolle::Forwarder => {
                match gruppe.forwarder.as_mut() {
                    Some(slot) if slot.ist_verbunden() || slot.worker_id != worker_id => {
                        // Slot belegt oder Karenzzeit einer fremden Identitaet
                        return Err(RundfunkError::DoppelteRolle {
                            sektion: sektion_id,
                            rolle,
                        });
                    }
                    Some(slot) => {
                        slot.wiederanbinden(generation, steuer_tx);
                        tracing::info!(
                            sektion = %sektion_id,
                            worker = %worker_id,
                            "Forwarder in Karenzzeit wieder angebunden"
                        );
                    }
                    None => {
                        gruppe.forwarder = Some(WorkerSlot::neu(
                            worker_id, rolle, generation, None, steuer_tx,
                        ));
                    }
                }
                None
            }
            WorkerRolle::Receiver => match gruppe.empfaenger.get_mut(&worker_id) {
                Some(slot) if slot.ist_verbunden() => {
                    return Err(RundfunkError::DoppelteRolle {
                        sektion: sektion_id,
                        rolle,
                    });
                }
                Some(slot) => {
                    slot.wiederanbinden(generation, steuer_tx);
                    tracing::info!(
                        sektion = %sektion_id,
                        worker = %worker_id,
                        "Receiver in Karenzzeit wieder angebunden"
                    );
                    slot.puffer.clone()
                }
                None => {
                    if gruppe.empfaenger.len() >= gruppe.max_empfaenger {
                        tracing::warn!(
                            sektion = %sektion_id,
                            worker = %worker_id,
                            limit = gruppe.max_empfaenger,
                            "Receiver-Limit erreicht – Registrierung abgelehnt"
                        );
                        return Err(RundfunkError::ServerVoll);
                    }
                    let puffer =
                        FrameBuffer::neu(self.inner.einstellungen.puffer_kapazitaet);
                    gruppe.empfaenger.insert(
                        worker_id,
                        WorkerSlot::neu(
                            worker_id,
                            rolle,
                            generation,
                            Some(puffer.clone()),
                            steuer_tx,
                        ),
                    );
                    Some(puffer)
                }
            },
        };

        drop(gruppe);

        tracing::info!(
            sektion = %sektion_id,
            worker = %worker_id,
            rolle = %rolle,
            "Worker registriert"
        );
        self.melden(HubEreignis::Registriert {
            sektion_id,
            rolle,
            worker_id,
        });
        self.melden(HubEreignis::Herzschlag {
            sektion_id,
            worker_id,
        });

        Ok(Registrierung { puffer, generation })
    }

    /// Meldet das Ende einer Verbindung (explizites Unregister, EOF oder
    /// Liveness-Timeout). Der Slot geht in die Karenzzeit.
    ///
    /// Die Generationsnummer stammt aus der Registrierung; stimmt sie nicht
    /// mehr, hat sich laengst eine neue Verbindung angebunden und der Aufruf
    /// ist ein No-Op.
    pub fn verbindung_geschlossen(
        &self,
        sektion_id: &SectionId,
        worker_id: &WorkerId,
        generation: u64,
        grund: &str,
    ) {
        let Some(mut gruppe) = self.inner.sektionen.get_mut(sektion_id) else {
            return;
        };
        let Some(slot) = gruppe.slot_mut(worker_id) else {
            return;
        };
        if slot.generation != generation || !slot.ist_verbunden() {
            return;
        }

        slot.zustand = VerbindungsZustand::Getrennt;
        slot.getrennt_seit = Some(Instant::now());
        slot.steuer_tx = None;
        let rolle = slot.rolle;
        let verbunden_s = slot.registriert_um.elapsed().as_secs();
        drop(gruppe);

        tracing::info!(
            sektion = %sektion_id,
            worker = %worker_id,
            rolle = %rolle,
            verbunden_s,
            grund,
            "Verbindung getrennt – Karenzzeit beginnt"
        );
        self.melden(HubEreignis::VerbindungGetrennt {
            sektion_id: *sektion_id,
            rolle,
            worker_id: *worker_id,
        });
    }

    // -----------------------------------------------------------------------
    // Frame-Weiterleitung
    // -----------------------------------------------------------------------

    /// Leitet ein Frame des Forwarders an alle verbundenen Receiver weiter
    ///
    /// Nur der registrierte, verbundene Forwarder der Sektion darf senden;
    /// alle anderen Absender werden abgelehnt. Slots in Karenzzeit werden
    /// uebersprungen, die Zustellung laeuft fuer sie nach Wiederanbindung
    /// beim naechsten Frame weiter.
    ///
    /// Gibt die Anzahl der belieferten Receiver zurueck.
    pub fn frame_verteilen(
        &self,
        sektion_id: &SectionId,
        absender: &WorkerId,
        frame: AudioFrame,
    ) -> Result<usize> {
        let mut gruppe = match self.inner.sektionen.get_mut(sektion_id) {
            Some(g) => g,
            None => {
                self.inner.frames_abgelehnt.fetch_add(1, Ordering::Relaxed);
                return Err(RundfunkError::SektionNichtGefunden(*sektion_id));
            }
        };

        let forwarder = match gruppe.forwarder.as_mut() {
            Some(f) if f.ist_verbunden() && &f.worker_id == absender => f,
            _ => {
                drop(gruppe);
                self.inner.frames_abgelehnt.fetch_add(1, Ordering::Relaxed);
                return Err(RundfunkError::NichtRegistriert(format!(
                    "Frame von {absender} ohne registrierten Forwarder verworfen"
                )));
            }
        };

        // Sequenznummern sind pro Produzent monoton nicht-fallend
        if frame.sequenz < forwarder.letzte_sequenz {
            self.inner
                .sequenz_verletzungen
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                sektion = %sektion_id,
                worker = %absender,
                sequenz = frame.sequenz,
                letzte = forwarder.letzte_sequenz,
                "Ruecklaeufige Sequenznummer"
            );
        }
        forwarder.letzte_sequenz = frame.sequenz;

        let mut zugestellt = 0usize;
        for slot in gruppe.empfaenger.values() {
            if !slot.ist_verbunden() {
                continue;
            }
            if let Some(puffer) = &slot.puffer {
                puffer.push(frame.clone());
                zugestellt += 1;
            }
        }
        drop(gruppe);

        self.inner.frames_empfangen.fetch_add(1, Ordering::Relaxed);
        self.inner
            .frames_weitergeleitet
            .fetch_add(zugestellt as u64, Ordering::Relaxed);
        tracing::trace!(
            sektion = %sektion_id,
            sequenz = frame.sequenz,
            empfaenger = zugestellt,
            "Frame weitergeleitet"
        );
        Ok(zugestellt)
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Verbucht ein Pong; ein veralteter Slot gilt wieder als aktiv
    pub fn pong_empfangen(&self, sektion_id: &SectionId, worker_id: &WorkerId) {
        let Some(mut gruppe) = self.inner.sektionen.get_mut(sektion_id) else {
            return;
        };
        let Some(slot) = gruppe.slot_mut(worker_id) else {
            return;
        };
        if !slot.ist_verbunden() {
            return;
        }
        slot.letzter_pong = Instant::now();
        if slot.zustand == VerbindungsZustand::Veraltet {
            tracing::info!(sektion = %sektion_id, worker = %worker_id, "Verbindung wieder aktiv");
        }
        slot.zustand = VerbindungsZustand::Aktiv;
        drop(gruppe);

        self.melden(HubEreignis::Herzschlag {
            sektion_id: *sektion_id,
            worker_id: *worker_id,
        });
    }

    /// Markiert einen Slot als veraltet (keine Pongs seit der Schwelle)
    ///
    /// Gibt true zurueck wenn der Slot neu markiert wurde.
    pub fn veraltet_markieren(&self, sektion_id: &SectionId, worker_id: &WorkerId) -> bool {
        let Some(mut gruppe) = self.inner.sektionen.get_mut(sektion_id) else {
            return false;
        };
        let Some(slot) = gruppe.slot_mut(worker_id) else {
            return false;
        };
        if slot.zustand != VerbindungsZustand::Aktiv {
            return false;
        }
        slot.zustand = VerbindungsZustand::Veraltet;
        tracing::warn!(
            sektion = %sektion_id,
            worker = %worker_id,
            letzter_pong_ms = slot.letzter_pong.elapsed().as_millis() as u64,
            "Keine Pongs – Verbindung veraltet"
        );
        true
    }

    /// Prueft alle Slots auf abgelaufene Karenzzeiten und gibt Rollen frei
    ///
    /// Gibt die Anzahl der freigegebenen Slots zurueck.
    pub fn karenzzeiten_pruefen(&self) -> usize {
        let karenzzeit = self.inner.einstellungen.karenzzeit;
        let mut verloren: Vec<(SectionId, WorkerRolle, WorkerId)> = Vec::new();

        for mut eintrag in self.inner.sektionen.iter_mut() {
            let sektion_id = *eintrag.key();
            let gruppe = eintrag.value_mut();

            if let Some(f) = gruppe.forwarder.as_ref() {
                if abgelaufen(f, karenzzeit) {
                    verloren.push((sektion_id, WorkerRolle::Forwarder, f.worker_id));
                    gruppe.forwarder = None;
                }
            }

            let abgelaufene: Vec<WorkerId> = gruppe
                .empfaenger
                .values()
                .filter(|s| abgelaufen(s, karenzzeit))
                .map(|s| s.worker_id)
                .collect();
            for worker_id in abgelaufene {
                gruppe.empfaenger.remove(&worker_id);
                verloren.push((sektion_id, WorkerRolle::Receiver, worker_id));
            }
        }

        let anzahl = verloren.len();
        for (sektion_id, rolle, worker_id) in verloren {
            tracing::warn!(
                sektion = %sektion_id,
                worker = %worker_id,
                rolle = %rolle,
                "Karenzzeit abgelaufen – Rolle endgueltig verloren"
            );
            self.melden(HubEreignis::RolleVerloren {
                sektion_id,
                rolle,
                worker_id,
            });
        }
        anzahl
    }

    /// Ueberwachungsschleife: prueft periodisch die Karenzzeiten
    ///
    /// Laeuft bis `shutdown_rx` true signalisiert. Wird vom Server als
    /// eigener Task gestartet.
    pub async fn ueberwachen(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut takt = tokio::time::interval(KARENZ_PRUEF_INTERVALL);
        takt.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = takt.tick() => {
                    self.karenzzeiten_pruefen();
                }
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("Hub-Ueberwachung beendet");
                        return;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Statistik
    // -----------------------------------------------------------------------

    /// Kumulative Hub-Statistik fuer Health-Reporting
    pub fn statistik(&self) -> HubStatistik {
        let mut aktiv = 0usize;
        let mut getrennt = 0usize;
        for eintrag in self.inner.sektionen.iter() {
            aktiv += eintrag.verbundene();
            getrennt += eintrag.getrennte();
        }
        HubStatistik {
            sektionen: self.inner.sektionen.len(),
            verbindungen_aktiv: aktiv,
            verbindungen_getrennt: getrennt,
            frames_empfangen: self.inner.frames_empfangen.load(Ordering::Relaxed),
            frames_weitergeleitet: self.inner.frames_weitergeleitet.load(Ordering::Relaxed),
            frames_abgelehnt: self.inner.frames_abgelehnt.load(Ordering::Relaxed),
            sequenz_verletzungen: self.inner.sequenz_verletzungen.load(Ordering::Relaxed),
        }
    }

    fn melden(&self, ereignis: HubEreignis) {
        // Ohne Koordinator (Standalone-Betrieb, Tests) verpuffen Ereignisse
        let _ = self.inner.ereignis_tx.send(ereignis);
    }
}

fn abgelaufen(slot: &WorkerSlot, karenzzeit: Duration) -> bool {
    match slot.getrennt_seit {
        Some(seit) => slot.zustand == VerbindungsZustand::Getrennt && seit.elapsed() >= karenzzeit,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_hub(karenzzeit: Duration) -> (RelayHub, mpsc::UnboundedReceiver<HubEreignis>) {
        RelayHub::neu(RelayEinstellungen {
            karenzzeit,
            puffer_kapazitaet: 8,
            ..RelayEinstellungen::default()
        })
    }

    fn steuer() -> (
        mpsc::UnboundedSender<RelayMessage>,
        mpsc::UnboundedReceiver<RelayMessage>,
    ) {
        mpsc::unbounded_channel()
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::neu(seq, seq * 20, Bytes::from_static(b"opus"))
    }

    #[test]
    fn registrierung_braucht_sektion() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let (tx, _rx) = steuer();
        let fehler = hub
            .registrieren(
                SectionId::new(),
                WorkerRolle::Forwarder,
                WorkerId::new(),
                tx,
            )
            .unwrap_err();
        assert!(matches!(fehler, RundfunkError::SektionNichtGefunden(_)));
    }

    #[test]
    fn doppelter_forwarder_wird_abgelehnt() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 2);

        let (tx1, _rx1) = steuer();
        hub.registrieren(sektion, WorkerRolle::Forwarder, WorkerId::new(), tx1)
            .unwrap();

        let (tx2, _rx2) = steuer();
        let fehler = hub
            .registrieren(sektion, WorkerRolle::Forwarder, WorkerId::new(), tx2)
            .unwrap_err();
        assert!(
            matches!(fehler, RundfunkError::DoppelteRolle { .. }),
            "Zweiter Forwarder muss abgelehnt werden"
        );

        // Bestehende Registrierung unberuehrt
        let status = hub.sektion_status(&sektion).unwrap();
        assert!(status.forwarder_aktiv);
    }

    #[test]
    fn empfaenger_limit_wird_erzwungen() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 1);

        let (tx1, _rx1) = steuer();
        hub.registrieren(sektion, WorkerRolle::Receiver, WorkerId::new(), tx1)
            .unwrap();

        let (tx2, _rx2) = steuer();
        let fehler = hub
            .registrieren(sektion, WorkerRolle::Receiver, WorkerId::new(), tx2)
            .unwrap_err();
        assert!(matches!(fehler, RundfunkError::ServerVoll));
    }

    #[test]
    fn fanout_erreicht_alle_verbundenen_empfaenger() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 4);

        let fwd = WorkerId::new();
        let (tx_f, _rx_f) = steuer();
        hub.registrieren(sektion, WorkerRolle::Forwarder, fwd, tx_f)
            .unwrap();

        let (tx1, _rx1) = steuer();
        let puffer1 = hub
            .registrieren(sektion, WorkerRolle::Receiver, WorkerId::new(), tx1)
            .unwrap()
            .puffer
            .unwrap();
        let (tx2, _rx2) = steuer();
        let puffer2 = hub
            .registrieren(sektion, WorkerRolle::Receiver, WorkerId::new(), tx2)
            .unwrap()
            .puffer
            .unwrap();

        for seq in 1..=3 {
            let zugestellt = hub.frame_verteilen(&sektion, &fwd, frame(seq)).unwrap();
            assert_eq!(zugestellt, 2);
        }

        for puffer in [&puffer1, &puffer2] {
            let seqs: Vec<u64> = (0..3).filter_map(|_| puffer.try_pop()).map(|f| f.sequenz).collect();
            assert_eq!(seqs, vec![1, 2, 3], "Reihenfolge muss erhalten bleiben");
        }
    }

    #[test]
    fn frames_nur_vom_registrierten_forwarder() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 2);

        // Ohne Forwarder: abgelehnt
        let fremd = WorkerId::new();
        let fehler = hub.frame_verteilen(&sektion, &fremd, frame(1)).unwrap_err();
        assert!(matches!(fehler, RundfunkError::NichtRegistriert(_)));

        // Mit Forwarder: nur dessen Identitaet darf senden
        let fwd = WorkerId::new();
        let (tx, _rx) = steuer();
        hub.registrieren(sektion, WorkerRolle::Forwarder, fwd, tx)
            .unwrap();
        assert!(hub.frame_verteilen(&sektion, &fwd, frame(1)).is_ok());
        assert!(hub.frame_verteilen(&sektion, &fremd, frame(2)).is_err());

        assert_eq!(hub.statistik().frames_abgelehnt, 2);
    }

    #[test]
    fn getrennte_empfaenger_werden_uebersprungen() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 4);

        let fwd = WorkerId::new();
        let (tx_f, _rx_f) = steuer();
        hub.registrieren(sektion, WorkerRolle::Forwarder, fwd, tx_f)
            .unwrap();

        let empfaenger = WorkerId::new();
        let (tx_e, _rx_e) = steuer();
        let reg = hub
            .registrieren(sektion, WorkerRolle::Receiver, empfaenger, tx_e)
            .unwrap();
        let puffer = reg.puffer.unwrap();

        hub.frame_verteilen(&sektion, &fwd, frame(1)).unwrap();
        hub.verbindung_geschlossen(&sektion, &empfaenger, reg.generation, "Test");

        // Waehrend der Karenzzeit: keine Zustellung
        let zugestellt = hub.frame_verteilen(&sektion, &fwd, frame(2)).unwrap();
        assert_eq!(zugestellt, 0);
        assert_eq!(puffer.belegung(), 1, "Nur das Frame vor der Trennung");
    }

    #[test]
    fn wiederanbindung_behaelt_puffer_und_liefert_weiter() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 2);

        let fwd = WorkerId::new();
        let (tx_f, _rx_f) = steuer();
        hub.registrieren(sektion, WorkerRolle::Forwarder, fwd, tx_f)
            .unwrap();

        let empfaenger = WorkerId::new();
        let (tx1, _rx1) = steuer();
        let reg1 = hub
            .registrieren(sektion, WorkerRolle::Receiver, empfaenger, tx1)
            .unwrap();

        hub.frame_verteilen(&sektion, &fwd, frame(1)).unwrap();
        hub.verbindung_geschlossen(&sektion, &empfaenger, reg1.generation, "Test");
        hub.frame_verteilen(&sektion, &fwd, frame(2)).unwrap();

        // Gleiche Identitaet bindet sich wieder an
        let (tx2, _rx2) = steuer();
        let reg2 = hub
            .registrieren(sektion, WorkerRolle::Receiver, empfaenger, tx2)
            .unwrap();
        let puffer = reg2.puffer.unwrap();
        hub.frame_verteilen(&sektion, &fwd, frame(3)).unwrap();

        let seqs: Vec<u64> = (0..puffer.belegung())
            .filter_map(|_| puffer.try_pop())
            .map(|f| f.sequenz)
            .collect();
        assert_eq!(
            seqs,
            vec![1, 3],
            "Frame waehrend der Trennung fehlt, Zustellung laeuft ab dem naechsten Frame weiter"
        );
    }

    #[test]
    fn fremde_identitaet_darf_karenz_slot_nicht_uebernehmen() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 4);

        let fwd = WorkerId::new();
        let (tx1, _rx1) = steuer();
        let reg = hub
            .registrieren(sektion, WorkerRolle::Forwarder, fwd, tx1)
            .unwrap();
        hub.verbindung_geschlossen(&sektion, &fwd, reg.generation, "Test");

        let (tx2, _rx2) = steuer();
        let fehler = hub
            .registrieren(sektion, WorkerRolle::Forwarder, WorkerId::new(), tx2)
            .unwrap_err();
        assert!(matches!(fehler, RundfunkError::DoppelteRolle { .. }));
    }

    #[test]
    fn karenzablauf_gibt_rolle_frei_und_meldet_verlust() {
        let (hub, mut ereignisse) = test_hub(Duration::from_millis(0));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 2);

        let fwd = WorkerId::new();
        let (tx, _rx) = steuer();
        let reg = hub
            .registrieren(sektion, WorkerRolle::Forwarder, fwd, tx)
            .unwrap();
        hub.verbindung_geschlossen(&sektion, &fwd, reg.generation, "Test");

        let freigegeben = hub.karenzzeiten_pruefen();
        assert_eq!(freigegeben, 1);

        // Ereignisfolge: Registriert, Herzschlag, VerbindungGetrennt, RolleVerloren
        let mut gesehen = Vec::new();
        while let Ok(e) = ereignisse.try_recv() {
            gesehen.push(e);
        }
        assert!(gesehen.contains(&HubEreignis::RolleVerloren {
            sektion_id: sektion,
            rolle: WorkerRolle::Forwarder,
            worker_id: fwd,
        }));

        // Slot ist frei: neue Identitaet darf registrieren
        let (tx2, _rx2) = steuer();
        assert!(hub
            .registrieren(sektion, WorkerRolle::Forwarder, WorkerId::new(), tx2)
            .is_ok());
    }

    #[test]
    fn veraltete_generation_trennt_nicht() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 2);

        let empfaenger = WorkerId::new();
        let (tx1, _rx1) = steuer();
        let reg1 = hub
            .registrieren(sektion, WorkerRolle::Receiver, empfaenger, tx1)
            .unwrap();
        hub.verbindung_geschlossen(&sektion, &empfaenger, reg1.generation, "Test");

        let (tx2, _rx2) = steuer();
        hub.registrieren(sektion, WorkerRolle::Receiver, empfaenger, tx2)
            .unwrap();

        // Spaetes Aufraeumen der alten Verbindung darf den neuen Slot nicht treffen
        hub.verbindung_geschlossen(&sektion, &empfaenger, reg1.generation, "Nachzuegler");
        let status = hub.sektion_status(&sektion).unwrap();
        assert_eq!(status.empfaenger_aktiv, 1);
    }

    #[test]
    fn sektionen_sind_isoliert() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion_a = SectionId::new();
        let sektion_b = SectionId::new();
        hub.sektion_anlegen(sektion_a, 2);
        hub.sektion_anlegen(sektion_b, 2);

        let fwd_a = WorkerId::new();
        let (tx_fa, _rx_fa) = steuer();
        hub.registrieren(sektion_a, WorkerRolle::Forwarder, fwd_a, tx_fa)
            .unwrap();
        let (tx_ea, _rx_ea) = steuer();
        let puffer_a = hub
            .registrieren(sektion_a, WorkerRolle::Receiver, WorkerId::new(), tx_ea)
            .unwrap()
            .puffer
            .unwrap();
        let (tx_eb, _rx_eb) = steuer();
        let puffer_b = hub
            .registrieren(sektion_b, WorkerRolle::Receiver, WorkerId::new(), tx_eb)
            .unwrap()
            .puffer
            .unwrap();

        hub.frame_verteilen(&sektion_a, &fwd_a, frame(1)).unwrap();

        assert_eq!(puffer_a.belegung(), 1);
        assert_eq!(puffer_b.belegung(), 0, "Fremde Sektion darf nichts sehen");
    }

    #[test]
    fn sektion_entfernen_trennt_steuerkanaele() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 2);

        let (tx, mut rx) = steuer();
        hub.registrieren(sektion, WorkerRolle::Receiver, WorkerId::new(), tx.clone())
            .unwrap();
        drop(tx);

        let getrennt = hub.sektion_entfernen(&sektion);
        assert_eq!(getrennt, 1);
        assert!(hub.sektion_status(&sektion).is_none());
        // Abschiedsnachricht, danach faellt der Steuerkanal mit der Gruppe weg
        assert!(matches!(
            rx.blocking_recv(),
            Some(RelayMessage::Error { .. })
        ));
        assert!(rx.blocking_recv().is_none());

        // Idempotent
        assert_eq!(hub.sektion_entfernen(&sektion), 0);
    }

    #[test]
    fn sequenz_ruecklauf_wird_gezaehlt() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 2);

        let fwd = WorkerId::new();
        let (tx, _rx) = steuer();
        hub.registrieren(sektion, WorkerRolle::Forwarder, fwd, tx)
            .unwrap();

        hub.frame_verteilen(&sektion, &fwd, frame(5)).unwrap();
        hub.frame_verteilen(&sektion, &fwd, frame(5)).unwrap(); // Gleichstand erlaubt
        hub.frame_verteilen(&sektion, &fwd, frame(3)).unwrap();

        assert_eq!(hub.statistik().sequenz_verletzungen, 1);
    }

    #[test]
    fn pong_macht_veralteten_slot_wieder_aktiv() {
        let (hub, _ereignisse) = test_hub(Duration::from_secs(30));
        let sektion = SectionId::new();
        hub.sektion_anlegen(sektion, 2);

        let worker = WorkerId::new();
        let (tx, _rx) = steuer();
        hub.registrieren(sektion, WorkerRolle::Forwarder, worker, tx)
            .unwrap();

        assert!(hub.veraltet_markieren(&sektion, &worker));
        assert!(!hub.veraltet_markieren(&sektion, &worker), "Nur einmal markieren");
        assert!(hub.sektion_status(&sektion).unwrap().forwarder_aktiv);

        hub.pong_empfangen(&sektion, &worker);
        assert!(hub.veraltet_markieren(&sektion, &worker), "Nach Pong wieder aktiv");
    }
}
