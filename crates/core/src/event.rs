//! Oeffentliche Lebenszyklus-Ereignisse
//!
//! Diese Ereignisse sind die nach aussen sichtbare Schnittstelle des
//! Koordinators: die Kommando-Schicht (ausserhalb dieses Repos) konsumiert
//! sie ueber einen tokio-Kanal. Sie sind serde-faehig damit sie bei Bedarf
//! unveraendert ueber ein Wire-Format weitergereicht werden koennen.

use crate::types::{SectionId, WorkerId, WorkerRolle};
use serde::{Deserialize, Serialize};

/// Alle Ereignisse die der SectionCoordinator nach aussen meldet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RundfunkEvent {
    // --- Sektions-Lebenszyklus ---
    /// Eine Sektion wurde angelegt (Zustand CREATED)
    SektionErstellt { sektion_id: SectionId, name: String },
    /// Eine Sektion ist aktiv; Frames fliessen
    SektionAktiv {
        sektion_id: SectionId,
        empfaenger_aktiv: usize,
        empfaenger_gewuenscht: usize,
    },
    /// Eine Sektion ist degradiert und wird gestoppt
    SektionDegradiert { sektion_id: SectionId, grund: String },
    /// Eine Sektion wurde beendet und aus dem aktiven Bestand entfernt
    SektionBeendet { sektion_id: SectionId },

    // --- Kapazitaet ---
    /// Die Sektion startete mit weniger Receivern als angefragt
    Teilkapazitaet {
        sektion_id: SectionId,
        gewuenscht: usize,
        erhalten: usize,
    },
    /// Eine Rolle ist verloren gegangen; bei `endgueltig` greift keine
    /// Neustart-Policy mehr
    RolleVerloren {
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
        endgueltig: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ist_serde_kompatibel() {
        let event = RundfunkEvent::Teilkapazitaet {
            sektion_id: SectionId::new(),
            gewuenscht: 5,
            erhalten: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        let _: RundfunkEvent = serde_json::from_str(&json).unwrap();
    }
}
