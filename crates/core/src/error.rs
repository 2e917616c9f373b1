//! Fehlertypen fuer Rundfunk
//!
//! Zentraler Fehler-Enum der alle moeglichen Fehlerzustaende abdeckt.
//! Untermodule koennen eigene Fehler definieren und via `#[from]` konvertieren.

use crate::types::{SectionId, WorkerId, WorkerRolle};
use thiserror::Error;

/// Globaler Result-Alias fuer Rundfunk
pub type Result<T> = std::result::Result<T, RundfunkError>;

/// Alle moeglichen Fehler im Rundfunk-System
#[derive(Debug, Error)]
pub enum RundfunkError {
    // --- Verbindung & Netzwerk ---
    #[error("Verbindung verloren: {0}")]
    VerbindungVerloren(String),

    #[error("Zeitlimit ueberschritten: {0}")]
    Zeitlimit(String),

    #[error("Server voll: maximale Verbindungsanzahl erreicht")]
    ServerVoll,

    // --- Registrierung & Rollen ---
    #[error("Doppelte Rolle: Sektion {sektion} hat bereits einen registrierten {rolle}")]
    DoppelteRolle {
        sektion: SectionId,
        rolle: WorkerRolle,
    },

    #[error("Nicht registriert: {0}")]
    NichtRegistriert(String),

    #[error("Sektion nicht gefunden: {0}")]
    SektionNichtGefunden(SectionId),

    // --- Worker & Prozesse ---
    #[error("Keine freien Tokens fuer Rolle {0}")]
    TokensErschoepft(WorkerRolle),

    #[error("Prozessstart fehlgeschlagen: {0}")]
    ProzessStart(String),

    #[error("Worker nicht gefunden: {0}")]
    WorkerNichtGefunden(WorkerId),

    // --- Puffer ---
    #[error("Pufferueberlauf: {verworfen} Frames verworfen")]
    PufferUeberlauf { verworfen: u64 },

    // --- Bereitstellung ---
    #[error("Kanal-Bereitstellung fehlgeschlagen: {0}")]
    Bereitstellung(String),

    // --- Zustandsmaschine ---
    #[error("Ungueltiger Zustandsuebergang: {von} -> {nach}")]
    UngueltigerZustand { von: String, nach: String },

    // --- Protokoll ---
    #[error("Ungueltige Nachricht: {0}")]
    UngueltigeNachricht(String),

    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Intern ---
    #[error("Interner Fehler: {0}")]
    Intern(String),

    #[error("IO-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisierungsfehler: {0}")]
    Serialisierung(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RundfunkError {
    /// Erstellt einen internen Fehler aus einer beliebigen Nachricht
    pub fn intern(msg: impl Into<String>) -> Self {
        Self::Intern(msg.into())
    }

    /// Gibt true zurueck wenn der Fehler wiederholbar sein koennte
    ///
    /// Wiederholbare Fehler werden lokal behandelt (Grace-Periode,
    /// Neustart-Policy) und nicht an den Aufrufer durchgereicht.
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(
            self,
            Self::VerbindungVerloren(_)
                | Self::Zeitlimit(_)
                | Self::ProzessStart(_)
                | Self::PufferUeberlauf { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fehler_anzeige() {
        let e = RundfunkError::TokensErschoepft(WorkerRolle::Receiver);
        assert_eq!(e.to_string(), "Keine freien Tokens fuer Rolle receiver");
    }

    #[test]
    fn wiederholbar_erkennung() {
        assert!(RundfunkError::VerbindungVerloren("test".into()).ist_wiederholbar());
        assert!(RundfunkError::ProzessStart("test".into()).ist_wiederholbar());
        assert!(!RundfunkError::Bereitstellung("test".into()).ist_wiederholbar());
        assert!(!RundfunkError::TokensErschoepft(WorkerRolle::Forwarder).ist_wiederholbar());
    }

    #[test]
    fn doppelte_rolle_nennt_sektion_und_rolle() {
        let sektion = SectionId::new();
        let e = RundfunkError::DoppelteRolle {
            sektion,
            rolle: WorkerRolle::Forwarder,
        };
        let text = e.to_string();
        assert!(text.contains("forwarder"));
        assert!(text.contains(&sektion.to_string()));
    }
}
