//! Gemeinsame Identifikations- und Grundtypen fuer Rundfunk
//!
//! Alle IDs verwenden das Newtype-Pattern um Verwechslungen zwischen
//! verschiedenen ID-Arten zur Compilezeit auszuschliessen.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Eindeutige Sektions-ID (eine logische Uebertragung)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectionId(pub Uuid);

impl SectionId {
    /// Erstellt eine neue zufaellige SectionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for SectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "section:{}", self.0)
    }
}

/// Eindeutige Worker-ID (stabil ueber Prozess-Neustarts hinweg,
/// da sie am Token haengt und nicht am Prozess)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Erstellt eine neue zufaellige WorkerId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker:{}", self.0)
    }
}

/// Eindeutige Kanal-ID (Referenz auf einen extern bereitgestellten Kanal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    /// Erstellt eine neue zufaellige ChannelId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Gibt die innere UUID zurueck
    pub fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel:{}", self.0)
    }
}

/// Rolle eines Workers innerhalb einer Sektion
///
/// Ein Forwarder produziert Audio-Frames, ein Receiver konsumiert sie.
/// Die Wire-Repraesentation ist snake_case ("forwarder" / "receiver").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRolle {
    Forwarder,
    Receiver,
}

impl WorkerRolle {
    /// Gibt true zurueck wenn diese Rolle Audio produziert
    pub fn ist_forwarder(&self) -> bool {
        matches!(self, Self::Forwarder)
    }

    /// Gibt true zurueck wenn diese Rolle Audio konsumiert
    pub fn ist_receiver(&self) -> bool {
        matches!(self, Self::Receiver)
    }
}

impl std::fmt::Display for WorkerRolle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forwarder => write!(f, "forwarder"),
            Self::Receiver => write!(f, "receiver"),
        }
    }
}

/// Bereitgestellter Kanalsatz einer Sektion
///
/// Wird vom externen ChannelProvisioner erzeugt und beim Beenden der
/// Sektion wieder abgebaut. Der Sprecherkanal ist der Kanal aus dem der
/// Forwarder aufnimmt, der Sektionskanal der Kanal in den die Receiver
/// wiedergeben.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KanalSatz {
    pub sektions_kanal: ChannelId,
    pub sprecher_kanal: ChannelId,
}

/// Ein encodiertes Audio-Frame wie es durch das Relay fliesst
///
/// Der Payload ist fuer das Relay opak (bereits encodiertes Audio).
/// Frames sind nach Erzeugung unveraenderlich; die Sequenznummer ist
/// pro Produzent monoton nicht-fallend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequenz: u64,
    pub zeitstempel_ms: u64,
    pub daten: Bytes,
}

impl AudioFrame {
    /// Erstellt ein neues Frame aus fertigen Bestandteilen
    pub fn neu(sequenz: u64, zeitstempel_ms: u64, daten: Bytes) -> Self {
        Self {
            sequenz,
            zeitstempel_ms,
            daten,
        }
    }

    /// Erstellt einen Stille-Marker (leerer Payload)
    ///
    /// Wird von Wiedergabe-Schleifen eingesetzt wenn der Puffer leer
    /// laeuft, damit der Ausgabetakt nie blockiert.
    pub fn stille(sequenz: u64) -> Self {
        Self {
            sequenz,
            zeitstempel_ms: 0,
            daten: Bytes::new(),
        }
    }

    /// Gibt true zurueck wenn dieses Frame ein Stille-Marker ist
    pub fn ist_stille(&self) -> bool {
        self.daten.is_empty()
    }

    /// Payload-Groesse in Bytes
    pub fn groesse(&self) -> usize {
        self.daten.len()
    }
}
