//! Relay-Protokoll (TCP)
//!
//! Definiert alle Nachrichten die zwischen Workern und dem RelayHub
//! ausgetauscht werden.
//!
//! ## Design
//! - Tagged Enum: das `type`-Feld unterscheidet die Nachrichtenarten
//! - JSON-Serialisierung via serde; Audio-Payloads werden base64-kodiert
//!   da das Wire-Format textbasiert ist
//! - Sequenznummern sind pro Forwarder monoton nicht-fallend

use bytes::Bytes;
use rundfunk_core::types::{AudioFrame, SectionId, WorkerId, WorkerRolle};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Fehler-Codes
// ---------------------------------------------------------------------------

/// Standardisierte Fehler-Codes fuer Error-Nachrichten des Hubs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayErrorCode {
    // Registrierung
    DuplicateRole,
    NotRegistered,
    SectionUnknown,
    // Protokoll
    ProtocolViolation,
    // Kapazitaet
    ServerFull,
    // Allgemein
    InternalError,
}

// ---------------------------------------------------------------------------
// base64-Payload
// ---------------------------------------------------------------------------

/// serde-Adapter: `Bytes` <-> base64-String im JSON
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(daten: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(daten))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Haupt-Enum: RelayMessage
// ---------------------------------------------------------------------------

/// Alle Nachrichten des Relay-Protokolls (typsicher via Tagged Enum)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Bindet eine neue Verbindung an (Sektion, Rolle, Worker-Identitaet)
    Register {
        section_id: SectionId,
        role: WorkerRolle,
        worker_id: WorkerId,
    },

    /// Bestaetigung des Hubs nach erfolgreicher Registrierung
    Registered {
        section_id: SectionId,
        worker_id: WorkerId,
    },

    /// Ein Audio-Frame vom Forwarder
    Frame {
        section_id: SectionId,
        worker_id: WorkerId,
        /// Monoton steigende Sequenznummer des Produzenten
        seq: u64,
        /// Aufnahmezeitpunkt in Millisekunden
        timestamp_ms: u64,
        /// Encodiertes Audio, base64 im JSON
        #[serde(with = "b64")]
        payload: Bytes,
    },

    /// Liveness-Probe (Hub -> Client, Clients duerfen ebenfalls pingen)
    Ping {
        /// Unix-Timestamp in Millisekunden fuer RTT-Messung
        timestamp_ms: u64,
    },

    /// Antwort auf einen Ping (spiegelt den Timestamp zurueck)
    Pong { echo_timestamp_ms: u64 },

    /// Explizite Abmeldung; der Hub gibt den Slot ohne Timeout-Wartezeit frei
    Unregister {
        section_id: SectionId,
        worker_id: WorkerId,
    },

    /// Fehlermeldung vom Hub
    Error {
        code: RelayErrorCode,
        message: String,
    },
}

impl RelayMessage {
    /// Erstellt eine Register-Nachricht
    pub fn register(section_id: SectionId, role: WorkerRolle, worker_id: WorkerId) -> Self {
        Self::Register {
            section_id,
            role,
            worker_id,
        }
    }

    /// Erstellt eine Frame-Nachricht aus einem AudioFrame
    pub fn frame(section_id: SectionId, worker_id: WorkerId, frame: &AudioFrame) -> Self {
        Self::Frame {
            section_id,
            worker_id,
            seq: frame.sequenz,
            timestamp_ms: frame.zeitstempel_ms,
            payload: frame.daten.clone(),
        }
    }

    /// Erstellt eine Ping-Nachricht
    pub fn ping(timestamp_ms: u64) -> Self {
        Self::Ping { timestamp_ms }
    }

    /// Erstellt eine Pong-Antwort
    pub fn pong(echo_timestamp_ms: u64) -> Self {
        Self::Pong { echo_timestamp_ms }
    }

    /// Erstellt eine Fehler-Nachricht
    pub fn fehler(code: RelayErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Extrahiert das AudioFrame aus einer Frame-Nachricht
    pub fn als_audio_frame(&self) -> Option<AudioFrame> {
        match self {
            Self::Frame {
                seq,
                timestamp_ms,
                payload,
                ..
            } => Some(AudioFrame::neu(*seq, *timestamp_ms, payload.clone())),
            _ => None,
        }
    }

    /// Serialisiert die Nachricht als JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialisiert eine Nachricht aus JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
