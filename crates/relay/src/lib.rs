//! rundfunk-relay – Verbindungs-Hub und TCP-Relay fuer Audio-Frames
//!
//! Herzstueck des Fan-Outs: der [`RelayHub`] gruppiert Verbindungen nach
//! (Sektion, Rolle) und leitet Frames vom Forwarder an alle Receiver der
//! Sektion weiter. Der [`RelayServer`] stellt den TCP-Endpunkt bereit,
//! der [`RelayClient`] die Worker-Seite des Protokolls.

pub mod client;
pub mod connection;
pub mod hub;
pub mod tcp;

// Bequeme Re-Exporte der wichtigsten Typen
pub use client::RelayClient;
pub use connection::RelayVerbindung;
pub use hub::{
    HubEreignis, HubStatistik, Registrierung, RelayEinstellungen, RelayHub, SektionStatus,
    VerbindungsZustand,
};
pub use tcp::RelayServer;
