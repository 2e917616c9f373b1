//! rundfunk-protocol – Netzwerkprotokoll-Definitionen
//!
//! Dieses Crate definiert alle Nachrichtentypen des Relay-Protokolls
//! sowie das laengenpraefixierte Wire-Format.

pub mod relay;
pub mod wire;

pub use relay::{RelayErrorCode, RelayMessage};
pub use wire::{RelayCodec, DEFAULT_MAX_MESSAGE_SIZE};
