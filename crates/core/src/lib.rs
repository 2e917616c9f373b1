//! rundfunk-core – Gemeinsame Typen, Rollen und Fehlertypen
//!
//! Dieses Crate stellt die fundamentalen Bausteine bereit, die von allen
//! anderen Rundfunk-Crates gemeinsam genutzt werden.

pub mod error;
pub mod event;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{Result, RundfunkError};
pub use event::RundfunkEvent;
pub use types::{AudioFrame, ChannelId, KanalSatz, SectionId, WorkerId, WorkerRolle};
