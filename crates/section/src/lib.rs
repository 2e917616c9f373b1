//! rundfunk-section – Sektions-Lebenszyklus und Koordination
//!
//! Eine Sektion ist eine logische Uebertragung: ein Kanalsatz, ein
//! Forwarder und N Receiver. Der [`SectionCoordinator`] fuehrt jede
//! Sektion durch ihre Zustandsmaschine und verdrahtet Hub-Ereignisse,
//! Supervisor-Ereignisse und den externen [`ChannelProvisioner`].

pub mod koordinator;
pub mod provisioner;
pub mod zustand;

// Bequeme Re-Exporte der wichtigsten Typen
pub use koordinator::{SectionCoordinator, SektionEinstellungen, SektionInfo};
pub use provisioner::{ChannelProvisioner, NoOpProvisioner};
pub use zustand::SektionZustand;
