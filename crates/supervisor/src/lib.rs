//! rundfunk-supervisor – Token-Pool und Prozess-Aufsicht
//!
//! Besitzt die endliche Menge der Worker-Identitaeten und die laufenden
//! OS-Prozesse: Spawnen mit Umgebungs-Kontrakt, Herzschlag-Ueberwachung,
//! Neustarts mit exponentiellem Backoff und saubere Token-Rueckgabe auf
//! jedem Austrittspfad.

pub mod prozess;
pub mod supervisor;
pub mod token;

// Bequeme Re-Exporte der wichtigsten Typen
pub use prozess::{SpawnKontext, WorkerProzess};
pub use supervisor::{
    ProcessSupervisor, SupervisorEinstellungen, SupervisorEreignis, WorkerInfo,
};
pub use token::{TokenPool, WorkerToken};
