//! rundfunk-audio – Frame-Pufferung und Adapter-Grenze
//!
//! Audio-Bausteine des Relays:
//! - Beschraenkter Frame-Puffer mit Drop-Oldest-Semantik
//! - Adapter-Schnittstelle zur externen Voice-Plattform
//! - Pump-Schleifen zwischen Adapter und Puffer
//!
//! Capture-Hardware, Codecs und DSP liegen bewusst ausserhalb: das Relay
//! behandelt Frames als opake Bytes.

pub mod adapter;
pub mod frame_buffer;

// Bequeme Re-Exporte der wichtigsten Typen
pub use adapter::{erfassung_pumpen, wiedergabe_pumpen, VoiceAdapter};
pub use frame_buffer::{FrameBuffer, PufferStatistik, STANDARD_KAPAZITAET};
