//! Token-Pool – Endliche Worker-Identitaeten pro Rolle
//!
//! Jeder laufende Worker-Prozess haelt genau ein [`WorkerToken`]. Die
//! Worker-Identitaet haengt am Token, nicht am Prozess: ein neu
//! gestarteter Prozess mit demselben Token bindet sich am Hub wieder an
//! denselben Slot.
//!
//! ## Invarianten
//! - Ein Token ist nie gleichzeitig an zwei Prozesse vergeben
//! - Die Zahl laufender Prozesse uebersteigt nie die Poolgroesse
//! - Doppelte Rueckgaben werden verworfen statt den Pool aufzublaehen

use parking_lot::Mutex;
use rundfunk_core::{Result, RundfunkError, WorkerId, WorkerRolle};
use std::collections::HashSet;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// WorkerToken
// ---------------------------------------------------------------------------

/// Eine Worker-Identitaet mit Zugangsdaten-Referenz
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerToken {
    /// Stabile Identitaet; ueberdauert Prozess-Neustarts
    pub worker_id: WorkerId,
    /// Rolle fuer die dieses Token gilt
    pub rolle: WorkerRolle,
    /// Zugangsdaten-Referenz (wird dem Worker-Prozess durchgereicht)
    pub zugangsdaten: String,
}

impl WorkerToken {
    /// Erstellt ein neues Token mit frischer Identitaet
    pub fn neu(rolle: WorkerRolle, zugangsdaten: impl Into<String>) -> Self {
        Self {
            worker_id: WorkerId::new(),
            rolle,
            zugangsdaten: zugangsdaten.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// TokenPool
// ---------------------------------------------------------------------------

struct PoolZustand {
    frei: Vec<WorkerToken>,
    /// Aktuell vergebene Identitaeten
    vergeben: HashSet<WorkerId>,
}

/// Endlicher Pool von Worker-Tokens
///
/// Thread-safe und `Clone`-faehig (innerer Arc); alle Mutationen laufen
/// unter einem einzigen Lock.
#[derive(Clone)]
pub struct TokenPool {
    inner: Arc<Mutex<PoolZustand>>,
}

impl TokenPool {
    /// Erstellt einen Pool aus vorbereiteten Tokens
    pub fn neu(tokens: Vec<WorkerToken>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolZustand {
                frei: tokens,
                vergeben: HashSet::new(),
            })),
        }
    }

    /// Erstellt einen Pool mit generierten Tokens pro Rolle
    ///
    /// Die Zugangsdaten-Referenzen werden durchnummeriert
    /// (`forwarder-0`, `receiver-3`, ...).
    pub fn aus_anzahl(forwarder: usize, receiver: usize) -> Self {
        let mut tokens = Vec::with_capacity(forwarder + receiver);
        for i in 0..forwarder {
            tokens.push(WorkerToken::neu(
                WorkerRolle::Forwarder,
                format!("forwarder-{i}"),
            ));
        }
        for i in 0..receiver {
            tokens.push(WorkerToken::neu(
                WorkerRolle::Receiver,
                format!("receiver-{i}"),
            ));
        }
        Self::neu(tokens)
    }

    /// Entnimmt ein freies Token der gewuenschten Rolle
    ///
    /// Schlaegt mit [`RundfunkError::TokensErschoepft`] fehl wenn keines
    /// frei ist; der Aufrufer entscheidet dann ueber reduzierte Kapazitaet
    /// oder Abbruch.
    pub fn erwerben(&self, rolle: WorkerRolle) -> Result<WorkerToken> {
        let mut zustand = self.inner.lock();
        let position = zustand.frei.iter().position(|t| t.rolle == rolle);
        match position {
            Some(i) => {
                let token = zustand.frei.swap_remove(i);
                zustand.vergeben.insert(token.worker_id);
                tracing::debug!(
                    worker = %token.worker_id,
                    rolle = %rolle,
                    frei = zustand.frei.iter().filter(|t| t.rolle == rolle).count(),
                    "Token vergeben"
                );
                Ok(token)
            }
            None => Err(RundfunkError::TokensErschoepft(rolle)),
        }
    }

    /// Gibt ein Token in den Pool zurueck
    ///
    /// Tokens die nicht aus diesem Pool stammen oder bereits
    /// zurueckgegeben wurden, werden verworfen.
    pub fn zurueckgeben(&self, token: WorkerToken) {
        let mut zustand = self.inner.lock();
        if !zustand.vergeben.remove(&token.worker_id) {
            tracing::warn!(
                worker = %token.worker_id,
                "Rueckgabe eines nicht vergebenen Tokens verworfen"
            );
            return;
        }
        tracing::debug!(worker = %token.worker_id, rolle = %token.rolle, "Token zurueckgegeben");
        zustand.frei.push(token);
    }

    /// Anzahl freier Tokens einer Rolle
    pub fn verfuegbar(&self, rolle: WorkerRolle) -> usize {
        self.inner
            .lock()
            .frei
            .iter()
            .filter(|t| t.rolle == rolle)
            .count()
    }

    /// Anzahl aktuell vergebener Tokens
    pub fn vergeben_anzahl(&self) -> usize {
        self.inner.lock().vergeben.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
