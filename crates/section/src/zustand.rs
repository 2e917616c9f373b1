//! Sektions-Zustandsmaschine
//!
//! Expliziter Zustands-Enum mit erschoepfender Uebergangstabelle statt
//! verstreuter Flags; damit bleiben auch die Degraded- und
//! Teilkapazitaets-Pfade pruefbar.
//!
//! ```text
//! CREATED -> PROVISIONING -> STARTING -> ACTIVE -> STOPPING -> TERMINATED
//!                 |              \          \
//!                 |               +-> DEGRADED -> STOPPING
//!                 +-> TERMINATED (Bereitstellung fehlgeschlagen)
//! ```

use rundfunk_core::{Result, RundfunkError};
use serde::{Deserialize, Serialize};

/// Lebenszyklus-Zustand einer Sektion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SektionZustand {
    /// Angelegt, Kanal-Anfrage noch nicht gestellt
    Created,
    /// Wartet auf den externen Kanal-Provisioner
    Provisioning,
    /// Tokens erworben, Worker fahren hoch
    Starting,
    /// Betriebszustand; Frames fliessen
    Active,
    /// Rollenverlust ausserhalb der Neustart-Policy; wird gestoppt
    Degraded,
    /// Worker werden gestoppt, Verbindungen getrennt
    Stopping,
    /// Endzustand; Sektion ist aus dem aktiven Bestand entfernt
    Terminated,
}

impl SektionZustand {
    /// Erschoepfende Uebergangstabelle
    pub fn uebergang_erlaubt(von: Self, nach: Self) -> bool {
        use SektionZustand::*;
        match (von, nach) {
            (Created, Provisioning) => true,
            // Bereitstellungsfehler beendet die Sektion direkt
            (Provisioning, Starting) | (Provisioning, Terminated) => true,
            (Starting, Active) | (Starting, Degraded) | (Starting, Stopping) => true,
            (Active, Degraded) | (Active, Stopping) => true,
            (Degraded, Stopping) => true,
            (Stopping, Terminated) => true,
            _ => false,
        }
    }

    /// Gibt true zurueck wenn der Zustand terminal ist
    pub fn ist_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Gibt true zurueck wenn die Sektion gestoppt wird oder schon weg ist
    pub fn ist_am_ende(&self) -> bool {
        matches!(self, Self::Stopping | Self::Terminated)
    }
}

impl std::fmt::Display for SektionZustand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

/// Prueft und vollzieht einen Uebergang
///
/// Schlaegt mit [`RundfunkError::UngueltigerZustand`] fehl wenn die
/// Tabelle den Uebergang nicht kennt.
pub fn uebergang(zustand: &mut SektionZustand, nach: SektionZustand) -> Result<()> {
    if !SektionZustand::uebergang_erlaubt(*zustand, nach) {
        return Err(RundfunkError::UngueltigerZustand {
            von: zustand.to_string(),
            nach: nach.to_string(),
        });
    }
    *zustand = nach;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use SektionZustand::*;

    #[test]
    fn regulaerer_lebenszyklus() {
        let mut zustand = Created;
        for nach in [Provisioning, Starting, Active, Stopping, Terminated] {
            uebergang(&mut zustand, nach).unwrap();
        }
        assert!(zustand.ist_terminal());
    }

    #[test]
    fn degraded_pfad() {
        assert!(SektionZustand::uebergang_erlaubt(Active, Degraded));
        assert!(SektionZustand::uebergang_erlaubt(Starting, Degraded));
        assert!(SektionZustand::uebergang_erlaubt(Degraded, Stopping));
        // Degraded fuehrt nie zurueck in den Betrieb
        assert!(!SektionZustand::uebergang_erlaubt(Degraded, Active));
    }

    #[test]
    fn bereitstellungsfehler_beendet_direkt() {
        assert!(SektionZustand::uebergang_erlaubt(Provisioning, Terminated));
        assert!(!SektionZustand::uebergang_erlaubt(Created, Terminated));
    }

    #[test]
    fn terminal_hat_keine_ausgaenge() {
        for nach in [
            Created,
            Provisioning,
            Starting,
            Active,
            Degraded,
            Stopping,
            Terminated,
        ] {
            assert!(
                !SektionZustand::uebergang_erlaubt(Terminated, nach),
                "Terminated -> {nach} darf nicht erlaubt sein"
            );
        }
    }

    #[test]
    fn ungueltiger_uebergang_meldet_beide_zustaende() {
        let mut zustand = Created;
        let fehler = uebergang(&mut zustand, Active).unwrap_err();
        let text = fehler.to_string();
        assert!(text.contains("created"));
        assert!(text.contains("active"));
        // Zustand bleibt unveraendert
        assert_eq!(zustand, Created);
    }
}
