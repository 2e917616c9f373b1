//! ChannelProvisioner – Seam zur externen Kanal-Verwaltung
//!
//! Das Anlegen und Abbauen der Sprach-Kanaele liegt ausserhalb dieses
//! Repos (Rollen, Rechte, Plattform-API). Der Koordinator haengt nur an
//! dieser Schnittstelle und an ihren Erfolgs-/Fehlermeldungen.

use async_trait::async_trait;
use rundfunk_core::{ChannelId, KanalSatz, Result, SectionId};

/// Legt den Kanalsatz einer Sektion an und baut ihn wieder ab
#[async_trait]
pub trait ChannelProvisioner: Send + Sync {
    /// Stellt den Kanalsatz fuer eine Sektion bereit
    ///
    /// Ein Fehler beendet die Sektion sofort (kein Neustart-Pfad).
    async fn bereitstellen(&self, sektion_id: SectionId, name: &str) -> Result<KanalSatz>;

    /// Baut den Kanalsatz einer beendeten Sektion ab
    ///
    /// Fehler werden geloggt, halten das Beenden aber nicht auf.
    async fn abbauen(&self, sektion_id: SectionId, kanaele: KanalSatz) -> Result<()>;
}

/// Provisioner fuer Betrieb ohne Kanal-Verwaltung
///
/// Vergibt frische Kanal-Referenzen ohne externe Wirkung; gedacht fuer
/// Deployments in denen die Kanaele ausserhalb verwaltet werden, und fuer
/// Tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProvisioner;

#[async_trait]
impl ChannelProvisioner for NoOpProvisioner {
    async fn bereitstellen(&self, sektion_id: SectionId, name: &str) -> Result<KanalSatz> {
        let kanaele = KanalSatz {
            sektions_kanal: ChannelId::new(),
            sprecher_kanal: ChannelId::new(),
        };
        tracing::debug!(
            sektion = %sektion_id,
            name,
            kanal = %kanaele.sektions_kanal,
            sprecher = %kanaele.sprecher_kanal,
            "Kanalsatz vergeben (No-Op)"
        );
        Ok(kanaele)
    }

    async fn abbauen(&self, sektion_id: SectionId, _kanaele: KanalSatz) -> Result<()> {
        tracing::debug!(sektion = %sektion_id, "Kanalsatz abgebaut (No-Op)");
        Ok(())
    }
}
