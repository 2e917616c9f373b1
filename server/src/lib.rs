//! rundfunk-server – Bibliotheks-Root
//!
//! Verdrahtet Relay-Hub, TCP-Endpunkt, Prozess-Supervisor und
//! Sektions-Koordinator zu einem laufenden Server und stellt den
//! oeffentlichen Einstiegspunkt fuer Integrationstests bereit.

pub mod config;

use anyhow::Result;
use config::ServerConfig;
use rundfunk_core::RundfunkEvent;
use rundfunk_relay::{RelayHub, RelayServer};
use rundfunk_section::{NoOpProvisioner, SectionCoordinator};
use rundfunk_supervisor::ProcessSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Intervall der Gesundheits-Logzeile
const GESUNDHEIT_INTERVALL: Duration = Duration::from_secs(60);

/// Haelt den laufenden Server-Zustand zusammen
pub struct Server {
    pub config: ServerConfig,
}

impl Server {
    /// Erstellt einen neuen Server aus der gegebenen Konfiguration
    pub fn neu(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Startet alle Teilsysteme und laeuft bis zum Shutdown-Signal
    ///
    /// Reihenfolge:
    /// 1. Relay-Hub und TCP-Endpunkt binden
    /// 2. Token-Pool und Prozess-Supervisor aufbauen
    /// 3. Sektions-Koordinator samt Ereignis-Pumpe starten
    /// 4. Auf Ctrl-C warten, dann alle Sektionen stoppen und Tasks beenden
    pub async fn starten(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Relay
        let (hub, hub_ereignisse) = RelayHub::neu(self.config.relay_einstellungen());
        let relay_server =
            RelayServer::binden(hub.clone(), self.config.relay_bind_adresse().parse()?).await?;
        let relay_adresse = relay_server.lokale_adresse();
        // Der Listener startet die Karenzzeit-Ueberwachung des Hubs selbst
        tokio::spawn(relay_server.starten(shutdown_rx.clone()));
        tracing::info!(adresse = %relay_adresse, "Relay-Endpunkt bereit");

        // Supervisor
        let pool = self.config.token_pool();
        let (supervisor, supervisor_ereignisse) =
            ProcessSupervisor::neu(pool, self.config.supervisor_einstellungen());
        tracing::info!(
            befehl = %self.config.supervisor.worker_befehl,
            forwarder_tokens = self.config.tokens.forwarder.len(),
            empfaenger_tokens = self.config.tokens.empfaenger.len(),
            "Prozess-Supervisor bereit"
        );

        // Koordinator; die Relay-Adresse der Worker zeigt auf den
        // tatsaechlich gebundenen Port
        let mut sektions_einstellungen = self.config.sektions_einstellungen();
        sektions_einstellungen.relay_adresse = format!(
            "{}:{}",
            self.config.relay_worker_host(),
            relay_adresse.port()
        );
        let (koordinator, ereignisse) = SectionCoordinator::neu(
            hub.clone(),
            supervisor.clone(),
            Arc::new(NoOpProvisioner),
            sektions_einstellungen,
        );
        tokio::spawn(koordinator.clone().pumpe(
            hub_ereignisse,
            supervisor_ereignisse,
            shutdown_rx.clone(),
        ));
        tokio::spawn(ereignisse_protokollieren(ereignisse, shutdown_rx.clone()));
        tokio::spawn(gesundheit_protokollieren(
            hub.clone(),
            koordinator.clone(),
            shutdown_rx,
        ));

        tracing::info!(
            server_name = %self.config.server.name,
            "Server laeuft. Warte auf Shutdown-Signal (Ctrl-C)..."
        );
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown-Signal empfangen, Server wird beendet");

        koordinator.alle_stoppen().await;
        let _ = shutdown_tx.send(true);
        Ok(())
    }
}

/// Protokolliert die oeffentlichen Lebenszyklus-Ereignisse
///
/// Platzhalter fuer die Kommando-Schicht: in einem Deployment mit
/// Verwaltungsoberflaeche konsumiert diese den Kanal stattdessen.
async fn ereignisse_protokollieren(
    mut ereignisse: mpsc::UnboundedReceiver<RundfunkEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            ereignis = ereignisse.recv() => {
                let Some(ereignis) = ereignis else { return };
                match &ereignis {
                    RundfunkEvent::SektionErstellt { sektion_id, name } => {
                        tracing::info!(sektion = %sektion_id, name, "Ereignis: Sektion erstellt");
                    }
                    RundfunkEvent::SektionAktiv {
                        sektion_id,
                        empfaenger_aktiv,
                        empfaenger_gewuenscht,
                    } => {
                        tracing::info!(
                            sektion = %sektion_id,
                            empfaenger_aktiv,
                            empfaenger_gewuenscht,
                            "Ereignis: Sektion aktiv"
                        );
                    }
                    RundfunkEvent::SektionDegradiert { sektion_id, grund } => {
                        tracing::error!(sektion = %sektion_id, grund, "Ereignis: Sektion degradiert");
                    }
                    RundfunkEvent::SektionBeendet { sektion_id } => {
                        tracing::info!(sektion = %sektion_id, "Ereignis: Sektion beendet");
                    }
                    RundfunkEvent::Teilkapazitaet {
                        sektion_id,
                        gewuenscht,
                        erhalten,
                    } => {
                        tracing::warn!(
                            sektion = %sektion_id,
                            gewuenscht,
                            erhalten,
                            "Ereignis: Teilkapazitaet"
                        );
                    }
                    RundfunkEvent::RolleVerloren {
                        sektion_id,
                        rolle,
                        worker_id,
                        endgueltig,
                    } => {
                        tracing::warn!(
                            sektion = %sektion_id,
                            rolle = %rolle,
                            worker = %worker_id,
                            endgueltig,
                            "Ereignis: Rolle verloren"
                        );
                    }
                }
            }
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Periodische Gesundheits-Logzeile mit Hub- und Sektionsstand
async fn gesundheit_protokollieren(
    hub: RelayHub,
    koordinator: SectionCoordinator,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut takt = tokio::time::interval(GESUNDHEIT_INTERVALL);
    takt.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    takt.tick().await;
    loop {
        tokio::select! {
            _ = takt.tick() => {
                let statistik = hub.statistik();
                tracing::info!(
                    sektionen = koordinator.sektionen_auflisten().len(),
                    verbindungen_aktiv = statistik.verbindungen_aktiv,
                    verbindungen_getrennt = statistik.verbindungen_getrennt,
                    frames_empfangen = statistik.frames_empfangen,
                    frames_weitergeleitet = statistik.frames_weitergeleitet,
                    frames_abgelehnt = statistik.frames_abgelehnt,
                    sequenz_verletzungen = statistik.sequenz_verletzungen,
                    "Gesundheit"
                );
            }
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}
