//! TCP-Listener – Bindet Socket, akzeptiert Verbindungen
//!
//! Der `RelayServer` bindet einen TCP-Socket und startet fuer jede
//! eingehende Verbindung einen eigenen tokio-Task mit einer
//! [`RelayVerbindung`]. Oberhalb des Verbindungslimits bekommen neue
//! Verbindungen eine SERVER_FULL-Fehlermeldung und werden geschlossen.

use futures_util::SinkExt;
use rundfunk_protocol::{RelayCodec, RelayErrorCode, RelayMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::connection::RelayVerbindung;
use crate::hub::RelayHub;

/// TCP-Frontend des Relay-Hubs
///
/// Bindet beim Erstellen, damit ephemere Ports (`:0`) vor dem Start
/// abfragbar sind.
pub struct RelayServer {
    hub: RelayHub,
    listener: TcpListener,
    lokale_adresse: SocketAddr,
}

impl RelayServer {
    /// Bindet den TCP-Socket
    pub async fn binden(hub: RelayHub, bind_addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let lokale_adresse = listener.local_addr()?;
        tracing::info!(adresse = %lokale_adresse, "Relay-Server gebunden");
        Ok(Self {
            hub,
            listener,
            lokale_adresse,
        })
    }

    /// Gibt die tatsaechlich gebundene Adresse zurueck
    pub fn lokale_adresse(&self) -> SocketAddr {
        self.lokale_adresse
    }

    /// Akzeptiert Verbindungen bis `shutdown_rx` true signalisiert
    ///
    /// Startet ausserdem die Karenzzeit-Ueberwachung des Hubs als
    /// eigenen Task.
    pub async fn starten(self, mut shutdown_rx: watch::Receiver<bool>) -> std::io::Result<()> {
        let einstellungen = self.hub.einstellungen().clone();
        let aktive = Arc::new(AtomicUsize::new(0));

        tokio::spawn(self.hub.clone().ueberwachen(shutdown_rx.clone()));

        tracing::info!(
            adresse = %self.lokale_adresse,
            max_verbindungen = einstellungen.max_verbindungen,
            "Relay-Server gestartet"
        );

        loop {
            tokio::select! {
                // Neue eingehende Verbindung
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if aktive.load(Ordering::Acquire) >= einstellungen.max_verbindungen {
                                tracing::warn!(
                                    peer = %peer_addr,
                                    max = einstellungen.max_verbindungen,
                                    "Server voll – Verbindung abgelehnt"
                                );
                                let max_groesse = einstellungen.max_nachricht_groesse;
                                tokio::spawn(async move {
                                    let mut framed = Framed::new(
                                        stream,
                                        RelayCodec::mit_max_groesse(max_groesse),
                                    );
                                    let _ = framed
                                        .send(RelayMessage::fehler(
                                            RelayErrorCode::ServerFull,
                                            "Maximale Verbindungsanzahl erreicht",
                                        ))
                                        .await;
                                });
                                continue;
                            }

                            tracing::debug!(peer = %peer_addr, "Verbindung akzeptiert");
                            aktive.fetch_add(1, Ordering::AcqRel);

                            let verbindung = RelayVerbindung::neu(self.hub.clone(), peer_addr);
                            let shutdown_rx_clone = shutdown_rx.clone();
                            let aktive_clone = Arc::clone(&aktive);
                            tokio::spawn(async move {
                                verbindung.verarbeiten(stream, shutdown_rx_clone).await;
                                aktive_clone.fetch_sub(1, Ordering::AcqRel);
                            });
                        }
                        Err(e) => {
                            tracing::error!(fehler = %e, "TCP-Accept-Fehler");
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        }
                    }
                }

                // Shutdown-Signal
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Relay-Server: Shutdown-Signal empfangen");
                        break;
                    }
                }
            }
        }

        tracing::info!("Relay-Server gestoppt");
        Ok(())
    }
}
