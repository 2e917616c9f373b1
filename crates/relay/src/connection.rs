//! Relay-Verbindung – Verwaltet eine einzelne TCP-Verbindung
//!
//! Jede akzeptierte Verbindung bekommt eine `RelayVerbindung` in einem
//! eigenen tokio-Task. Der Ablauf hat zwei Phasen:
//!
//! 1. Handshake: die erste Nachricht muss innerhalb der Handshake-Frist
//!    ein `register` sein; alles andere wird abgelehnt. Der Hub prueft
//!    Sektion, Rollen-Exklusivitaet und Receiver-Limit.
//! 2. Betrieb: eine select-Schleife multiplext eingehende Nachrichten,
//!    Hub-Steuernachrichten, Frame-Zustellung (nur Receiver) und den
//!    Keepalive-Ping. Kein Zweig blockiert die anderen Verbindungen.
//!
//! ## Keepalive
//! - Der Hub sendet alle `ping_intervall` einen Ping
//! - Ohne Empfang seit `veraltet_schwelle` wird der Slot als veraltet markiert
//! - Ohne Empfang seit `getrennt_schwelle` wird die Verbindung getrennt

use futures_util::{SinkExt, StreamExt};
use rundfunk_audio::FrameBuffer;
use rundfunk_core::{RundfunkError, SectionId, WorkerId, WorkerRolle};
use rundfunk_protocol::{RelayCodec, RelayErrorCode, RelayMessage};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use crate::hub::RelayHub;

/// Unix-Zeitstempel in Millisekunden fuer Ping/RTT
fn jetzt_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Uebersetzt einen internen Fehler in den Wire-Fehlercode
fn fehler_code(fehler: &RundfunkError) -> RelayErrorCode {
    match fehler {
        RundfunkError::DoppelteRolle { .. } => RelayErrorCode::DuplicateRole,
        RundfunkError::NichtRegistriert(_) => RelayErrorCode::NotRegistered,
        RundfunkError::SektionNichtGefunden(_) => RelayErrorCode::SectionUnknown,
        RundfunkError::ServerVoll => RelayErrorCode::ServerFull,
        RundfunkError::UngueltigeNachricht(_) => RelayErrorCode::ProtocolViolation,
        _ => RelayErrorCode::InternalError,
    }
}

// ---------------------------------------------------------------------------
// RelayVerbindung
// ---------------------------------------------------------------------------

/// Verarbeitet eine einzelne TCP-Verbindung zum Hub
pub struct RelayVerbindung {
    hub: RelayHub,
    peer_addr: SocketAddr,
}

impl RelayVerbindung {
    /// Erstellt eine neue RelayVerbindung
    pub fn neu(hub: RelayHub, peer_addr: SocketAddr) -> Self {
        Self { hub, peer_addr }
    }

    /// Startet die Verbindungs-Verarbeitungsschleife
    ///
    /// Laeuft bis die Verbindung endet oder ein Shutdown-Signal eingeht.
    pub async fn verarbeiten(
        self,
        stream: TcpStream,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let peer_addr = self.peer_addr;
        let einstellungen = self.hub.einstellungen().clone();
        let mut framed = Framed::new(
            stream,
            RelayCodec::mit_max_groesse(einstellungen.max_nachricht_groesse),
        );

        tracing::debug!(peer = %peer_addr, "Neue Verbindung");

        // Phase 1: Register-Handshake innerhalb der Frist
        let register = match tokio::time::timeout(einstellungen.handshake_frist, framed.next()).await
        {
            Err(_) => {
                tracing::warn!(peer = %peer_addr, "Handshake-Frist verstrichen");
                let _ = framed
                    .send(RelayMessage::fehler(
                        RelayErrorCode::ProtocolViolation,
                        "Keine Register-Nachricht innerhalb der Frist",
                    ))
                    .await;
                return;
            }
            Ok(None) => {
                tracing::debug!(peer = %peer_addr, "Verbindung vor Registrierung geschlossen");
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(peer = %peer_addr, fehler = %e, "Frame-Lesefehler im Handshake");
                return;
            }
            Ok(Some(Ok(nachricht))) => nachricht,
        };

        let (sektion_id, rolle, worker_id) = match register {
            RelayMessage::Register {
                section_id,
                role,
                worker_id,
            } => (section_id, role, worker_id),
            andere => {
                // Frames und alles andere vor der Registrierung: ablehnen
                tracing::warn!(
                    peer = %peer_addr,
                    nachricht = ?andere,
                    "Nachricht vor Registrierung abgelehnt"
                );
                let _ = framed
                    .send(RelayMessage::fehler(
                        RelayErrorCode::NotRegistered,
                        "Erst registrieren",
                    ))
                    .await;
                return;
            }
        };

        // Steuerkanal Hub -> Verbindungs-Task
        let (steuer_tx, mut steuer_rx) = mpsc::unbounded_channel::<RelayMessage>();

        let registrierung = match self.hub.registrieren(sektion_id, rolle, worker_id, steuer_tx) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    peer = %peer_addr,
                    sektion = %sektion_id,
                    rolle = %rolle,
                    fehler = %e,
                    "Registrierung abgelehnt"
                );
                let _ = framed
                    .send(RelayMessage::fehler(fehler_code(&e), e.to_string()))
                    .await;
                return;
            }
        };
        let generation = registrierung.generation;
        let puffer: Option<FrameBuffer> = registrierung.puffer;

        if framed
            .send(RelayMessage::Registered {
                section_id: sektion_id,
                worker_id,
            })
            .await
            .is_err()
        {
            self.hub
                .verbindung_geschlossen(&sektion_id, &worker_id, generation, "Ack nicht zustellbar");
            return;
        }

        // Phase 2: Betriebsschleife
        let mut letzter_empfang = Instant::now();
        let mut naechster_ping = Instant::now() + einstellungen.ping_intervall;
        let mut trenn_grund = "Verbindung beendet";

        loop {
            let jetzt = Instant::now();

            // Liveness-Pruefung
            let still = jetzt.duration_since(letzter_empfang);
            if still > einstellungen.getrennt_schwelle {
                trenn_grund = "Liveness-Timeout";
                tracing::warn!(peer = %peer_addr, worker = %worker_id, "Liveness-Timeout");
                break;
            }
            if still > einstellungen.veraltet_schwelle {
                self.hub.veraltet_markieren(&sektion_id, &worker_id);
            }

            // Naechsten Ping-Zeitpunkt berechnen
            let ping_verzoegerung = if jetzt < naechster_ping {
                naechster_ping.duration_since(jetzt)
            } else {
                Duration::from_millis(1)
            };

            tokio::select! {
                // Eingehende Nachricht vom Worker
                frame = framed.next() => {
                    match frame {
                        Some(Ok(nachricht)) => {
                            letzter_empfang = Instant::now();
                            if !self.nachricht_behandeln(
                                nachricht,
                                &mut framed,
                                sektion_id,
                                rolle,
                                worker_id,
                                &mut trenn_grund,
                            )
                            .await
                            {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(peer = %peer_addr, fehler = %e, "Frame-Lesefehler");
                            trenn_grund = "Lesefehler";
                            break;
                        }
                        None => {
                            tracing::debug!(peer = %peer_addr, "Verbindung vom Worker getrennt");
                            trenn_grund = "EOF";
                            break;
                        }
                    }
                }

                // Steuernachricht vom Hub (z.B. Abschied beim Sektionsende)
                steuer = steuer_rx.recv() => {
                    match steuer {
                        Some(nachricht) => {
                            if framed.send(nachricht).await.is_err() {
                                trenn_grund = "Senden fehlgeschlagen";
                                break;
                            }
                        }
                        None => {
                            trenn_grund = "Steuerkanal geschlossen";
                            break;
                        }
                    }
                }

                // Frame-Zustellung an Receiver
                frame = naechstes_frame(&puffer) => {
                    let nachricht = RelayMessage::frame(sektion_id, worker_id, &frame);
                    if framed.send(nachricht).await.is_err() {
                        trenn_grund = "Senden fehlgeschlagen";
                        break;
                    }
                }

                // Keepalive-Ping
                _ = tokio::time::sleep(ping_verzoegerung) => {
                    if jetzt >= naechster_ping {
                        if framed.send(RelayMessage::ping(jetzt_ms())).await.is_err() {
                            trenn_grund = "Ping nicht zustellbar";
                            break;
                        }
                        naechster_ping = Instant::now() + einstellungen.ping_intervall;
                    }
                }

                // Shutdown-Signal
                Ok(()) = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!(peer = %peer_addr, "Shutdown – Verbindung wird getrennt");
                        let _ = framed
                            .send(RelayMessage::fehler(
                                RelayErrorCode::InternalError,
                                "Server wird heruntergefahren",
                            ))
                            .await;
                        trenn_grund = "Shutdown";
                        break;
                    }
                }
            }
        }

        self.hub
            .verbindung_geschlossen(&sektion_id, &worker_id, generation, trenn_grund);
        tracing::debug!(peer = %peer_addr, worker = %worker_id, "Verbindungs-Task beendet");
    }

    /// Behandelt eine eingehende Nachricht; false beendet die Schleife
    async fn nachricht_behandeln(
        &self,
        nachricht: RelayMessage,
        framed: &mut Framed<TcpStream, RelayCodec>,
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
        trenn_grund: &mut &'static str,
    ) -> bool {
        match nachricht {
            RelayMessage::Frame { .. } if rolle.ist_forwarder() => {
                let frame = match nachricht.als_audio_frame() {
                    Some(f) => f,
                    None => return true,
                };
                match self.hub.frame_verteilen(&sektion_id, &worker_id, frame) {
                    Ok(_) => true,
                    Err(e) => {
                        let endgueltig =
                            matches!(e, RundfunkError::SektionNichtGefunden(_));
                        let _ = framed
                            .send(RelayMessage::fehler(fehler_code(&e), e.to_string()))
                            .await;
                        if endgueltig {
                            *trenn_grund = "Sektion entfernt";
                        }
                        !endgueltig
                    }
                }
            }
            RelayMessage::Frame { .. } => {
                // Receiver senden keine Frames
                tracing::warn!(
                    peer = %self.peer_addr,
                    worker = %worker_id,
                    "Frame von einem Receiver – Protokollverletzung"
                );
                let _ = framed
                    .send(RelayMessage::fehler(
                        RelayErrorCode::ProtocolViolation,
                        "Receiver duerfen keine Frames senden",
                    ))
                    .await;
                *trenn_grund = "Protokollverletzung";
                false
            }
            RelayMessage::Pong { echo_timestamp_ms } => {
                self.hub.pong_empfangen(&sektion_id, &worker_id);
                let rtt = jetzt_ms().saturating_sub(echo_timestamp_ms);
                tracing::trace!(peer = %self.peer_addr, rtt_ms = rtt, "Pong empfangen");
                true
            }
            RelayMessage::Ping { timestamp_ms } => {
                // Symmetrie: auch Worker duerfen die Leitung pruefen
                framed.send(RelayMessage::pong(timestamp_ms)).await.is_ok()
            }
            RelayMessage::Unregister {
                section_id: sektion,
                worker_id: worker,
            } => {
                if sektion != sektion_id || worker != worker_id {
                    let _ = framed
                        .send(RelayMessage::fehler(
                            RelayErrorCode::ProtocolViolation,
                            "Unregister fuer fremde Identitaet",
                        ))
                        .await;
                    *trenn_grund = "Protokollverletzung";
                } else {
                    tracing::info!(
                        peer = %self.peer_addr,
                        worker = %worker_id,
                        "Explizit abgemeldet"
                    );
                    *trenn_grund = "Explizit abgemeldet";
                }
                false
            }
            RelayMessage::Register { .. } => {
                let _ = framed
                    .send(RelayMessage::fehler(
                        RelayErrorCode::ProtocolViolation,
                        "Bereits registriert",
                    ))
                    .await;
                *trenn_grund = "Doppelte Registrierung";
                false
            }
            RelayMessage::Registered { .. } | RelayMessage::Error { .. } => {
                // Hub-Nachrichten haben hier nichts verloren; ignorieren
                tracing::trace!(peer = %self.peer_addr, "Unerwartete Hub-Nachricht ignoriert");
                true
            }
        }
    }
}

/// Liefert das naechste zuzustellende Frame; Forwarder haben keinen Puffer
/// und warten hier endlos
async fn naechstes_frame(puffer: &Option<FrameBuffer>) -> rundfunk_core::AudioFrame {
    match puffer {
        Some(p) => p.pop().await,
        None => std::future::pending().await,
    }
}
