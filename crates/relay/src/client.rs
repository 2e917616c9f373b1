//! RelayClient – Worker-Seite des Relay-Protokolls
//!
//! Wird von Worker-Prozessen benutzt um sich am Hub zu registrieren,
//! Frames zu senden (Forwarder) bzw. zu empfangen (Receiver). Pings des
//! Hubs werden automatisch beantwortet, der Aufrufer muss sich um
//! Liveness nicht kuemmern.

use futures_util::{SinkExt, StreamExt};
use rundfunk_core::{AudioFrame, Result, RundfunkError, SectionId, WorkerId, WorkerRolle};
use rundfunk_protocol::{RelayCodec, RelayErrorCode, RelayMessage};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

/// Frist fuer den Registrierungs-Handshake
pub const REGISTRIERUNGS_FRIST: Duration = Duration::from_secs(10);

/// Uebersetzt einen Wire-Fehlercode zurueck in den internen Fehler
fn fehler_aus_code(
    code: RelayErrorCode,
    message: String,
    sektion: SectionId,
    rolle: WorkerRolle,
) -> RundfunkError {
    match code {
        RelayErrorCode::DuplicateRole => RundfunkError::DoppelteRolle { sektion, rolle },
        RelayErrorCode::NotRegistered => RundfunkError::NichtRegistriert(message),
        RelayErrorCode::SectionUnknown => RundfunkError::SektionNichtGefunden(sektion),
        RelayErrorCode::ServerFull => RundfunkError::ServerVoll,
        RelayErrorCode::ProtocolViolation => RundfunkError::UngueltigeNachricht(message),
        RelayErrorCode::InternalError => RundfunkError::Intern(message),
    }
}

/// Verbindung eines Workers zum Relay-Hub
#[derive(Debug)]
pub struct RelayClient {
    framed: Framed<TcpStream, RelayCodec>,
    sektion_id: SectionId,
    rolle: WorkerRolle,
    worker_id: WorkerId,
}

impl RelayClient {
    /// Verbindet sich mit dem Hub und registriert die eigene Identitaet
    ///
    /// Blockiert bis der Hub die Registrierung bestaetigt oder ablehnt;
    /// nach [`REGISTRIERUNGS_FRIST`] gibt es einen Zeitlimit-Fehler.
    pub async fn verbinden(
        adresse: impl ToSocketAddrs,
        sektion_id: SectionId,
        rolle: WorkerRolle,
        worker_id: WorkerId,
    ) -> Result<Self> {
        let stream = TcpStream::connect(adresse).await?;
        let mut framed = Framed::new(stream, RelayCodec::neu());

        framed
            .send(RelayMessage::register(sektion_id, rolle, worker_id))
            .await?;

        let bestaetigung = tokio::time::timeout(REGISTRIERUNGS_FRIST, async {
            loop {
                match framed.next().await {
                    Some(Ok(RelayMessage::Registered {
                        section_id,
                        worker_id: bestaetigt,
                    })) if section_id == sektion_id && bestaetigt == worker_id => {
                        return Ok(());
                    }
                    Some(Ok(RelayMessage::Ping { timestamp_ms })) => {
                        framed.send(RelayMessage::pong(timestamp_ms)).await?;
                    }
                    Some(Ok(RelayMessage::Error { code, message })) => {
                        return Err(fehler_aus_code(code, message, sektion_id, rolle));
                    }
                    Some(Ok(andere)) => {
                        tracing::trace!(nachricht = ?andere, "Nachricht vor Bestaetigung ignoriert");
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(RundfunkError::VerbindungVerloren(
                            "Hub hat die Verbindung vor der Bestaetigung geschlossen".into(),
                        ));
                    }
                }
            }
        })
        .await;

        match bestaetigung {
            Ok(Ok(())) => {
                tracing::debug!(
                    sektion = %sektion_id,
                    worker = %worker_id,
                    rolle = %rolle,
                    "Am Hub registriert"
                );
                Ok(Self {
                    framed,
                    sektion_id,
                    rolle,
                    worker_id,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RundfunkError::Zeitlimit(
                "Registrierung nicht bestaetigt".into(),
            )),
        }
    }

    /// Sendet ein Audio-Frame an den Hub (Forwarder)
    pub async fn frame_senden(&mut self, frame: &AudioFrame) -> Result<()> {
        self.framed
            .send(RelayMessage::frame(self.sektion_id, self.worker_id, frame))
            .await?;
        Ok(())
    }

    /// Wartet auf das naechste zugestellte Frame (Receiver)
    ///
    /// Pings werden unterwegs beantwortet, Fehlermeldungen des Hubs als
    /// Fehler zurueckgegeben.
    pub async fn naechstes_frame(&mut self) -> Result<AudioFrame> {
        loop {
            match self.framed.next().await {
                Some(Ok(nachricht @ RelayMessage::Frame { .. })) => {
                    if let Some(frame) = nachricht.als_audio_frame() {
                        return Ok(frame);
                    }
                }
                Some(Ok(RelayMessage::Ping { timestamp_ms })) => {
                    self.framed.send(RelayMessage::pong(timestamp_ms)).await?;
                }
                Some(Ok(RelayMessage::Error { code, message })) => {
                    return Err(fehler_aus_code(code, message, self.sektion_id, self.rolle));
                }
                Some(Ok(andere)) => {
                    tracing::trace!(nachricht = ?andere, "Nachricht ignoriert");
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(RundfunkError::VerbindungVerloren(
                        "Hub hat die Verbindung geschlossen".into(),
                    ));
                }
            }
        }
    }

    /// Meldet sich beim Hub ab und schliesst die Verbindung
    pub async fn abmelden(mut self) -> Result<()> {
        self.framed
            .send(RelayMessage::Unregister {
                section_id: self.sektion_id,
                worker_id: self.worker_id,
            })
            .await?;
        self.framed.close().await?;
        Ok(())
    }

    /// Sektion dieser Verbindung
    pub fn sektion_id(&self) -> SectionId {
        self.sektion_id
    }

    /// Rolle dieser Verbindung
    pub fn rolle(&self) -> WorkerRolle {
        self.rolle
    }

    /// Worker-Identitaet dieser Verbindung
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }
}
