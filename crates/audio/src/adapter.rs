//! Adapter-Grenze zwischen Voice-Plattform und Relay
//!
//! Capture, Playback und Codecs liegen ausserhalb dieses Repos. Hier ist
//! nur die Schnittstelle definiert, plus die beiden Pump-Schleifen die
//! einen Adapter per Message-Passing an einen [`FrameBuffer`] koppeln:
//! Capture produziert in den Puffer, Wiedergabe konsumiert daraus. Es gibt
//! bewusst keine direkte Callback-Kopplung zwischen Adapter und Relay.

use crate::frame_buffer::FrameBuffer;
use async_trait::async_trait;
use rundfunk_core::{AudioFrame, ChannelId, Result};
use std::time::Duration;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// VoiceAdapter
// ---------------------------------------------------------------------------

/// Schnittstelle zur externen Voice-Plattform
///
/// Implementierungen melden nur Erfolg oder Fehler; das Relay haengt an
/// keinem Implementierungsdetail.
#[async_trait]
pub trait VoiceAdapter: Send {
    /// Tritt dem Zielkanal bei
    async fn beitreten(&mut self, kanal: ChannelId) -> Result<()>;

    /// Liefert das naechste aufgenommene Frame
    ///
    /// `None` bedeutet: die Quelle ist versiegt (Kanal verlassen,
    /// Aufnahme beendet).
    async fn frame_aufnehmen(&mut self) -> Result<Option<AudioFrame>>;

    /// Spielt ein Frame ab (Stille-Marker eingeschlossen)
    async fn frame_abspielen(&mut self, frame: AudioFrame) -> Result<()>;

    /// Verlaesst den Kanal
    async fn verlassen(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Pump-Schleifen
// ---------------------------------------------------------------------------

/// Pumpt aufgenommene Frames vom Adapter in den Puffer
///
/// Laeuft bis die Quelle versiegt oder ein Fehler auftritt; gibt die
/// Anzahl gepumpter Frames zurueck.
pub async fn erfassung_pumpen<A>(adapter: &mut A, puffer: &FrameBuffer) -> Result<u64>
where
    A: VoiceAdapter + ?Sized,
{
    let mut gepumpt = 0u64;
    while let Some(frame) = adapter.frame_aufnehmen().await? {
        puffer.push(frame);
        gepumpt += 1;
    }
    tracing::debug!(gepumpt, "Capture-Quelle versiegt, Pump-Schleife endet");
    Ok(gepumpt)
}

/// Pumpt Frames aus dem Puffer in die Wiedergabe
///
/// Wartet pro Frame hoechstens `takt`; bei leerem Puffer wird ein
/// Stille-Marker eingespielt, damit der Ausgabetakt nie stockt. Laeuft bis
/// `stop` true signalisiert oder der Sender wegfaellt; gibt die Anzahl
/// echter (nicht-stiller) Frames zurueck.
pub async fn wiedergabe_pumpen<A>(
    adapter: &mut A,
    puffer: &FrameBuffer,
    takt: Duration,
    mut stop: watch::Receiver<bool>,
) -> Result<u64>
where
    A: VoiceAdapter + ?Sized,
{
    let mut letzte_sequenz = 0u64;
    let mut abgespielt = 0u64;

    loop {
        tokio::select! {
            biased;

            geaendert = stop.changed() => {
                if geaendert.is_err() || *stop.borrow() {
                    tracing::debug!(abgespielt, "Wiedergabe-Pumpe gestoppt");
                    return Ok(abgespielt);
                }
            }

            frame = puffer.pop_mit_timeout(takt) => {
                match frame {
                    Some(frame) => {
                        letzte_sequenz = frame.sequenz;
                        adapter.frame_abspielen(frame).await?;
                        abgespielt += 1;
                    }
                    None => {
                        // Leerer Puffer: Stille einspielen statt zu stocken
                        adapter
                            .frame_abspielen(AudioFrame::stille(letzte_sequenz.wrapping_add(1)))
                            .await?;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::VecDeque;

    /// Adapter-Fake: liefert vorbereitete Frames und sammelt Abgespieltes
    struct TestAdapter {
        quelle: VecDeque<AudioFrame>,
        senke: Vec<AudioFrame>,
        stop_nach: usize,
        stop_tx: Option<watch::Sender<bool>>,
    }

    impl TestAdapter {
        fn mit_quelle(frames: Vec<AudioFrame>) -> Self {
            Self {
                quelle: frames.into(),
                senke: Vec::new(),
                stop_nach: usize::MAX,
                stop_tx: None,
            }
        }
    }

    #[async_trait]
    impl VoiceAdapter for TestAdapter {
        async fn beitreten(&mut self, _kanal: ChannelId) -> Result<()> {
            Ok(())
        }

        async fn frame_aufnehmen(&mut self) -> Result<Option<AudioFrame>> {
            Ok(self.quelle.pop_front())
        }

        async fn frame_abspielen(&mut self, frame: AudioFrame) -> Result<()> {
            self.senke.push(frame);
            if self.senke.len() >= self.stop_nach {
                if let Some(tx) = &self.stop_tx {
                    let _ = tx.send(true);
                }
            }
            Ok(())
        }

        async fn verlassen(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn make_frame(seq: u64) -> AudioFrame {
        AudioFrame::neu(seq, seq * 20, Bytes::from_static(b"opus"))
    }

    #[tokio::test]
    async fn erfassung_fuellt_puffer_in_reihenfolge() {
        let mut adapter = TestAdapter::mit_quelle(vec![make_frame(1), make_frame(2), make_frame(3)]);
        let puffer = FrameBuffer::neu(10);

        let gepumpt = erfassung_pumpen(&mut adapter, &puffer).await.unwrap();
        assert_eq!(gepumpt, 3);
        assert_eq!(puffer.belegung(), 3);
        assert_eq!(puffer.try_pop().map(|f| f.sequenz), Some(1));
        assert_eq!(puffer.try_pop().map(|f| f.sequenz), Some(2));
        assert_eq!(puffer.try_pop().map(|f| f.sequenz), Some(3));
    }

    #[tokio::test]
    async fn wiedergabe_spielt_frames_und_stoppt() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut adapter = TestAdapter::mit_quelle(vec![]);
        adapter.stop_nach = 3;
        adapter.stop_tx = Some(stop_tx);

        let puffer = FrameBuffer::neu(10);
        puffer.push(make_frame(1));
        puffer.push(make_frame(2));
        puffer.push(make_frame(3));

        let abgespielt =
            wiedergabe_pumpen(&mut adapter, &puffer, Duration::from_millis(50), stop_rx)
                .await
                .unwrap();

        assert_eq!(abgespielt, 3);
        let seqs: Vec<u64> = adapter.senke.iter().map(|f| f.sequenz).collect();
        assert_eq!(seqs, vec![1, 2, 3], "Reihenfolge muss erhalten bleiben");
    }

    #[tokio::test(start_paused = true)]
    async fn wiedergabe_spielt_stille_bei_leerem_puffer() {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut adapter = TestAdapter::mit_quelle(vec![]);
        adapter.stop_nach = 2; // zwei Stille-Marker, dann Stopp
        adapter.stop_tx = Some(stop_tx);

        let puffer = FrameBuffer::neu(10);

        let abgespielt =
            wiedergabe_pumpen(&mut adapter, &puffer, Duration::from_millis(20), stop_rx)
                .await
                .unwrap();

        // Nur Stille gespielt, keine echten Frames
        assert_eq!(abgespielt, 0);
        assert!(adapter.senke.iter().all(|f| f.ist_stille()));
        assert_eq!(adapter.senke.len(), 2);
    }
}
