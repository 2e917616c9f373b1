//! Begrenzter Frame-Puffer zwischen Netzwerk- und Audio-Takt
//!
//! Entkoppelt den Produzenten (Netzwerk-Fanout oder Capture-Thread) vom
//! Konsumenten (Wiedergabeschleife oder Verbindungs-Task). Bei Ueberlauf
//! wird das aelteste Frame verworfen (latest-wins) und der Verlust gezaehlt.
//!
//! ## Design
//! - `push` blockiert nie laenger als den Lock selbst
//! - Entnahme existiert blockierend (Condvar, fuer dedizierte Audio-Threads)
//!   und async (tokio Notify, fuer Verbindungs-Tasks), da Produzent und
//!   Konsument ueblicherweise auf verschiedenen Scheduling-Modellen laufen
//! - ein einziger Mutex schuetzt Queue und Statistik

use parking_lot::{Condvar, Mutex};
use rundfunk_core::AudioFrame;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Konfiguration & Statistiken
// ---------------------------------------------------------------------------

/// Standard-Kapazitaet in Frames
pub const STANDARD_KAPAZITAET: usize = 100;

/// Statistiken des Frame-Puffers (Snapshot)
#[derive(Debug, Clone, Default)]
pub struct PufferStatistik {
    /// Anzahl eingefuegter Frames gesamt
    pub eingefuegt: u64,
    /// Anzahl entnommener Frames gesamt
    pub entnommen: u64,
    /// Anzahl durch Ueberlauf verworfener Frames
    pub verworfen: u64,
    /// Aktueller Fuellstand in Frames
    pub fuellstand: usize,
}

// ---------------------------------------------------------------------------
// FrameBuffer
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PufferZustand {
    frames: VecDeque<AudioFrame>,
    eingefuegt: u64,
    entnommen: u64,
    verworfen: u64,
}

#[derive(Debug)]
struct PufferInner {
    zustand: Mutex<PufferZustand>,
    belegt: Condvar,
    notify: Notify,
    kapazitaet: usize,
}

/// Begrenzter, thread-sicherer Frame-Puffer mit latest-wins Ueberlauf
///
/// Klonen ist billig (Arc); alle Klone teilen denselben Puffer. Genau ein
/// Konsument sollte entnehmen, die Produzentenseite darf beliebig geteilt
/// werden.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    inner: Arc<PufferInner>,
}

impl FrameBuffer {
    /// Erstellt einen neuen Puffer mit gegebener Kapazitaet (mindestens 1)
    pub fn neu(kapazitaet: usize) -> Self {
        Self {
            inner: Arc::new(PufferInner {
                zustand: Mutex::new(PufferZustand {
                    frames: VecDeque::with_capacity(kapazitaet.max(1)),
                    eingefuegt: 0,
                    entnommen: 0,
                    verworfen: 0,
                }),
                belegt: Condvar::new(),
                notify: Notify::new(),
                kapazitaet: kapazitaet.max(1),
            }),
        }
    }

    /// Erstellt einen Puffer mit Standard-Kapazitaet
    pub fn standard() -> Self {
        Self::neu(STANDARD_KAPAZITAET)
    }

    /// Fuegt ein Frame ein; verdraengt bei vollem Puffer das aelteste
    ///
    /// Der Verlust wird gezaehlt aber nicht als Fehler gemeldet
    /// (best-effort, latest-wins).
    pub fn push(&self, frame: AudioFrame) {
        let mut zustand = self.inner.zustand.lock();
        if zustand.frames.len() >= self.inner.kapazitaet {
            zustand.frames.pop_front();
            zustand.verworfen += 1;
            tracing::trace!(
                verworfen = zustand.verworfen,
                "Puffer-Ueberlauf: aeltestes Frame verworfen"
            );
        }
        zustand.frames.push_back(frame);
        zustand.eingefuegt += 1;
        drop(zustand);

        self.inner.belegt.notify_one();
        self.inner.notify.notify_one();
    }

    /// Entnimmt das aelteste Frame ohne zu warten
    pub fn try_pop(&self) -> Option<AudioFrame> {
        let mut zustand = self.inner.zustand.lock();
        let frame = zustand.frames.pop_front();
        if frame.is_some() {
            zustand.entnommen += 1;
        }
        frame
    }

    /// Entnimmt blockierend; liefert nach `timeout` den Stille-Marker
    ///
    /// Fuer Konsumenten auf dedizierten OS-Threads (Wiedergabetakt).
    /// Der Marker kommt vom Aufrufer, damit die Wiedergabeschleife nie
    /// auf Daten warten muss.
    pub fn pop_blockierend(&self, timeout: Duration, stille: AudioFrame) -> AudioFrame {
        let frist = Instant::now() + timeout;
        let mut zustand = self.inner.zustand.lock();

        while zustand.frames.is_empty() {
            let rest = frist.saturating_duration_since(Instant::now());
            if rest.is_zero() {
                return stille;
            }
            // Spurious Wakeups: Schleife prueft den Fuellstand erneut
            self.inner.belegt.wait_for(&mut zustand, rest);
        }

        match zustand.frames.pop_front() {
            Some(frame) => {
                zustand.entnommen += 1;
                frame
            }
            None => stille,
        }
    }

    /// Entnimmt async; wartet bis ein Frame eintrifft
    pub async fn pop(&self) -> AudioFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            // notify_one hinterlegt ein Permit, daher geht zwischen
            // try_pop und notified kein Wakeup verloren
            self.inner.notify.notified().await;
        }
    }

    /// Entnimmt async mit Timeout; `None` wenn kein Frame eintraf
    pub async fn pop_mit_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        tokio::time::timeout(timeout, self.pop()).await.ok()
    }

    /// Aktueller Fuellstand in Frames
    pub fn belegung(&self) -> usize {
        self.inner.zustand.lock().frames.len()
    }

    /// Konfigurierte Kapazitaet
    pub fn kapazitaet(&self) -> usize {
        self.inner.kapazitaet
    }

    /// Gibt true zurueck wenn der Puffer leer ist
    pub fn ist_leer(&self) -> bool {
        self.belegung() == 0
    }

    /// Anzahl durch Ueberlauf verworfener Frames
    pub fn verworfen(&self) -> u64 {
        self.inner.zustand.lock().verworfen
    }

    /// Snapshot aller Zaehler
    pub fn statistik(&self) -> PufferStatistik {
        let zustand = self.inner.zustand.lock();
        PufferStatistik {
            eingefuegt: zustand.eingefuegt,
            entnommen: zustand.entnommen,
            verworfen: zustand.verworfen,
            fuellstand: zustand.frames.len(),
        }
    }

    /// Verwirft alle gepufferten Frames (Zaehler bleiben erhalten)
    pub fn leeren(&self) {
        self.inner.zustand.lock().frames.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn make_frame(seq: u64) -> AudioFrame {
        AudioFrame::neu(seq, seq * 20, Bytes::from_static(&[0xAB; 16]))
    }

    #[test]
    fn puffer_haelt_kapazitaet_ein() {
        let puffer = FrameBuffer::neu(5);

        for i in 0..20u64 {
            puffer.push(make_frame(i));
            assert!(
                puffer.belegung() <= 5,
                "Fuellstand darf Kapazitaet nie ueberschreiten"
            );
        }

        assert_eq!(puffer.belegung(), 5);
        assert_eq!(puffer.verworfen(), 15);
    }

    #[test]
    fn ueberlauf_verwirft_aelteste() {
        let puffer = FrameBuffer::neu(3);

        for i in 0..5u64 {
            puffer.push(make_frame(i));
        }

        // Seq 0 und 1 wurden verdraengt, 2..4 bleiben in Reihenfolge
        assert_eq!(puffer.try_pop().map(|f| f.sequenz), Some(2));
        assert_eq!(puffer.try_pop().map(|f| f.sequenz), Some(3));
        assert_eq!(puffer.try_pop().map(|f| f.sequenz), Some(4));
        assert!(puffer.try_pop().is_none());
    }

    #[test]
    fn gemischte_push_pop_folge_haelt_kapazitaet() {
        let puffer = FrameBuffer::neu(4);

        for runde in 0..10u64 {
            for i in 0..3u64 {
                puffer.push(make_frame(runde * 10 + i));
                assert!(puffer.belegung() <= 4);
            }
            let _ = puffer.try_pop();
            assert!(puffer.belegung() <= 4);
        }
    }

    #[test]
    fn pop_blockierend_timeout_liefert_stille() {
        let puffer = FrameBuffer::neu(8);
        let frame = puffer.pop_blockierend(Duration::from_millis(10), AudioFrame::stille(0));
        assert!(frame.ist_stille(), "Leerer Puffer muss Stille liefern");
    }

    #[test]
    fn pop_blockierend_empfaengt_von_anderem_thread() {
        let puffer = FrameBuffer::neu(8);
        let produzent = puffer.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            produzent.push(make_frame(42));
        });

        let frame = puffer.pop_blockierend(Duration::from_secs(2), AudioFrame::stille(0));
        assert_eq!(frame.sequenz, 42);
        handle.join().unwrap();
    }

    #[test]
    fn statistik_zaehlt_korrekt() {
        let puffer = FrameBuffer::neu(2);
        puffer.push(make_frame(0));
        puffer.push(make_frame(1));
        puffer.push(make_frame(2)); // verdraengt Seq 0
        let _ = puffer.try_pop();

        let stat = puffer.statistik();
        assert_eq!(stat.eingefuegt, 3);
        assert_eq!(stat.entnommen, 1);
        assert_eq!(stat.verworfen, 1);
        assert_eq!(stat.fuellstand, 1);
    }

    #[test]
    fn leeren_verwirft_inhalt() {
        let puffer = FrameBuffer::neu(4);
        puffer.push(make_frame(1));
        puffer.push(make_frame(2));
        puffer.leeren();
        assert!(puffer.ist_leer());
        // Zaehler bleiben erhalten
        assert_eq!(puffer.statistik().eingefuegt, 2);
    }

    #[tokio::test]
    async fn async_pop_wartet_auf_push() {
        let puffer = FrameBuffer::neu(8);
        let produzent = puffer.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            produzent.push(make_frame(7));
        });

        let frame = puffer.pop().await;
        assert_eq!(frame.sequenz, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn async_pop_mit_timeout_leerer_puffer() {
        let puffer = FrameBuffer::neu(8);
        let ergebnis = puffer.pop_mit_timeout(Duration::from_millis(50)).await;
        assert!(ergebnis.is_none());
    }

    #[tokio::test]
    async fn async_pop_liefert_vorhandenes_sofort() {
        let puffer = FrameBuffer::neu(8);
        puffer.push(make_frame(3));
        let frame = puffer.pop_mit_timeout(Duration::from_secs(1)).await;
        assert_eq!(frame.map(|f| f.sequenz), Some(3));
    }
}
