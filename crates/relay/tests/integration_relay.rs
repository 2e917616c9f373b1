//! Integrationstests: Relay-Server, Hub und Worker-Clients ueber echtes TCP
//!
//! Jeder Test bindet einen eigenen Server auf einem ephemeren Port.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rundfunk_core::{AudioFrame, RundfunkError, SectionId, WorkerId, WorkerRolle};
use rundfunk_protocol::{RelayCodec, RelayErrorCode, RelayMessage};
use rundfunk_relay::{HubEreignis, RelayClient, RelayEinstellungen, RelayHub, RelayServer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

// ---------------------------------------------------------------------------
// Hilfsfunktionen
// ---------------------------------------------------------------------------

struct TestUmgebung {
    hub: RelayHub,
    ereignisse: mpsc::UnboundedReceiver<HubEreignis>,
    adresse: SocketAddr,
    _shutdown_tx: watch::Sender<bool>,
}

async fn server_starten(einstellungen: RelayEinstellungen) -> TestUmgebung {
    let (hub, ereignisse) = RelayHub::neu(einstellungen);
    let server = RelayServer::binden(hub.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .expect("Server muss binden");
    let adresse = server.lokale_adresse();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.starten(shutdown_rx));
    TestUmgebung {
        hub,
        ereignisse,
        adresse,
        _shutdown_tx: shutdown_tx,
    }
}

fn frame(seq: u64) -> AudioFrame {
    AudioFrame::neu(seq, seq * 20, Bytes::from(format!("frame-{seq}")))
}

async fn frame_mit_frist(client: &mut RelayClient) -> AudioFrame {
    tokio::time::timeout(Duration::from_secs(5), client.naechstes_frame())
        .await
        .expect("Zeitlimit beim Frame-Empfang")
        .expect("Frame erwartet")
}

/// Pollt eine Bedingung bis sie zutrifft oder die Frist ablaeuft
async fn warte_bis<F: Fn() -> bool>(beschreibung: &str, frist: Duration, bedingung: F) {
    let start = tokio::time::Instant::now();
    loop {
        if bedingung() {
            return;
        }
        assert!(
            start.elapsed() < frist,
            "Frist abgelaufen: {beschreibung}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Fan-Out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fanout_liefert_an_alle_empfaenger_in_reihenfolge() {
    let umgebung = server_starten(RelayEinstellungen::default()).await;
    let sektion = SectionId::new();
    umgebung.hub.sektion_anlegen(sektion, 2);

    let mut forwarder = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Forwarder,
        WorkerId::new(),
    )
    .await
    .expect("Forwarder muss registrieren");

    let mut empfaenger1 = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Receiver,
        WorkerId::new(),
    )
    .await
    .expect("Receiver 1 muss registrieren");
    let mut empfaenger2 = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Receiver,
        WorkerId::new(),
    )
    .await
    .expect("Receiver 2 muss registrieren");

    for seq in 1..=3u64 {
        forwarder.frame_senden(&frame(seq)).await.unwrap();
    }

    for empfaenger in [&mut empfaenger1, &mut empfaenger2] {
        let mut seqs = Vec::new();
        for _ in 0..3 {
            seqs.push(frame_mit_frist(empfaenger).await.sequenz);
        }
        assert_eq!(seqs, vec![1, 2, 3], "Reihenfolge muss erhalten bleiben");
    }
}

#[tokio::test]
async fn sektionen_bleiben_strikt_getrennt() {
    let umgebung = server_starten(RelayEinstellungen::default()).await;
    let sektion_a = SectionId::new();
    let sektion_b = SectionId::new();
    umgebung.hub.sektion_anlegen(sektion_a, 1);
    umgebung.hub.sektion_anlegen(sektion_b, 1);

    let mut forwarder_a = RelayClient::verbinden(
        umgebung.adresse,
        sektion_a,
        WorkerRolle::Forwarder,
        WorkerId::new(),
    )
    .await
    .unwrap();
    let mut empfaenger_a = RelayClient::verbinden(
        umgebung.adresse,
        sektion_a,
        WorkerRolle::Receiver,
        WorkerId::new(),
    )
    .await
    .unwrap();
    let mut empfaenger_b = RelayClient::verbinden(
        umgebung.adresse,
        sektion_b,
        WorkerRolle::Receiver,
        WorkerId::new(),
    )
    .await
    .unwrap();

    forwarder_a.frame_senden(&frame(1)).await.unwrap();

    assert_eq!(frame_mit_frist(&mut empfaenger_a).await.sequenz, 1);

    // Sektion B darf nichts sehen
    let nichts =
        tokio::time::timeout(Duration::from_millis(200), empfaenger_b.naechstes_frame()).await;
    assert!(nichts.is_err(), "Frame aus fremder Sektion empfangen");
}

// ---------------------------------------------------------------------------
// Registrierungsregeln
// ---------------------------------------------------------------------------

#[tokio::test]
async fn doppelter_forwarder_wird_am_draht_abgelehnt() {
    let umgebung = server_starten(RelayEinstellungen::default()).await;
    let sektion = SectionId::new();
    umgebung.hub.sektion_anlegen(sektion, 1);

    let _forwarder = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Forwarder,
        WorkerId::new(),
    )
    .await
    .unwrap();

    let fehler = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Forwarder,
        WorkerId::new(),
    )
    .await
    .unwrap_err();
    assert!(
        matches!(fehler, RundfunkError::DoppelteRolle { .. }),
        "Erwartet DoppelteRolle, bekam: {fehler}"
    );
}

#[tokio::test]
async fn frame_vor_registrierung_wird_abgelehnt() {
    let umgebung = server_starten(RelayEinstellungen::default()).await;
    let sektion = SectionId::new();
    umgebung.hub.sektion_anlegen(sektion, 1);

    // Roh-Verbindung ohne Register
    let stream = tokio::net::TcpStream::connect(umgebung.adresse)
        .await
        .unwrap();
    let mut framed = Framed::new(stream, RelayCodec::neu());
    framed
        .send(RelayMessage::frame(sektion, WorkerId::new(), &frame(1)))
        .await
        .unwrap();

    let antwort = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("Zeitlimit")
        .expect("Antwort erwartet")
        .expect("Dekodierbare Antwort erwartet");
    match antwort {
        RelayMessage::Error { code, .. } => assert_eq!(code, RelayErrorCode::NotRegistered),
        andere => panic!("Erwartet Error-Nachricht, bekam: {andere:?}"),
    }

    // Danach schliesst der Hub die Verbindung
    let ende = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("Zeitlimit");
    assert!(ende.is_none(), "Verbindung muss geschlossen werden");
}

#[tokio::test]
async fn verbindungslimit_weist_ueberzaehlige_ab() {
    let einstellungen = RelayEinstellungen {
        max_verbindungen: 1,
        ..RelayEinstellungen::default()
    };
    let umgebung = server_starten(einstellungen).await;
    let sektion = SectionId::new();
    umgebung.hub.sektion_anlegen(sektion, 2);

    let _erster = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Receiver,
        WorkerId::new(),
    )
    .await
    .expect("Erste Verbindung muss durchgehen");

    let fehler = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Receiver,
        WorkerId::new(),
    )
    .await
    .unwrap_err();
    assert!(
        matches!(fehler, RundfunkError::ServerVoll),
        "Erwartet ServerVoll, bekam: {fehler}"
    );
}

// ---------------------------------------------------------------------------
// Karenzzeit & Wiederanbindung
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wiederanbindung_setzt_zustellung_fort() {
    let umgebung = server_starten(RelayEinstellungen::default()).await;
    let sektion = SectionId::new();
    umgebung.hub.sektion_anlegen(sektion, 2);

    let mut forwarder = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Forwarder,
        WorkerId::new(),
    )
    .await
    .unwrap();
    let mut empfaenger1 = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Receiver,
        WorkerId::new(),
    )
    .await
    .unwrap();

    let worker2 = WorkerId::new();
    let mut empfaenger2 =
        RelayClient::verbinden(umgebung.adresse, sektion, WorkerRolle::Receiver, worker2)
            .await
            .unwrap();

    forwarder.frame_senden(&frame(1)).await.unwrap();
    assert_eq!(frame_mit_frist(&mut empfaenger1).await.sequenz, 1);
    assert_eq!(frame_mit_frist(&mut empfaenger2).await.sequenz, 1);

    // Receiver 2 faellt weg; Receiver 1 bleibt ungestoert
    drop(empfaenger2);
    let hub = umgebung.hub.clone();
    warte_bis("Receiver 2 gilt als getrennt", Duration::from_secs(5), || {
        hub.sektion_status(&sektion)
            .is_some_and(|s| s.empfaenger_aktiv == 1)
    })
    .await;

    forwarder.frame_senden(&frame(2)).await.unwrap();
    assert_eq!(frame_mit_frist(&mut empfaenger1).await.sequenz, 2);

    // Gleiche Identitaet kehrt innerhalb der Karenzzeit zurueck
    let mut empfaenger2 =
        RelayClient::verbinden(umgebung.adresse, sektion, WorkerRolle::Receiver, worker2)
            .await
            .expect("Wiederanbindung muss klappen");

    forwarder.frame_senden(&frame(3)).await.unwrap();
    assert_eq!(frame_mit_frist(&mut empfaenger1).await.sequenz, 3);
    assert_eq!(
        frame_mit_frist(&mut empfaenger2).await.sequenz,
        3,
        "Zustellung muss beim naechsten Frame weiterlaufen, ohne das verpasste Frame"
    );
}

#[tokio::test]
async fn karenzablauf_meldet_rollenverlust() {
    let einstellungen = RelayEinstellungen {
        karenzzeit: Duration::from_millis(50),
        ..RelayEinstellungen::default()
    };
    let mut umgebung = server_starten(einstellungen).await;
    let sektion = SectionId::new();
    umgebung.hub.sektion_anlegen(sektion, 1);

    let worker = WorkerId::new();
    let empfaenger =
        RelayClient::verbinden(umgebung.adresse, sektion, WorkerRolle::Receiver, worker)
            .await
            .unwrap();
    drop(empfaenger);

    // Ereigniskette bis zum Rollenverlust abwarten
    let verloren = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match umgebung.ereignisse.recv().await {
                Some(HubEreignis::RolleVerloren {
                    sektion_id,
                    rolle,
                    worker_id,
                }) => return (sektion_id, rolle, worker_id),
                Some(_) => continue,
                None => panic!("Ereigniskanal geschlossen"),
            }
        }
    })
    .await
    .expect("RolleVerloren muss gemeldet werden");
    assert_eq!(verloren, (sektion, WorkerRolle::Receiver, worker));

    // Der Slot ist frei: eine neue Identitaet darf den Platz belegen
    let _neuer = RelayClient::verbinden(
        umgebung.adresse,
        sektion,
        WorkerRolle::Receiver,
        WorkerId::new(),
    )
    .await
    .expect("Freier Slot muss neu belegbar sein");
}

#[tokio::test]
async fn abmelden_gibt_verbindung_sofort_frei() {
    let umgebung = server_starten(RelayEinstellungen::default()).await;
    let sektion = SectionId::new();
    umgebung.hub.sektion_anlegen(sektion, 1);

    let worker = WorkerId::new();
    let empfaenger =
        RelayClient::verbinden(umgebung.adresse, sektion, WorkerRolle::Receiver, worker)
            .await
            .unwrap();
    empfaenger.abmelden().await.unwrap();

    let hub = umgebung.hub.clone();
    warte_bis("Abmeldung verarbeitet", Duration::from_secs(5), || {
        hub.sektion_status(&sektion)
            .is_some_and(|s| s.empfaenger_aktiv == 0)
    })
    .await;

    // Slot haengt in der Karenzzeit, gehoert aber weiter der Identitaet
    let status = umgebung.hub.sektion_status(&sektion).unwrap();
    assert_eq!(status.empfaenger_gesamt, 1);

    // Dieselbe Identitaet darf sofort zurueckkommen
    let _zurueck =
        RelayClient::verbinden(umgebung.adresse, sektion, WorkerRolle::Receiver, worker)
            .await
            .expect("Rueckkehr in der Karenzzeit muss klappen");
}
