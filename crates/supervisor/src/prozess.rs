//! Worker-Prozess – Spawnen und Beenden einzelner OS-Prozesse
//!
//! Worker bekommen ihren kompletten Kontext ueber Umgebungsvariablen
//! (`RUNDFUNK_*`) und halten ihr stdin offen: das Schliessen des stdin
//! durch den Supervisor ist die Aufforderung zum freiwilligen Beenden.
//! Reagiert ein Worker nicht innerhalb der Stopp-Frist, wird er gekillt.
//!
//! ## Umgebungsvariablen-Kontrakt
//! | Variable                      | Inhalt                          |
//! |-------------------------------|---------------------------------|
//! | `RUNDFUNK_TOKEN`              | Zugangsdaten-Referenz           |
//! | `RUNDFUNK_WORKER_ID`          | Worker-Identitaet (UUID)        |
//! | `RUNDFUNK_SEKTION_ID`         | Sektion (UUID)                  |
//! | `RUNDFUNK_ROLLE`              | `forwarder` oder `receiver`     |
//! | `RUNDFUNK_KANAL_ID`           | Sektionskanal (UUID)            |
//! | `RUNDFUNK_SPRECHER_KANAL_ID`  | Sprecherkanal (UUID)            |
//! | `RUNDFUNK_RELAY_ADRESSE`      | TCP-Endpunkt des Relay-Hubs     |

use rundfunk_core::{KanalSatz, Result, RundfunkError, SectionId, WorkerRolle};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

use crate::token::WorkerToken;

// ---------------------------------------------------------------------------
// SpawnKontext
// ---------------------------------------------------------------------------

/// Alles was ein Worker-Prozess zum Hochfahren braucht
#[derive(Debug, Clone)]
pub struct SpawnKontext {
    pub sektion_id: SectionId,
    pub rolle: WorkerRolle,
    pub kanaele: KanalSatz,
    /// TCP-Endpunkt des Relay-Hubs, z.B. `127.0.0.1:7400`
    pub relay_adresse: String,
}

/// Baut das Spawn-Kommando mit vollstaendigem Umgebungs-Kontrakt
fn kommando_bauen(
    programm: &str,
    argumente: &[String],
    token: &WorkerToken,
    kontext: &SpawnKontext,
) -> Command {
    let mut cmd = Command::new(programm);
    cmd.args(argumente)
        .env("RUNDFUNK_TOKEN", &token.zugangsdaten)
        .env("RUNDFUNK_WORKER_ID", token.worker_id.inner().to_string())
        .env("RUNDFUNK_SEKTION_ID", kontext.sektion_id.inner().to_string())
        .env("RUNDFUNK_ROLLE", kontext.rolle.to_string())
        .env(
            "RUNDFUNK_KANAL_ID",
            kontext.kanaele.sektions_kanal.inner().to_string(),
        )
        .env(
            "RUNDFUNK_SPRECHER_KANAL_ID",
            kontext.kanaele.sprecher_kanal.inner().to_string(),
        )
        .env("RUNDFUNK_RELAY_ADRESSE", &kontext.relay_adresse)
        .stdin(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

// ---------------------------------------------------------------------------
// WorkerProzess
// ---------------------------------------------------------------------------

/// Ein laufender Worker-Prozess
#[derive(Debug)]
pub struct WorkerProzess {
    child: Child,
    stdin: Option<ChildStdin>,
    gestartet_um: Instant,
}

impl WorkerProzess {
    /// Spawnt einen Worker-Prozess
    pub fn starten(
        programm: &str,
        argumente: &[String],
        token: &WorkerToken,
        kontext: &SpawnKontext,
    ) -> Result<Self> {
        let mut cmd = kommando_bauen(programm, argumente, token, kontext);
        let mut child = cmd
            .spawn()
            .map_err(|e| RundfunkError::ProzessStart(format!("{programm}: {e}")))?;
        let stdin = child.stdin.take();

        tracing::info!(
            programm,
            pid = child.id(),
            worker = %token.worker_id,
            sektion = %kontext.sektion_id,
            rolle = %kontext.rolle,
            "Worker-Prozess gestartet"
        );
        Ok(Self {
            child,
            stdin,
            gestartet_um: Instant::now(),
        })
    }

    /// Prozess-ID, solange der Prozess laeuft
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Laufzeit seit dem Spawn
    pub fn laufzeit(&self) -> Duration {
        self.gestartet_um.elapsed()
    }

    /// Fordert den Prozess zum freiwilligen Beenden auf
    ///
    /// Schliesst das stdin des Workers; der Worker sieht EOF und faehrt
    /// herunter. Mehrfacher Aufruf ist ein No-Op.
    pub async fn stopp_anfordern(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Wartet auf das Prozessende
    pub async fn warten(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Beendet den Prozess zwangsweise
    pub async fn toeten(&mut self) {
        if let Err(e) = self.child.kill().await {
            // Prozess war bereits weg
            tracing::debug!(fehler = %e, "Kill ohne Wirkung");
        }
    }

    /// Stoppt den Prozess: erst freiwillig, nach `frist` zwangsweise
    ///
    /// Gibt den Exit-Status zurueck wenn der Prozess freiwillig ging.
    pub async fn stoppen(&mut self, frist: Duration) -> Option<ExitStatus> {
        self.stopp_anfordern().await;
        match tokio::time::timeout(frist, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    pid = self.child.id(),
                    frist_ms = frist.as_millis() as u64,
                    "Worker reagiert nicht auf Stopp – wird gekillt"
                );
                self.toeten().await;
                let _ = self.child.wait().await;
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
