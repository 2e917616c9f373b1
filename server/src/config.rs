//! Server-Konfiguration
//!
//! Wird beim Start aus einer TOML-Datei geladen. Alle Felder haben
//! sinnvolle Standardwerte, sodass der Server ohne Konfigurationsdatei
//! lauffaehig ist. Die Abschnitts-Structs werden ueber Hilfsmethoden in
//! die Laufzeit-Einstellungen der Teilsysteme uebersetzt.

use rundfunk_core::WorkerRolle;
use rundfunk_relay::RelayEinstellungen;
use rundfunk_section::SektionEinstellungen;
use rundfunk_supervisor::{SupervisorEinstellungen, TokenPool, WorkerToken};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Vollstaendige Server-Konfiguration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ServerConfig {
    /// Allgemeine Server-Einstellungen
    pub server: ServerAbschnitt,
    /// Logging-Einstellungen
    pub logging: LoggingAbschnitt,
    /// Relay-Endpunkt und Verbindungs-Fristen
    pub relay: RelayAbschnitt,
    /// Frame-Puffer-Einstellungen
    pub puffer: PufferAbschnitt,
    /// Prozess-Aufsicht und Neustart-Policy
    pub supervisor: SupervisorAbschnitt,
    /// Zugangsdaten-Referenzen des Token-Pools
    pub tokens: TokenAbschnitt,
    /// Sektions-Lebenszyklus
    pub sektionen: SektionenAbschnitt,
}

/// Allgemeine Server-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAbschnitt {
    /// Anzeigename des Servers
    pub name: String,
}

impl Default for ServerAbschnitt {
    fn default() -> Self {
        Self {
            name: "Rundfunk Server".into(),
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingAbschnitt {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Format: "json" oder "text"
    pub format: String,
}

impl Default for LoggingAbschnitt {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Relay-Endpunkt und Verbindungs-Fristen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayAbschnitt {
    /// Bind-Adresse des TCP-Endpunkts
    pub bind_adresse: String,
    /// Port des TCP-Endpunkts
    pub port: u16,
    /// Maximale Anzahl gleichzeitiger Verbindungen
    pub max_verbindungen: usize,
    /// Maximale Nachrichtengroesse auf dem Draht in Bytes
    pub max_frame_groesse: usize,
    /// Ping-Intervall des Hubs in Sekunden
    pub ping_intervall_s: u64,
    /// Ohne Pong nach dieser Dauer gilt eine Verbindung als veraltet
    pub stale_timeout_s: u64,
    /// Karenzzeit fuer getrennte Worker-Slots in Sekunden
    pub grace_periode_s: u64,
}

impl Default for RelayAbschnitt {
    fn default() -> Self {
        Self {
            bind_adresse: "0.0.0.0".into(),
            port: 7400,
            max_verbindungen: 100,
            max_frame_groesse: 1024 * 1024,
            ping_intervall_s: 10,
            stale_timeout_s: 20,
            grace_periode_s: 30,
        }
    }
}

/// Frame-Puffer-Einstellungen
///
/// `pop_timeout_ms` ist Teil des Worker-Kontrakts: Wiedergabe-Schleifen
/// warten hoechstens so lange auf ein Frame bevor Stille ausgegeben wird.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PufferAbschnitt {
    /// Kapazitaet der Receiver-Frame-Puffer
    pub kapazitaet: usize,
    /// Wartezeit der Wiedergabe-Schleifen in Millisekunden
    pub pop_timeout_ms: u64,
}

impl Default for PufferAbschnitt {
    fn default() -> Self {
        Self {
            kapazitaet: 100,
            pop_timeout_ms: 10,
        }
    }
}

/// Prozess-Aufsicht und Neustart-Policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorAbschnitt {
    /// Programm das pro Worker gespawnt wird
    pub worker_befehl: String,
    /// Feste Argumente fuer jeden Worker
    pub worker_argumente: Vec<String>,
    /// Erwartetes Herzschlag-Intervall in Sekunden
    pub herzschlag_intervall_s: u64,
    /// K: so viele verpasste Herzschlaege gelten als Ausfall
    pub max_fehlende_herzschlaege: u32,
    /// R: maximale Neustarts bevor die Rolle als verloren gilt
    pub max_neustarts: u32,
    /// Basis des exponentiellen Backoffs in Millisekunden
    pub backoff_basis_ms: u64,
    /// Obergrenze des Backoffs in Millisekunden
    pub backoff_max_ms: u64,
    /// Frist fuer freiwilliges Beenden in Sekunden
    pub stop_frist_s: u64,
}

impl Default for SupervisorAbschnitt {
    fn default() -> Self {
        Self {
            worker_befehl: "rundfunk-worker".into(),
            worker_argumente: Vec::new(),
            herzschlag_intervall_s: 10,
            max_fehlende_herzschlaege: 3,
            max_neustarts: 3,
            backoff_basis_ms: 500,
            backoff_max_ms: 30_000,
            stop_frist_s: 5,
        }
    }
}

/// Zugangsdaten-Referenzen des Token-Pools
///
/// Jede Referenz wird zu genau einem [`WorkerToken`]; mehr Worker als
/// Referenzen kann das System nie gleichzeitig betreiben.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenAbschnitt {
    /// Zugangsdaten fuer Forwarder-Worker
    pub forwarder: Vec<String>,
    /// Zugangsdaten fuer Receiver-Worker
    pub empfaenger: Vec<String>,
}

impl Default for TokenAbschnitt {
    fn default() -> Self {
        Self {
            forwarder: vec!["forwarder-0".into()],
            empfaenger: vec!["empfaenger-0".into(), "empfaenger-1".into()],
        }
    }
}

/// Sektions-Lebenszyklus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SektionenAbschnitt {
    /// Receiver-Anzahl wenn der Aufrufer keine nennt
    pub standard_empfaenger: usize,
    /// Receiver-Starts pro Staffel
    pub batch_groesse: usize,
    /// Pause zwischen zwei Staffeln in Millisekunden
    pub batch_pause_ms: u64,
    /// Frist bis zum Aktiv-Gate in Sekunden
    pub start_frist_s: u64,
}

impl Default for SektionenAbschnitt {
    fn default() -> Self {
        Self {
            standard_empfaenger: 2,
            batch_groesse: 10,
            batch_pause_ms: 2000,
            start_frist_s: 30,
        }
    }
}

impl ServerConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei.
    /// Gibt die Standardkonfiguration zurueck wenn die Datei nicht existiert.
    pub fn laden(pfad: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => {
                let config: Self = toml::from_str(&inhalt)
                    .map_err(|e| anyhow::anyhow!("Konfigurationsfehler in '{pfad}': {e}"))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    pfad = pfad,
                    "Konfigurationsdatei nicht gefunden, verwende Standardwerte"
                );
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Konfigurationsdatei '{pfad}' nicht lesbar: {e}"
            )),
        }
    }

    /// Gibt die vollstaendige Bind-Adresse des Relay-Endpunkts zurueck
    pub fn relay_bind_adresse(&self) -> String {
        format!("{}:{}", self.relay.bind_adresse, self.relay.port)
    }

    /// Host unter dem lokale Worker den Relay erreichen
    ///
    /// Bei einem Wildcard-Bind verbinden sich Worker ueber Loopback.
    pub fn relay_worker_host(&self) -> &str {
        match self.relay.bind_adresse.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            adresse => adresse,
        }
    }

    /// Uebersetzt den `[relay]`/`[puffer]`-Abschnitt in Hub-Einstellungen
    pub fn relay_einstellungen(&self) -> RelayEinstellungen {
        RelayEinstellungen {
            ping_intervall: Duration::from_secs(self.relay.ping_intervall_s),
            veraltet_schwelle: Duration::from_secs(self.relay.stale_timeout_s),
            // Getrennt wird eine Verbindung ein Ping-Intervall nach der
            // Veraltet-Schwelle
            getrennt_schwelle: Duration::from_secs(
                self.relay.stale_timeout_s + self.relay.ping_intervall_s,
            ),
            karenzzeit: Duration::from_secs(self.relay.grace_periode_s),
            puffer_kapazitaet: self.puffer.kapazitaet,
            max_nachricht_groesse: self.relay.max_frame_groesse,
            max_verbindungen: self.relay.max_verbindungen,
            ..RelayEinstellungen::default()
        }
    }

    /// Uebersetzt den `[supervisor]`-Abschnitt in Supervisor-Einstellungen
    pub fn supervisor_einstellungen(&self) -> SupervisorEinstellungen {
        SupervisorEinstellungen {
            worker_befehl: self.supervisor.worker_befehl.clone(),
            worker_argumente: self.supervisor.worker_argumente.clone(),
            herzschlag_intervall: Duration::from_secs(self.supervisor.herzschlag_intervall_s),
            max_fehlende_herzschlaege: self.supervisor.max_fehlende_herzschlaege,
            max_neustarts: self.supervisor.max_neustarts,
            backoff_basis: Duration::from_millis(self.supervisor.backoff_basis_ms),
            backoff_max: Duration::from_millis(self.supervisor.backoff_max_ms),
            stop_frist: Duration::from_secs(self.supervisor.stop_frist_s),
        }
    }

    /// Uebersetzt den `[sektionen]`-Abschnitt in Koordinator-Einstellungen
    ///
    /// Die Relay-Adresse zeigt auf den konfigurierten Port; bindet der
    /// Server auf einem anderen Port, ueberschreibt er sie beim Start.
    pub fn sektions_einstellungen(&self) -> SektionEinstellungen {
        SektionEinstellungen {
            standard_empfaenger: self.sektionen.standard_empfaenger,
            batch_groesse: self.sektionen.batch_groesse,
            batch_pause: Duration::from_millis(self.sektionen.batch_pause_ms),
            start_frist: Duration::from_secs(self.sektionen.start_frist_s),
            relay_adresse: format!("{}:{}", self.relay_worker_host(), self.relay.port),
        }
    }

    /// Baut den Token-Pool aus den konfigurierten Zugangsdaten-Referenzen
    pub fn token_pool(&self) -> TokenPool {
        let mut tokens =
            Vec::with_capacity(self.tokens.forwarder.len() + self.tokens.empfaenger.len());
        for zugangsdaten in &self.tokens.forwarder {
            tokens.push(WorkerToken::neu(
                WorkerRolle::Forwarder,
                zugangsdaten.clone(),
            ));
        }
        for zugangsdaten in &self.tokens.empfaenger {
            tokens.push(WorkerToken::neu(
                WorkerRolle::Receiver,
                zugangsdaten.clone(),
            ));
        }
        TokenPool::neu(tokens)
    }
}
