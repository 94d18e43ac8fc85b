// CLI subcommand dispatch and session setup.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Subcommand;
use diql_client::transport::TransportEvent;
use diql_client::{Client, ClientConfig, ConnectionConfig, DocumentError, SessionEvent};
use diql_common::analysis::Analysis;
use tokio::sync::broadcast;

use crate::exit_code::{ServiceUnreachable, SessionRejected};
use crate::output::OutputFormat;

pub mod clone;
pub mod run;
pub mod show;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Subcommand)]
pub enum Command {
    /// Load an analysis and print it
    Show(show::ShowArgs),
    /// Execute one query and print its result
    Run(run::RunArgs),
    /// Clone an analysis version into a new analysis
    Clone(clone::CloneArgs),
}

/// Global options shared by every subcommand.
pub struct Session {
    pub config: Option<PathBuf>,
    pub url: Option<String>,
    pub credential: Option<String>,
    pub format: OutputFormat,
}

pub fn run(session: &Session, cmd: Command) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        match cmd {
            Command::Show(args) => show::run(session, args).await,
            Command::Run(args) => run::run(session, args).await,
            Command::Clone(args) => clone::run(session, args).await,
        }
    })
}

impl Session {
    pub fn connection_config(&self) -> anyhow::Result<ConnectionConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load_from(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => ClientConfig::load(),
        };
        if let Some(url) = &self.url {
            config.connection.url = url.clone();
        }
        // A one-shot command should fail rather than wait for a reconnect.
        config.connection.lazy = false;
        Ok(config.connection)
    }

    /// Open a session and wait for the socket to come up.
    pub async fn connect(&self) -> anyhow::Result<Connection> {
        let config = self.connection_config()?;
        let url = config.url.clone();
        let client = Client::connect(config, self.credential.clone())?;
        let session_events = client.commands().session_events();

        let mut events = client.transport().subscribe();
        if !client.transport().ready() {
            let opened = tokio::time::timeout(CONNECT_TIMEOUT, async {
                while let Some(event) = events.recv().await {
                    if matches!(event, TransportEvent::Open) {
                        return true;
                    }
                }
                false
            })
            .await;
            if !matches!(opened, Ok(true)) {
                client.close();
                return Err(ServiceUnreachable { url }.into());
            }
        }
        tracing::debug!(url = %client.transport().config().url, "session open");

        Ok(Connection { client, session_events })
    }
}

pub struct Connection {
    pub client: Client,
    session_events: broadcast::Receiver<SessionEvent>,
}

impl Connection {
    /// Attach context to a failed document operation, naming a rejected
    /// credential when that is what ended the request.
    pub fn explain(&mut self, error: DocumentError, action: String) -> anyhow::Error {
        if self.logged_out() {
            return anyhow::Error::new(SessionRejected).context(action);
        }
        anyhow::Error::new(error).context(action)
    }

    /// Whether the server has rejected this session's credential.
    pub fn logged_out(&mut self) -> bool {
        matches!(self.session_events.try_recv(), Ok(SessionEvent::LoggedOut { .. }))
    }

    pub async fn load(&mut self, analysis_id: &str, version: Option<i64>) -> anyhow::Result<Analysis> {
        let loaded = self.client.documents().load_analysis(analysis_id, version).await;
        match loaded {
            Ok(analysis) => Ok(analysis),
            Err(error) => Err(self.explain(error, format!("failed to load analysis {analysis_id}"))),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(config: Option<PathBuf>, url: Option<&str>) -> Session {
        Session {
            config,
            url: url.map(str::to_string),
            credential: None,
            format: OutputFormat::Json,
        }
    }

    #[test]
    fn url_flag_overrides_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            "[connection]\nurl = \"wss://a.example.com/socket\"\nreconnect_interval_ms = 500\nlazy = true\n",
        )
        .expect("write config");

        let from_file = session(Some(path.clone()), None).connection_config().expect("config");
        assert_eq!(from_file.url, "wss://a.example.com/socket");
        assert_eq!(from_file.reconnect_interval_ms, 500);
        assert!(!from_file.lazy);

        let overridden = session(Some(path), Some("wss://b.example.com/socket"))
            .connection_config()
            .expect("config");
        assert_eq!(overridden.url, "wss://b.example.com/socket");
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = session(Some(dir.path().join("nope.toml")), None);
        assert!(missing.connection_config().is_err());
    }
}
