// diql client library: the reconnecting command channel, query execution,
// and the optimistically versioned analysis document.

pub mod commands;
pub mod config;
pub mod document;
pub mod execution;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use commands::{CommandClient, CommandError, CommandEvent, CommandStream, SessionEvent};
pub use config::{ClientConfig, ConfigError, ConnectionConfig};
pub use document::{DocumentError, DocumentService};
pub use execution::{ExecutionService, IntermediateCallback, QueryContext, QueryFailed, ResultHandle};
pub use transport::{Connector, Transport, TransportError, WebSocketConnector};

/// One session with the query service, with every layer wired together.
#[derive(Clone)]
pub struct Client {
    commands: CommandClient,
    documents: DocumentService,
}

impl Client {
    /// Validate the configuration and open a WebSocket session (unless the
    /// connection is configured lazy). Must be called within a tokio runtime.
    pub fn connect(config: ConnectionConfig, credential: Option<String>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_connector(config, credential, Arc::new(WebSocketConnector)))
    }

    pub fn with_connector(
        config: ConnectionConfig,
        credential: Option<String>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let transport = Transport::new(config, connector);
        let commands = CommandClient::new(transport, credential);
        let execution = ExecutionService::new(commands.clone());
        let documents = DocumentService::new(commands.clone(), execution);
        Self { commands, documents }
    }

    pub fn transport(&self) -> &Transport {
        self.commands.transport()
    }

    pub fn commands(&self) -> &CommandClient {
        &self.commands
    }

    pub fn execution(&self) -> &ExecutionService {
        self.documents.execution()
    }

    pub fn documents(&self) -> &DocumentService {
        &self.documents
    }

    /// Drop the loaded document, cancel its executions, and close the socket.
    pub fn close(&self) {
        self.documents.unload_analysis();
        self.transport().close();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{test_config, MockConnector};
    use crate::transport::ConnectionState;

    #[test]
    fn connect_rejects_plain_ws_to_remote_hosts() {
        let config = ConnectionConfig {
            url: "ws://query.example.com/socket".to_string(),
            ..ConnectionConfig::default()
        };
        assert!(matches!(Client::connect(config, None), Err(ConfigError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn close_cancels_executions_and_closes_the_socket() {
        let (connector, mut sockets) = MockConnector::new();
        let client = Client::with_connector(test_config(), Some("token-1".to_string()), connector);
        let mut socket = sockets.recv().await.expect("transport should connect");

        client.documents().set_loaded_analysis(
            serde_json::from_value(json!({
                "id": "A1",
                "version": 2,
                "qubes": [{ "id": "Q1", "sliceId": "S1", "queries": [{ "id": "R1", "diql": "select count()" }] }],
                "slices": [{ "id": "S1" }]
            }))
            .expect("document should decode"),
        );
        let result = client.documents().provide_query_results("Q1", "R1", None).expect("query exists");
        let execute = socket.next_frame().await;
        assert_eq!(execute["commandData"]["analysisVersion"], 2);

        client.close();

        let cancel = socket.next_frame().await;
        assert_eq!(cancel["command"], "cancel");
        assert!(result.snapshot().is_failed());
        assert_eq!(client.transport().state(), ConnectionState::Closed);
        assert!(client.documents().document().is_none());
    }
}
