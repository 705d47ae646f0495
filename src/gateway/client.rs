//! A single gateway client: supervisor, fallback poller, and send queue

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::connection::{
    ConnectionState, ConnectionSupervisor, DisconnectReason, FallbackPoller, OutboundMessage,
    PollerSignal, ReinitializeOptions, Remediation, SendPolicy, SendQueue,
};
use crate::session::{ClientSession, SessionStore};
use crate::transport::{Connector, MessageContent, SendOptions};
use crate::types::Result;

/// Per-client health view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessSummary {
    pub client_id: String,
    pub state: String,
    pub ready: bool,
    pub awaiting_pairing: bool,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub last_auth_failure_at: Option<DateTime<Utc>>,
    pub last_pairing_code_at: Option<DateTime<Utc>>,
    pub last_connect_error: Option<String>,
    pub fatal_error: Option<String>,
    pub session_path: String,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitIssueKind {
    MissingDependency,
    AuthFailure,
    AwaitingPairing,
    NotReady,
}

/// Why a client is not usable after startup
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitIssue {
    pub client_id: String,
    pub kind: InitIssueKind,
    pub detail: String,
    pub remediation: Remediation,
}

struct ClientTasks {
    poller: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl ClientTasks {
    fn abort(&self) {
        self.poller.abort();
        self.worker.abort();
    }
}

impl Drop for ClientTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// One gateway client. Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct GatewayClient {
    supervisor: ConnectionSupervisor,
    queue: SendQueue,
    tasks: Arc<ClientTasks>,
}

impl GatewayClient {
    /// Build the client and spawn its poller and send worker.
    ///
    /// Does not connect; call [`GatewayClient::connect`].
    pub fn start(
        client_id: &str,
        config: Arc<GatewayConfig>,
        connector: Arc<dyn Connector>,
        store: SessionStore,
    ) -> Self {
        let signal = Arc::new(PollerSignal::default());
        let session = ClientSession::new(client_id, &store);
        let supervisor = ConnectionSupervisor::new(
            session,
            Arc::clone(&config),
            connector,
            store,
            Arc::clone(&signal),
        );
        let poller = Arc::new(FallbackPoller::new(
            supervisor.clone(),
            signal,
            Arc::clone(&config),
        ))
        .start();
        let (queue, worker) = SendQueue::start(supervisor.clone(), SendPolicy::from_config(&config));
        Self {
            supervisor,
            queue,
            tasks: Arc::new(ClientTasks { poller, worker }),
        }
    }

    pub fn client_id(&self) -> &str {
        self.supervisor.client_id()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub(crate) fn queue(&self) -> &SendQueue {
        &self.queue
    }

    pub async fn connect(&self) -> Result<()> {
        self.supervisor.connect().await
    }

    pub async fn reinitialize(&self, options: ReinitializeOptions) -> Result<()> {
        self.supervisor.reinitialize(options).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.supervisor.disconnect().await
    }

    /// Queue a message and wait for its delivery outcome
    pub async fn send_message(
        &self,
        target: &str,
        content: impl Into<MessageContent>,
        options: SendOptions,
    ) -> Result<String> {
        self.queue
            .send(OutboundMessage {
                target: target.to_string(),
                content: content.into(),
                options,
            })
            .await
    }

    pub fn is_ready(&self) -> bool {
        self.supervisor.is_ready()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub async fn wait_for_ready(&self, timeout: Option<Duration>) -> Result<()> {
        self.supervisor.wait_for_ready(timeout).await
    }

    pub fn on_ready<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.supervisor.observers().on_ready(handler);
    }

    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(&str, &DisconnectReason) + Send + Sync + 'static,
    {
        self.supervisor.observers().on_disconnected(handler);
    }

    pub fn on_pairing_challenge<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.supervisor.observers().on_pairing_challenge(handler);
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub async fn wait_for_idle(&self) {
        self.queue.wait_for_idle().await
    }

    pub fn readiness_summary(&self) -> ReadinessSummary {
        let state = self.supervisor.state();
        let snapshot = self.supervisor.gate().snapshot();
        let fatal_error = match &state {
            ConnectionState::Fatal { message } => Some(message.clone()),
            _ => None,
        };
        ReadinessSummary {
            client_id: self.client_id().to_string(),
            state: state.name().to_string(),
            ready: snapshot.ready,
            awaiting_pairing: snapshot.awaiting_pairing
                || matches!(state, ConnectionState::AwaitingPairing { .. }),
            last_disconnect_reason: snapshot.last_disconnect_reason,
            last_auth_failure_at: snapshot.last_auth_failure_at,
            last_pairing_code_at: snapshot.last_pairing_code_at,
            last_connect_error: snapshot.last_connect_error,
            fatal_error,
            session_path: self.supervisor.session().session_path_display(),
            queue_depth: self.queue.depth(),
        }
    }

    /// Classify why the client is not ready, if it is not
    pub fn init_issue(&self) -> Option<InitIssue> {
        if self.is_ready() {
            return None;
        }
        let summary = self.readiness_summary();
        let state = self.supervisor.state();
        let (kind, detail, remediation) = match &state {
            ConnectionState::Fatal { message } => (
                InitIssueKind::MissingDependency,
                message.clone(),
                Remediation::MissingDependency,
            ),
            ConnectionState::AuthFailed { message } => (
                InitIssueKind::AuthFailure,
                message
                    .clone()
                    .unwrap_or_else(|| "authentication failure".to_string()),
                Remediation::Reauthenticate,
            ),
            _ if summary.awaiting_pairing => (
                InitIssueKind::AwaitingPairing,
                summary
                    .last_disconnect_reason
                    .map(|reason| format!("logged out ({})", reason))
                    .unwrap_or_else(|| "pairing code not yet scanned".to_string()),
                Remediation::PairingRequired,
            ),
            _ => (
                InitIssueKind::NotReady,
                summary
                    .last_connect_error
                    .unwrap_or_else(|| format!("client not ready (state {})", state.name())),
                Remediation::CheckConnectivity,
            ),
        };
        Some(InitIssue {
            client_id: self.client_id().to_string(),
            kind,
            detail,
            remediation,
        })
    }

    /// Disconnect and stop background tasks. Pending sends fail.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        self.tasks.abort();
    }
}
