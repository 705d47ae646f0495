//! Gateway facade
//!
//! Registry of named clients sharing one connector and session store. The
//! first configured client is the primary: plain sends and admin
//! notifications go through it.

pub mod admin;
pub mod client;
pub mod target;

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::session::SessionStore;
use crate::transport::{Connector, MessageContent, SendOptions};
use crate::types::{GatewayError, Result};

pub use admin::AdminNotifier;
pub use client::{GatewayClient, InitIssue, InitIssueKind, ReadinessSummary};

/// Health view across all clients
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySummary {
    pub mode: &'static str,
    pub primary_client_id: String,
    pub ready: bool,
    pub clients: Vec<ReadinessSummary>,
}

pub struct GatewayFacade {
    config: Arc<GatewayConfig>,
    store: SessionStore,
    clients: DashMap<String, GatewayClient>,
    primary_id: String,
    admin: Arc<AdminNotifier>,
}

impl GatewayFacade {
    /// Register every configured client. Must run inside a tokio runtime;
    /// clients are not connected yet.
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let primary_id = config
            .primary_client_id()
            .ok_or_else(|| GatewayError::Config("at least one client id is required".to_string()))?
            .to_string();
        {
            let mut seen = HashSet::new();
            if let Some(duplicate) = config.client_ids.iter().find(|id| !seen.insert(id.as_str())) {
                return Err(GatewayError::Config(format!("duplicate client id '{}'", duplicate)));
            }
        }

        let config = Arc::new(config);
        let store = SessionStore::new(config.auth_data_path.clone());
        let clients = DashMap::new();
        for client_id in &config.client_ids {
            let client = GatewayClient::start(
                client_id,
                Arc::clone(&config),
                Arc::clone(&connector),
                store.clone(),
            );
            clients.insert(client_id.clone(), client);
        }

        let admin = Arc::new(AdminNotifier::new(&config.admin_targets));
        if let Some(primary) = clients.get(&primary_id) {
            let notifier = Arc::clone(&admin);
            let queue = primary.queue().clone();
            primary.on_ready(move |client_id, _source| notifier.flush(client_id, &queue));
        }

        info!(
            clients = config.client_ids.len(),
            primary = %primary_id,
            auth_root = %store.root().display(),
            admin_targets = admin.targets().len(),
            "Gateway clients registered"
        );

        Ok(Self {
            config,
            store,
            clients,
            primary_id,
            admin,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn primary_client_id(&self) -> &str {
        &self.primary_id
    }

    pub fn client(&self, client_id: &str) -> Result<GatewayClient> {
        self.clients
            .get(client_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::UnknownClient(client_id.to_string()))
    }

    pub fn primary(&self) -> Result<GatewayClient> {
        self.client(&self.primary_id)
    }

    /// All clients, in configuration order
    pub fn clients(&self) -> Vec<GatewayClient> {
        self.config
            .client_ids
            .iter()
            .filter_map(|id| self.client(id).ok())
            .collect()
    }

    /// Connect every client concurrently
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let clients = self.clients();
        let results = futures::future::join_all(clients.iter().map(|client| client.connect())).await;
        clients
            .iter()
            .map(|client| client.client_id().to_string())
            .zip(results)
            .collect()
    }

    /// Send through the primary client
    pub async fn send_message(
        &self,
        target: &str,
        content: impl Into<MessageContent>,
        options: SendOptions,
    ) -> Result<String> {
        self.primary()?.send_message(target, content, options).await
    }

    /// Try each client in order until one delivers
    pub async fn send_with_fallback(
        &self,
        target: &str,
        content: impl Into<MessageContent>,
        options: SendOptions,
        client_ids: &[&str],
    ) -> Result<String> {
        let content = content.into();
        let mut last_error = None;
        for client_id in client_ids {
            let client = match self.client(client_id) {
                Ok(client) => client,
                Err(e) => {
                    warn!(client_id, "Skipping fallback client: {}", e);
                    last_error = Some(e);
                    continue;
                }
            };
            match client
                .send_message(target, content.clone(), options.clone())
                .await
            {
                Ok(message_id) => return Ok(message_id),
                Err(e) => {
                    warn!(client_id, "Send failed; trying next client: {}", e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            GatewayError::Config("send_with_fallback needs at least one client id".to_string())
        }))
    }

    /// Notify operators. Held until the primary client is READY.
    pub fn notify_admins(&self, text: impl Into<String>) {
        if self.admin.targets().is_empty() {
            debug!("No admin targets configured; dropping notification");
            return;
        }
        self.admin.enqueue(text.into());
        if let Ok(primary) = self.primary() {
            if primary.is_ready() {
                self.admin.flush(primary.client_id(), primary.queue());
            }
        }
    }

    pub fn pending_admin_notifications(&self) -> usize {
        self.admin.pending_count()
    }

    pub fn readiness_summary(&self) -> GatewaySummary {
        let clients: Vec<ReadinessSummary> = self
            .clients()
            .iter()
            .map(GatewayClient::readiness_summary)
            .collect();
        GatewaySummary {
            mode: "send-only",
            primary_client_id: self.primary_id.clone(),
            ready: clients.iter().all(|c| c.ready),
            clients,
        }
    }

    pub fn init_issues(&self) -> Vec<InitIssue> {
        self.clients()
            .iter()
            .filter_map(GatewayClient::init_issue)
            .collect()
    }

    /// Resolve once every client's queue is empty
    pub async fn wait_for_all_queues(&self) {
        let clients = self.clients();
        futures::future::join_all(clients.iter().map(|client| client.wait_for_idle())).await;
    }

    pub async fn shutdown(&self) {
        for client in self.clients() {
            client.shutdown().await;
        }
        info!("Gateway clients shut down");
    }
}
