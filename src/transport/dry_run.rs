//! Dry-run transport for development mode.
//!
//! Pairs instantly, reports READY, and logs every send instead of
//! delivering it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{
    Connector, EventSink, MessageContent, OpenRequest, SendOptions, TransportError,
    TransportEvent, TransportHandle, TransportState,
};

#[derive(Debug, Default)]
pub struct DryRunConnector;

impl DryRunConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for DryRunConnector {
    async fn open(
        &self,
        request: OpenRequest,
        events: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError> {
        info!(
            client_id = %request.client_id,
            session_path = %request.session_path.display(),
            "Opening dry-run transport"
        );
        let handle = Arc::new(DryRunHandle {
            client_id: request.client_id,
            connected: AtomicBool::new(true),
            sent: AtomicU64::new(0),
        });
        events.emit(TransportEvent::Authenticated);
        events.emit(TransportEvent::Ready);
        Ok(handle)
    }
}

pub struct DryRunHandle {
    client_id: String,
    connected: AtomicBool,
    sent: AtomicU64,
}

impl DryRunHandle {
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransportHandle for DryRunHandle {
    async fn send(
        &self,
        target: &str,
        content: &MessageContent,
        _options: &SendOptions,
    ) -> Result<String, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotReady("dry-run session closed".into()));
        }
        let id = Uuid::new_v4().to_string();
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            client_id = %self.client_id,
            recipient = target,
            kind = content.kind(),
            message_id = %id,
            "Dry-run send"
        );
        Ok(id)
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool, TransportError> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn state(&self) -> Result<TransportState, TransportError> {
        Ok(if self.connected.load(Ordering::SeqCst) {
            TransportState::Connected
        } else {
            TransportState::Closed
        })
    }
}
