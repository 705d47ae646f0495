//! Scripted transport shared by the lifecycle tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

use courier::config::GatewayConfig;
use courier::session::SessionStore;
use courier::transport::{
    Connector, EventSink, MessageContent, OpenRequest, SendOptions, TransportError,
    TransportEvent, TransportHandle, TransportState,
};
use courier::GatewayClient;

pub const CLIENT_ID: &str = "wa-test";
pub const TARGET: &str = "628123456789@c.us";

/// What the connector does on one `open` call
#[derive(Clone)]
pub enum OpenScript {
    Fail(TransportError),
    /// Succeed and emit these events
    Emit(Vec<TransportEvent>),
}

/// Calls observed across every handle a connector has opened
#[derive(Default)]
pub struct Recorder {
    opens: Mutex<Vec<Instant>>,
    logouts: Mutex<Vec<Instant>>,
    closes: AtomicUsize,
    sends: Mutex<Vec<(Instant, String, String)>>,
    send_results: Mutex<VecDeque<Result<String, TransportError>>>,
    probe_ready: AtomicBool,
    probe_state: Mutex<Option<TransportState>>,
    /// `is_ready` and `state` never resolve while set
    status_stalled: AtomicBool,
}

impl Recorder {
    async fn stall_if_requested(&self) {
        if self.status_stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

pub struct MockConnector {
    script: Mutex<VecDeque<OpenScript>>,
    fallback: OpenScript,
    sinks: Mutex<Vec<EventSink>>,
    recorder: Arc<Recorder>,
}

impl MockConnector {
    /// `fallback` applies to every open once the script runs out
    pub fn new(fallback: OpenScript) -> Arc<Self> {
        Self::scripted(Vec::new(), fallback)
    }

    pub fn scripted(script: Vec<OpenScript>, fallback: OpenScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            sinks: Mutex::new(Vec::new()),
            recorder: Arc::new(Recorder::default()),
        })
    }

    /// Emit an event on the most recently opened session
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.sinks
            .lock()
            .unwrap()
            .last()
            .map(|sink| sink.emit(event))
            .unwrap_or(false)
    }

    /// What every handle reports when probed
    pub fn set_probe(&self, ready: bool, state: TransportState) {
        self.recorder.probe_ready.store(ready, Ordering::SeqCst);
        *self.recorder.probe_state.lock().unwrap() = Some(state);
    }

    /// Make every status call hang, as a wedged browser page would
    pub fn stall_status_calls(&self, stalled: bool) {
        self.recorder.status_stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn push_send_results<I>(&self, results: I)
    where
        I: IntoIterator<Item = Result<String, TransportError>>,
    {
        self.recorder.send_results.lock().unwrap().extend(results);
    }

    pub fn open_count(&self) -> usize {
        self.recorder.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.recorder.opens.lock().unwrap().clone()
    }

    pub fn logout_times(&self) -> Vec<Instant> {
        self.recorder.logouts.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.recorder.closes.load(Ordering::SeqCst)
    }

    pub fn send_times(&self) -> Vec<Instant> {
        self.recorder
            .sends
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _, _)| *at)
            .collect()
    }

    /// `(target, text)` of every send call, in order
    pub fn sent(&self) -> Vec<(String, String)> {
        self.recorder
            .sends
            .lock()
            .unwrap()
            .iter()
            .map(|(_, target, text)| (target.clone(), text.clone()))
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        _request: OpenRequest,
        events: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError> {
        self.recorder.opens.lock().unwrap().push(Instant::now());
        let script = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.sinks.lock().unwrap().push(events.clone());
        match script {
            OpenScript::Fail(err) => Err(err),
            OpenScript::Emit(scripted) => {
                for event in scripted {
                    events.emit(event);
                }
                Ok(Arc::new(MockHandle {
                    recorder: Arc::clone(&self.recorder),
                }))
            }
        }
    }
}

struct MockHandle {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn send(
        &self,
        target: &str,
        content: &MessageContent,
        _options: &SendOptions,
    ) -> Result<String, TransportError> {
        let text = match content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Document { file_name, .. } => file_name.clone(),
        };
        let count = {
            let mut sends = self.recorder.sends.lock().unwrap();
            sends.push((Instant::now(), target.to_string(), text));
            sends.len()
        };
        self.recorder
            .send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("msg-{}", count)))
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.recorder.logouts.lock().unwrap().push(Instant::now());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool, TransportError> {
        self.recorder.stall_if_requested().await;
        Ok(self.recorder.probe_ready.load(Ordering::SeqCst))
    }

    async fn state(&self) -> Result<TransportState, TransportError> {
        self.recorder.stall_if_requested().await;
        Ok(self
            .recorder
            .probe_state
            .lock()
            .unwrap()
            .unwrap_or(TransportState::Opening))
    }
}

/// Production-shaped timings with short connect, auth-ready, and hard-init
/// windows so paused-clock tests stay readable
pub fn test_config(dir: &TempDir) -> GatewayConfig {
    GatewayConfig {
        client_ids: vec![CLIENT_ID.to_string()],
        auth_data_path: dir.path().to_path_buf(),
        connect_timeout: Duration::from_secs(30),
        auth_ready_timeout: Duration::from_secs(5),
        hard_init_base_delay: Duration::from_secs(1),
        hard_init_max_delay: Duration::from_secs(10),
        ..GatewayConfig::default()
    }
}

pub fn start_client(connector: &Arc<MockConnector>, config: GatewayConfig) -> GatewayClient {
    let store = SessionStore::new(config.auth_data_path.clone());
    let connector: Arc<dyn Connector> = connector.clone();
    GatewayClient::start(CLIENT_ID, Arc::new(config), connector, store)
}
