//! Outbound send queue
//!
//! One worker per client drains a bounded FIFO channel, so messages are
//! delivered one at a time in submission order. Each job waits for readiness
//! first; a readiness timeout fails that job without consuming a retry.
//! Rate-limited sends are retried with jittered exponential backoff; any
//! other transport error fails the job immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::retry::{exponential_backoff, with_jitter, JITTER_RATIO};
use super::supervisor::ConnectionSupervisor;
use crate::config::GatewayConfig;
use crate::transport::{MessageContent, SendOptions};
use crate::types::{GatewayError, Result};

/// Delivery tuning for one client's queue
#[derive(Debug, Clone)]
pub struct SendPolicy {
    /// Transport calls per message, first attempt included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub response_delay: Duration,
    pub capacity: usize,
}

impl SendPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_attempts: config.send_max_attempts.max(1),
            base_delay: config.send_base_delay,
            response_delay: config.response_delay,
            capacity: config.send_queue_capacity.max(1),
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry` plus jitter
    pub fn retry_delay(&self, retry: u32) -> Duration {
        with_jitter(exponential_backoff(self.base_delay, retry, None), JITTER_RATIO)
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub target: String,
    pub content: MessageContent,
    pub options: SendOptions,
}

struct QueuedSend {
    message: OutboundMessage,
    reply: oneshot::Sender<Result<String>>,
}

/// Handle for submitting messages to a client's worker
#[derive(Clone)]
pub struct SendQueue {
    client_id: String,
    tx: mpsc::Sender<QueuedSend>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl SendQueue {
    /// Spawn the worker and return the submission handle
    pub fn start(supervisor: ConnectionSupervisor, policy: SendPolicy) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(policy.capacity);
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        let queue = Self {
            client_id: supervisor.client_id().to_string(),
            tx,
            pending: Arc::clone(&pending),
            idle: Arc::clone(&idle),
        };
        let worker = tokio::spawn(run_worker(supervisor, policy, rx, pending, idle));
        (queue, worker)
    }

    /// Enqueue a message and wait for its delivery outcome.
    ///
    /// A message counts as pending only once it holds a channel slot, so a
    /// caller dropped while the queue is full leaves the depth untouched.
    pub async fn send(&self, message: OutboundMessage) -> Result<String> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| GatewayError::Shutdown(self.client_id.clone()))?;
        let (reply, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        permit.send(QueuedSend { message, reply });
        rx.await
            .map_err(|_| GatewayError::Shutdown(self.client_id.clone()))?
    }

    /// Messages submitted but not yet resolved
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolve once every submitted message has been resolved
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn release(pending: &AtomicUsize, idle: &Notify) {
    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        idle.notify_waiters();
    }
}

async fn run_worker(
    supervisor: ConnectionSupervisor,
    policy: SendPolicy,
    mut rx: mpsc::Receiver<QueuedSend>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    debug!(client_id = %supervisor.client_id(), "Send worker started");
    while let Some(job) = rx.recv().await {
        if !policy.response_delay.is_zero() {
            tokio::time::sleep(policy.response_delay).await;
        }
        let result = deliver(&supervisor, &policy, &job.message).await;
        let _ = job.reply.send(result);
        release(&pending, &idle);
    }
    debug!(client_id = %supervisor.client_id(), "Send worker stopped");
}

async fn deliver(
    supervisor: &ConnectionSupervisor,
    policy: &SendPolicy,
    message: &OutboundMessage,
) -> Result<String> {
    let client_id = supervisor.client_id();
    let mut attempt = 1u32;
    loop {
        supervisor.wait_for_ready(message.options.ready_timeout).await?;
        let handle = supervisor
            .current_handle()
            .ok_or_else(|| supervisor.not_ready_error(Duration::ZERO))?;

        match handle
            .send(&message.target, &message.content, &message.options)
            .await
        {
            Ok(message_id) => {
                info!(
                    client_id,
                    recipient = %message.target,
                    kind = message.content.kind(),
                    message_id = %message_id,
                    attempt,
                    "Message sent"
                );
                return Ok(message_id);
            }
            Err(e) if e.is_rate_limited() && attempt < policy.max_attempts => {
                let delay = policy.retry_delay(attempt - 1);
                warn!(
                    client_id,
                    recipient = %message.target,
                    attempt,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited; retrying send"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_rate_limited() => {
                warn!(client_id, recipient = %message.target, attempt, "Rate limited; attempts exhausted");
                return Err(GatewayError::RateLimited {
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(client_id, recipient = %message.target, "Send failed: {}", e);
                return Err(GatewayError::Send(e.to_string()));
            }
        }
    }
}
