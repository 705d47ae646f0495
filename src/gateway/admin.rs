//! Operator notifications
//!
//! Messages for the configured admin numbers are held until the primary
//! client is READY, then delivered through its send queue in order.

use std::sync::Mutex;
use tracing::{info, warn};

use super::target::to_chat_id;
use crate::connection::{OutboundMessage, SendQueue};
use crate::transport::{MessageContent, SendOptions};

pub struct AdminNotifier {
    targets: Vec<String>,
    pending: Mutex<Vec<String>>,
}

impl AdminNotifier {
    pub fn new(raw_targets: &[String]) -> Self {
        let targets = raw_targets
            .iter()
            .filter_map(|raw| {
                let chat_id = to_chat_id(raw);
                if chat_id.is_none() {
                    warn!(target_number = %raw, "Ignoring invalid admin number");
                }
                chat_id
            })
            .collect();
        Self {
            targets,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn enqueue(&self, text: String) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(text);
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn take_pending(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Hand every pending notification to `queue`, one message per target
    pub fn flush(&self, client_id: &str, queue: &SendQueue) {
        let messages = self.take_pending();
        if messages.is_empty() || self.targets.is_empty() {
            return;
        }
        info!(
            client_id,
            messages = messages.len(),
            targets = self.targets.len(),
            "Flushing admin notifications"
        );
        let jobs: Vec<OutboundMessage> = messages
            .iter()
            .flat_map(|text| {
                self.targets.iter().map(move |target| OutboundMessage {
                    target: target.clone(),
                    content: MessageContent::Text(text.clone()),
                    options: SendOptions::default(),
                })
            })
            .collect();
        let queue = queue.clone();
        tokio::spawn(async move {
            for job in jobs {
                let target = job.target.clone();
                if let Err(e) = queue.send(job).await {
                    warn!(target_chat = %target, "Admin notification failed: {}", e);
                }
            }
        });
    }
}
