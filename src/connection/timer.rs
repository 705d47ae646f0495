//! Cancellable delayed tasks

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// A task that fires once after a delay.
///
/// Dropping or cancelling the handle before the delay elapses prevents the
/// work from running. Once fired, the work runs on its own task and is no
/// longer affected by the handle.
#[derive(Debug)]
pub struct ScheduledTask {
    label: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn after<F>(delay: Duration, label: &'static str, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(timer = label, "Timer fired");
            tokio::spawn(work);
        });
        Self { label, handle }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn has_fired(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
