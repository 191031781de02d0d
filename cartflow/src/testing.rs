//! Test doubles for code built on top of the coordinator.
//!
//! [`RecordingSink`] records every mutation pushed to it and lets a test wait until the
//! detached dispatch tasks have reached it.
use crate::model::MutationAction;
use crate::sink::EventSink;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// The error returned by a failing [`RecordingSink`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SinkFailure(pub String);

#[derive(Debug, Default)]
struct Recorded {
    pushes: Vec<(String, MutationAction)>,
    running: usize,
    max_concurrent: usize,
    completed: usize,
}

/// An [`EventSink`] that records pushed mutations.
///
/// Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    recorded: Arc<Mutex<Recorded>>,
    changed: Arc<Notify>,
    failure: Option<SinkFailure>,
    gate: Option<Arc<Notify>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that records pushes and then fails them with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(SinkFailure(message.into())),
            ..Self::default()
        }
    }

    /// Makes every push wait for a notification on `gate` before completing.
    pub fn blocked_on(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Returns the pushes received so far, in arrival order.
    pub fn pushes(&self) -> Vec<(String, MutationAction)> {
        self.lock().pushes.clone()
    }

    /// Returns the number of pushes that have completed.
    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    /// Returns the highest number of pushes observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    /// Waits until at least `count` pushes have been received.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |r| r.pushes.len() >= count).await
    }

    /// Waits until at least `count` pushes have completed.
    pub async fn wait_for_completed(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |r| r.completed >= count).await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn(&Recorded) -> bool) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.changed.notified();
                if done(&self.lock()) {
                    return;
                }
                changed.await;
            }
        })
        .await
        .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    type Error = SinkFailure;

    async fn push_cart_sync(
        &self,
        cart_id: String,
        action: MutationAction,
    ) -> Result<(), Self::Error> {
        {
            let mut recorded = self.lock();
            recorded.pushes.push((cart_id, action));
            recorded.running += 1;
            recorded.max_concurrent = recorded.max_concurrent.max(recorded.running);
        }
        self.changed.notify_waiters();

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        {
            let mut recorded = self.lock();
            recorded.running -= 1;
            recorded.completed += 1;
        }
        self.changed.notify_waiters();

        match &self.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}
