//! Event sink receives the mutations accepted by the coordinator.
//!
//! The coordinator calls [`EventSink::push_cart_sync`] on a detached task and never observes
//! its result: retries, delivery guarantees and failure reporting belong to the sink. Two
//! variants are provided:
//!
//! * [`DirectSink`] publishes every pushed mutation immediately, as a one-request batch.
//! * [`BufferedSink`] queues pushed mutations and lets a background worker publish them in
//!   batches.
//!
//! Both turn a mutation into a one-entry [`CartUpdateRequest`] whose version is drawn from a
//! [`VersionSequencer`].
mod buffered;

pub use buffered::{BufferedSink, BufferedSinkConfig, SinkClosed};

use crate::model::{CartUpdateRequest, MutationAction};
use crate::publisher::{BatchPublisher, Error as PublishError};
use crate::transport::Transport;
use async_trait::async_trait;
use cartflow_serde::Serializer;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Receives accepted cart mutations for propagation.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    type Error: StdError + Send + Sync + 'static;

    /// Propagates a mutation of `cart_id` downstream.
    async fn push_cart_sync(
        &self,
        cart_id: String,
        action: MutationAction,
    ) -> Result<(), Self::Error>;
}

/// Hands out per-user version numbers.
///
/// Versions of a user start right after the seeded value (1 for an unknown user) and grow by
/// one at every call. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct VersionSequencer {
    last: Arc<Mutex<HashMap<String, u64>>>,
}

impl VersionSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sequencer that continues from the given last applied versions.
    pub fn seeded<I, S>(versions: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            last: Arc::new(Mutex::new(
                versions.into_iter().map(|(u, v)| (u.into(), v)).collect(),
            )),
        }
    }

    /// Reserves the next version of `user_id`.
    pub fn next(&self, user_id: &str) -> u64 {
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let version = last.entry(user_id.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    fn request(&self, cart_id: String, action: MutationAction) -> CartUpdateRequest {
        let version = self.next(&cart_id);
        CartUpdateRequest::new(cart_id, version).with_entry(action)
    }
}

/// Publishes every pushed mutation as its own batch.
///
/// Version assignment and the publish that follows happen under one lock shared by clones, so
/// concurrent pushes reach the transport in version order.
#[derive(Debug, Clone)]
pub struct DirectSink<T, S> {
    publisher: BatchPublisher<T, S>,
    versions: VersionSequencer,
    publishing: Arc<AsyncMutex<()>>,
}

impl<T, S> DirectSink<T, S>
where
    T: Transport,
    S: Serializer<CartUpdateRequest> + Send + Sync,
{
    pub fn new(publisher: BatchPublisher<T, S>, versions: VersionSequencer) -> Self {
        Self {
            publisher,
            versions,
            publishing: Arc::new(AsyncMutex::new(())),
        }
    }
}

#[async_trait]
impl<T, S> EventSink for DirectSink<T, S>
where
    T: Transport + 'static,
    S: Serializer<CartUpdateRequest> + Send + Sync + 'static,
{
    type Error = PublishError<T::Error>;

    async fn push_cart_sync(
        &self,
        cart_id: String,
        action: MutationAction,
    ) -> Result<(), Self::Error> {
        let _publishing = self.publishing.lock().await;
        let request = self.versions.request(cart_id, action);
        self.publisher.publish_batch(&[request]).await
    }
}
