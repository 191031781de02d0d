//! Consumer side of the cart update stream.
//!
//! A consumer receives [`DeliveredEnvelope`]s lane by lane, turns them back into
//! [`CartUpdateRequest`]s with [`decode_cart_update`] and applies them in version order,
//! which a [`VersionGate`] enforces per user.
use crate::envelope::{DeliveredEnvelope, Envelope};
use crate::model::CartUpdateRequest;
use async_trait::async_trait;
use cartflow_serde::Deserializer;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};

/// Represents a listener of a cart update topic.
#[async_trait]
pub trait EnvelopeListener: Send + Sync {
    /// The type of error that may occur while handling an envelope.
    type Error: Display + Send + Sync;

    /// Returns the unique identifier of the listener.
    ///
    /// Delivery progress is tracked per listener id and partition.
    fn id(&self) -> &'static str;

    /// Handles a delivered envelope.
    ///
    /// Returning an error stops the lane at this envelope; it is delivered again later.
    async fn handle(&self, envelope: DeliveredEnvelope) -> Result<(), Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum ConsumeError {
    #[error("unexpected type id {found:?}, expected {expected}")]
    UnexpectedType {
        expected: String,
        found: Option<String>,
    },
    #[error(transparent)]
    Decode(#[from] cartflow_serde::Error),
    #[error("envelope key {key:?} does not match user id {user_id}")]
    KeyMismatch { key: String, user_id: String },
}

/// Decodes the value of `envelope` into a [`CartUpdateRequest`].
///
/// The type discriminator header must equal `expected_type_id` and the envelope key must be
/// the request's user id.
pub fn decode_cart_update<D>(
    envelope: &Envelope,
    deserializer: &D,
    expected_type_id: &str,
) -> Result<CartUpdateRequest, ConsumeError>
where
    D: Deserializer<CartUpdateRequest>,
{
    let found = envelope.type_id();
    if found != Some(expected_type_id) {
        return Err(ConsumeError::UnexpectedType {
            expected: expected_type_id.to_string(),
            found: found.map(str::to_string),
        });
    }

    let request = deserializer.deserialize(&envelope.value)?;
    if envelope.key != request.partition_key() {
        return Err(ConsumeError::KeyMismatch {
            key: String::from_utf8_lossy(&envelope.key).into_owned(),
            user_id: request.user_id,
        });
    }
    Ok(request)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Cart update request version ({requested}) must be one unit ahead the current version ({current})"
)]
pub struct VersionError {
    pub user_id: String,
    pub requested: u64,
    pub current: u64,
}

impl VersionError {
    /// Returns true when the request was already applied, as happens on redelivery.
    pub fn is_duplicate(&self) -> bool {
        self.requested <= self.current
    }
}

/// Tracks the last applied cart version per user.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct VersionGate {
    current: Arc<Mutex<HashMap<String, u64>>>,
}

impl VersionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last applied version of `user_id`, 0 when none was applied.
    pub fn current(&self, user_id: &str) -> u64 {
        self.lock().get(user_id).copied().unwrap_or_default()
    }

    /// Checks that `request` is the next version for its user.
    pub fn check(&self, request: &CartUpdateRequest) -> Result<(), VersionError> {
        let current = self.current(&request.user_id);
        if request.version_number != current + 1 {
            return Err(VersionError {
                user_id: request.user_id.clone(),
                requested: request.version_number,
                current,
            });
        }
        Ok(())
    }

    /// Records `request` as applied.
    pub fn advance(&self, request: &CartUpdateRequest) {
        let mut current = self.lock();
        let version = current.entry(request.user_id.clone()).or_default();
        *version = (*version).max(request.version_number);
    }

    /// Checks `request` and records it in one step.
    pub fn admit(&self, request: &CartUpdateRequest) -> Result<(), VersionError> {
        let mut current = self.lock();
        let version = current.entry(request.user_id.clone()).or_default();
        if request.version_number != *version + 1 {
            return Err(VersionError {
                user_id: request.user_id.clone(),
                requested: request.version_number,
                current: *version,
            });
        }
        *version = request.version_number;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
