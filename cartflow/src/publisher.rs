//! Batch publisher turns ordered cart update requests into keyed envelopes.
//!
//! A batch is prepared entirely in memory before anything is written: requests are checked,
//! serialized and wrapped in envelopes keyed by user id. Only when every request of the batch
//! has been encoded is the batch handed to the transport, in a single call. A request that
//! cannot be encoded therefore never leaves a later version of the same user on the stream
//! without its predecessor.
use crate::envelope::{Envelope, DEFAULT_TYPE_ID, TYPE_ID_HEADER};
use crate::model::CartUpdateRequest;
use crate::transport::Transport;
use cartflow_serde::Serializer;
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Represents all the ways a batch publish can fail.
///
/// Every variant is fatal to the call. Apart from `Transport`, they are detected before any
/// I/O takes place.
#[derive(thiserror::Error, Debug)]
pub enum Error<TE> {
    /// A request is missing its user id or carries version zero.
    #[error("malformed request at position {index}: {reason}")]
    Malformed { index: usize, reason: &'static str },
    /// Requests of the same user are not in non-decreasing version order.
    #[error(
        "request for user {user_id} with version {version_number} follows version {previous} in the same batch"
    )]
    VersionOrder {
        user_id: String,
        previous: u64,
        version_number: u64,
    },
    /// A request could not be encoded.
    #[error("unable to serialize request for user {user_id} version {version_number}: {source}")]
    Serialization {
        user_id: String,
        version_number: u64,
        #[source]
        source: cartflow_serde::Error,
    },
    /// The transport refused the batch or could not be reached.
    #[error("transport error: {0}")]
    Transport(#[source] TE),
}

/// Batch publisher configuration
///
/// # Properties:
///
/// * `type_id`: the value of the type discriminator header attached to every envelope.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    type_id: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            type_id: DEFAULT_TYPE_ID.to_string(),
        }
    }
}

impl PublisherConfig {
    /// Sets the type discriminator attached to every envelope.
    pub fn with_type_id(mut self, type_id: impl Into<String>) -> Self {
        self.type_id = type_id.into();
        self
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }
}

/// Publishes batches of [`CartUpdateRequest`]s to a [`Transport`].
///
/// The publisher keeps no state between calls: each call is a self-contained batch, and it
/// neither retries nor deduplicates. Publishing the same batch twice writes it twice.
#[derive(Debug, Clone)]
pub struct BatchPublisher<T, S> {
    transport: T,
    serializer: S,
    config: PublisherConfig,
}

impl<T, S> BatchPublisher<T, S>
where
    T: Transport,
    S: Serializer<CartUpdateRequest> + Send + Sync,
{
    /// Creates a new publisher writing to `transport` with the default configuration.
    pub fn new(transport: T, serializer: S) -> Self {
        Self::with_config(transport, serializer, PublisherConfig::default())
    }

    pub fn with_config(transport: T, serializer: S, config: PublisherConfig) -> Self {
        Self {
            transport,
            serializer,
            config,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publishes a batch of requests.
    ///
    /// # Arguments
    ///
    /// * `requests` - The requests to publish. Requests of the same user must appear in
    ///   non-decreasing version order; the batch is written in the given order.
    ///
    /// # Returns
    ///
    /// `Ok(())` once the transport has accepted the whole batch. Any error means the batch
    /// has not been delivered, and the caller may resend it verbatim.
    #[instrument(skip_all, fields(batch_size = requests.len()))]
    pub async fn publish_batch(&self, requests: &[CartUpdateRequest]) -> Result<(), Error<T::Error>> {
        if requests.is_empty() {
            debug!("empty batch, nothing to publish");
            return Ok(());
        }
        let envelopes = self.prepare(requests)?;
        self.transport
            .write_messages(envelopes)
            .await
            .map_err(Error::Transport)?;
        debug!("batch published");
        Ok(())
    }

    fn prepare(&self, requests: &[CartUpdateRequest]) -> Result<Vec<Envelope>, Error<T::Error>> {
        check_batch(requests)?;
        requests
            .iter()
            .map(|request| self.envelope(request))
            .collect()
    }

    fn envelope(&self, request: &CartUpdateRequest) -> Result<Envelope, Error<T::Error>> {
        let value =
            self.serializer
                .serialize(request)
                .map_err(|source| Error::Serialization {
                    user_id: request.user_id.clone(),
                    version_number: request.version_number,
                    source,
                })?;
        Ok(Envelope::new(request.partition_key(), value)
            .with_header(TYPE_ID_HEADER, self.config.type_id.as_bytes()))
    }
}

fn check_batch<TE>(requests: &[CartUpdateRequest]) -> Result<(), Error<TE>> {
    let mut last_versions: HashMap<&str, u64> = HashMap::new();
    for (index, request) in requests.iter().enumerate() {
        if request.user_id.is_empty() {
            return Err(Error::Malformed {
                index,
                reason: "user id must not be empty",
            });
        }
        if request.version_number == 0 {
            return Err(Error::Malformed {
                index,
                reason: "version number must be positive",
            });
        }
        if let Some(previous) = last_versions.insert(&request.user_id, request.version_number) {
            if request.version_number < previous {
                return Err(Error::VersionOrder {
                    user_id: request.user_id.clone(),
                    previous,
                    version_number: request.version_number,
                });
            }
        }
    }
    Ok(())
}
