use super::{EventSink, VersionSequencer};
use crate::model::{CartUpdateRequest, MutationAction};
use crate::publisher::BatchPublisher;
use crate::transport::Transport;
use async_trait::async_trait;
use cartflow_serde::Serializer;
use std::time::Duration;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered sink configuration
///
/// # Properties:
///
/// * `linger`: how long the first queued mutation may wait for others before the pending
///   batch is published.
/// * `max_batch`: the number of queued mutations that triggers an immediate publish.
/// * `capacity`: the number of mutations the queue holds before pushes wait for room.
#[derive(Debug, Clone)]
pub struct BufferedSinkConfig {
    linger: Duration,
    max_batch: usize,
    capacity: usize,
}

impl BufferedSinkConfig {
    /// Creates a new `BufferedSinkConfig` with the specified linger time.
    pub fn linger(linger: Duration) -> Self {
        Self {
            linger,
            max_batch: 100,
            capacity: 1024,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn linger_time(&self) -> Duration {
        self.linger
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The buffered sink worker has stopped and no longer accepts mutations.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("buffered sink worker is closed")]
pub struct SinkClosed;

/// Queues pushed mutations for a background worker that publishes them in batches.
///
/// The queue keeps push order, so mutations of a user pushed one after the other are
/// published with increasing versions, in the same batch or in successive ones. A failed
/// publish is logged and its mutations are dropped.
#[derive(Debug, Clone)]
pub struct BufferedSink {
    sender: mpsc::Sender<(String, MutationAction)>,
}

impl BufferedSink {
    /// Spawns the worker on the current Tokio runtime.
    ///
    /// The worker stops when `shutdown` is cancelled or when every clone of the sink has been
    /// dropped, after publishing what is still queued. Outside of a Tokio runtime nothing is
    /// spawned and an error is returned.
    pub fn spawn<T, S>(
        publisher: BatchPublisher<T, S>,
        versions: VersionSequencer,
        config: BufferedSinkConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), TryCurrentError>
    where
        T: Transport + 'static,
        S: Serializer<CartUpdateRequest> + Send + Sync + 'static,
    {
        let runtime = Handle::try_current()?;
        let (sender, receiver) = mpsc::channel(config.capacity);
        let worker = Worker {
            publisher,
            versions,
            config,
            receiver,
            pending: vec![],
        };
        let handle = runtime.spawn(worker.run(shutdown));
        Ok((Self { sender }, handle))
    }
}

#[async_trait]
impl EventSink for BufferedSink {
    type Error = SinkClosed;

    async fn push_cart_sync(
        &self,
        cart_id: String,
        action: MutationAction,
    ) -> Result<(), Self::Error> {
        self.sender
            .send((cart_id, action))
            .await
            .map_err(|_| SinkClosed)
    }
}

struct Worker<T, S> {
    publisher: BatchPublisher<T, S>,
    versions: VersionSequencer,
    config: BufferedSinkConfig,
    receiver: mpsc::Receiver<(String, MutationAction)>,
    pending: Vec<(String, MutationAction)>,
}

impl<T, S> Worker<T, S>
where
    T: Transport,
    S: Serializer<CartUpdateRequest> + Send + Sync,
{
    async fn run(mut self, shutdown: CancellationToken) {
        let mut flush_at: Option<Instant> = None;
        loop {
            let linger = async move {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.receiver.recv() => match received {
                    Some(mutation) => {
                        self.pending.push(mutation);
                        if self.pending.len() >= self.config.max_batch {
                            self.flush().await;
                            flush_at = None;
                        } else if flush_at.is_none() {
                            flush_at = Some(Instant::now() + self.config.linger);
                        }
                    }
                    None => break,
                },
                _ = linger => {
                    self.flush().await;
                    flush_at = None;
                }
            }
        }

        self.receiver.close();
        while let Some(mutation) = self.receiver.recv().await {
            self.pending.push(mutation);
            if self.pending.len() >= self.config.max_batch {
                self.flush().await;
            }
        }
        self.flush().await;
        debug!("buffered sink worker stopped");
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let requests: Vec<CartUpdateRequest> = self
            .pending
            .drain(..)
            .map(|(cart_id, action)| self.versions.request(cart_id, action))
            .collect();
        if let Err(err) = self.publisher.publish_batch(&requests).await {
            warn!(
                error = %err,
                batch_size = requests.len(),
                "failed to publish buffered cart updates"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use assert2::check;
    use cartflow_serde::serde::json::Json;
    use cartflow_serde::Deserializer;

    fn versions_of(transport: &InMemoryTransport, user: &str) -> Vec<u64> {
        let json = Json::<CartUpdateRequest>::default();
        transport
            .messages()
            .iter()
            .filter(|m| m.envelope.key == user.as_bytes())
            .map(|m| json.deserialize(&m.envelope.value).unwrap().version_number)
            .collect()
    }

    #[tokio::test]
    async fn it_publishes_a_full_batch_in_one_write() {
        let transport = InMemoryTransport::new(2);
        let (sink, worker) = BufferedSink::spawn(
            BatchPublisher::new(transport.clone(), Json::default()),
            VersionSequencer::new(),
            BufferedSinkConfig::linger(Duration::from_secs(3600)).with_max_batch(3),
            CancellationToken::new(),
        )
        .unwrap();

        for product in ["P001", "P002", "P003"] {
            sink.push_cart_sync("user_1".to_string(), MutationAction::new(product, 1))
                .await
                .unwrap();
        }
        drop(sink);
        worker.await.unwrap();

        check!(transport.write_calls() == 1);
        check!(versions_of(&transport, "user_1") == vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn it_publishes_pending_mutations_after_the_linger_time() {
        let transport = InMemoryTransport::new(2);
        let (sink, _worker) = BufferedSink::spawn(
            BatchPublisher::new(transport.clone(), Json::default()),
            VersionSequencer::new(),
            BufferedSinkConfig::linger(Duration::from_millis(50)),
            CancellationToken::new(),
        )
        .unwrap();

        sink.push_cart_sync("user_1".to_string(), MutationAction::new("P001", 1))
            .await
            .unwrap();
        sink.push_cart_sync("user_2".to_string(), MutationAction::new("P001", 2))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        check!(transport.write_calls() == 0);

        tokio::time::sleep(Duration::from_millis(100)).await;

        check!(transport.write_calls() == 1);
        check!(versions_of(&transport, "user_1") == vec![1]);
        check!(versions_of(&transport, "user_2") == vec![1]);
    }

    #[tokio::test]
    async fn it_flushes_queued_mutations_on_shutdown() {
        let transport = InMemoryTransport::new(2);
        let shutdown = CancellationToken::new();
        let (sink, worker) = BufferedSink::spawn(
            BatchPublisher::new(transport.clone(), Json::default()),
            VersionSequencer::seeded([("user_1", 4)]),
            BufferedSinkConfig::linger(Duration::from_secs(3600)),
            shutdown.clone(),
        )
        .unwrap();

        sink.push_cart_sync("user_1".to_string(), MutationAction::new("P001", 1))
            .await
            .unwrap();
        shutdown.cancel();
        worker.await.unwrap();

        check!(versions_of(&transport, "user_1") == vec![5]);
        check!(
            sink.push_cart_sync("user_1".to_string(), MutationAction::new("P001", 1))
                .await
                == Err(SinkClosed)
        );
    }

    #[test]
    fn it_does_not_spawn_without_a_runtime() {
        let transport = InMemoryTransport::new(2);

        let result = BufferedSink::spawn(
            BatchPublisher::new(transport.clone(), Json::default()),
            VersionSequencer::new(),
            BufferedSinkConfig::linger(Duration::from_millis(50)),
            CancellationToken::new(),
        );

        check!(result.is_err());
        check!(transport.write_calls() == 0);
    }
}
