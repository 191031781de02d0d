//! Transport is the delivery mechanism between the publisher and the consumers.
//!
//! A transport accepts batches of [`Envelope`]s and routes every envelope to an ordered lane
//! (a partition) chosen from its key. Implementations must keep the submission order of
//! envelopes sharing a lane, and must accept or refuse a batch as a whole: there is no partial
//! success.
//!
//! [`InMemoryTransport`] is an in-process partitioned log, useful for tests and for running the
//! pipeline in a single process. Other backends, such as the PostgreSQL one, live in their own
//! crates.
use crate::envelope::{DeliveredEnvelope, Envelope};
use async_trait::async_trait;
use md5::{Digest, Md5};
use std::convert::Infallible;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, MutexGuard};

/// A partitioned, ordered message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    /// Writes a batch of envelopes.
    ///
    /// # Arguments
    ///
    /// * `messages` - The envelopes to write, in submission order.
    ///
    /// # Returns
    ///
    /// `Ok(())` if every envelope has been handed to the transport, an error otherwise. On
    /// error, the caller must assume none of the envelopes has been delivered and decide
    /// whether to resend the whole batch.
    async fn write_messages(&self, messages: Vec<Envelope>) -> Result<(), Self::Error>;
}

/// Maps a message key to one of a fixed number of lanes.
pub trait Partitioner: Send + Sync {
    /// Returns the lane of `key`, in `0..partitions`.
    fn partition(&self, key: &[u8], partitions: u32) -> u32;
}

/// Routes keys by the first four bytes of their MD5 digest.
///
/// The mapping only depends on the key bytes and the number of partitions, so every producer
/// routes the same user to the same lane.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn partition(&self, key: &[u8], partitions: u32) -> u32 {
        let digest = Md5::digest(key);
        let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        hash % partitions.max(1)
    }
}

#[derive(Debug, Default)]
struct Log {
    lanes: Vec<Vec<Envelope>>,
    positions: Vec<(u32, u64)>,
    write_calls: usize,
}

/// In-process partitioned log.
///
/// Cloning the transport yields a handle to the same log.
#[derive(Debug, Clone)]
pub struct InMemoryTransport<P = HashPartitioner> {
    log: Arc<Mutex<Log>>,
    partitioner: P,
    partitions: u32,
}

impl InMemoryTransport {
    /// Creates an empty log with `partitions` lanes, routed by [`HashPartitioner`].
    pub fn new(partitions: u32) -> Self {
        Self::with_partitioner(HashPartitioner, partitions)
    }
}

impl<P: Partitioner> InMemoryTransport<P> {
    /// Creates an empty log with `partitions` lanes, routed by `partitioner`.
    pub fn with_partitioner(partitioner: P, partitions: u32) -> Self {
        let partitions = partitions.max(1);
        Self {
            log: Arc::new(Mutex::new(Log {
                lanes: vec![vec![]; partitions as usize],
                ..Default::default()
            })),
            partitioner,
            partitions,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Returns the lane `key` is routed to.
    pub fn partition_of(&self, key: &[u8]) -> u32 {
        self.partitioner.partition(key, self.partitions)
    }

    /// Returns the number of `write_messages` calls that reached the log.
    pub fn write_calls(&self) -> usize {
        self.lock().write_calls
    }

    /// Returns every envelope in the order it was written.
    pub fn messages(&self) -> Vec<DeliveredEnvelope> {
        let log = self.lock();
        log.positions
            .iter()
            .map(|&(partition, offset)| DeliveredEnvelope {
                partition,
                offset,
                envelope: log.lanes[partition as usize][offset as usize].clone(),
            })
            .collect()
    }

    /// Returns every envelope of one lane, in lane order.
    pub fn partition(&self, partition: u32) -> Vec<DeliveredEnvelope> {
        self.read(partition, 0, usize::MAX)
    }

    /// Reads up to `max` envelopes of a lane, starting at `from_offset`.
    pub fn read(&self, partition: u32, from_offset: u64, max: usize) -> Vec<DeliveredEnvelope> {
        let log = self.lock();
        let Some(lane) = log.lanes.get(partition as usize) else {
            return vec![];
        };
        lane.iter()
            .enumerate()
            .skip(from_offset as usize)
            .take(max)
            .map(|(offset, envelope)| DeliveredEnvelope {
                partition,
                offset: offset as u64,
                envelope: envelope.clone(),
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<P: Partitioner> Transport for InMemoryTransport<P> {
    type Error = Infallible;

    async fn write_messages(&self, messages: Vec<Envelope>) -> Result<(), Self::Error> {
        let mut log = self.lock();
        log.write_calls += 1;
        for envelope in messages {
            let partition = self.partitioner.partition(&envelope.key, self.partitions);
            let lane = &mut log.lanes[partition as usize];
            lane.push(envelope);
            let offset = (lane.len() - 1) as u64;
            log.positions.push((partition, offset));
        }
        Ok(())
    }
}
