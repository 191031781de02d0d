use thiserror::Error;

/// Represents all the ways a method can fail within Cartflow Postgres.
#[derive(Error, Debug)]
pub enum Error {
    /// Error returned from the database.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// The topic was configured with an unusable number of partitions.
    #[error("a topic needs between 1 and {max} partitions, got {0}", max = i32::MAX)]
    InvalidPartitions(u32),
    /// A message addressed a partition the topic does not have.
    #[error("partition {partition} is out of range for a topic of {partitions} partitions")]
    PartitionOutOfRange { partition: u32, partitions: u32 },
    /// A lane polling task panicked or was cancelled.
    #[cfg(feature = "listener")]
    #[error(transparent)]
    Listener(#[from] tokio::task::JoinError),
}
