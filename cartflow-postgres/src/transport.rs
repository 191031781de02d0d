//! PostgreSQL Transport
//!
//! Envelopes are appended to per-partition lanes of a topic. Every lane keeps its own offset
//! counter in `cart_lane`; a batch reserves the offsets it needs while holding the lane rows
//! locked, so the offsets of a lane follow commit order and, inside a batch, submission order.
#[cfg(test)]
mod tests;

use crate::Error;
use async_trait::async_trait;
use cartflow::{DeliveredEnvelope, Envelope, HashPartitioner, Header, Partitioner, Transport};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Postgres binds at most 65535 parameters per statement; each message row binds 7.
const INSERT_CHUNK_SIZE: usize = 1000;

/// PostgreSQL transport configuration.
#[derive(Debug, Clone)]
pub struct PgTransportConfig {
    topic: String,
    partitions: u32,
}

impl PgTransportConfig {
    /// Creates a configuration for `topic` with a single partition.
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partitions: 1,
        }
    }

    /// Sets the number of partitions of the topic.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn topic_name(&self) -> &str {
        &self.topic
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }
}

/// PostgreSQL transport implementation.
#[derive(Debug, Clone)]
pub struct PgTransport<P = HashPartitioner> {
    pool: PgPool,
    config: PgTransportConfig,
    partitioner: P,
}

impl PgTransport {
    /// Creates a new `PgTransport` routing keys with the [`HashPartitioner`].
    ///
    /// It initializes the database and creates the lanes of the configured topic.
    pub async fn try_new(pool: PgPool, config: PgTransportConfig) -> Result<Self, Error> {
        Self::with_partitioner(pool, config, HashPartitioner).await
    }
}

impl<P: Partitioner> PgTransport<P> {
    /// Creates a new `PgTransport` routing keys with `partitioner`.
    pub async fn with_partitioner(
        pool: PgPool,
        config: PgTransportConfig,
        partitioner: P,
    ) -> Result<Self, Error> {
        if config.partitions == 0 || i32::try_from(config.partitions).is_err() {
            return Err(Error::InvalidPartitions(config.partitions));
        }
        setup(&pool).await?;
        sqlx::query(include_str!("transport/sql/insert_cart_lanes.sql"))
            .bind(&config.topic)
            .bind(config.partitions as i32)
            .execute(&pool)
            .await?;
        Ok(Self {
            pool,
            config,
            partitioner,
        })
    }

    pub fn config(&self) -> &PgTransportConfig {
        &self.config
    }

    /// Returns the lane `key` is routed to.
    pub fn partition_of(&self, key: &[u8]) -> u32 {
        self.partitioner.partition(key, self.config.partitions)
    }

    /// Reads up to `max` messages of a lane, starting at `from_offset`.
    pub async fn read_lane(
        &self,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<DeliveredEnvelope>, Error> {
        if partition >= self.config.partitions {
            return Err(Error::PartitionOutOfRange {
                partition,
                partitions: self.config.partitions,
            });
        }
        fetch_lane(&self.pool, &self.config.topic, partition, from_offset, max).await
    }

    async fn reserve_offsets(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        partition: u32,
        count: usize,
    ) -> Result<i64, Error> {
        let count = count as i64;
        let next_offset = sqlx::query_scalar::<_, i64>(
            r#"
                UPDATE cart_lane
                SET next_offset = next_offset + $3
                WHERE topic = $1 AND lane = $2
                RETURNING next_offset
                "#,
        )
        .bind(&self.config.topic)
        .bind(partition as i32)
        .bind(count)
        .fetch_one(&mut **tx)
        .await?;
        Ok(next_offset - count)
    }

    async fn insert_messages(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        rows: &[(u32, i64, Envelope)],
    ) -> Result<(), Error> {
        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO cart_message (topic, lane, lane_offset, message_key, payload, header_keys, header_values) ",
            );
            builder.push_values(chunk, |mut row, (partition, offset, envelope)| {
                let (header_keys, header_values): (Vec<String>, Vec<Vec<u8>>) = envelope
                    .headers
                    .iter()
                    .map(|header| (header.key.clone(), header.value.clone()))
                    .unzip();
                row.push_bind(self.config.topic.clone())
                    .push_bind(*partition as i32)
                    .push_bind(*offset)
                    .push_bind(envelope.key.clone())
                    .push_bind(envelope.value.clone())
                    .push_bind(header_keys)
                    .push_bind(header_values);
            });
            builder.build().execute(&mut **tx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Partitioner> Transport for PgTransport<P> {
    type Error = Error;

    #[instrument(skip_all, fields(topic = %self.config.topic, messages = messages.len()))]
    async fn write_messages(&self, messages: Vec<Envelope>) -> Result<(), Self::Error> {
        if messages.is_empty() {
            return Ok(());
        }

        // lanes are locked in ascending order so concurrent batches never deadlock
        let mut lanes: BTreeMap<u32, Vec<Envelope>> = BTreeMap::new();
        for envelope in messages {
            lanes
                .entry(self.partition_of(&envelope.key))
                .or_default()
                .push(envelope);
        }

        let mut tx = self.pool.begin().await?;
        let mut rows = Vec::new();
        for (partition, envelopes) in lanes {
            let first_offset = self
                .reserve_offsets(&mut tx, partition, envelopes.len())
                .await?;
            rows.extend(
                envelopes
                    .into_iter()
                    .enumerate()
                    .map(|(i, envelope)| (partition, first_offset + i as i64, envelope)),
            );
        }
        self.insert_messages(&mut tx, &rows).await?;
        tx.commit().await?;

        debug!(rows = rows.len(), "batch committed");
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    lane: i32,
    lane_offset: i64,
    message_key: Vec<u8>,
    payload: Vec<u8>,
    header_keys: Vec<String>,
    header_values: Vec<Vec<u8>>,
}

impl From<MessageRow> for DeliveredEnvelope {
    fn from(row: MessageRow) -> Self {
        let headers = row
            .header_keys
            .into_iter()
            .zip(row.header_values)
            .map(|(key, value)| Header { key, value })
            .collect();
        DeliveredEnvelope {
            partition: row.lane as u32,
            offset: row.lane_offset as u64,
            envelope: Envelope {
                key: row.message_key,
                value: row.payload,
                headers,
            },
        }
    }
}

pub(crate) async fn fetch_lane(
    pool: &PgPool,
    topic: &str,
    partition: u32,
    from_offset: u64,
    max: usize,
) -> Result<Vec<DeliveredEnvelope>, Error> {
    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
            SELECT lane, lane_offset, message_key, payload, header_keys, header_values
            FROM cart_message
            WHERE topic = $1 AND lane = $2 AND lane_offset >= $3
            ORDER BY lane_offset
            LIMIT $4
            "#,
    )
    .bind(topic)
    .bind(partition as i32)
    .bind(from_offset as i64)
    .bind(max as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(DeliveredEnvelope::from).collect())
}

pub(crate) async fn setup(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(include_str!("transport/sql/table_cart_lane.sql"))
        .execute(pool)
        .await?;
    sqlx::query(include_str!("transport/sql/table_cart_message.sql"))
        .execute(pool)
        .await?;
    Ok(())
}
