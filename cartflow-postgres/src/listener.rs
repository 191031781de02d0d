//! PostgreSQL Lane Listener
//!
//! This module delivers the envelopes stored by the `PgTransport` to `EnvelopeListener`s.
//! Each registered listener polls every lane of the topic independently and keeps its own
//! position per lane, so the envelopes of a lane reach it in offset order.
//! Delivery is at least once: an envelope whose handling fails stops the lane and is
//! delivered again on the next poll, so listeners should tolerate duplicates.

use crate::transport::fetch_lane;
use crate::Error;
use async_trait::async_trait;
use cartflow::EnvelopeListener;
use futures::future::join_all;
use futures::{try_join, Future};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// PostgreSQL lane listener implementation.
pub struct PgLaneListener {
    pool: PgPool,
    topic: String,
    partitions: u32,
    executors: Vec<Arc<dyn LaneExecutor + Sync + Send>>,
    shutdown_token: CancellationToken,
}

impl PgLaneListener {
    /// Creates a new `PgLaneListener` for the `partitions` lanes of `topic`.
    pub fn builder(pool: PgPool, topic: impl Into<String>, partitions: u32) -> Self {
        Self {
            pool,
            topic: topic.into(),
            partitions,
            executors: vec![],
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Registers a listener on every lane of the topic.
    pub fn register_listener(
        mut self,
        listener: impl EnvelopeListener + 'static,
        config: PgLaneListenerConfig,
    ) -> Self {
        let listener = Arc::new(listener);
        for lane in 0..self.partitions {
            self.executors.push(Arc::new(PgLaneExecutor {
                pool: self.pool.clone(),
                topic: self.topic.clone(),
                lane,
                listener: listener.clone(),
                config: config.clone(),
            }));
        }
        self
    }

    /// Starts polling the lanes for all registered listeners.
    ///
    /// It returns when the listener is shut down, or with the first error a polling task
    /// stopped on.
    pub async fn start(self) -> Result<(), Error> {
        crate::setup(&self.pool).await?;
        let mut handles = vec![];
        for executor in self.executors {
            executor.init().await?;
            let shutdown = self.shutdown_token.clone();
            let handle = tokio::spawn(async move {
                let mut poll = tokio::time::interval(executor.config().poll());
                poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = poll.tick() => {
                            if let Err(err) = executor.execute().await {
                                warn!(
                                    listener = executor.listener_id(),
                                    lane = executor.lane(),
                                    error = %err,
                                    "lane polling stopped"
                                );
                                return Err(err);
                            }
                        }
                        _ = shutdown.cancelled() => return Ok::<(), Error>(()),
                    };
                }
            });
            handles.push(handle);
        }
        for outcome in join_all(handles).await {
            outcome??;
        }
        Ok(())
    }

    /// Starts the listener with a shutdown signal.
    pub async fn start_with_shutdown<F: Future<Output = ()> + Send + 'static>(
        self,
        shutdown: F,
    ) -> Result<(), Error> {
        let shutdown_token = self.shutdown_token.clone();
        let shutdown_handle = async move {
            shutdown.await;
            shutdown_token.cancel();
            Ok::<(), Error>(())
        };
        try_join!(self.start(), shutdown_handle).map(|_| ())
    }
}

/// PostgreSQL lane listener configuration
///
/// # Properties:
///
/// * `poll`: how often each lane is polled for new envelopes.
/// * `batch_size`: the maximum number of envelopes handled per lane and poll.
#[derive(Debug, Clone)]
pub struct PgLaneListenerConfig {
    poll: Duration,
    batch_size: usize,
}

impl PgLaneListenerConfig {
    /// Creates a new `PgLaneListenerConfig` with the specified poll interval.
    pub fn poller(poll: Duration) -> Self {
        Self {
            poll,
            batch_size: 100,
        }
    }

    /// Sets the batch size for processing envelopes in the listener.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn poll(&self) -> Duration {
        self.poll
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[async_trait]
trait LaneExecutor {
    fn config(&self) -> &PgLaneListenerConfig;
    fn listener_id(&self) -> &str;
    fn lane(&self) -> u32;
    async fn init(&self) -> Result<(), Error>;
    async fn execute(&self) -> Result<(), Error>;
}

/// The lane position reached when handling stopped early.
#[derive(Debug)]
struct LaneStopped {
    next_offset: i64,
}

struct PgLaneExecutor<L: EnvelopeListener> {
    pool: PgPool,
    topic: String,
    lane: u32,
    listener: Arc<L>,
    config: PgLaneListenerConfig,
}

impl<L: EnvelopeListener> PgLaneExecutor<L> {
    async fn lock_lane(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
                SELECT next_offset
                FROM cart_lane_consumer
                WHERE listener_id = $1 AND topic = $2 AND lane = $3
                FOR UPDATE SKIP LOCKED
                "#,
        )
        .bind(self.listener.id())
        .bind(&self.topic)
        .bind(self.lane as i32)
        .fetch_optional(&mut **tx)
        .await
    }

    async fn release_lane(
        &self,
        result: Result<i64, LaneStopped>,
        mut tx: Transaction<'_, Postgres>,
    ) -> Result<(), sqlx::Error> {
        let next_offset = match result {
            Ok(next_offset) => next_offset,
            Err(LaneStopped { next_offset }) => next_offset,
        };
        sqlx::query(
            r#"
                UPDATE cart_lane_consumer
                SET next_offset = $1, updated_at = now()
                WHERE listener_id = $2 AND topic = $3 AND lane = $4
                "#,
        )
        .bind(next_offset)
        .bind(self.listener.id())
        .bind(&self.topic)
        .bind(self.lane as i32)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    async fn handle_envelopes_from(&self, mut next_offset: i64) -> Result<i64, LaneStopped> {
        let envelopes = fetch_lane(
            &self.pool,
            &self.topic,
            self.lane,
            next_offset as u64,
            self.config.batch_size,
        )
        .await
        .map_err(|err| {
            warn!(lane = self.lane, error = %err, "unable to read lane");
            LaneStopped { next_offset }
        })?;

        for delivered in envelopes {
            let offset = delivered.offset as i64;
            match self.listener.handle(delivered).await {
                Ok(()) => next_offset = offset + 1,
                Err(err) => {
                    warn!(
                        listener = self.listener.id(),
                        lane = self.lane,
                        offset,
                        error = %err,
                        "envelope handling failed, lane stopped"
                    );
                    return Err(LaneStopped { next_offset });
                }
            }
        }
        Ok(next_offset)
    }

    async fn try_execute(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let Some(next_offset) = self.lock_lane(&mut tx).await? else {
            return Ok(());
        };
        let result = self.handle_envelopes_from(next_offset).await;
        if let Ok(reached) = result {
            if reached > next_offset {
                debug!(
                    listener = self.listener.id(),
                    lane = self.lane,
                    reached,
                    "lane advanced"
                );
            }
        }
        self.release_lane(result, tx).await
    }
}

#[async_trait]
impl<L: EnvelopeListener> LaneExecutor for PgLaneExecutor<L> {
    fn config(&self) -> &PgLaneListenerConfig {
        &self.config
    }

    fn listener_id(&self) -> &str {
        self.listener.id()
    }

    fn lane(&self) -> u32 {
        self.lane
    }

    async fn init(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
                INSERT INTO cart_lane_consumer (listener_id, topic, lane, next_offset)
                VALUES ($1, $2, $3, 0)
                ON CONFLICT (listener_id, topic, lane) DO NOTHING
                "#,
        )
        .bind(self.listener.id())
        .bind(&self.topic)
        .bind(self.lane as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn execute(&self) -> Result<(), Error> {
        match self.try_execute().await {
            Err(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut) | Ok(()) => Ok(()),
            Err(err) => Err(Error::Database(err)),
        }
    }
}

pub(crate) async fn setup(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(include_str!("listener/sql/table_cart_lane_consumer.sql"))
        .execute(pool)
        .await?;
    Ok(())
}
