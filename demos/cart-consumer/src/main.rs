use anyhow::{Context, Result};
use async_trait::async_trait;
use cartflow::serde::json::Json;
use cartflow::{
    decode_cart_update, CartUpdateRequest, ConsumeError, DeliveredEnvelope, EntryOutcome,
    EnvelopeListener, VersionGate, DEFAULT_TYPE_ID,
};
use cartflow_postgres::{PgLaneListener, PgLaneListenerConfig};
use sqlx::{postgres::PgConnectOptions, PgPool};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("CARTFLOW_LOG_FORMAT").as_deref() == Ok("json") {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[derive(thiserror::Error, Debug)]
enum CartLogError {
    #[error(transparent)]
    Consume(#[from] ConsumeError),
}

/// Logs every cart update it is able to apply in version order.
struct CartLog {
    deserializer: Json<CartUpdateRequest>,
    versions: VersionGate,
}

#[async_trait]
impl EnvelopeListener for CartLog {
    type Error = CartLogError;

    fn id(&self) -> &'static str {
        "cart-log"
    }

    async fn handle(&self, delivered: DeliveredEnvelope) -> Result<(), Self::Error> {
        let decoded = decode_cart_update(&delivered.envelope, &self.deserializer, DEFAULT_TYPE_ID);
        let request = match decoded {
            Ok(request) => request,
            // envelopes of other schemas share the topic
            Err(ConsumeError::UnexpectedType { found, .. }) => {
                info!(
                    partition = delivered.partition,
                    offset = delivered.offset,
                    type_id = ?found,
                    "skipped"
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self.versions.admit(&request) {
            if err.is_duplicate() {
                info!(
                    user_id = %request.user_id,
                    version = request.version_number,
                    "duplicate delivery"
                );
            } else {
                warn!(error = %err, user_id = %request.user_id, "out of order update");
            }
            return Ok(());
        }

        for entry in &request.entries {
            match entry.outcome() {
                EntryOutcome::Apply => info!(
                    user_id = %request.user_id,
                    version = request.version_number,
                    product_id = %entry.product_id,
                    qty = entry.qty_adjustment,
                    "applied"
                ),
                EntryOutcome::NoOp => {}
                EntryOutcome::Unsupported(action) => {
                    warn!(user_id = %request.user_id, %action, "unsupported action")
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let topic = std::env::var("CARTFLOW_TOPIC").unwrap_or_else(|_| "cart-update-request".into());
    let partitions = match std::env::var("CARTFLOW_PARTITIONS") {
        Ok(value) => value.parse().context("CARTFLOW_PARTITIONS must be a number")?,
        Err(_) => 2,
    };

    let pool = PgPool::connect_with(PgConnectOptions::new()).await?;
    let listener = CartLog {
        deserializer: Json::default(),
        versions: VersionGate::new(),
    };

    PgLaneListener::builder(pool, topic, partitions)
        .register_listener(
            listener,
            PgLaneListenerConfig::poller(Duration::from_millis(200)).with_batch_size(50),
        )
        .start_with_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    Ok(())
}
