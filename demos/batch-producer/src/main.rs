use anyhow::{Context, Result};
use cartflow::serde::json::Json;
use cartflow::{
    BatchPublisher, BufferedSink, BufferedSinkConfig, CartEntry, CartUpdateRequest,
    MutationAction, StructuralValidator, UpdateCoordinator, VersionSequencer,
};
use cartflow_postgres::{PgTransport, PgTransportConfig};
use sqlx::{postgres::PgConnectOptions, PgPool};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const USERS: [&str; 4] = ["user_1", "user_2", "user_3", "user_4"];

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

fn transport_config() -> Result<PgTransportConfig> {
    let topic = std::env::var("CARTFLOW_TOPIC").unwrap_or_else(|_| "cart-update-request".into());
    let partitions = match std::env::var("CARTFLOW_PARTITIONS") {
        Ok(value) => value.parse().context("CARTFLOW_PARTITIONS must be a number")?,
        Err(_) => 2,
    };
    Ok(PgTransportConfig::topic(topic).with_partitions(partitions))
}

/// Two consecutive versions for each user, grouped by user.
fn sample_batch() -> Vec<CartUpdateRequest> {
    USERS
        .into_iter()
        .flat_map(|user| {
            (1..=2).map(move |version| {
                CartUpdateRequest::new(user, version)
                    .with_entry(CartEntry::qty_change("P001", "Laptop", 1))
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    // Create a PostgreSQL pool from the PG* environment variables
    let pool = PgPool::connect_with(PgConnectOptions::new()).await?;

    let transport = PgTransport::try_new(pool, transport_config()?).await?;
    let publisher = BatchPublisher::new(transport, Json::default());

    // Bulk path: the batch is already validated and versioned by the caller
    let batch = sample_batch();
    publisher.publish_batch(&batch).await?;
    info!(requests = batch.len(), "sample batch published");

    // Coordinator path: single mutations are validated, then handed off to a buffered sink
    let shutdown = CancellationToken::new();
    let versions = VersionSequencer::seeded(USERS.into_iter().map(|user| (user, 2)));
    let (sink, worker) = BufferedSink::spawn(
        publisher,
        versions,
        BufferedSinkConfig::linger(Duration::from_millis(20)),
        shutdown.clone(),
    )?;
    let coordinator = UpdateCoordinator::new(StructuralValidator, sink);
    coordinator
        .update_cart("user_1", MutationAction::new("P002", 2))
        .await?;
    coordinator
        .update_cart("user_3", MutationAction::new("P001", -1))
        .await?;
    info!("coordinator mutations dispatched");

    // let the detached dispatch tasks reach the sink before draining it
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    worker.await?;
    Ok(())
}
