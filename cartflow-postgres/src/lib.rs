//! # PostgreSQL Cartflow Backend Library
//!
//! Stores cart update envelopes in per-partition lanes and delivers them to lane listeners.
mod error;
#[cfg(feature = "listener")]
mod listener;
mod transport;

#[cfg(feature = "listener")]
pub use crate::listener::{PgLaneListener, PgLaneListenerConfig};
pub use crate::transport::{PgTransport, PgTransportConfig};
pub use error::Error;

/// Initializes the PostgreSQL DB
///
/// It creates the lane and message tables used by the Postgres transport.
/// If the `listener` feature is enabled, it also creates the table tracking listener progress.
pub async fn setup(pool: &sqlx::PgPool) -> Result<(), Error> {
    crate::transport::setup(pool).await?;
    #[cfg(feature = "listener")]
    crate::listener::setup(pool).await?;
    Ok(())
}
