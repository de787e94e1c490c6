//! Publish-side helpers.
//!
//! `notify` issues the transient `NOTIFY` and, for durable channels, the
//! stored-row insert in one transaction: the notification reaches listening
//! sessions iff the row is visible to a new transaction.

use log::info;
use pgpubsub_core::CustomPayload;
use serde_json::{Map, Value};
use sqlx::{PgExecutor, PgPool};

use crate::registry::{ChannelRegistry, RegistryError};

/// PostgreSQL rejects NOTIFY payloads longer than roughly 8000 bytes.
pub const MAX_NOTIFY_PAYLOAD_BYTES: usize = 8000;

/// Errors from the publish helpers.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The channel is not registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The serialized payload exceeds the NOTIFY size limit.
    #[error("payload is {0} bytes, over the {MAX_NOTIFY_PAYLOAD_BYTES}-byte NOTIFY limit")]
    PayloadTooLarge(usize),

    /// The publish transaction failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Publishes a custom payload to a channel.
///
/// For durable channels the stored row is inserted in the same transaction
/// as the `pg_notify`, so the two are atomic with respect to the caller's
/// commit. Returns the serialized payload text.
pub async fn notify(
    pool: &PgPool,
    registry: &ChannelRegistry,
    channel: &str,
    kwargs: Map<String, Value>,
    context: Option<Value>,
) -> Result<String, NotifyError> {
    let descriptor = registry.resolve(channel)?;
    let payload = CustomPayload { kwargs, context }.to_wire();
    let serialized = payload.to_string();
    if serialized.len() > MAX_NOTIFY_PAYLOAD_BYTES {
        return Err(NotifyError::PayloadTooLarge(serialized.len()));
    }

    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(&descriptor.name)
        .bind(&serialized)
        .execute(&mut *tx)
        .await?;
    if descriptor.durable {
        sqlx::query("INSERT INTO pgpubsub_notification (channel, payload) VALUES ($1, $2)")
            .bind(&descriptor.name)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    info!("notified channel '{}' with payload {serialized}", descriptor.name);
    Ok(serialized)
}

/// Asks listening processes to drain the stored backlog.
///
/// Sends a `null` payload to each durable channel in the selection (every
/// registered durable channel when `channels` is empty). Useful when a
/// stored notification was never dispatched, e.g. because all listeners
/// happened to be down when it was published.
pub async fn process_stored_notifications(
    pool: &PgPool,
    registry: &ChannelRegistry,
    channels: &[String],
) -> Result<(), NotifyError> {
    for descriptor in registry.select(channels)?.iter().filter(|d| d.durable) {
        sqlx::query("SELECT pg_notify($1, 'null')")
            .bind(&descriptor.name)
            .execute(pool)
            .await?;
        info!(
            "notified channel '{}' to recover stored notifications",
            descriptor.name
        );
    }
    Ok(())
}

/// Attaches a context object to trigger payloads produced by the current
/// transaction, via the `pgpubsub.notification_context` setting.
pub async fn set_notification_context<'e, E: PgExecutor<'e>>(
    executor: E,
    context: &Value,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT set_config('pgpubsub.notification_context', $1, true)")
        .bind(context.to_string())
        .execute(executor)
        .await?;
    Ok(())
}
