//! Read helpers over the stored-notification table.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

/// One row of `pgpubsub_notification`.
#[derive(Debug, Clone, FromRow)]
pub struct StoredNotification {
    /// Monotonically increasing key.
    pub id: i64,
    /// The channel the notification was published on.
    pub channel: String,
    /// The payload, byte-identical to the transient notification.
    pub payload: Value,
    /// Migration identifier of the producing application at publish time.
    pub db_version: Option<String>,
    /// When the row was inserted.
    pub created_at: DateTime<Utc>,
}

/// Count of stored rows and age of the oldest one across the given
/// channels. Takes no row locks; safe to run beside the claim protocol.
pub async fn queue_stats(
    pool: &PgPool,
    channels: &[String],
) -> Result<(i64, Option<DateTime<Utc>>), sqlx::Error> {
    let (count, oldest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
        r#"
        SELECT COUNT(*), MIN(created_at)
        FROM pgpubsub_notification
        WHERE channel = ANY($1)
        "#,
    )
    .bind(channels)
    .fetch_one(pool)
    .await?;

    Ok((count, oldest))
}

/// Fetches the next batch of stored rows for a channel, oldest first.
///
/// Keyset pagination on `id` keeps recovery memory bounded regardless of
/// backlog size.
pub async fn fetch_batch(
    pool: &PgPool,
    channel: &str,
    after_id: i64,
    limit: u32,
) -> Result<Vec<StoredNotification>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, channel, payload, db_version, created_at
        FROM pgpubsub_notification
        WHERE channel = $1 AND id > $2
        ORDER BY id ASC
        LIMIT $3
        "#,
    )
    .bind(channel)
    .bind(after_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
}
