//! Migration 001: Create the stored-notification table.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Creates `pgpubsub_notification` and its channel index.
pub struct CreateNotificationTable;

#[async_trait]
impl Migration for CreateNotificationTable {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_notification_table"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pgpubsub_notification (
                id BIGSERIAL PRIMARY KEY,
                channel VARCHAR(63) NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut **tx)
        .await?;

        // The claim query filters on (channel, payload); the channel index
        // narrows the scan, payload equality is checked on the heap.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pgpubsub_notification_channel
            ON pgpubsub_notification(channel)
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
