//! Migration 002: Stamp stored rows with the producer's migration id.
//!
//! `db_version` lets a deployer check, before rolling out a
//! backward-incompatible schema change, that no stored row predates the
//! migration that made the change safe. Nullable so that rows written by
//! older deployments remain valid.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{Migration, MigrationError};

/// Adds the nullable `db_version` column.
pub struct AddDbVersion;

#[async_trait]
impl Migration for AddDbVersion {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "add_db_version"
    }

    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            ALTER TABLE pgpubsub_notification
            ADD COLUMN IF NOT EXISTS db_version TEXT NULL
            "#,
        )
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
