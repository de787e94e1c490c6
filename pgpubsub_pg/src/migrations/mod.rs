//! Embedded schema migrations.
//!
//! Versioned, fingerprinted, forward-only. The whole pending set is applied
//! in a single transaction serialized by an advisory lock: any number of
//! producer and worker processes may race to boot after a deploy, exactly
//! one of them runs the DDL, and the claim protocol never observes a
//! half-migrated notification table. There is no `down()` — the table is a
//! live delivery queue, and rolling its schema back under producers loses
//! rows.
//!
//! To add a migration, create `mXXX_description.rs`, implement
//! [`Migration`], and append it to the `MIGRATIONS` array below.

mod m001_create_notification_table;
mod m002_add_db_version;

use m001_create_notification_table::CreateNotificationTable;
use m002_add_db_version::AddDbVersion;

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};

/// All migrations in version order. Append only.
const MIGRATIONS: &[&dyn Migration] = &[&CreateNotificationTable, &AddDbVersion];

// Advisory-lock key for the migration transaction: "pgpubsub" as bytes.
const MIGRATION_LOCK: i64 = 0x7067_7075_6273_7562;

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration's code changed after it was recorded as applied.
    #[error("migration {version} ({name}) changed after it was applied; refusing to continue")]
    Altered {
        /// The version whose fingerprint no longer matches.
        version: i64,
        /// The name of the migration.
        name: &'static str,
    },

    /// A migration failed to execute; the whole run was rolled back.
    #[error("migration {version} ({name}) failed: {reason}")]
    Failed {
        /// The version of the migration that failed.
        version: i64,
        /// The name of the migration.
        name: &'static str,
        /// The reason for the failure.
        reason: String,
    },
}

/// One schema change.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, strictly increasing version number.
    fn version(&self) -> i64;

    /// Human-readable name (e.g. `create_notification_table`).
    fn name(&self) -> &'static str;

    /// Executes the change inside the migrator's transaction. Do not
    /// commit or roll back.
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError>;

    /// Short identity hash recorded at apply time, checked on every later
    /// run so an edited migration is caught instead of silently skipped.
    fn fingerprint(&self) -> String {
        let digest = Sha256::digest(format!("{}:{}", self.version(), self.name()));
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// One row of the tracking table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MigrationRecord {
    /// The version number of the migration.
    pub version: i64,
    /// The name recorded at apply time.
    pub name: String,
    /// The fingerprint recorded at apply time.
    pub fingerprint: String,
    /// When the migration was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

/// Applies and tracks the embedded migrations.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every pending migration, all-or-nothing.
    ///
    /// The run takes `pg_advisory_xact_lock` first, so concurrent processes
    /// booting at the same moment queue up behind whichever got there
    /// first and then find nothing left to do. Returns the number of
    /// migrations this call applied.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _pgpubsub_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                fingerprint VARCHAR(16) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let recorded: HashMap<i64, String> =
            sqlx::query_as::<_, (i64, String)>("SELECT version, fingerprint FROM _pgpubsub_migrations")
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();

        let mut applied = 0usize;
        for migration in MIGRATIONS {
            match recorded.get(&migration.version()) {
                Some(fingerprint) if *fingerprint == migration.fingerprint() => continue,
                Some(_) => {
                    // Dropping the transaction rolls back anything applied
                    // earlier in this run.
                    return Err(MigrationError::Altered {
                        version: migration.version(),
                        name: migration.name(),
                    });
                }
                None => {}
            }

            log::info!(
                "applying migration {} ({})",
                migration.version(),
                migration.name()
            );
            migration.up(&mut tx).await.map_err(|e| MigrationError::Failed {
                version: migration.version(),
                name: migration.name(),
                reason: e.to_string(),
            })?;

            sqlx::query(
                "INSERT INTO _pgpubsub_migrations (version, name, fingerprint) VALUES ($1, $2, $3)",
            )
            .bind(migration.version())
            .bind(migration.name())
            .bind(migration.fingerprint())
            .execute(&mut *tx)
            .await?;
            applied += 1;
        }

        tx.commit().await?;
        if applied > 0 {
            log::info!("applied {applied} migrations");
        }
        Ok(applied)
    }

    /// The highest applied version, or 0 on a database the migrator has
    /// never touched. Read-only: performs no DDL.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        if !self.tracking_table_exists().await? {
            return Ok(0);
        }
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM _pgpubsub_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Every applied migration in version order. Read-only: performs no
    /// DDL, and returns empty on an untouched database.
    pub async fn history(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        if !self.tracking_table_exists().await? {
            return Ok(Vec::new());
        }
        let records = sqlx::query_as::<_, MigrationRecord>(
            r#"
            SELECT version, name, fingerprint, applied_at
            FROM _pgpubsub_migrations
            ORDER BY version
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn tracking_table_exists(&self) -> Result<bool, MigrationError> {
        let regclass: Option<String> =
            sqlx::query_scalar("SELECT to_regclass('_pgpubsub_migrations')::text")
                .fetch_one(&self.pool)
                .await?;
        Ok(regclass.is_some())
    }
}
