//! Database-side trigger installation.
//!
//! Installs a plpgsql trigger that publishes a trigger payload on row
//! `INSERT`/`UPDATE`/`DELETE`. The generated function builds
//! `{app, model, old, new, context[, db_version]}` — `old`/`new` via
//! `to_jsonb(OLD/NEW)`, context from the transaction-local
//! `pgpubsub.notification_context` setting — then notifies the channel,
//! inserting a stored row first when the channel is durable.

use sha2::{Digest, Sha256};
use sqlx::PgPool;

/// When the trigger fires relative to the row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    /// `BEFORE` the operation.
    Before,
    /// `AFTER` the operation.
    After,
}

/// The row operations a trigger reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOperation {
    /// Row inserts.
    Insert,
    /// Row updates.
    Update,
    /// Row deletes.
    Delete,
}

impl TriggerOperation {
    fn sql(self) -> &'static str {
        match self {
            TriggerOperation::Insert => "INSERT",
            TriggerOperation::Update => "UPDATE",
            TriggerOperation::Delete => "DELETE",
        }
    }
}

/// Description of one trigger to install.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    /// The channel notified by the trigger.
    pub channel: String,
    /// Application label embedded in the payload.
    pub app: String,
    /// Model name embedded in the payload.
    pub model: String,
    /// The table the trigger is attached to. Must be a valid (optionally
    /// schema-qualified) identifier; it is interpolated verbatim.
    pub table: String,
    /// When the trigger fires.
    pub timing: TriggerTiming,
    /// The operations the trigger reacts to.
    pub operations: Vec<TriggerOperation>,
    /// Mirror notifications into the stored table.
    pub durable: bool,
    /// Migration identifier stamped on payloads and stored rows.
    pub db_version: Option<String>,
}

impl TriggerSpec {
    /// Deterministic name shared by the trigger and its function.
    ///
    /// Channel names allow characters identifiers do not, so the name is a
    /// sanitized form plus a short hash of the channel.
    pub fn trigger_name(&self) -> String {
        let sanitized: String = self
            .channel
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .take(32)
            .collect();
        let digest = Sha256::digest(self.channel.as_bytes());
        format!("pgpubsub_notify_{sanitized}_{:02x}{:02x}", digest[0], digest[1])
    }

    fn function_sql(&self) -> String {
        let name = self.trigger_name();
        let channel = sql_literal(&self.channel);
        let app = sql_literal(&self.app);
        let model = sql_literal(&self.model);

        let db_version_insert = match &self.db_version {
            Some(version) => format!(
                "payload := jsonb_insert(payload, '{{db_version}}', to_jsonb({}::text));\n                ",
                sql_quoted(version)
            ),
            None => String::new(),
        };
        let publish = if self.durable {
            let db_version_column = match &self.db_version {
                Some(version) => sql_quoted(version),
                None => "NULL".to_string(),
            };
            format!(
                "INSERT INTO pgpubsub_notification (channel, payload, db_version)\n                VALUES ({channel}, payload, {db_version_column});\n                PERFORM pg_notify({channel}, payload::text);"
            )
        } else {
            format!("PERFORM pg_notify({channel}, payload::text);")
        };

        format!(
            r#"
            CREATE OR REPLACE FUNCTION {name}()
            RETURNS TRIGGER AS $body$
            DECLARE
                payload JSONB;
                context_text TEXT;
            BEGIN
                payload := jsonb_build_object('app', {app}, 'model', {model});
                payload := jsonb_insert(payload, '{{old}}', COALESCE(to_jsonb(OLD), 'null'::jsonb));
                payload := jsonb_insert(payload, '{{new}}', COALESCE(to_jsonb(NEW), 'null'::jsonb));
                SELECT current_setting('pgpubsub.notification_context', true) INTO context_text;
                IF COALESCE(context_text, '') = '' THEN
                    context_text := '{{}}';
                END IF;
                payload := jsonb_insert(payload, '{{context}}', context_text::jsonb);
                {db_version_insert}{publish}
                RETURN COALESCE(NEW, OLD);
            END;
            $body$ LANGUAGE plpgsql
            "#
        )
    }

    fn trigger_sql(&self) -> String {
        let name = self.trigger_name();
        let timing = match self.timing {
            TriggerTiming::Before => "BEFORE",
            TriggerTiming::After => "AFTER",
        };
        let operations: Vec<&str> = self.operations.iter().map(|op| op.sql()).collect();
        format!(
            r#"
            CREATE TRIGGER {name}
            {timing} {operations} ON {table}
            FOR EACH ROW
            EXECUTE FUNCTION {name}()
            "#,
            operations = operations.join(" OR "),
            table = self.table,
        )
    }
}

/// Creates or replaces the trigger described by `spec`. Idempotent.
pub async fn install_trigger(pool: &PgPool, spec: &TriggerSpec) -> Result<(), sqlx::Error> {
    sqlx::query(&spec.function_sql()).execute(pool).await?;
    sqlx::query(&format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        spec.trigger_name(),
        spec.table
    ))
    .execute(pool)
    .await?;
    sqlx::query(&spec.trigger_sql()).execute(pool).await?;
    Ok(())
}

/// Drops the trigger and its function.
pub async fn uninstall_trigger(pool: &PgPool, spec: &TriggerSpec) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        spec.trigger_name(),
        spec.table
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "DROP FUNCTION IF EXISTS {}()",
        spec.trigger_name()
    ))
    .execute(pool)
    .await?;
    Ok(())
}

// Single-quoted SQL string literal with embedded quotes doubled.
fn sql_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_literal(value: &str) -> String {
    sql_quoted(value)
}
