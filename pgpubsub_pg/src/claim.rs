//! The durable-lock claim protocol.
//!
//! For every envelope destined for a durable channel the worker runs one
//! short transaction: lock the first stored row matching the envelope's
//! `(channel, payload)` with skip-locked semantics, run the callback while
//! the lock is held, and delete the row on success. Across any number of
//! concurrent workers this yields exactly one execution per stored row:
//!
//! - no matching row → another worker already processed the notification;
//! - filter/compat rejection → commit without deleting, leaving the row for
//!   a future process;
//! - callback failure → abort, making the row claimable again.
//!
//! The match is by payload identity, not row id, so identical payloads
//! collapse to one delivery; clients wanting per-event delivery must embed
//! a unique identifier in the payload.

use std::collections::HashSet;

use log::{debug, error, warn};
use pgpubsub_core::Envelope;
use sqlx::PgPool;

use crate::dispatcher::{DispatchError, DispatchOutcome, Dispatcher};

/// How a claim attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// The callback completed and the stored row was deleted.
    Processed,
    /// No unlocked row matched; the envelope was dropped.
    NoRow,
    /// A row was claimed but declined (filter, compat, or malformed
    /// payload); it stays in the table for a future process.
    Released,
    /// The callback failed; the transaction was rolled back and the row
    /// remains claimable.
    Failed,
}

/// Claims and executes one durable envelope.
///
/// `declined` records the payload identities this worker has already
/// refused in this session, so a repeated live notification for the same
/// payload is not claimed again. Database errors are fatal to the caller;
/// callback failures are confined to the envelope.
pub async fn claim_and_dispatch(
    pool: &PgPool,
    dispatcher: &Dispatcher,
    envelope: &Envelope,
    declined: &mut HashSet<String>,
) -> Result<ClaimResult, sqlx::Error> {
    let identity = envelope.identity();
    if declined.contains(&identity) {
        debug!(
            "not reclaiming declined notification on '{}' in this session",
            envelope.channel
        );
        return Ok(ClaimResult::Released);
    }

    let mut tx = pool.begin().await?;

    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id
        FROM pgpubsub_notification
        WHERE channel = $1 AND payload = $2
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(&envelope.channel)
    .bind(&envelope.payload)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((row_id,)) = row else {
        // Processed elsewhere, or still locked by a sibling.
        tx.commit().await?;
        debug!(
            "no claimable row for notification on '{}' ({:?})",
            envelope.channel, envelope.source
        );
        return Ok(ClaimResult::NoRow);
    };

    match dispatcher.dispatch(&mut tx, envelope).await {
        Ok(DispatchOutcome::Completed) => {
            sqlx::query("DELETE FROM pgpubsub_notification WHERE id = $1")
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!(
                "processed stored notification {row_id} on '{}'",
                envelope.channel
            );
            Ok(ClaimResult::Processed)
        }
        Ok(DispatchOutcome::Filtered)
        | Ok(DispatchOutcome::Skipped)
        | Ok(DispatchOutcome::Malformed) => {
            tx.commit().await?;
            declined.insert(identity);
            Ok(ClaimResult::Released)
        }
        Err(DispatchError::UnknownChannel(e)) => {
            tx.commit().await?;
            warn!("released stored notification {row_id}: {e}");
            declined.insert(identity);
            Ok(ClaimResult::Released)
        }
        Err(DispatchError::Callback { channel, source }) => {
            tx.rollback().await?;
            error!(
                "callback failed on '{channel}', stored notification {row_id} kept for retry: {source}"
            );
            Ok(ClaimResult::Failed)
        }
    }
}
