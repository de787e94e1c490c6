//! Recovery scan over persisted notifications.
//!
//! On startup (or on a live `null`-payload hint) a worker replays stored
//! rows for its durable channels, oldest first, feeding each as a replay
//! envelope through the same skip-locked claim used for live delivery.
//! Concurrent live processing therefore dedups naturally: a row claimed by
//! a sibling is simply not found again.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};
use pgpubsub_core::Envelope;
use sqlx::PgPool;

use crate::channel::ChannelDescriptor;
use crate::claim::{self, ClaimResult};
use crate::dispatcher::Dispatcher;
use crate::store;

/// Replays all stored rows for one durable channel.
///
/// Rows are fetched in keyset-paginated batches so memory stays bounded for
/// arbitrarily large backlogs. Returns the number of rows this worker
/// processed itself.
pub async fn recover_channel(
    pool: &PgPool,
    dispatcher: &Dispatcher,
    channel: &str,
    batch_size: u32,
    declined: &mut HashSet<String>,
) -> Result<u64, sqlx::Error> {
    let mut processed = 0u64;
    let mut last_id = 0i64;

    loop {
        let rows = store::fetch_batch(pool, channel, last_id, batch_size).await?;
        if rows.is_empty() {
            break;
        }

        for row in rows {
            last_id = row.id;
            let envelope = Envelope::replay(row.channel, row.payload, row.db_version);
            let result = claim::claim_and_dispatch(pool, dispatcher, &envelope, declined).await?;
            if result == ClaimResult::Processed {
                processed += 1;
            } else {
                debug!("recovery on '{channel}': row {} -> {result:?}", row.id);
            }
        }
    }

    if processed > 0 {
        info!("recovered {processed} stored notifications on '{channel}'");
    }
    Ok(processed)
}

/// Replays stored rows for every durable channel in the worker's set.
/// Transient channels have nothing to recover and are skipped.
pub async fn recover_channels(
    pool: &PgPool,
    dispatcher: &Dispatcher,
    channels: &[Arc<ChannelDescriptor>],
    batch_size: u32,
    declined: &mut HashSet<String>,
) -> Result<u64, sqlx::Error> {
    let mut total = 0u64;
    for descriptor in channels.iter().filter(|d| d.durable) {
        total += recover_channel(pool, dispatcher, &descriptor.name, batch_size, declined).await?;
    }
    Ok(total)
}
