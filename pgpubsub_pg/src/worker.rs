//! The worker run loop.
//!
//! ```text
//! INIT ──subscribe──▶ (RECOVER?) ──▶ RUNNING ⇄ IDLE ──shutdown──▶ DRAINING ──▶ EXITED
//!                                        │
//!                                        └──fatal error──▶ EXITED (supervised restart)
//! ```
//!
//! A worker owns one listening connection and processes notifications one
//! at a time; parallelism comes from running several workers. There is no
//! in-process queue between poll and dispatch: during a long callback the
//! server-side notification queue absorbs pending events, and a slow worker
//! is simply overtaken by faster siblings on the same channel.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use pgpubsub_core::Envelope;
use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelDescriptor;
use crate::claim;
use crate::config::ListenerConfig;
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::recovery;
use crate::session::{ListenSession, Polled, ReceivedNotification, SessionError};

/// Errors fatal to a worker. The supervisor decides whether to restart.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The listening session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A claim or recovery transaction failed at the database level.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A single listener worker.
pub struct Worker {
    id: usize,
    pool: PgPool,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ListenerConfig>,
    channels: Vec<Arc<ChannelDescriptor>>,
    declined: HashSet<String>,
}

impl Worker {
    /// Creates a worker over the given channel set.
    pub fn new(
        id: usize,
        pool: PgPool,
        dispatcher: Arc<Dispatcher>,
        config: Arc<ListenerConfig>,
        channels: Vec<Arc<ChannelDescriptor>>,
    ) -> Self {
        Self {
            id,
            pool,
            dispatcher,
            config,
            channels,
            declined: HashSet::new(),
        }
    }

    /// Runs the worker until shutdown or a fatal error.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut session = ListenSession::connect(&self.pool).await?;
        let names: Vec<&str> = self.channels.iter().map(|d| d.name.as_str()).collect();
        session.subscribe(&names).await?;
        info!("worker {} subscribed to {} channels", self.id, names.len());

        if self.config.recover {
            let recovered = recovery::recover_channels(
                &self.pool,
                &self.dispatcher,
                &self.channels,
                self.config.recovery_batch_size,
                &mut self.declined,
            )
            .await?;
            info!("worker {} recovery pass processed {recovered} rows", self.id);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = session.poll(self.config.poll_deadline) => match polled? {
                    Polled::Timeout => {
                        debug!("worker {} idle", self.id);
                    }
                    Polled::Notification(notification) => {
                        self.handle(&notification).await?;
                    }
                },
            }
        }

        session.close().await?;
        info!("worker {} exited cleanly", self.id);
        Ok(())
    }

    /// Processes one live notification to termination.
    ///
    /// Recoverable problems (unknown channel, malformed payload, callback
    /// failure) are confined to the notification in hand; only database and
    /// session errors propagate.
    async fn handle(&mut self, notification: &ReceivedNotification) -> Result<(), WorkerError> {
        let descriptor = match self.dispatcher.registry().resolve(&notification.channel) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("worker {} dropping notification: {e}", self.id);
                return Ok(());
            }
        };

        let payload: Value = match serde_json::from_str(&notification.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "worker {} dropping non-JSON payload on '{}' from pid {}: {e}",
                    self.id, notification.channel, notification.pid
                );
                return Ok(());
            }
        };

        // A null payload asks listeners to drain the stored backlog.
        if payload.is_null() {
            if descriptor.durable {
                info!(
                    "worker {} draining stored notifications on '{}'",
                    self.id, descriptor.name
                );
                recovery::recover_channel(
                    &self.pool,
                    &self.dispatcher,
                    &descriptor.name,
                    self.config.recovery_batch_size,
                    &mut self.declined,
                )
                .await?;
            }
            return Ok(());
        }

        let envelope = Envelope::live(descriptor.name.clone(), payload);

        if descriptor.durable {
            let result =
                claim::claim_and_dispatch(&self.pool, &self.dispatcher, &envelope, &mut self.declined)
                    .await?;
            debug!(
                "worker {} durable notification on '{}' -> {result:?}",
                self.id, descriptor.name
            );
        } else {
            let mut conn = self.pool.acquire().await?;
            match self.dispatcher.dispatch(&mut conn, &envelope).await {
                Ok(outcome) => {
                    debug!(
                        "worker {} transient notification on '{}' -> {outcome:?}",
                        self.id, descriptor.name
                    );
                }
                Err(DispatchError::UnknownChannel(e)) => {
                    warn!("worker {} dropping notification: {e}", self.id);
                }
                Err(DispatchError::Callback { channel, source }) => {
                    error!(
                        "worker {} callback failed on '{channel}': {source}; continuing",
                        self.id
                    );
                }
            }
        }

        Ok(())
    }
}
