//! Channel descriptors and listener callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use pgpubsub_core::{MAX_CHANNEL_NAME_LENGTH, PayloadError, RowSnapshot};
use serde_json::{Map, Value};
use sqlx::PgConnection;

use crate::dispatcher::PayloadMeta;

/// How a channel's payloads are deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Custom payloads carrying keyword arguments.
    Custom,
    /// Payloads produced by a database trigger, carrying row snapshots.
    Trigger,
}

/// Errors a listener callback can return.
///
/// The durable path treats the two variants differently: a decode failure
/// releases the stored row for a future deployment, while a callback
/// failure aborts the claim transaction so another worker can retry.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The payload could not be decoded into the listener's parameters.
    #[error("payload decode failed: {0}")]
    Decode(#[from] PayloadError),

    /// The listener itself failed.
    #[error("listener failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ListenerError {
    /// Wraps an arbitrary error as a callback failure.
    pub fn callback(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Callback(Box::new(err))
    }
}

/// A callback for a custom-payload channel.
///
/// The connection is the claim transaction on durable channels, so writes
/// made through it commit atomically with the stored row's deletion.
#[async_trait]
pub trait CustomListener: Send + Sync {
    /// Handles one notification.
    async fn call(
        &self,
        conn: &mut PgConnection,
        kwargs: &Map<String, Value>,
        meta: PayloadMeta<'_>,
    ) -> Result<(), ListenerError>;
}

/// A callback for a trigger-payload channel.
#[async_trait]
pub trait TriggerListener: Send + Sync {
    /// Handles one notification. `old` is `None` on insert, `new` is `None`
    /// on delete.
    async fn call(
        &self,
        conn: &mut PgConnection,
        old: Option<RowSnapshot>,
        new: Option<RowSnapshot>,
        meta: PayloadMeta<'_>,
    ) -> Result<(), ListenerError>;
}

/// The callback attached to a channel, tagged by payload kind.
#[derive(Clone)]
pub enum ChannelCallback {
    /// Callback for custom payloads.
    Custom(Arc<dyn CustomListener>),
    /// Callback for trigger payloads.
    Trigger(Arc<dyn TriggerListener>),
}

impl ChannelCallback {
    /// The payload kind this callback expects.
    pub fn kind(&self) -> PayloadKind {
        match self {
            ChannelCallback::Custom(_) => PayloadKind::Custom,
            ChannelCallback::Trigger(_) => PayloadKind::Trigger,
        }
    }
}

/// A registered channel: name, durability, and the callback to run.
///
/// Descriptors are immutable for the lifetime of a worker; the registry
/// hands out shared references.
#[derive(Clone)]
pub struct ChannelDescriptor {
    /// The channel name, used verbatim as the PostgreSQL channel identifier.
    pub name: String,
    /// Optional fully-qualified dotted alias resolving to this channel.
    pub alias: Option<String>,
    /// Whether notifications are mirrored into the stored table and
    /// delivered under the claim protocol.
    pub durable: bool,
    /// The callback to invoke for each delivered notification.
    pub callback: ChannelCallback,
}

impl ChannelDescriptor {
    /// Creates a transient custom-payload channel.
    pub fn custom(name: impl Into<String>, listener: Arc<dyn CustomListener>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            durable: false,
            callback: ChannelCallback::Custom(listener),
        }
    }

    /// Creates a transient trigger-payload channel.
    pub fn trigger(name: impl Into<String>, listener: Arc<dyn TriggerListener>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            durable: false,
            callback: ChannelCallback::Trigger(listener),
        }
    }

    /// Marks the channel durable.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Attaches a dotted alias (e.g. `myapp.channels.PostReads`).
    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The payload kind of this channel.
    pub fn payload_kind(&self) -> PayloadKind {
        self.callback.kind()
    }

    /// Validates the channel name against PostgreSQL's identifier rules.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("channel name must not be empty".into());
        }
        if self.name.len() > MAX_CHANNEL_NAME_LENGTH {
            return Err(format!(
                "channel name '{}' exceeds PostgreSQL's {} byte identifier limit",
                self.name, MAX_CHANNEL_NAME_LENGTH
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDescriptor")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("durable", &self.durable)
            .field("payload_kind", &self.payload_kind())
            .finish()
    }
}
