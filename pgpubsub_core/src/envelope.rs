//! The in-memory notification envelope.

use serde_json::Value;

use crate::error::PayloadError;
use crate::payload::{NotifyPayload, TriggerPayload};

/// Where an envelope entered the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Received from the PostgreSQL `LISTEN` stream in real time.
    Live,
    /// Scanned from the stored-notification table by the recovery path.
    Replay,
}

/// A single notification travelling through a worker.
///
/// Envelopes are created when a notification is received from the listen
/// session or scanned from the durable table, consumed by exactly one
/// dispatcher invocation, and dropped when that invocation returns.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The channel the notification arrived on.
    pub channel: String,
    /// The raw JSON payload, kept verbatim for payload-identity matching.
    pub payload: Value,
    /// Live or replayed.
    pub source: Source,
    /// Migration identifier recorded at publish time, when known.
    pub db_version: Option<String>,
}

impl Envelope {
    /// Builds a live envelope from a received notification.
    pub fn live(channel: impl Into<String>, payload: Value) -> Self {
        let db_version = payload_db_version(&payload);
        Self {
            channel: channel.into(),
            payload,
            source: Source::Live,
            db_version,
        }
    }

    /// Builds a replay envelope from a stored row.
    ///
    /// The stored `db_version` column wins over any version embedded in the
    /// payload; rows written by older deployments carry it only in-payload.
    pub fn replay(
        channel: impl Into<String>,
        payload: Value,
        db_version: Option<String>,
    ) -> Self {
        let db_version = db_version.or_else(|| payload_db_version(&payload));
        Self {
            channel: channel.into(),
            payload,
            source: Source::Replay,
            db_version,
        }
    }

    /// Parses the payload into its tagged form.
    pub fn parse(&self) -> Result<NotifyPayload, PayloadError> {
        NotifyPayload::parse(&self.payload)
    }

    /// The object the listener filter is evaluated over: the payload's
    /// top-level `context`, falling back to `extras`, then `{}`.
    pub fn filter_context(&self) -> Value {
        for key in ["context", "extras"] {
            if let Some(value) = self.payload.get(key)
                && value.is_object()
            {
                return value.clone();
            }
        }
        Value::Object(serde_json::Map::new())
    }

    /// Payload identity within a session, used to remember declined rows.
    pub fn identity(&self) -> String {
        format!("{}\u{1f}{}", self.channel, self.payload)
    }
}

fn payload_db_version(payload: &Value) -> Option<String> {
    match NotifyPayload::parse(payload) {
        Ok(NotifyPayload::Trigger(TriggerPayload { db_version, .. })) => db_version,
        _ => None,
    }
}
