//! Maps envelopes to callbacks.
//!
//! The dispatcher resolves the channel descriptor, applies the listener
//! filter and the `db_version` compatibility gate, deserializes the payload
//! according to the channel's payload kind, and invokes the callback. It
//! reports how the envelope terminated so the durable path can decide
//! whether the stored row is deleted, released, or rolled back.

use std::sync::Arc;

use log::{debug, warn};
use pgpubsub_core::{Envelope, ListenerFilter, NotifyPayload, RowDecoder, RowSnapshot};
use serde_json::Value;
use sqlx::PgConnection;

use crate::channel::{ChannelCallback, ListenerError};
use crate::config::ListenerConfig;
use crate::registry::{ChannelRegistry, RegistryError};

/// Optional payload objects surfaced to callbacks, gated by the
/// `PGPUBSUB_PASS_CONTEXT_TO_LISTENERS` / `PGPUBSUB_PASS_EXTRAS_TO_LISTENERS`
/// settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadMeta<'a> {
    /// The payload's top-level `context` object, when surfaced.
    pub context: Option<&'a Value>,
    /// The payload's top-level `extras` object, when surfaced.
    pub extras: Option<&'a Value>,
}

/// How an envelope terminated without a callback error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The callback ran to completion.
    Completed,
    /// The listener filter rejected the envelope.
    Filtered,
    /// The payload predates the minimum accepted `db_version`; leave the
    /// stored row for a future deployment.
    Skipped,
    /// The payload could not be parsed or decoded; on the durable path the
    /// row is released so a future deployment may reprocess it.
    Malformed,
}

/// Errors the dispatcher propagates to its caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The envelope's channel is not in the registry.
    #[error(transparent)]
    UnknownChannel(#[from] RegistryError),

    /// The callback failed; the durable path aborts the claim transaction.
    #[error("callback failed for channel '{channel}': {source}")]
    Callback {
        /// The channel whose callback failed.
        channel: String,
        /// The callback's error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The envelope → callback dispatcher shared by every worker path.
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    config: Arc<ListenerConfig>,
    filter: Arc<dyn ListenerFilter>,
    row_decoder: Arc<dyn RowDecoder>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        config: Arc<ListenerConfig>,
        filter: Arc<dyn ListenerFilter>,
        row_decoder: Arc<dyn RowDecoder>,
    ) -> Self {
        Self {
            registry,
            config,
            filter,
            row_decoder,
        }
    }

    /// The registry this dispatcher resolves channels against.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Runs one envelope to termination.
    ///
    /// `conn` is the claim transaction on the durable path and a plain
    /// pooled connection on the transient path; callbacks receive it so
    /// their writes share the caller's transactional scope.
    pub async fn dispatch(
        &self,
        conn: &mut PgConnection,
        envelope: &Envelope,
    ) -> Result<DispatchOutcome, DispatchError> {
        let descriptor = self.registry.resolve(&envelope.channel)?;

        let payload = match envelope.parse() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "dropping malformed payload on '{}' ({:?}): {e}",
                    envelope.channel, envelope.source
                );
                return Ok(DispatchOutcome::Malformed);
            }
        };

        if !self.filter.accept(&envelope.filter_context()) {
            debug!("filter rejected envelope on '{}'", envelope.channel);
            return Ok(DispatchOutcome::Filtered);
        }

        let result = match (&descriptor.callback, payload) {
            (ChannelCallback::Custom(listener), NotifyPayload::Custom(custom)) => {
                let meta = self.meta(custom.context.as_ref(), None);
                listener.call(conn, &custom.kwargs, meta).await
            }
            (ChannelCallback::Trigger(listener), NotifyPayload::Trigger(trigger)) => {
                if !self.config.accepts_db_version(envelope.db_version.as_deref()) {
                    debug!(
                        "skipping '{}' payload with db_version {:?} (minimum {:?})",
                        envelope.channel, envelope.db_version, self.config.min_db_version
                    );
                    return Ok(DispatchOutcome::Skipped);
                }
                let old = match self.decode_row(&trigger.app, &trigger.model, trigger.old.as_ref()) {
                    Ok(row) => row,
                    Err(outcome) => return Ok(outcome),
                };
                let new = match self.decode_row(&trigger.app, &trigger.model, trigger.new.as_ref()) {
                    Ok(row) => row,
                    Err(outcome) => return Ok(outcome),
                };
                let meta = self.meta(trigger.context.as_ref(), trigger.extras.as_ref());
                listener.call(conn, old, new, meta).await
            }
            (callback, payload) => {
                warn!(
                    "payload shape does not match channel '{}' (registered {:?}, got {})",
                    envelope.channel,
                    callback.kind(),
                    payload_kind_name(&payload),
                );
                return Ok(DispatchOutcome::Malformed);
            }
        };

        match result {
            Ok(()) => Ok(DispatchOutcome::Completed),
            Err(ListenerError::Decode(e)) => {
                warn!(
                    "listener for '{}' could not decode payload: {e}",
                    envelope.channel
                );
                Ok(DispatchOutcome::Malformed)
            }
            Err(ListenerError::Callback(source)) => Err(DispatchError::Callback {
                channel: envelope.channel.clone(),
                source,
            }),
        }
    }

    fn meta<'a>(
        &self,
        context: Option<&'a Value>,
        extras: Option<&'a Value>,
    ) -> PayloadMeta<'a> {
        PayloadMeta {
            context: context.filter(|_| self.config.pass_context_to_listeners),
            extras: extras.filter(|_| self.config.pass_extras_to_listeners),
        }
    }

    fn decode_row(
        &self,
        app: &str,
        model: &str,
        state: Option<&Value>,
    ) -> Result<Option<RowSnapshot>, DispatchOutcome> {
        let Some(state) = state else {
            return Ok(None);
        };
        match self.row_decoder.decode(app, model, state) {
            Ok(row) => Ok(Some(row)),
            Err(e) => {
                warn!("row decode failed for {app}.{model}: {e}");
                Err(DispatchOutcome::Malformed)
            }
        }
    }
}

fn payload_kind_name(payload: &NotifyPayload) -> &'static str {
    match payload {
        NotifyPayload::Recover => "recovery hint",
        NotifyPayload::Custom(_) => "custom",
        NotifyPayload::Trigger(_) => "trigger",
    }
}
