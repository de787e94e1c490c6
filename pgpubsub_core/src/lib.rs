//! # pgpubsub core
//!
//! Backend-agnostic building blocks for the pgpubsub message bus: the wire
//! format for notification payloads, the in-memory notification envelope,
//! the pluggable row decoder for trigger payloads, and the listener filter
//! hook. The PostgreSQL runtime lives in the `pgpubsub_pg` crate.

#![deny(missing_docs)]

pub mod envelope;
pub mod error;
pub mod filter;
pub mod payload;
pub mod row;

pub use envelope::{Envelope, Source};
pub use error::PayloadError;
pub use filter::{AcceptAll, FilterRegistry, ListenerFilter};
pub use payload::{CustomPayload, NotifyPayload, TriggerPayload, decode_kwargs};
pub use row::{ColumnRowDecoder, RowDecoder, RowSnapshot};

/// PostgreSQL rejects channel identifiers longer than 63 bytes.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 63;
