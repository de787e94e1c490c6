//! # pgpubsub postgres runtime
//!
//! The listener runtime and stored-notification locking protocol of the
//! pgpubsub message bus, built on PostgreSQL `LISTEN`/`NOTIFY`.
//!
//! A [`Supervisor`](supervisor::Supervisor) runs a pool of
//! [`Worker`](worker::Worker)s. Each worker owns one listening connection,
//! subscribes to a set of registered channels, and dispatches every incoming
//! notification to exactly one callback. Durable channels additionally
//! mirror each notification into the `pgpubsub_notification` table; the
//! skip-locked claim protocol in [`claim`] guarantees that across any number
//! of concurrent workers each stored row is executed by exactly one of them.

#![deny(missing_docs)]

pub mod channel;
pub mod claim;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod metrics;
pub mod migrations;
pub mod notify;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod triggers;
pub mod worker;

pub use channel::{ChannelCallback, ChannelDescriptor, CustomListener, ListenerError,
    PayloadKind, TriggerListener};
pub use claim::ClaimResult;
pub use config::ListenerConfig;
pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, PayloadMeta};
pub use migrations::Migrator;
pub use registry::{ChannelRegistry, RegistryError};
pub use session::{ListenSession, Polled, SessionError};
pub use supervisor::{RestartPolicy, Supervisor};
pub use worker::{Worker, WorkerError};
