//! The deployment-configurable listener filter hook.
//!
//! A single predicate evaluated over the payload's `context` (or `extras`)
//! object, applied identically on the live and replay paths. Deployments
//! register named filters at process init and select one by name through
//! the `PGPUBSUB_LISTENER_FILTER` environment variable.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// A predicate over the envelope's context object.
///
/// Returning `false` drops the envelope; on the durable path the stored row
/// is released (not deleted) so another deployment may claim it.
pub trait ListenerFilter: Send + Sync {
    /// Whether this process should handle a notification with the given
    /// context.
    fn accept(&self, context: &Value) -> bool;
}

/// The default filter: accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ListenerFilter for AcceptAll {
    fn accept(&self, _context: &Value) -> bool {
        true
    }
}

/// Named filters available to this deployment.
#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<String, Arc<dyn ListenerFilter>>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter under a name. Re-registering a name replaces the
    /// previous filter.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        filter: Arc<dyn ListenerFilter>,
    ) -> &mut Self {
        self.filters.insert(name.into(), filter);
        self
    }

    /// Looks up a filter by its registered name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ListenerFilter>> {
        self.filters.get(name).cloned()
    }
}
