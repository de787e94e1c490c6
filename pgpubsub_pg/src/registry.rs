//! The channel registry.
//!
//! Channels are registered explicitly during process initialization; the
//! runtime treats the registry as read-only afterwards. Lookups accept the
//! canonical channel name, a registered dotted alias, or a dotted path whose
//! final segment is a registered name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::ChannelDescriptor;

/// Errors raised while building or querying the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No descriptor is registered under the given name.
    #[error("channel '{0}' is not registered")]
    NotFound(String),

    /// Two descriptors were registered under the same name or alias.
    #[error("channel name '{0}' registered twice")]
    Duplicate(String),

    /// A descriptor failed validation.
    #[error("invalid channel '{name}': {reason}")]
    Invalid {
        /// The offending channel name.
        name: String,
        /// Why validation failed.
        reason: String,
    },
}

/// The immutable channel name → descriptor map.
pub struct ChannelRegistry {
    by_name: HashMap<String, Arc<ChannelDescriptor>>,
    by_alias: HashMap<String, Arc<ChannelDescriptor>>,
}

impl ChannelRegistry {
    /// Starts building a registry.
    pub fn builder() -> ChannelRegistryBuilder {
        ChannelRegistryBuilder {
            descriptors: Vec::new(),
        }
    }

    /// Resolves a channel name or dotted path to its descriptor.
    pub fn resolve(&self, name: &str) -> Result<Arc<ChannelDescriptor>, RegistryError> {
        if let Some(descriptor) = self.by_name.get(name) {
            return Ok(descriptor.clone());
        }
        if let Some(descriptor) = self.by_alias.get(name) {
            return Ok(descriptor.clone());
        }
        if let Some(last) = name.rsplit('.').next()
            && last != name
            && let Some(descriptor) = self.by_name.get(last)
        {
            return Ok(descriptor.clone());
        }
        Err(RegistryError::NotFound(name.to_string()))
    }

    /// All registered channels, in registration order by name.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<ChannelDescriptor>> {
        self.by_name.values()
    }

    /// The durable subset of registered channels.
    pub fn durable_channels(&self) -> impl Iterator<Item = &Arc<ChannelDescriptor>> {
        self.by_name.values().filter(|d| d.durable)
    }

    /// Resolves a selection of names, or every registered channel when the
    /// selection is empty. Unknown names are a configuration error.
    pub fn select(&self, names: &[String]) -> Result<Vec<Arc<ChannelDescriptor>>, RegistryError> {
        if names.is_empty() {
            return Ok(self.channels().cloned().collect());
        }
        names.iter().map(|name| self.resolve(name)).collect()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder collecting descriptors before validation.
pub struct ChannelRegistryBuilder {
    descriptors: Vec<ChannelDescriptor>,
}

impl ChannelRegistryBuilder {
    /// Adds a channel.
    pub fn register(mut self, descriptor: ChannelDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Validates every descriptor and freezes the registry.
    pub fn build(self) -> Result<ChannelRegistry, RegistryError> {
        let mut by_name = HashMap::new();
        let mut by_alias = HashMap::new();
        for descriptor in self.descriptors {
            descriptor.validate().map_err(|reason| RegistryError::Invalid {
                name: descriptor.name.clone(),
                reason,
            })?;
            let descriptor = Arc::new(descriptor);
            if by_name
                .insert(descriptor.name.clone(), descriptor.clone())
                .is_some()
            {
                return Err(RegistryError::Duplicate(descriptor.name.clone()));
            }
            if let Some(alias) = &descriptor.alias
                && by_alias.insert(alias.clone(), descriptor.clone()).is_some()
            {
                return Err(RegistryError::Duplicate(alias.clone()));
            }
        }
        Ok(ChannelRegistry { by_name, by_alias })
    }
}
