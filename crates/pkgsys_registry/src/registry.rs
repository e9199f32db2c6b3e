//! The provider registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use pkgsys_manifest::is_valid_name;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::provider::ProviderDescriptor;
use crate::security::validate_url;

/// Registered providers by name.
///
/// Entries are never replaced or removed: a second registration under the
/// same name must be identical to the first.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<ProviderDescriptor>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider.
    ///
    /// Re-registering an identical descriptor is a no-op. A descriptor that
    /// differs from the registered one in any field is a conflict; the key is
    /// checked first so key substitution is always reported as such.
    pub fn register(
        &self,
        descriptor: ProviderDescriptor,
    ) -> Result<Arc<ProviderDescriptor>, RegistryError> {
        if !is_valid_name(&descriptor.name) {
            return Err(RegistryError::InvalidName(descriptor.name));
        }
        validate_url(&descriptor.base_location, descriptor.policy.allow_local()).map_err(
            |source| RegistryError::InvalidLocation {
                name: descriptor.name.clone(),
                source,
            },
        )?;

        let mut providers = self.providers.write();
        if let Some(existing) = providers.get(&descriptor.name) {
            if let Some(field) = first_difference(existing, &descriptor) {
                warn!(
                    provider = %descriptor.name,
                    field,
                    "Rejected conflicting provider registration"
                );
                return Err(RegistryError::conflict(descriptor.name, field));
            }
            debug!(provider = %descriptor.name, "Provider already registered");
            return Ok(Arc::clone(existing));
        }

        info!(
            provider = %descriptor.name,
            tier = %descriptor.trust_tier,
            key = %descriptor.key_fingerprint(),
            "Registered provider"
        );
        let descriptor = Arc::new(descriptor);
        providers.insert(descriptor.name.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ProviderDescriptor>, RegistryError> {
        self.providers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

fn first_difference(a: &ProviderDescriptor, b: &ProviderDescriptor) -> Option<&'static str> {
    if a.public_key != b.public_key {
        Some("public key")
    } else if a.base_location != b.base_location {
        Some("base location")
    } else if a.trust_tier != b.trust_tier {
        Some("trust tier")
    } else if a.policy != b.policy {
        Some("policy")
    } else {
        None
    }
}
