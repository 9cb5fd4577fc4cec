use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::provider::Provider;
use crate::types::ProviderKind;

/// Read-mostly name → adapter map.
///
/// Built at startup; admin-driven changes swap the whole snapshot, so the
/// hot path never takes a lock.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: ArcSwap<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_providers(providers: Vec<Arc<dyn Provider>>) -> Self {
        let registry = Self::new();
        registry.replace(providers);
        registry
    }

    /// Swap in a full new provider set (admin updates rebuild, not mutate).
    pub fn replace(&self, providers: Vec<Arc<dyn Provider>>) {
        let mut map: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for provider in providers {
            map.insert(provider.name().to_string(), provider);
        }
        self.providers.store(Arc::new(map));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.load().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        let mut providers: Vec<_> = self.providers.load().values().cloned().collect();
        providers.sort_by(|a, b| a.name().cmp(b.name()));
        providers
    }

    /// First provider of the given kind that exposes the native passthrough
    /// capability, by name order. Passthrough selects by type, not name.
    pub fn first_native_of_kind(&self, kind: ProviderKind) -> Option<Arc<dyn Provider>> {
        self.all()
            .into_iter()
            .find(|p| p.kind() == kind && p.native().is_some())
    }
}
