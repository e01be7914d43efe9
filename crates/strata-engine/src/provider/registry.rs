use std::collections::HashMap;
use std::sync::Arc;

use super::ResourceProvider;

/// Package name → provider instance.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, package: impl Into<String>, provider: Arc<dyn ResourceProvider>) {
        let package = package.into();
        tracing::debug!(package = %package, "provider registered");
        self.providers.insert(package, provider);
    }

    pub fn with(mut self, package: impl Into<String>, provider: Arc<dyn ResourceProvider>) -> Self {
        self.register(package, provider);
        self
    }

    pub fn get(&self, package: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(package).cloned()
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut packages: Vec<&str> = self.packages().collect();
        packages.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("packages", &packages)
            .finish()
    }
}
