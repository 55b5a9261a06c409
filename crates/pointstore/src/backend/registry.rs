//! Backend resolution by selector.

use crate::backend::{Backend, EmbeddedBackend, MemoryBackend};
use crate::config::{BackendSelector, StoreConfig};
use crate::error::{Result, StoreError};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Builds a backend from the store configuration.
pub type BackendFactory = Box<dyn Fn(&StoreConfig) -> Result<Arc<dyn Backend>> + Send + Sync>;

/// Maps backend selectors to the factories that build them.
///
/// Selectors without a registered factory fail to resolve with
/// `UnsupportedBackend`; there is no silent fallback.
pub struct BackendRegistry {
    factories: HashMap<BackendSelector, BackendFactory>,
}

impl BackendRegistry {
    /// Creates a registry with no adapters.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry holding the builtin adapters.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(BackendSelector::Embedded, |config| {
            Ok(Arc::new(EmbeddedBackend::open(config)?) as Arc<dyn Backend>)
        });
        registry.register(BackendSelector::Memory, |config| {
            Ok(Arc::new(MemoryBackend::new(config)) as Arc<dyn Backend>)
        });
        #[cfg(feature = "sqlite")]
        registry.register(
            BackendSelector::relational(crate::backend::relational::SQLITE_DIALECT),
            |config| Ok(Arc::new(crate::backend::SqliteBackend::open(config)?) as Arc<dyn Backend>),
        );
        registry
    }

    /// Registers `factory` under `selector`, replacing any previous one.
    pub fn register<F>(&mut self, selector: BackendSelector, factory: F)
    where
        F: Fn(&StoreConfig) -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.factories.insert(selector, Box::new(factory));
    }

    /// Returns true if an adapter is registered for `selector`.
    pub fn contains(&self, selector: &BackendSelector) -> bool {
        self.factories.contains_key(selector)
    }

    /// Registered selectors, sorted by their display form.
    pub fn selectors(&self) -> Vec<BackendSelector> {
        let mut selectors: Vec<_> = self.factories.keys().cloned().collect();
        selectors.sort_by_key(|s| s.to_string());
        selectors
    }

    /// Validates `config` and builds the backend it selects.
    pub fn resolve(&self, config: &StoreConfig) -> Result<Arc<dyn Backend>> {
        config.validate()?;
        let factory = self
            .factories
            .get(&config.backend)
            .ok_or_else(|| StoreError::UnsupportedBackend(config.backend.to_string()))?;
        let backend = factory(config)?;
        info!("Resolved backend {}", config.backend);
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("selectors", &self.selectors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_selectors() {
        let registry = BackendRegistry::default();
        assert!(registry.contains(&BackendSelector::Embedded));
        assert!(registry.contains(&BackendSelector::Memory));
        #[cfg(feature = "sqlite")]
        assert!(registry.contains(&BackendSelector::relational("sqlite")));
        assert!(!registry.contains(&BackendSelector::external("influx")));
    }

    #[test]
    fn test_unknown_selector_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::new(temp_dir.path())
            .with_backend(BackendSelector::external("influx"));
        match BackendRegistry::default().resolve(&config) {
            Err(StoreError::UnsupportedBackend(name)) => assert_eq!(name, "external:influx"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("external adapter resolved without registration"),
        }
    }

    #[test]
    fn test_registered_adapter_resolves() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = BackendRegistry::empty();
        registry.register(BackendSelector::external("scratch"), |config| {
            Ok(Arc::new(MemoryBackend::new(config)) as Arc<dyn Backend>)
        });
        let config =
            StoreConfig::new(temp_dir.path()).with_backend(BackendSelector::external("scratch"));
        let backend = registry.resolve(&config).unwrap();
        assert_eq!(backend.selector(), BackendSelector::Memory);
        assert_eq!(registry.selectors(), vec![BackendSelector::external("scratch")]);
    }
}
