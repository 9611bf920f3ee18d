use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PluginError;
use crate::source::Source;

/// Process-wide registry of discovery plugins, keyed by plugin id.
///
/// Populated once at process start and read-only thereafter (no interior
/// mutability once wrapped in `Arc`). Registration is idempotent by id:
/// registering the same id twice replaces the earlier entry.
pub struct PluginRegistry {
    sources: HashMap<String, Arc<dyn Source>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { sources: HashMap::new() }
    }

    /// Register a plugin. Returns `&mut self` for chaining. Last write for
    /// a given id wins.
    pub fn register(&mut self, source: Arc<dyn Source>) -> &mut Self {
        let id = source.meta().id.clone();
        self.sources.insert(id, source);
        self
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Source>, PluginError> {
        self.sources.get(id).cloned().ok_or_else(|| PluginError::NotRegistered(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{DiscoverContext, DiscoverResult, PluginMeta};
    use async_trait::async_trait;

    struct Stub(PluginMeta);

    impl Stub {
        fn named(id: &str) -> Self {
            Stub(PluginMeta {
                id: id.to_string(),
                name: id.to_string(),
                description: String::new(),
                category: "test".to_string(),
                config_spec: serde_json::json!({}),
            })
        }
    }

    #[async_trait]
    impl Source for Stub {
        fn meta(&self) -> &PluginMeta {
            &self.0
        }

        fn validate(&self, raw: &serde_json::Value) -> Result<serde_json::Value, PluginError> {
            Ok(raw.clone())
        }

        async fn discover(&self, _ctx: DiscoverContext, _cfg: &serde_json::Value) -> Result<DiscoverResult, PluginError> {
            Ok(DiscoverResult::default())
        }
    }

    #[test]
    fn unregistered_id_is_not_registered_error() {
        let registry = PluginRegistry::new();
        assert!(matches!(registry.get("missing"), Err(PluginError::NotRegistered(_))));
    }

    #[test]
    fn register_is_idempotent_by_id_last_write_wins() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Stub::named("manifest")));
        registry.register(Arc::new(Stub::named("manifest")));
        assert_eq!(registry.ids().len(), 1);
    }

    #[test]
    fn registered_plugin_is_retrievable() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Stub::named("manifest")));
        assert!(registry.get("manifest").is_ok());
    }
}
