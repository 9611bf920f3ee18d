use std::path::PathBuf;

use async_trait::async_trait;
use marmot_config::load_manifest;
use tracing::debug;

use crate::error::PluginError;
use crate::source::{DiscoverContext, DiscoverResult, PluginMeta};
use crate::Source;

/// Reads a static YAML manifest of assets/lineage/statistics from disk.
/// Used for local/dev bootstrap and as the always-registered reference
/// plugin that exercises the framework end-to-end without any network.
pub struct ManifestSource {
    meta: PluginMeta,
}

impl ManifestSource {
    pub fn new() -> Self {
        Self {
            meta: PluginMeta {
                id: "manifest".to_string(),
                name: "Manifest".to_string(),
                description: "Reads assets/lineage/statistics from a static YAML manifest file".to_string(),
                category: "local".to_string(),
                config_spec: serde_json::json!({
                    "type": "object",
                    "required": ["path"],
                    "properties": { "path": { "type": "string" } },
                }),
            },
        }
    }
}

impl Default for ManifestSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for ManifestSource {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn validate(&self, raw: &serde_json::Value) -> Result<serde_json::Value, PluginError> {
        let path = raw
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PluginError::InvalidConfig("missing required field 'path'".to_string()))?;
        Ok(serde_json::json!({ "path": path }))
    }

    async fn discover(&self, ctx: DiscoverContext, cfg: &serde_json::Value) -> Result<DiscoverResult, PluginError> {
        if ctx.is_canceled() {
            return Err(PluginError::Canceled);
        }
        let path = cfg
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PluginError::InvalidConfig("missing required field 'path'".to_string()))?;
        debug!(path, "ManifestSource: discover");
        let doc = load_manifest(&PathBuf::from(path))
            .map_err(|e| PluginError::DiscoverFailed(e.to_string()))?;
        Ok(DiscoverResult { assets: doc.assets, lineage: doc.lineage, statistics: doc.statistics })
    }
}
