use std::time::Duration;

use async_trait::async_trait;
use marmot_domain::{Asset, AssetType, LineageEdge, LineageType, Mrn, Statistic};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::source::{DiscoverContext, DiscoverResult, PluginMeta};
use crate::Source;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls a configured HTTP endpoint that returns a JSON catalog payload
/// shaped like `{ "assets": [...], "lineage": [...], "statistics": [...] }`
/// (the same shape `marmot-config`'s manifest loader produces) and converts
/// it into a `DiscoverResult`.
pub struct HttpCatalogSource {
    meta: PluginMeta,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CatalogAsset {
    mrn: String,
    name: String,
    #[serde(rename = "type")]
    asset_type: String,
    #[serde(default)]
    providers: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CatalogLineageEdge {
    source_mrn: String,
    target_mrn: String,
    #[serde(rename = "type")]
    edge_type: String,
}

#[derive(Debug, Deserialize)]
struct CatalogStatistic {
    asset_mrn: String,
    metric_name: String,
    value: f64,
}

#[derive(Debug, Deserialize, Default)]
struct CatalogPayload {
    #[serde(default)]
    assets: Vec<CatalogAsset>,
    #[serde(default)]
    lineage: Vec<CatalogLineageEdge>,
    #[serde(default)]
    statistics: Vec<CatalogStatistic>,
}

impl HttpCatalogSource {
    pub fn new() -> Self {
        Self {
            meta: PluginMeta {
                id: "http_catalog".to_string(),
                name: "HTTP Catalog".to_string(),
                description: "Polls an HTTP endpoint returning a JSON asset/lineage/statistics catalog".to_string(),
                category: "http".to_string(),
                config_spec: serde_json::json!({
                    "type": "object",
                    "required": ["url"],
                    "properties": {
                        "url": { "type": "string" },
                        "bearer_token": { "type": "string" },
                    },
                }),
            },
            client: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .expect("reqwest client builder with static config never fails"),
        }
    }
}

impl Default for HttpCatalogSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for HttpCatalogSource {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn validate(&self, raw: &serde_json::Value) -> Result<serde_json::Value, PluginError> {
        let url = raw
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PluginError::InvalidConfig("missing required field 'url'".to_string()))?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(PluginError::InvalidConfig(format!("invalid url '{url}': must be http(s)")));
        }

        let mut normalized = serde_json::json!({ "url": url });
        if let Some(token) = raw.get("bearer_token").and_then(|v| v.as_str()) {
            normalized["bearer_token"] = serde_json::Value::String(token.to_string());
        }
        Ok(normalized)
    }

    async fn discover(&self, ctx: DiscoverContext, cfg: &serde_json::Value) -> Result<DiscoverResult, PluginError> {
        let url = cfg
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PluginError::InvalidConfig("missing required field 'url'".to_string()))?;

        if ctx.is_canceled() {
            return Err(PluginError::Canceled);
        }

        debug!(url, "HttpCatalogSource: discover");
        let mut req = self.client.get(url);
        if let Some(token) = cfg.get("bearer_token").and_then(|v| v.as_str()) {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| PluginError::DiscoverFailed(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(PluginError::DiscoverFailed(format!("{url}: http {}", resp.status())));
        }

        let payload: CatalogPayload =
            resp.json().await.map_err(|e| PluginError::DiscoverFailed(format!("decoding {url}: {e}")))?;

        if ctx.is_canceled() {
            return Err(PluginError::Canceled);
        }

        let assets = payload
            .assets
            .into_iter()
            .map(|a| {
                let mut asset = Asset::fresh(Mrn::new(a.mrn), a.name, AssetType::new(a.asset_type));
                asset.providers = a.providers;
                asset.tags = a.tags;
                asset.metadata = a.metadata;
                asset
            })
            .collect();

        let mut lineage = Vec::with_capacity(payload.lineage.len());
        for e in payload.lineage {
            let edge_type = match e.edge_type.as_str() {
                "data_flow" => LineageType::DataFlow,
                "derivation" => LineageType::Derivation,
                "schema_reference" => LineageType::SchemaReference,
                other => {
                    warn!(edge_type = other, "HttpCatalogSource: skipping lineage edge with unknown type");
                    continue;
                }
            };
            lineage.push(LineageEdge { source_mrn: Mrn::new(e.source_mrn), target_mrn: Mrn::new(e.target_mrn), edge_type });
        }

        let statistics = payload
            .statistics
            .into_iter()
            .map(|s| Statistic { asset_mrn: Mrn::new(s.asset_mrn), metric_name: s.metric_name, value: s.value })
            .collect();

        Ok(DiscoverResult { assets, lineage, statistics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_url() {
        let source = HttpCatalogSource::new();
        assert!(source.validate(&serde_json::json!({})).is_err());
    }

    #[test]
    fn validate_rejects_malformed_url() {
        let source = HttpCatalogSource::new();
        assert!(source.validate(&serde_json::json!({ "url": "not a url" })).is_err());
    }

    #[test]
    fn validate_accepts_well_formed_url() {
        let source = HttpCatalogSource::new();
        let normalized = source.validate(&serde_json::json!({ "url": "https://catalog.example/assets" })).unwrap();
        assert_eq!(normalized["url"], "https://catalog.example/assets");
    }
}
