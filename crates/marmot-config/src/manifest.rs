use std::collections::HashMap;
use std::path::Path;

use marmot_domain::{Asset, AssetType, LineageEdge, LineageType, Mrn, Statistic};
use serde::Deserialize;

use crate::error::ConfigError;

/// Raw YAML shape of a single asset entry in a seed manifest.
#[derive(Debug, Deserialize)]
struct RawAsset {
    mrn: String,
    name: String,
    #[serde(rename = "type")]
    asset_type: String,
    #[serde(default)]
    providers: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLineageEdge {
    source_mrn: String,
    target_mrn: String,
    #[serde(rename = "type", default = "default_lineage_type")]
    edge_type: String,
}

fn default_lineage_type() -> String {
    "data_flow".to_string()
}

#[derive(Debug, Deserialize)]
struct RawStatistic {
    asset_mrn: String,
    metric_name: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    assets: Vec<RawAsset>,
    #[serde(default)]
    lineage: Vec<RawLineageEdge>,
    #[serde(default)]
    statistics: Vec<RawStatistic>,
}

/// Assets/lineage/statistics loaded from a static manifest, ready to hand
/// to the asset and lineage repositories.
#[derive(Debug, Default)]
pub struct ManifestDocument {
    pub assets: Vec<Asset>,
    pub lineage: Vec<LineageEdge>,
    pub statistics: Vec<Statistic>,
}

/// Loads a single YAML manifest file, the shape `ManifestSource` reads for
/// local/dev bootstrap and tests.
pub fn load_manifest(path: &Path) -> Result<ManifestDocument, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io { path: path.display().to_string(), source: e })?;
    let raw: RawManifest = serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::YamlParse { path: path.display().to_string(), source: e })?;
    convert(raw, path)
}

fn convert(raw: RawManifest, path: &Path) -> Result<ManifestDocument, ConfigError> {
    let assets = raw
        .assets
        .into_iter()
        .map(|a| {
            let mut asset = Asset::fresh(Mrn::new(a.mrn), a.name, AssetType::new(a.asset_type));
            asset.providers = a.providers;
            asset.tags = a.tags;
            asset.metadata = a.metadata;
            asset.description = a.description;
            asset
        })
        .collect();

    let lineage = raw
        .lineage
        .into_iter()
        .map(|e| {
            let edge_type = match e.edge_type.as_str() {
                "data_flow" => LineageType::DataFlow,
                "derivation" => LineageType::Derivation,
                "schema_reference" => LineageType::SchemaReference,
                other => {
                    return Err(ConfigError::Conversion {
                        path: path.display().to_string(),
                        message: format!("unknown lineage edge type '{other}'"),
                    })
                }
            };
            Ok(LineageEdge { source_mrn: Mrn::new(e.source_mrn), target_mrn: Mrn::new(e.target_mrn), edge_type })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let statistics = raw
        .statistics
        .into_iter()
        .map(|s| Statistic { asset_mrn: Mrn::new(s.asset_mrn), metric_name: s.metric_name, value: s.value })
        .collect();

    Ok(ManifestDocument { assets, lineage, statistics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_assets_lineage_and_statistics() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
assets:
  - mrn: "mrn://pg/db/orders"
    name: orders
    type: table
    tags: [pii]
lineage:
  - source_mrn: "mrn://pg/db/raw_orders"
    target_mrn: "mrn://pg/db/orders"
    type: derivation
statistics:
  - asset_mrn: "mrn://pg/db/orders"
    metric_name: row_count
    value: 1200
"#
        )
        .unwrap();

        let doc = load_manifest(file.path()).unwrap();
        assert_eq!(doc.assets.len(), 1);
        assert_eq!(doc.assets[0].tags, vec!["pii".to_string()]);
        assert_eq!(doc.lineage.len(), 1);
        assert_eq!(doc.statistics[0].value, 1200.0);
    }

    #[test]
    fn unknown_lineage_type_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
lineage:
  - source_mrn: a
    target_mrn: b
    type: bogus
"#
        )
        .unwrap();
        assert!(load_manifest(file.path()).is_err());
    }
}
