use std::time::Instant;

use async_trait::async_trait;
use marmot_domain::{Asset, LineageEdge, Statistic};

use crate::error::PluginError;

/// Static, process-lifetime description of a registered plugin.
#[derive(Debug, Clone)]
pub struct PluginMeta {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    /// JSON Schema-ish description of the config shape `validate` expects,
    /// surfaced to operators; not enforced by the registry itself.
    pub config_spec: serde_json::Value,
}

/// Cooperative cancellation + deadline handed to a running `discover` call.
///
/// The scheduler derives this from a run's lease: `deadline` is set to
/// `lease_expiry - safety margin`. Long-running plugin work should check
/// `is_canceled` (or race against `canceled`) at natural yield points and
/// return `PluginError::Canceled` promptly rather than run past `deadline`.
#[derive(Clone)]
pub struct DiscoverContext {
    pub deadline: Instant,
    canceled: tokio_util::sync::CancellationToken,
}

impl DiscoverContext {
    pub fn new(deadline: Instant, canceled: tokio_util::sync::CancellationToken) -> Self {
        Self { deadline, canceled }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.is_cancelled() || Instant::now() >= self.deadline
    }

    pub async fn cancelled(&self) {
        self.canceled.cancelled().await
    }
}

/// Output of a single `discover` call: what the plugin found this run.
/// The caller (scheduler) is responsible for persisting these via the
/// asset/lineage repositories; `discover` itself never touches storage.
#[derive(Debug, Clone, Default)]
pub struct DiscoverResult {
    pub assets: Vec<Asset>,
    pub lineage: Vec<LineageEdge>,
    pub statistics: Vec<Statistic>,
}

#[async_trait]
pub trait Source: Send + Sync + 'static {
    fn meta(&self) -> &PluginMeta;

    /// Must be pure: no I/O, no mutation. Fails with
    /// `PluginError::InvalidConfig` on structural errors or missing
    /// required fields.
    fn validate(&self, raw: &serde_json::Value) -> Result<serde_json::Value, PluginError>;

    /// May be long-running; must honor `ctx`'s cancellation/deadline and
    /// must not mutate shared state.
    async fn discover(&self, ctx: DiscoverContext, cfg: &serde_json::Value) -> Result<DiscoverResult, PluginError>;
}
