use async_trait::async_trait;
use marmot_domain::{AssetId, RuleId};

/// Notified after a batch of membership deltas for one rule commits.
///
/// Used by the Data-Product service to invalidate caches and by the
/// notification aggregator to raise subscription notifications.
#[async_trait]
pub trait MembershipObserver: Send + Sync + 'static {
    async fn rule_assets_changed(&self, rule_id: RuleId, added: Vec<AssetId>, removed: Vec<AssetId>);
}
