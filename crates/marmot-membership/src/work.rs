use marmot_domain::{Asset, RuleId};

/// A single unit of membership work, per spec.md 4.E.
#[derive(Debug, Clone)]
pub enum WorkItem {
    EvaluateAssetAgainstAllRules(Box<Asset>),
    EvaluateRuleAgainstAllAssets(RuleId),
}
