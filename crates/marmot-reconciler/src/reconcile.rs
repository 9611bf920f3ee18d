use std::sync::Arc;
use std::time::Duration;

use marmot_membership::MembershipHandle;
use marmot_store::{AdvisoryLock, RuleRepository};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ReconcileError;
use crate::report::{ReconcileReport, ReconcileRequest};

/// Default sweep interval, per spec.md 4.F.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub struct ReconcilerConfig {
    pub name: String,
    pub holder: String,
    pub interval: Duration,
}

impl ReconcilerConfig {
    pub fn new(name: impl Into<String>, holder: impl Into<String>) -> Self {
        Self { name: name.into(), holder: holder.into(), interval: DEFAULT_SWEEP_INTERVAL }
    }
}

/// One full sweep: acquire the advisory lock, enqueue `EvaluateRule` for
/// every enabled rule, wait for the membership service to drain, release.
pub async fn reconcile(
    request: &ReconcileRequest,
    lock: &dyn AdvisoryLock,
    lock_name: &str,
    holder: &str,
    rules: &dyn RuleRepository,
    membership: &MembershipHandle,
) -> Result<Option<ReconcileReport>, ReconcileError> {
    if !lock.try_acquire(lock_name, holder).await? {
        return Ok(None);
    }

    let result = sweep(request, rules, membership).await;
    lock.release(lock_name, holder).await?;
    result.map(Some)
}

async fn sweep(
    request: &ReconcileRequest,
    rules: &dyn RuleRepository,
    membership: &MembershipHandle,
) -> Result<ReconcileReport, ReconcileError> {
    let mut report = ReconcileReport::new(request.kind);
    let enabled = rules.list_enabled().await?;

    for rule in enabled {
        loop {
            match membership.try_evaluate_rule(rule.id) {
                Ok(()) => {
                    report.rules_swept += 1;
                    break;
                }
                Err(marmot_membership::EnqueueError::QueueFull) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                Err(e) => {
                    report.errors.push(format!("rule {}: {e}", rule.id));
                    break;
                }
            }
        }
    }

    membership.drain().await;
    Ok(report)
}

/// Spawns the periodic background loop. Stops when `cancel` is dropped or
/// triggered — the task exits its current sleep at the next interval tick
/// check, matching the cooperative-shutdown shape used elsewhere in this
/// workspace (`tokio_util::sync::CancellationToken`).
pub fn spawn(
    config: ReconcilerConfig,
    lock: Arc<dyn AdvisoryLock>,
    rules: Arc<dyn RuleRepository>,
    membership: MembershipHandle,
    cancel: tokio_util::sync::CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.tick().await; // first tick fires immediately; skip so we don't sweep at startup

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(reconciler = %config.name, "reconciler shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let request = ReconcileRequest { kind: membership.kind() };
            match reconcile(&request, lock.as_ref(), &config.name, &config.holder, rules.as_ref(), &membership).await {
                Ok(Some(report)) => {
                    if report.errors.is_empty() {
                        info!(reconciler = %config.name, rules_swept = report.rules_swept, "reconcile sweep complete");
                    } else {
                        warn!(reconciler = %config.name, rules_swept = report.rules_swept, errors = ?report.errors, "reconcile sweep completed with errors");
                    }
                }
                Ok(None) => {
                    info!(reconciler = %config.name, "lock held by another replica, skipping this interval");
                }
                Err(e) => {
                    warn!(reconciler = %config.name, error = %e, "reconcile sweep failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marmot_domain::{MarmotError, RuleCore, RuleId, RuleKind};
    use marmot_store::InMemoryStore;

    fn fresh_rule(name: &str) -> RuleCore {
        let now = chrono::Utc::now();
        RuleCore {
            id: RuleId::new(),
            owner_entity_id: "owner".to_string(),
            name: name.to_string(),
            query_expression: "type = 'table'".to_string(),
            priority: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    struct AlwaysBusyLock;

    #[async_trait]
    impl AdvisoryLock for AlwaysBusyLock {
        async fn try_acquire(&self, _name: &str, _holder: &str) -> Result<bool, MarmotError> {
            Ok(false)
        }
        async fn release(&self, _name: &str, _holder: &str) -> Result<(), MarmotError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn skips_the_sweep_when_the_lock_is_held_elsewhere() {
        let store = InMemoryStore::new();
        store.seed_rule(RuleKind::AssetRule, fresh_rule("r1")).await;
        let rules = store.rule_repository(RuleKind::AssetRule);
        let memberships: Arc<dyn marmot_store::MembershipRepository> = Arc::new(store.clone());
        let assets: Arc<dyn marmot_store::AssetRepository> = Arc::new(store.clone());

        let mut config = marmot_membership::MembershipServiceConfig::new(RuleKind::AssetRule);
        config.workers = 1;
        let (handle, _workers) = marmot_membership::spawn(config, rules.clone(), memberships, assets);

        let request = ReconcileRequest { kind: RuleKind::AssetRule };
        let report = reconcile(&request, &AlwaysBusyLock, "recon", "holder-1", rules.as_ref(), &handle).await.unwrap();
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn sweeps_every_enabled_rule_and_waits_for_drain() {
        let store = InMemoryStore::new();
        let rule = fresh_rule("r1");
        store.seed_rule(RuleKind::AssetRule, rule.clone()).await;
        let rules = store.rule_repository(RuleKind::AssetRule);
        let memberships: Arc<dyn marmot_store::MembershipRepository> = Arc::new(store.clone());
        let assets_repo: Arc<dyn marmot_store::AssetRepository> = Arc::new(store.clone());

        let asset =
            marmot_domain::Asset::fresh(marmot_domain::Mrn::new("mrn://pg/db/orders"), "orders", marmot_domain::AssetType::new("table"));
        assets_repo.upsert(&asset).await.unwrap();

        let mut config = marmot_membership::MembershipServiceConfig::new(RuleKind::AssetRule);
        config.workers = 1;
        let (handle, _workers) = marmot_membership::spawn(config, rules.clone(), memberships.clone(), assets_repo);

        let lock = Arc::new(store.clone()) as Arc<dyn AdvisoryLock>;
        let request = ReconcileRequest { kind: RuleKind::AssetRule };
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            reconcile(&request, lock.as_ref(), "recon", "holder-1", rules.as_ref(), &handle),
        )
        .await
        .expect("reconcile timed out")
        .unwrap()
        .expect("lock should have been free");

        assert_eq!(report.rules_swept, 1);
        assert!(report.errors.is_empty());
        let members = memberships.members_of_rule(rule.id).await.unwrap();
        assert_eq!(members, vec![asset.id]);
    }
}
