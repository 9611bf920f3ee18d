use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use marmot_domain::{
    Asset, AssetId, LineageEdge, MarmotError, Membership, Mrn, Notification, NotificationId,
    NotificationKind, NotificationPreference, PipelineRun, PipelineSchedule, RuleCore, RuleId,
    RuleKind, RunId, RunStatus, RunSummary, ScheduleId, Statistic, UserId, WebhookDelivery,
    WebhookId, WebhookSubscription,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::repo::{
    AdvisoryLock, AssetRepository, LineageRepository, MembershipDelta, MembershipRepository,
    NotificationRepository, RuleRepository, ScheduleStore, WebhookRepository,
};

#[derive(Default)]
struct Inner {
    assets: HashMap<AssetId, Asset>,
    assets_by_mrn: HashMap<Mrn, AssetId>,
    lineage: Vec<LineageEdge>,
    statistics: Vec<Statistic>,
    schedules: HashMap<ScheduleId, PipelineSchedule>,
    runs: HashMap<RunId, PipelineRun>,
    rules: HashMap<RuleId, (RuleKind, RuleCore)>,
    memberships: HashMap<(RuleId, AssetId), Membership>,
    notifications: HashMap<NotificationId, Notification>,
    preferences: Vec<NotificationPreference>,
    webhooks: HashMap<WebhookId, WebhookSubscription>,
    deliveries: Vec<WebhookDelivery>,
    locks: HashMap<String, String>,
}

/// In-memory backing store used by tests and local bootstrap. All data is
/// lost on process exit.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a rule directly, bypassing any rule-CRUD surface (none of
    /// which this crate owns — rule authoring lives above `marmot-store`).
    pub async fn seed_rule(&self, kind: RuleKind, rule: RuleCore) {
        self.inner.write().await.rules.insert(rule.id, (kind, rule));
    }

    /// Returns a `RuleRepository` scoped to `kind`, sharing this store's
    /// backing map. Call once per membership service at startup.
    pub fn rule_repository(&self, kind: RuleKind) -> Arc<dyn RuleRepository> {
        Arc::new(MemoryRuleRepository { inner: self.inner.clone(), kind })
    }
}

#[async_trait]
impl AssetRepository for InMemoryStore {
    async fn upsert(&self, asset: &Asset) -> Result<Asset, MarmotError> {
        let mut guard = self.inner.write().await;
        if let Some(existing_id) = guard.assets_by_mrn.get(&asset.mrn).copied() {
            let mut merged = asset.clone();
            let existing = guard.assets.get(&existing_id).expect("indexed asset must exist");
            merged.id = existing_id;
            merged.created_at = existing.created_at;
            merged.updated_at = Utc::now();
            guard.assets.insert(existing_id, merged.clone());
            Ok(merged)
        } else {
            guard.assets_by_mrn.insert(asset.mrn.clone(), asset.id);
            guard.assets.insert(asset.id, asset.clone());
            Ok(asset.clone())
        }
    }

    async fn get(&self, id: AssetId) -> Result<Option<Asset>, MarmotError> {
        Ok(self.inner.read().await.assets.get(&id).cloned())
    }

    async fn get_by_mrn(&self, mrn: &Mrn) -> Result<Option<Asset>, MarmotError> {
        let guard = self.inner.read().await;
        Ok(guard.assets_by_mrn.get(mrn).and_then(|id| guard.assets.get(id)).cloned())
    }

    async fn list(&self) -> Result<Vec<Asset>, MarmotError> {
        Ok(self.inner.read().await.assets.values().cloned().collect())
    }

    async fn list_page(&self, offset: u64, limit: u64) -> Result<Vec<Asset>, MarmotError> {
        let guard = self.inner.read().await;
        let mut all: Vec<Asset> = guard.assets.values().cloned().collect();
        all.sort_by_key(|a| a.id.0);
        Ok(all.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn delete(&self, id: AssetId) -> Result<(), MarmotError> {
        let mut guard = self.inner.write().await;
        if let Some(asset) = guard.assets.remove(&id) {
            guard.assets_by_mrn.remove(&asset.mrn);
        }
        Ok(())
    }
}

#[async_trait]
impl LineageRepository for InMemoryStore {
    async fn insert_edges(&self, edges: &[LineageEdge]) -> Result<(), MarmotError> {
        self.inner.write().await.lineage.extend_from_slice(edges);
        Ok(())
    }

    async fn insert_statistics(&self, stats: &[Statistic]) -> Result<(), MarmotError> {
        self.inner.write().await.statistics.extend_from_slice(stats);
        Ok(())
    }

    async fn list_edges(&self) -> Result<Vec<LineageEdge>, MarmotError> {
        Ok(self.inner.read().await.lineage.clone())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn create_schedule(&self, schedule: &PipelineSchedule) -> Result<(), MarmotError> {
        self.inner.write().await.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<PipelineSchedule>, MarmotError> {
        Ok(self.inner.read().await.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<PipelineSchedule>, MarmotError> {
        Ok(self.inner.read().await.schedules.values().cloned().collect())
    }

    async fn claim_due_schedules(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease_duration: Duration,
        limit: u32,
    ) -> Result<Vec<PipelineSchedule>, MarmotError> {
        let mut guard = self.inner.write().await;
        let mut claimed = Vec::new();

        let due_ids: Vec<ScheduleId> = guard
            .schedules
            .values()
            .filter(|s| {
                s.enabled
                    && s.next_run_at <= now
                    && (s.lease_owner.is_none() || s.lease_expires_at.is_some_and(|exp| exp < now))
            })
            .map(|s| s.id)
            .take(limit as usize)
            .collect();

        for id in due_ids {
            if let Some(s) = guard.schedules.get_mut(&id) {
                s.lease_owner = Some(owner.to_string());
                s.lease_expires_at = Some(now + lease_duration);
                claimed.push(s.clone());
            }
        }

        Ok(claimed)
    }

    async fn renew_lease(&self, schedule_id: ScheduleId, owner: &str, ext: Duration) -> Result<(), MarmotError> {
        let mut guard = self.inner.write().await;
        let schedule = guard
            .schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| MarmotError::not_found(format!("schedule {schedule_id} not found")))?;
        if schedule.lease_owner.as_deref() != Some(owner) {
            return Err(MarmotError::lease_lost(format!("schedule {schedule_id} lease no longer held by {owner}")));
        }
        schedule.lease_expires_at = Some(Utc::now() + ext);
        Ok(())
    }

    async fn set_next_run_at(&self, schedule_id: ScheduleId, next_run_at: DateTime<Utc>) -> Result<(), MarmotError> {
        let mut guard = self.inner.write().await;
        if let Some(s) = guard.schedules.get_mut(&schedule_id) {
            s.next_run_at = next_run_at;
        }
        Ok(())
    }

    async fn clear_lease(&self, schedule_id: ScheduleId) -> Result<(), MarmotError> {
        let mut guard = self.inner.write().await;
        if let Some(s) = guard.schedules.get_mut(&schedule_id) {
            s.lease_owner = None;
            s.lease_expires_at = None;
        }
        Ok(())
    }

    async fn create_run(&self, run: &PipelineRun) -> Result<(), MarmotError> {
        self.inner.write().await.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<PipelineRun>, MarmotError> {
        Ok(self.inner.read().await.runs.get(&id).cloned())
    }

    async fn start_run(&self, run_id: RunId) -> Result<(), MarmotError> {
        let mut guard = self.inner.write().await;
        let run = guard.runs.get_mut(&run_id).ok_or_else(|| MarmotError::not_found(format!("run {run_id} not found")))?;
        run.start()?;
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        summary: Option<RunSummary>,
        error_message: Option<String>,
    ) -> Result<(), MarmotError> {
        let mut guard = self.inner.write().await;
        let run = guard.runs.get_mut(&run_id).ok_or_else(|| MarmotError::not_found(format!("run {run_id} not found")))?;
        if run.status != RunStatus::Running {
            return Err(MarmotError::lease_lost(format!("run {run_id} is no longer running (status={})", run.status)));
        }
        match status {
            RunStatus::Completed => run.complete(summary.unwrap_or_default())?,
            RunStatus::Failed => run.fail(error_message.unwrap_or_default())?,
            RunStatus::Cancelled => run.cancel()?,
            other => return Err(MarmotError::validation(format!("complete_run called with non-terminal status {other}"))),
        }
        Ok(())
    }
}

/// Scopes rule reads to one of the two kinds sharing the `rules` map, per
/// spec.md 4.E. `InMemoryStore::rule_repository` hands out one per kind.
pub struct MemoryRuleRepository {
    inner: Arc<RwLock<Inner>>,
    kind: RuleKind,
}

#[async_trait]
impl RuleRepository for MemoryRuleRepository {
    fn kind(&self) -> RuleKind {
        self.kind
    }

    async fn list_enabled(&self) -> Result<Vec<RuleCore>, MarmotError> {
        Ok(self
            .inner
            .read()
            .await
            .rules
            .values()
            .filter(|(kind, r)| *kind == self.kind && r.enabled)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn get(&self, id: RuleId) -> Result<Option<RuleCore>, MarmotError> {
        Ok(self
            .inner
            .read()
            .await
            .rules
            .get(&id)
            .filter(|(kind, _)| *kind == self.kind)
            .map(|(_, r)| r.clone()))
    }
}

#[async_trait]
impl MembershipRepository for InMemoryStore {
    async fn members_of_rule(&self, rule_id: RuleId) -> Result<Vec<AssetId>, MarmotError> {
        let guard = self.inner.read().await;
        Ok(guard.memberships.keys().filter(|(r, _)| *r == rule_id).map(|(_, a)| *a).collect())
    }

    async fn rules_of_asset(&self, asset_id: AssetId) -> Result<Vec<RuleId>, MarmotError> {
        let guard = self.inner.read().await;
        Ok(guard.memberships.keys().filter(|(_, a)| *a == asset_id).map(|(r, _)| *r).collect())
    }

    async fn flush_deltas(&self, deltas: &[MembershipDelta]) -> Result<Vec<Membership>, MarmotError> {
        let mut guard = self.inner.write().await;
        let mut applied = Vec::new();
        for delta in deltas {
            match delta {
                MembershipDelta::Add { rule_id, asset_id } => {
                    if !guard.assets.contains_key(asset_id) {
                        continue; // FK violation: asset vanished; caller retries once.
                    }
                    let m = Membership { rule_id: *rule_id, asset_id: *asset_id, created_at: Utc::now() };
                    guard.memberships.entry((*rule_id, *asset_id)).or_insert_with(|| m.clone());
                    applied.push(m);
                }
                MembershipDelta::Remove { rule_id, asset_id } => {
                    guard.memberships.remove(&(*rule_id, *asset_id));
                }
            }
        }
        Ok(applied)
    }
}

#[async_trait]
impl NotificationRepository for InMemoryStore {
    async fn create(&self, notification: &Notification) -> Result<(), MarmotError> {
        self.inner.write().await.notifications.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get(&self, id: NotificationId) -> Result<Option<Notification>, MarmotError> {
        Ok(self.inner.read().await.notifications.get(&id).cloned())
    }

    async fn preferences_for(
        &self,
        user_ids: &[UserId],
        kind: NotificationKind,
    ) -> Result<Vec<NotificationPreference>, MarmotError> {
        let guard = self.inner.read().await;
        Ok(guard
            .preferences
            .iter()
            .filter(|p| p.kind == kind && user_ids.contains(&p.user_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WebhookRepository for InMemoryStore {
    async fn get_subscription(&self, id: WebhookId) -> Result<Option<WebhookSubscription>, MarmotError> {
        Ok(self.inner.read().await.webhooks.get(&id).cloned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>, MarmotError> {
        Ok(self.inner.read().await.webhooks.values().cloned().collect())
    }

    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), MarmotError> {
        self.inner.write().await.deliveries.push(delivery.clone());
        Ok(())
    }

    async fn deliveries_for_event(&self, event_id: Uuid) -> Result<Vec<WebhookDelivery>, MarmotError> {
        Ok(self.inner.read().await.deliveries.iter().filter(|d| d.event_id == event_id).cloned().collect())
    }
}

#[async_trait]
impl AdvisoryLock for InMemoryStore {
    async fn try_acquire(&self, name: &str, holder: &str) -> Result<bool, MarmotError> {
        let mut guard = self.inner.write().await;
        match guard.locks.get(name) {
            Some(existing) if existing != holder => Ok(false),
            _ => {
                guard.locks.insert(name.to_string(), holder.to_string());
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), MarmotError> {
        let mut guard = self.inner.write().await;
        if guard.locks.get(name).map(String::as_str) == Some(holder) {
            guard.locks.remove(name);
        }
        Ok(())
    }
}

impl InMemoryStore {
    pub async fn insert_webhook(&self, sub: WebhookSubscription) {
        self.inner.write().await.webhooks.insert(sub.id, sub);
    }

    pub async fn set_preference(&self, pref: NotificationPreference) {
        self.inner.write().await.preferences.push(pref);
    }

    pub async fn all_notifications_for_test(&self) -> Vec<Notification> {
        self.inner.read().await.notifications.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_domain::AssetType;

    fn fresh_asset() -> Asset {
        Asset::fresh(Mrn::new("mrn://pg/db/orders"), "orders", AssetType::new("table"))
    }

    #[tokio::test]
    async fn upsert_merges_by_mrn_and_preserves_created_at() {
        let store = InMemoryStore::new();
        let a = fresh_asset();
        let first = store.upsert(&a).await.unwrap();

        let mut changed = a.clone();
        changed.id = AssetId::new(); // caller-supplied id on re-ingest should not matter
        changed.description = Some("now documented".into());
        let second = store.upsert(&changed).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_due_schedules_is_exclusive() {
        let store = InMemoryStore::new();
        let schedule = PipelineSchedule {
            id: ScheduleId::new(),
            name: "nightly".into(),
            plugin_id: "manifest".into(),
            config: Vec::new(),
            cron_expr: "0 0 * * *".into(),
            enabled: true,
            next_run_at: Utc::now() - Duration::seconds(1),
            lease_owner: None,
            lease_expires_at: None,
        };
        store.create_schedule(&schedule).await.unwrap();

        let now = Utc::now();
        let a = store.claim_due_schedules(now, "replica-a", Duration::seconds(30), 1).await.unwrap();
        let b = store.claim_due_schedules(now, "replica-b", Duration::seconds(30), 1).await.unwrap();

        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(a[0].lease_owner.as_deref(), Some("replica-a"));
    }

    #[tokio::test]
    async fn renew_lease_fails_for_wrong_owner() {
        let store = InMemoryStore::new();
        let schedule = PipelineSchedule {
            id: ScheduleId::new(),
            name: "x".into(),
            plugin_id: "manifest".into(),
            config: Vec::new(),
            cron_expr: "* * * * *".into(),
            enabled: true,
            next_run_at: Utc::now(),
            lease_owner: Some("owner-a".into()),
            lease_expires_at: Some(Utc::now() + Duration::seconds(30)),
        };
        store.create_schedule(&schedule).await.unwrap();

        let err = store.renew_lease(schedule.id, "owner-b", Duration::seconds(30)).await.unwrap_err();
        assert_eq!(err.kind, marmot_domain::ErrorKind::LeaseLost);
    }

    #[tokio::test]
    async fn flush_deltas_drops_adds_for_vanished_assets() {
        let store = InMemoryStore::new();
        let applied = store
            .flush_deltas(&[MembershipDelta::Add { rule_id: RuleId::new(), asset_id: AssetId::new() }])
            .await
            .unwrap();
        assert!(applied.is_empty());
    }

    #[tokio::test]
    async fn advisory_lock_is_exclusive() {
        let store = InMemoryStore::new();
        assert!(store.try_acquire("asset-rule-sweep", "replica-a").await.unwrap());
        assert!(!store.try_acquire("asset-rule-sweep", "replica-b").await.unwrap());
        store.release("asset-rule-sweep", "replica-a").await.unwrap();
        assert!(store.try_acquire("asset-rule-sweep", "replica-b").await.unwrap());
    }
}
