use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marmot_domain::{
    Asset, AssetId, LineageEdge, MarmotError, Membership, Mrn, Notification, NotificationId,
    NotificationKind, NotificationPreference, PipelineRun, PipelineSchedule, RuleId, RuleKind,
    RunId, RunStatus, RunSummary, ScheduleId, Statistic, UserId, WebhookDelivery, WebhookId,
    WebhookSubscription,
};
use uuid::Uuid;

/// Owns Asset rows exclusively; `upsert` merges by `mrn` per the §3
/// invariant and bumps `updated_at` without touching `created_at`.
#[async_trait]
pub trait AssetRepository: Send + Sync + 'static {
    async fn upsert(&self, asset: &Asset) -> Result<Asset, MarmotError>;
    async fn get(&self, id: AssetId) -> Result<Option<Asset>, MarmotError>;
    async fn get_by_mrn(&self, mrn: &Mrn) -> Result<Option<Asset>, MarmotError>;
    async fn list(&self) -> Result<Vec<Asset>, MarmotError>;
    async fn list_page(&self, offset: u64, limit: u64) -> Result<Vec<Asset>, MarmotError>;
    async fn delete(&self, id: AssetId) -> Result<(), MarmotError>;
}

/// Owns `asset_lineage` rows; feeds `marmot-graph`'s in-memory index.
#[async_trait]
pub trait LineageRepository: Send + Sync + 'static {
    async fn insert_edges(&self, edges: &[LineageEdge]) -> Result<(), MarmotError>;
    async fn insert_statistics(&self, stats: &[Statistic]) -> Result<(), MarmotError>;
    async fn list_edges(&self) -> Result<Vec<LineageEdge>, MarmotError>;
}

/// `pipeline_schedules` + `pipeline_runs`, per spec.md 4.G. The scheduler
/// holds temporary leases only; it never deletes rows it doesn't own.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    async fn create_schedule(&self, schedule: &PipelineSchedule) -> Result<(), MarmotError>;
    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<PipelineSchedule>, MarmotError>;
    async fn list_schedules(&self) -> Result<Vec<PipelineSchedule>, MarmotError>;

    /// `SELECT ... FOR UPDATE SKIP LOCKED` claim, exactly per spec.md 4.G —
    /// at most `limit` rows where `enabled AND next_run_at <= now AND
    /// (lease_owner IS NULL OR lease_expires_at < now)`.
    async fn claim_due_schedules(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease_duration: chrono::Duration,
        limit: u32,
    ) -> Result<Vec<PipelineSchedule>, MarmotError>;

    /// Extends the lease iff `lease_owner` still matches `owner`; otherwise
    /// `ErrorKind::LeaseLost`.
    async fn renew_lease(
        &self,
        schedule_id: ScheduleId,
        owner: &str,
        ext: chrono::Duration,
    ) -> Result<(), MarmotError>;

    async fn set_next_run_at(&self, schedule_id: ScheduleId, next_run_at: DateTime<Utc>) -> Result<(), MarmotError>;
    async fn clear_lease(&self, schedule_id: ScheduleId) -> Result<(), MarmotError>;

    async fn create_run(&self, run: &PipelineRun) -> Result<(), MarmotError>;
    async fn get_run(&self, id: RunId) -> Result<Option<PipelineRun>, MarmotError>;

    /// Only transitions a run out of `running`; a run claimed by a lease
    /// that has since been lost fails this with `ErrorKind::LeaseLost`.
    async fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        summary: Option<RunSummary>,
        error_message: Option<String>,
    ) -> Result<(), MarmotError>;

    async fn start_run(&self, run_id: RunId) -> Result<(), MarmotError>;
}

/// Shared by Data-Product and Asset-Rule storage; `kind` scopes rows to
/// one of the two services sharing the `rules` table.
#[async_trait]
pub trait RuleRepository: Send + Sync + 'static {
    fn kind(&self) -> RuleKind;
    async fn list_enabled(&self) -> Result<Vec<marmot_domain::RuleCore>, MarmotError>;
    async fn get(&self, id: RuleId) -> Result<Option<marmot_domain::RuleCore>, MarmotError>;
}

/// A single delta to apply to the `rule_memberships` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipDelta {
    Add { rule_id: RuleId, asset_id: AssetId },
    Remove { rule_id: RuleId, asset_id: AssetId },
}

/// Exclusively owned by the membership services (§3 ownership).
#[async_trait]
pub trait MembershipRepository: Send + Sync + 'static {
    async fn members_of_rule(&self, rule_id: RuleId) -> Result<Vec<AssetId>, MarmotError>;
    async fn rules_of_asset(&self, asset_id: AssetId) -> Result<Vec<RuleId>, MarmotError>;

    /// One transactional upsert-many + delete-many, per spec.md 4.E. Adds
    /// that violate the asset FK (asset vanished mid-flush) are reported
    /// back so the caller can drop-and-retry once.
    async fn flush_deltas(&self, deltas: &[MembershipDelta]) -> Result<Vec<Membership>, MarmotError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync + 'static {
    async fn create(&self, notification: &Notification) -> Result<(), MarmotError>;
    async fn get(&self, id: NotificationId) -> Result<Option<Notification>, MarmotError>;

    /// Single batched lookup — per spec.md 4.D "consulted in batch (single
    /// query for a window)" — rather than one query per user.
    async fn preferences_for(
        &self,
        user_ids: &[UserId],
        kind: NotificationKind,
    ) -> Result<Vec<NotificationPreference>, MarmotError>;
}

#[async_trait]
pub trait WebhookRepository: Send + Sync + 'static {
    async fn get_subscription(&self, id: WebhookId) -> Result<Option<WebhookSubscription>, MarmotError>;
    async fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>, MarmotError>;
    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), MarmotError>;
    async fn deliveries_for_event(&self, event_id: Uuid) -> Result<Vec<WebhookDelivery>, MarmotError>;
}

/// Process-wide advisory lock used by `marmot-reconciler` to guarantee only
/// one replica sweeps a given rule kind at a time (spec.md 4.F).
#[async_trait]
pub trait AdvisoryLock: Send + Sync + 'static {
    /// Attempts to acquire the lock named `name`; `Ok(false)` means another
    /// holder already has it (not an error — the caller logs and retries
    /// next interval).
    async fn try_acquire(&self, name: &str, holder: &str) -> Result<bool, MarmotError>;
    async fn release(&self, name: &str, holder: &str) -> Result<(), MarmotError>;
}
