use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use marmot_domain::{
    Asset, AssetId, LineageEdge, MarmotError, Membership, Mrn, Notification, NotificationId,
    NotificationKind, NotificationPreference, PipelineRun, PipelineSchedule, RuleCore, RuleId,
    RuleKind, RunId, RunStatus, RunSummary, ScheduleId, Statistic, UserId, WebhookDelivery,
    WebhookId, WebhookSubscription,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::map_sqlx;
use crate::repo::{
    AdvisoryLock, AssetRepository, LineageRepository, MembershipDelta, MembershipRepository,
    NotificationRepository, RuleRepository, ScheduleStore, WebhookRepository,
};

// Idempotent DDL — run on every `connect()` rather than via a separate
// migration tool.
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
    id           UUID PRIMARY KEY,
    mrn          TEXT NOT NULL UNIQUE,
    asset        JSONB NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assets_mrn ON assets (mrn);

CREATE TABLE IF NOT EXISTS asset_lineage (
    source_mrn TEXT NOT NULL,
    target_mrn TEXT NOT NULL,
    edge_type  TEXT NOT NULL,
    PRIMARY KEY (source_mrn, target_mrn, edge_type)
);

CREATE TABLE IF NOT EXISTS asset_statistics (
    asset_mrn   TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    value       DOUBLE PRECISION NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (asset_mrn, metric_name)
);

CREATE TABLE IF NOT EXISTS pipeline_schedules (
    id                UUID PRIMARY KEY,
    schedule          JSONB NOT NULL,
    enabled           BOOLEAN NOT NULL,
    next_run_at       TIMESTAMPTZ NOT NULL,
    lease_owner       TEXT,
    lease_expires_at  TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_schedules_due
    ON pipeline_schedules (next_run_at) WHERE enabled;

CREATE TABLE IF NOT EXISTS pipeline_runs (
    id           UUID PRIMARY KEY,
    schedule_id  UUID,
    status       TEXT NOT NULL,
    run          JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_schedule ON pipeline_runs (schedule_id);

CREATE TABLE IF NOT EXISTS rules (
    id    UUID PRIMARY KEY,
    kind  TEXT NOT NULL,
    rule  JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rules_kind_enabled ON rules (kind, ((rule->>'enabled')::boolean));

CREATE TABLE IF NOT EXISTS rule_memberships (
    rule_id    UUID NOT NULL,
    asset_id   UUID NOT NULL REFERENCES assets (id) ON DELETE CASCADE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (rule_id, asset_id)
);

CREATE TABLE IF NOT EXISTS notifications (
    id   UUID PRIMARY KEY,
    body JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS notification_preferences (
    user_id TEXT NOT NULL,
    kind    TEXT NOT NULL,
    enabled BOOLEAN NOT NULL,
    PRIMARY KEY (user_id, kind)
);

CREATE TABLE IF NOT EXISTS webhooks (
    id           UUID PRIMARY KEY,
    subscription JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    subscription_id UUID NOT NULL,
    event_id        UUID NOT NULL,
    attempt_n       INT NOT NULL,
    delivery        JSONB NOT NULL,
    recorded_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (subscription_id, event_id, attempt_n)
);
CREATE INDEX IF NOT EXISTS idx_deliveries_event ON webhook_deliveries (event_id);

CREATE TABLE IF NOT EXISTS advisory_locks (
    name   TEXT PRIMARY KEY,
    holder TEXT NOT NULL
);
"#;

/// Persistent store backed by PostgreSQL. Domain structs round-trip
/// through JSONB columns, with scalar columns pulled out wherever the
/// query needs to filter or order on them (mrn, status, lease columns,
/// kind).
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> Result<Self, MarmotError> {
        let pool = PgPool::connect(url).await.map_err(|e| map_sqlx("postgres connect", e))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), MarmotError> {
        sqlx::query(MIGRATIONS).execute(&self.pool).await.map_err(|e| map_sqlx("migration", e))?;
        Ok(())
    }

    /// Returns a `RuleRepository` scoped to `kind`, sharing this store's
    /// pool. Call once per membership service at startup.
    pub fn rule_repository(&self, kind: RuleKind) -> Arc<dyn RuleRepository> {
        Arc::new(PostgresRuleRepository { pool: self.pool.clone(), kind })
    }

    /// Inserts or replaces a rule row directly; rule authoring lives above
    /// this crate, this exists for seeding in tests and bootstrap.
    pub async fn put_rule(&self, kind: RuleKind, rule: &RuleCore) -> Result<(), MarmotError> {
        let payload = to_json(rule)?;
        sqlx::query("INSERT INTO rules (id, kind, rule) VALUES ($1, $2, $3) ON CONFLICT (id) DO UPDATE SET kind = EXCLUDED.kind, rule = EXCLUDED.rule")
            .bind(rule.id.0)
            .bind(kind.to_string())
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("put rule", e))?;
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<serde_json::Value, MarmotError> {
    serde_json::to_value(v).map_err(|e| MarmotError::validation(format!("serialize: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> Result<T, MarmotError> {
    serde_json::from_value(v).map_err(|e| MarmotError::validation(format!("deserialize: {e}")))
}

#[async_trait]
impl AssetRepository for PostgresStore {
    async fn upsert(&self, asset: &Asset) -> Result<Asset, MarmotError> {
        let json = to_json(asset)?;
        let row: (serde_json::Value,) = sqlx::query_as(
            "INSERT INTO assets (id, mrn, asset, created_at, updated_at)
             VALUES ($1, $2, $3::jsonb, $4, $4)
             ON CONFLICT (mrn) DO UPDATE SET
                asset = jsonb_set(
                    jsonb_set($3::jsonb, '{created_at}', assets.asset->'created_at'),
                    '{id}', to_jsonb(assets.id)
                ),
                updated_at = $4
             RETURNING asset",
        )
        .bind(asset.id.0)
        .bind(asset.mrn.as_str())
        .bind(&json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("upsert asset", e))?;
        from_json(row.0)
    }

    async fn get(&self, id: AssetId) -> Result<Option<Asset>, MarmotError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT asset FROM assets WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get asset", e))?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn get_by_mrn(&self, mrn: &Mrn) -> Result<Option<Asset>, MarmotError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT asset FROM assets WHERE mrn = $1")
            .bind(mrn.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get asset by mrn", e))?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn list(&self) -> Result<Vec<Asset>, MarmotError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as("SELECT asset FROM assets ORDER BY mrn")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("list assets", e))?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    async fn list_page(&self, offset: u64, limit: u64) -> Result<Vec<Asset>, MarmotError> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT asset FROM assets ORDER BY mrn OFFSET $1 LIMIT $2")
                .bind(offset as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx("list assets page", e))?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    async fn delete(&self, id: AssetId) -> Result<(), MarmotError> {
        sqlx::query("DELETE FROM assets WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("delete asset", e))?;
        Ok(())
    }
}

#[async_trait]
impl LineageRepository for PostgresStore {
    async fn insert_edges(&self, edges: &[LineageEdge]) -> Result<(), MarmotError> {
        for edge in edges {
            sqlx::query(
                "INSERT INTO asset_lineage (source_mrn, target_mrn, edge_type) VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(edge.source_mrn.as_str())
            .bind(edge.target_mrn.as_str())
            .bind(format!("{:?}", edge.edge_type))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("insert lineage edge", e))?;
        }
        Ok(())
    }

    async fn insert_statistics(&self, stats: &[Statistic]) -> Result<(), MarmotError> {
        for stat in stats {
            sqlx::query(
                "INSERT INTO asset_statistics (asset_mrn, metric_name, value, recorded_at)
                 VALUES ($1, $2, $3, NOW())
                 ON CONFLICT (asset_mrn, metric_name) DO UPDATE SET value = EXCLUDED.value, recorded_at = NOW()",
            )
            .bind(stat.asset_mrn.as_str())
            .bind(&stat.metric_name)
            .bind(stat.value)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("insert statistic", e))?;
        }
        Ok(())
    }

    async fn list_edges(&self) -> Result<Vec<LineageEdge>, MarmotError> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT source_mrn, target_mrn, edge_type FROM asset_lineage")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx("list lineage edges", e))?;
        rows.into_iter()
            .map(|(source, target, edge_type)| {
                let edge_type = match edge_type.as_str() {
                    "DataFlow" => marmot_domain::LineageType::DataFlow,
                    "Derivation" => marmot_domain::LineageType::Derivation,
                    "SchemaReference" => marmot_domain::LineageType::SchemaReference,
                    other => return Err(MarmotError::validation(format!("unknown lineage edge type '{other}'"))),
                };
                Ok(LineageEdge { source_mrn: Mrn::new(source), target_mrn: Mrn::new(target), edge_type })
            })
            .collect()
    }
}

#[async_trait]
impl ScheduleStore for PostgresStore {
    async fn create_schedule(&self, schedule: &PipelineSchedule) -> Result<(), MarmotError> {
        let json = to_json(schedule)?;
        sqlx::query(
            "INSERT INTO pipeline_schedules (id, schedule, enabled, next_run_at, lease_owner, lease_expires_at)
             VALUES ($1, $2::jsonb, $3, $4, $5, $6)",
        )
        .bind(schedule.id.0)
        .bind(&json)
        .bind(schedule.enabled)
        .bind(schedule.next_run_at)
        .bind(&schedule.lease_owner)
        .bind(schedule.lease_expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("create schedule", e))?;
        Ok(())
    }

    async fn get_schedule(&self, id: ScheduleId) -> Result<Option<PipelineSchedule>, MarmotError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT schedule FROM pipeline_schedules WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get schedule", e))?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn list_schedules(&self) -> Result<Vec<PipelineSchedule>, MarmotError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as("SELECT schedule FROM pipeline_schedules")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("list schedules", e))?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    async fn claim_due_schedules(
        &self,
        now: DateTime<Utc>,
        owner: &str,
        lease_duration: Duration,
        limit: u32,
    ) -> Result<Vec<PipelineSchedule>, MarmotError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("begin claim tx", e))?;

        let rows: Vec<(Uuid, serde_json::Value)> = sqlx::query_as(
            "SELECT id, schedule FROM pipeline_schedules
             WHERE enabled AND next_run_at <= $1
               AND (lease_owner IS NULL OR lease_expires_at < $1)
             ORDER BY next_run_at
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx("claim schedules select", e))?;

        let lease_expires_at = now + lease_duration;
        let mut claimed = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            let mut schedule: PipelineSchedule = from_json(raw)?;
            schedule.lease_owner = Some(owner.to_string());
            schedule.lease_expires_at = Some(lease_expires_at);
            let json = to_json(&schedule)?;

            sqlx::query(
                "UPDATE pipeline_schedules
                 SET lease_owner = $2, lease_expires_at = $3, schedule = $4::jsonb
                 WHERE id = $1",
            )
            .bind(id)
            .bind(owner)
            .bind(lease_expires_at)
            .bind(&json)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("claim schedules update", e))?;
            claimed.push(schedule);
        }

        tx.commit().await.map_err(|e| map_sqlx("commit claim tx", e))?;
        Ok(claimed)
    }

    async fn renew_lease(&self, schedule_id: ScheduleId, owner: &str, ext: Duration) -> Result<(), MarmotError> {
        let new_expiry = Utc::now() + ext;
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("begin renew tx", e))?;

        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT schedule FROM pipeline_schedules WHERE id = $1 AND lease_owner = $2 FOR UPDATE",
        )
        .bind(schedule_id.0)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx("renew lease select", e))?;

        let Some((raw,)) = row else {
            return Err(MarmotError::lease_lost(format!("schedule {schedule_id} lease no longer held by {owner}")));
        };
        let mut schedule: PipelineSchedule = from_json(raw)?;
        schedule.lease_expires_at = Some(new_expiry);
        let json = to_json(&schedule)?;

        sqlx::query("UPDATE pipeline_schedules SET lease_expires_at = $1, schedule = $2::jsonb WHERE id = $3")
            .bind(new_expiry)
            .bind(&json)
            .bind(schedule_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("renew lease update", e))?;

        tx.commit().await.map_err(|e| map_sqlx("commit renew tx", e))?;
        Ok(())
    }

    async fn set_next_run_at(&self, schedule_id: ScheduleId, next_run_at: DateTime<Utc>) -> Result<(), MarmotError> {
        let mut schedule = self
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| MarmotError::not_found(format!("schedule {schedule_id}")))?;
        schedule.next_run_at = next_run_at;
        let json = to_json(&schedule)?;

        sqlx::query("UPDATE pipeline_schedules SET next_run_at = $1, schedule = $2::jsonb WHERE id = $3")
            .bind(next_run_at)
            .bind(&json)
            .bind(schedule_id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("set next_run_at", e))?;
        Ok(())
    }

    async fn clear_lease(&self, schedule_id: ScheduleId) -> Result<(), MarmotError> {
        let mut schedule = self
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| MarmotError::not_found(format!("schedule {schedule_id}")))?;
        schedule.lease_owner = None;
        schedule.lease_expires_at = None;
        let json = to_json(&schedule)?;

        sqlx::query("UPDATE pipeline_schedules SET lease_owner = NULL, lease_expires_at = NULL, schedule = $2::jsonb WHERE id = $1")
            .bind(schedule_id.0)
            .bind(&json)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("clear lease", e))?;
        Ok(())
    }

    async fn create_run(&self, run: &PipelineRun) -> Result<(), MarmotError> {
        let json = to_json(run)?;
        sqlx::query(
            "INSERT INTO pipeline_runs (id, schedule_id, status, run) VALUES ($1, $2, $3, $4::jsonb)",
        )
        .bind(run.id.0)
        .bind(run.schedule_id.map(|s| s.0))
        .bind(run.status.to_string())
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("create run", e))?;
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<PipelineRun>, MarmotError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT run FROM pipeline_runs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get run", e))?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn start_run(&self, run_id: RunId) -> Result<(), MarmotError> {
        let mut run = self.get_run(run_id).await?.ok_or_else(|| MarmotError::not_found(format!("run {run_id}")))?;
        run.start()?;
        let json = to_json(&run)?;
        sqlx::query("UPDATE pipeline_runs SET status = $2, run = $3::jsonb WHERE id = $1 AND status = 'pending'")
            .bind(run_id.0)
            .bind(run.status.to_string())
            .bind(&json)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("start run", e))?;
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        summary: Option<RunSummary>,
        error_message: Option<String>,
    ) -> Result<(), MarmotError> {
        let mut run = self.get_run(run_id).await?.ok_or_else(|| MarmotError::not_found(format!("run {run_id}")))?;

        match status {
            RunStatus::Completed => run.complete(summary.unwrap_or_default())?,
            RunStatus::Failed => run.fail(error_message.unwrap_or_default())?,
            RunStatus::Cancelled => run.cancel()?,
            other => return Err(MarmotError::validation(format!("complete_run called with non-terminal status {other}"))),
        }

        let json = to_json(&run)?;
        let result = sqlx::query(
            "UPDATE pipeline_runs SET status = $2, run = $3::jsonb WHERE id = $1 AND status = 'running'",
        )
        .bind(run_id.0)
        .bind(run.status.to_string())
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("complete run", e))?;

        if result.rows_affected() == 0 {
            return Err(MarmotError::lease_lost(format!("run {run_id} was not in 'running' state when completed")));
        }
        Ok(())
    }
}

/// Scopes rule reads to one of the two kinds sharing the `rules` table
/// (Data-Product vs Asset-Rule), per spec.md 4.E — "two independent
/// instances... share the same design." `PostgresStore::rule_repository`
/// hands out one of these per kind.
pub struct PostgresRuleRepository {
    pool: PgPool,
    kind: RuleKind,
}

#[async_trait]
impl RuleRepository for PostgresRuleRepository {
    fn kind(&self) -> RuleKind {
        self.kind
    }

    async fn list_enabled(&self) -> Result<Vec<RuleCore>, MarmotError> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT rule FROM rules WHERE kind = $1 AND (rule->>'enabled')::boolean")
                .bind(self.kind.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx("list enabled rules", e))?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    async fn get(&self, id: RuleId) -> Result<Option<RuleCore>, MarmotError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT rule FROM rules WHERE id = $1 AND kind = $2")
            .bind(id.0)
            .bind(self.kind.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get rule", e))?;
        row.map(|(v,)| from_json(v)).transpose()
    }
}

#[async_trait]
impl MembershipRepository for PostgresStore {
    async fn members_of_rule(&self, rule_id: RuleId) -> Result<Vec<AssetId>, MarmotError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT asset_id FROM rule_memberships WHERE rule_id = $1")
            .bind(rule_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("members of rule", e))?;
        Ok(rows.into_iter().map(|(id,)| AssetId(id)).collect())
    }

    async fn rules_of_asset(&self, asset_id: AssetId) -> Result<Vec<RuleId>, MarmotError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT rule_id FROM rule_memberships WHERE asset_id = $1")
            .bind(asset_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("rules of asset", e))?;
        Ok(rows.into_iter().map(|(id,)| RuleId(id)).collect())
    }

    async fn flush_deltas(&self, deltas: &[MembershipDelta]) -> Result<Vec<Membership>, MarmotError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("begin flush tx", e))?;
        let mut applied = Vec::new();

        for delta in deltas {
            match delta {
                MembershipDelta::Add { rule_id, asset_id } => {
                    let result = sqlx::query(
                        "INSERT INTO rule_memberships (rule_id, asset_id, created_at)
                         VALUES ($1, $2, NOW())
                         ON CONFLICT (rule_id, asset_id) DO NOTHING",
                    )
                    .bind(rule_id.0)
                    .bind(asset_id.0)
                    .execute(&mut *tx)
                    .await;

                    match result {
                        Ok(_) => applied.push(Membership { rule_id: *rule_id, asset_id: *asset_id, created_at: Utc::now() }),
                        Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => continue, // asset vanished; caller retries once
                        Err(e) => return Err(map_sqlx("flush delta add", e)),
                    }
                }
                MembershipDelta::Remove { rule_id, asset_id } => {
                    sqlx::query("DELETE FROM rule_memberships WHERE rule_id = $1 AND asset_id = $2")
                        .bind(rule_id.0)
                        .bind(asset_id.0)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx("flush delta remove", e))?;
                }
            }
        }

        tx.commit().await.map_err(|e| map_sqlx("commit flush tx", e))?;
        Ok(applied)
    }
}

#[async_trait]
impl NotificationRepository for PostgresStore {
    async fn create(&self, notification: &Notification) -> Result<(), MarmotError> {
        let json = to_json(notification)?;
        sqlx::query("INSERT INTO notifications (id, body) VALUES ($1, $2::jsonb)")
            .bind(notification.id.0)
            .bind(&json)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("create notification", e))?;
        Ok(())
    }

    async fn get(&self, id: NotificationId) -> Result<Option<Notification>, MarmotError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT body FROM notifications WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get notification", e))?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn preferences_for(
        &self,
        user_ids: &[UserId],
        kind: NotificationKind,
    ) -> Result<Vec<NotificationPreference>, MarmotError> {
        let ids: Vec<String> = user_ids.iter().map(|u| u.0.clone()).collect();
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT user_id, enabled FROM notification_preferences WHERE kind = $1 AND user_id = ANY($2)",
        )
        .bind(kind.to_string())
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("batch preferences", e))?;
        Ok(rows.into_iter().map(|(user_id, enabled)| NotificationPreference { user_id: UserId(user_id), kind, enabled }).collect())
    }
}

#[async_trait]
impl WebhookRepository for PostgresStore {
    async fn get_subscription(&self, id: WebhookId) -> Result<Option<WebhookSubscription>, MarmotError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as("SELECT subscription FROM webhooks WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("get webhook subscription", e))?;
        row.map(|(v,)| from_json(v)).transpose()
    }

    async fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>, MarmotError> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as("SELECT subscription FROM webhooks")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx("list webhook subscriptions", e))?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }

    async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<(), MarmotError> {
        let json = to_json(delivery)?;
        sqlx::query(
            "INSERT INTO webhook_deliveries (subscription_id, event_id, attempt_n, delivery)
             VALUES ($1, $2, $3, $4::jsonb)
             ON CONFLICT (subscription_id, event_id, attempt_n) DO UPDATE SET delivery = EXCLUDED.delivery",
        )
        .bind(delivery.subscription_id.0)
        .bind(delivery.event_id)
        .bind(delivery.attempt_n as i32)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("record delivery", e))?;
        Ok(())
    }

    async fn deliveries_for_event(&self, event_id: Uuid) -> Result<Vec<WebhookDelivery>, MarmotError> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT delivery FROM webhook_deliveries WHERE event_id = $1 ORDER BY attempt_n")
                .bind(event_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx("deliveries for event", e))?;
        rows.into_iter().map(|(v,)| from_json(v)).collect()
    }
}

#[async_trait]
impl AdvisoryLock for PostgresStore {
    async fn try_acquire(&self, name: &str, holder: &str) -> Result<bool, MarmotError> {
        let result = sqlx::query("INSERT INTO advisory_locks (name, holder) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("acquire advisory lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), MarmotError> {
        sqlx::query("DELETE FROM advisory_locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("release advisory lock", e))?;
        Ok(())
    }
}

// Postgres-backed scenarios are gated behind `TEST_POSTGRES_URL` — they
// don't run in CI without a live database.
#[cfg(test)]
mod tests {
    use super::*;
    use marmot_domain::AssetType;

    async fn test_store() -> Option<PostgresStore> {
        let url = std::env::var("TEST_POSTGRES_URL").ok()?;
        Some(PostgresStore::connect(&url).await.expect("connect"))
    }

    #[tokio::test]
    #[ignore]
    async fn upsert_asset_is_idempotent_on_mrn() {
        let Some(store) = test_store().await else { return };
        let asset = Asset::fresh(Mrn::new("mrn://pg/db/t1"), "t1", AssetType::new("table"));
        let first = store.upsert(&asset).await.unwrap();
        let second = store.upsert(&asset).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    #[ignore]
    async fn reupsert_on_rediscovery_merges_by_mrn_instead_of_replacing_id() {
        // Every plugin builds a fresh `Asset` (fresh id, fresh timestamps)
        // on each discovery run, so re-ingestion of the same mrn must keep
        // the original row's identity, not adopt the newly-built one.
        let Some(store) = test_store().await else { return };
        let mrn = Mrn::new("mrn://pg/db/t2");
        let first_seen = Asset::fresh(mrn.clone(), "t2", AssetType::new("table"));
        let first = store.upsert(&first_seen).await.unwrap();

        let rediscovered = Asset::fresh(mrn, "t2-renamed", AssetType::new("table"));
        assert_ne!(first_seen.id, rediscovered.id);
        let second = store.upsert(&rediscovered).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.name, "t2-renamed");

        let by_id = store.get(first.id).await.unwrap().expect("row still addressable by its original id");
        assert_eq!(by_id.id, first.id);
        assert_eq!(by_id.name, "t2-renamed");
    }

    #[tokio::test]
    #[ignore]
    async fn claim_due_schedules_under_concurrency() {
        let Some(store) = test_store().await else { return };
        let schedule = PipelineSchedule {
            id: ScheduleId::new(),
            name: "s1".into(),
            plugin_id: "manifest".into(),
            config: Vec::new(),
            cron_expr: "* * * * *".into(),
            enabled: true,
            next_run_at: Utc::now() - Duration::seconds(1),
            lease_owner: None,
            lease_expires_at: None,
        };
        store.create_schedule(&schedule).await.unwrap();

        let now = Utc::now();
        let a = store.claim_due_schedules(now, "a", Duration::seconds(30), 1).await.unwrap();
        let b = store.claim_due_schedules(now, "b", Duration::seconds(30), 1).await.unwrap();
        assert_eq!(a.len() + b.len(), 1);
    }
}
