use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use marmot_domain::{MarmotError, PipelineRun, PipelineSchedule, RunStatus, RunSummary};
use marmot_plugin::{DiscoverContext, PluginRegistry};
use marmot_store::{AssetRepository, LineageRepository, ScheduleStore};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::crypto::decrypt_config;
use crate::cron_util::next_run_at;
use crate::error::SchedulerError;
use crate::observer::RunObserver;

pub const DEFAULT_MAX_WORKERS: usize = 5;
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LEASE_EXPIRY: Duration = Duration::from_secs(300);
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(15);
const MAX_ERROR_MESSAGE_LEN: usize = 2000;

pub struct SchedulerConfig {
    pub owner_id: String,
    pub max_workers: usize,
    pub scheduler_interval: Duration,
    pub lease_expiry: Duration,
    pub safety_margin: Duration,
    pub encryption_key: Option<[u8; 32]>,
}

impl SchedulerConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            max_workers: DEFAULT_MAX_WORKERS,
            scheduler_interval: DEFAULT_SCHEDULER_INTERVAL,
            lease_expiry: DEFAULT_LEASE_EXPIRY,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            encryption_key: None,
        }
    }

    fn renew_interval(&self) -> Duration {
        self.lease_expiry / 3
    }
}

struct State {
    owner_id: String,
    lease_expiry: Duration,
    safety_margin: Duration,
    encryption_key: Option<[u8; 32]>,
    store: Arc<dyn ScheduleStore>,
    assets: Arc<dyn AssetRepository>,
    lineage: Arc<dyn LineageRepository>,
    plugins: Arc<PluginRegistry>,
    observers: Vec<Arc<dyn RunObserver>>,
}

/// Spawns the ticker + bounded worker pool described in spec.md 4.H.
/// Dropping `cancel` (triggering it) stops claiming new work at the next
/// tick and lets in-flight workers run to completion.
pub fn spawn(
    config: SchedulerConfig,
    store: Arc<dyn ScheduleStore>,
    assets: Arc<dyn AssetRepository>,
    lineage: Arc<dyn LineageRepository>,
    plugins: Arc<PluginRegistry>,
    observers: Vec<Arc<dyn RunObserver>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let renew_interval = config.renew_interval();
    let max_workers = config.max_workers;
    let scheduler_interval = config.scheduler_interval;

    let state = Arc::new(State {
        owner_id: config.owner_id,
        lease_expiry: config.lease_expiry,
        safety_margin: config.safety_margin,
        encryption_key: config.encryption_key,
        store,
        assets,
        lineage,
        plugins,
        observers,
    });

    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut ticker = tokio::time::interval(scheduler_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler shutting down, no longer claiming new schedules");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let free_slots = semaphore.available_permits() as u32;
            if free_slots == 0 {
                continue;
            }

            let lease_duration = chrono::Duration::from_std(state.lease_expiry).unwrap_or(chrono::Duration::seconds(300));
            let claimed = match state.store.claim_due_schedules(Utc::now(), &state.owner_id, lease_duration, free_slots).await {
                Ok(schedules) => schedules,
                Err(e) => {
                    warn!(error = %e, "failed to claim due schedules");
                    continue;
                }
            };

            for schedule in claimed {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
                let state = state.clone();
                let renew_interval = renew_interval;
                tokio::spawn(async move {
                    let _permit = permit;
                    run_schedule(&state, schedule, renew_interval).await;
                });
            }
        }
    })
}

async fn run_schedule(state: &State, schedule: PipelineSchedule, renew_interval: Duration) {
    let run = PipelineRun::new_pending(schedule.name.clone(), "scheduler", Some(schedule.id));
    if let Err(e) = state.store.create_run(&run).await {
        warn!(schedule_id = %schedule.id, error = %e, "failed to create run row");
        return;
    }
    if let Err(e) = state.store.start_run(run.id).await {
        warn!(run_id = %run.id, error = %e, "failed to transition run to running");
        return;
    }

    let outcome = execute(state, &schedule, renew_interval).await;
    finish_run(state, &schedule, run, outcome).await;
}

enum Outcome {
    Success(RunSummary),
    Failed(String),
    Cancelled,
}

async fn execute(state: &State, schedule: &PipelineSchedule, renew_interval: Duration) -> Outcome {
    let cfg_bytes = match &state.encryption_key {
        Some(key) => match decrypt_config(key, &schedule.config) {
            Ok(bytes) => bytes,
            Err(e) => return Outcome::Failed(truncate(e.to_string())),
        },
        None => schedule.config.clone(),
    };

    let raw_cfg: serde_json::Value = match serde_json::from_slice(&cfg_bytes) {
        Ok(v) => v,
        Err(e) => return Outcome::Failed(truncate(format!("invalid config JSON: {e}"))),
    };

    let source = match state.plugins.get(&schedule.plugin_id) {
        Ok(source) => source,
        Err(e) => return Outcome::Failed(truncate(e.to_string())),
    };

    let cfg = match source.validate(&raw_cfg) {
        Ok(cfg) => cfg,
        Err(e) => return Outcome::Failed(truncate(e.to_string())),
    };

    let cancel = CancellationToken::new();
    let deadline = std::time::Instant::now() + state.lease_expiry.saturating_sub(state.safety_margin);
    let ctx = DiscoverContext::new(deadline, cancel.clone());

    let lease_lost = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let renew_task = {
        let store = state.store.clone();
        let owner = state.owner_id.clone();
        let schedule_id = schedule.id;
        let cancel = cancel.clone();
        let lease_lost = lease_lost.clone();
        let ext = chrono::Duration::from_std(state.lease_expiry).unwrap_or(chrono::Duration::seconds(300));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(renew_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if store.renew_lease(schedule_id, &owner, ext).await.is_err() {
                    lease_lost.store(true, std::sync::atomic::Ordering::SeqCst);
                    cancel.cancel();
                    return;
                }
            }
        })
    };

    let result = source.discover(ctx, &cfg).await;
    renew_task.abort();

    if lease_lost.load(std::sync::atomic::Ordering::SeqCst) {
        return Outcome::Cancelled;
    }

    match result {
        Ok(discovered) => {
            for asset in &discovered.assets {
                if let Err(e) = state.assets.upsert(asset).await {
                    return Outcome::Failed(truncate(format!("failed to persist asset {}: {e}", asset.mrn)));
                }
            }
            if let Err(e) = state.lineage.insert_edges(&discovered.lineage).await {
                return Outcome::Failed(truncate(format!("failed to persist lineage: {e}")));
            }
            if let Err(e) = state.lineage.insert_statistics(&discovered.statistics).await {
                return Outcome::Failed(truncate(format!("failed to persist statistics: {e}")));
            }

            let mut by_type: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
            for asset in &discovered.assets {
                *by_type.entry(asset.asset_type.to_string()).or_default() += 1;
            }
            let summary = RunSummary { total_entities: discovered.assets.len() as u64, by_type };
            Outcome::Success(summary)
        }
        Err(marmot_plugin::PluginError::Canceled) => Outcome::Cancelled,
        Err(e) => Outcome::Failed(truncate(e.to_string())),
    }
}

async fn finish_run(state: &State, schedule: &PipelineSchedule, mut run: PipelineRun, outcome: Outcome) {
    let (status, summary, error_message) = match outcome {
        Outcome::Success(summary) => (RunStatus::Completed, Some(summary), None),
        Outcome::Failed(msg) => (RunStatus::Failed, None, Some(msg)),
        Outcome::Cancelled => (RunStatus::Cancelled, None, Some("lease lost".to_string())),
    };

    if let Err(e) = state.store.complete_run(run.id, status, summary.clone(), error_message.clone()).await {
        warn!(run_id = %run.id, error = %e, "failed to record terminal run transition");
        return;
    }

    if status == RunStatus::Completed {
        if let Err(e) = reschedule(state, schedule).await {
            warn!(schedule_id = %schedule.id, error = %e, "failed to reschedule after successful run");
        }
    }

    run.start().ok();
    match status {
        RunStatus::Completed => run.complete(summary.unwrap_or_default()).ok(),
        RunStatus::Failed => run.fail(error_message.unwrap_or_default()).ok(),
        RunStatus::Cancelled => run.cancel().ok(),
        _ => None,
    };

    if run.is_manually_triggered() {
        for observer in &state.observers {
            observer.run_completed(&run).await;
        }
    }
}

async fn reschedule(state: &State, schedule: &PipelineSchedule) -> Result<(), SchedulerError> {
    let next = next_run_at(&schedule.cron_expr, Utc::now())?;
    state.store.set_next_run_at(schedule.id, next).await?;
    state.store.clear_lease(schedule.id).await?;
    Ok(())
}

fn truncate(message: String) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        message
    } else {
        let mut truncated = message;
        truncated.truncate(MAX_ERROR_MESSAGE_LEN);
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marmot_domain::{Asset, AssetType, Mrn};
    use marmot_plugin::{DiscoverResult, PluginError, PluginMeta, Source};
    use marmot_store::InMemoryStore;
    use std::sync::Mutex as StdMutex;

    struct StubSource {
        meta: PluginMeta,
        fail: bool,
    }

    impl StubSource {
        fn named(id: &str, fail: bool) -> Self {
            Self {
                meta: PluginMeta { id: id.to_string(), name: id.to_string(), description: String::new(), category: "test".to_string(), config_spec: serde_json::json!({}) },
                fail,
            }
        }
    }

    #[async_trait]
    impl Source for StubSource {
        fn meta(&self) -> &PluginMeta {
            &self.meta
        }

        fn validate(&self, raw: &serde_json::Value) -> Result<serde_json::Value, PluginError> {
            Ok(raw.clone())
        }

        async fn discover(&self, _ctx: DiscoverContext, _cfg: &serde_json::Value) -> Result<DiscoverResult, PluginError> {
            if self.fail {
                return Err(PluginError::DiscoverFailed("boom".to_string()));
            }
            Ok(DiscoverResult {
                assets: vec![Asset::fresh(Mrn::new("mrn://pg/db/orders"), "orders", AssetType::new("table"))],
                lineage: Vec::new(),
                statistics: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        runs: StdMutex<Vec<RunStatus>>,
    }

    #[async_trait]
    impl RunObserver for RecordingObserver {
        async fn run_completed(&self, run: &PipelineRun) {
            self.runs.lock().unwrap().push(run.status);
        }
    }

    fn fresh_schedule(plugin_id: &str) -> PipelineSchedule {
        PipelineSchedule {
            id: marmot_domain::ScheduleId::new(),
            name: "test-schedule".to_string(),
            plugin_id: plugin_id.to_string(),
            config: b"{}".to_vec(),
            cron_expr: "0 0 * * * *".to_string(),
            enabled: true,
            next_run_at: Utc::now(),
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    fn test_state(store: Arc<InMemoryStore>, plugins: PluginRegistry, observers: Vec<Arc<dyn RunObserver>>) -> State {
        State {
            owner_id: "node-1".to_string(),
            lease_expiry: Duration::from_secs(300),
            safety_margin: Duration::from_secs(15),
            encryption_key: None,
            store: store.clone(),
            assets: store.clone(),
            lineage: store.clone(),
            plugins: Arc::new(plugins),
            observers,
        }
    }

    #[tokio::test]
    async fn successful_run_persists_assets_and_reschedules() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(StubSource::named("manifest", false)));
        let observer = Arc::new(RecordingObserver::default());
        let state = test_state(store.clone(), registry, vec![observer.clone()]);

        let schedule = fresh_schedule("manifest");
        store.create_schedule(&schedule).await.unwrap();

        let run = PipelineRun::new_pending(schedule.name.clone(), "alice", Some(schedule.id));
        store.create_run(&run).await.unwrap();
        store.start_run(run.id).await.unwrap();

        let outcome = execute(&state, &schedule, Duration::from_secs(100)).await;
        finish_run(&state, &schedule, run, outcome).await;

        let persisted = store.get_by_mrn(&Mrn::new("mrn://pg/db/orders")).await.unwrap();
        assert!(persisted.is_some());

        let updated_schedule = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert!(updated_schedule.next_run_at > schedule.next_run_at);
        assert!(updated_schedule.lease_owner.is_none());

        assert_eq!(observer.runs.lock().unwrap().as_slice(), &[RunStatus::Completed]);
    }

    #[tokio::test]
    async fn failing_plugin_marks_run_failed_and_notifies_manual_trigger() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(StubSource::named("manifest", true)));
        let observer = Arc::new(RecordingObserver::default());
        let state = test_state(store.clone(), registry, vec![observer.clone()]);

        let schedule = fresh_schedule("manifest");
        store.create_schedule(&schedule).await.unwrap();

        let run = PipelineRun::new_pending(schedule.name.clone(), "bob", Some(schedule.id));
        store.create_run(&run).await.unwrap();
        store.start_run(run.id).await.unwrap();

        let outcome = execute(&state, &schedule, Duration::from_secs(100)).await;
        finish_run(&state, &schedule, run, outcome).await;

        assert_eq!(observer.runs.lock().unwrap().as_slice(), &[RunStatus::Failed]);
    }

    #[tokio::test]
    async fn system_triggered_run_does_not_notify() {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(StubSource::named("manifest", false)));
        let observer = Arc::new(RecordingObserver::default());
        let state = test_state(store.clone(), registry, vec![observer.clone()]);

        let schedule = fresh_schedule("manifest");
        store.create_schedule(&schedule).await.unwrap();

        let run = PipelineRun::new_pending(schedule.name.clone(), "scheduler", Some(schedule.id));
        store.create_run(&run).await.unwrap();
        store.start_run(run.id).await.unwrap();

        let outcome = execute(&state, &schedule, Duration::from_secs(100)).await;
        finish_run(&state, &schedule, run, outcome).await;

        assert!(observer.runs.lock().unwrap().is_empty());
    }
}
