use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marmot_domain::{Asset, AssetId, MarmotError, RuleId, RuleKind};
use marmot_eval::ExprCache;
use marmot_store::{AssetRepository, MembershipDelta, MembershipRepository, RuleRepository};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::EnqueueError;
use crate::observer::MembershipObserver;
use crate::work::WorkItem;

/// Default worker pool size, per spec.md 4.E.
pub const DEFAULT_WORKERS: usize = 5;
/// Default bounded channel capacity feeding the worker pool.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
/// Default flush batch size.
pub const DEFAULT_BATCH_SIZE: usize = 200;
/// Default flush interval, per spec.md 4.E.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
/// Default page size when paging through all assets for a rule evaluation.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

pub struct MembershipServiceConfig {
    pub kind: RuleKind,
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub page_size: u64,
}

impl MembershipServiceConfig {
    pub fn new(kind: RuleKind) -> Self {
        Self {
            kind,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

struct State {
    kind: RuleKind,
    rules: Arc<dyn RuleRepository>,
    memberships: Arc<dyn MembershipRepository>,
    assets: Arc<dyn AssetRepository>,
    observers: RwLock<Vec<Arc<dyn MembershipObserver>>>,
    expr_cache: ExprCache,
    batch_size: usize,
    flush_interval: Duration,
    page_size: u64,
    pending: AtomicUsize,
    drained: Notify,
}

/// Cheap-to-clone front door used by observer callbacks (asset/rule
/// repositories) and by `marmot-reconciler` to push work onto the queue.
#[derive(Clone)]
pub struct MembershipHandle {
    tx: mpsc::Sender<WorkItem>,
    state: Arc<State>,
}

impl MembershipHandle {
    pub fn kind(&self) -> RuleKind {
        self.state.kind
    }

    pub fn try_evaluate_asset(&self, asset: Asset) -> Result<(), EnqueueError> {
        self.try_send(WorkItem::EvaluateAssetAgainstAllRules(Box::new(asset)))
    }

    pub fn try_evaluate_rule(&self, rule_id: RuleId) -> Result<(), EnqueueError> {
        self.try_send(WorkItem::EvaluateRuleAgainstAllAssets(rule_id))
    }

    fn try_send(&self, item: WorkItem) -> Result<(), EnqueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })?;
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Blocks until every item enqueued so far has been processed and
    /// flushed. Used by `marmot-reconciler` after a full sweep, per
    /// spec.md 4.F ("waits for the membership service's queue to drain
    /// before releasing").
    ///
    /// The waiter is registered (via `enable()`) before `pending` is
    /// checked, so a `notify_waiters()` landing between the check and the
    /// await is never missed — otherwise a worker's last `fetch_sub` could
    /// reach zero and notify between this method's load and its
    /// subscription to the notification, blocking forever.
    pub async fn drain(&self) {
        loop {
            let notified = self.state.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub async fn register_observer(&self, observer: Arc<dyn MembershipObserver>) {
        self.state.observers.write().await.push(observer);
    }
}

/// Spawns the worker pool and returns a handle plus the workers' join
/// handles (join on graceful shutdown after dropping every clone of the
/// handle, which closes the channel).
pub fn spawn(
    config: MembershipServiceConfig,
    rules: Arc<dyn RuleRepository>,
    memberships: Arc<dyn MembershipRepository>,
    assets: Arc<dyn AssetRepository>,
) -> (MembershipHandle, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let rx = Arc::new(Mutex::new(rx));

    let state = Arc::new(State {
        kind: config.kind,
        rules,
        memberships,
        assets,
        observers: RwLock::new(Vec::new()),
        expr_cache: ExprCache::new(),
        batch_size: config.batch_size,
        flush_interval: config.flush_interval,
        page_size: config.page_size,
        pending: AtomicUsize::new(0),
        drained: Notify::new(),
    });

    let mut workers = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        let rx = rx.clone();
        let state = state.clone();
        workers.push(tokio::spawn(worker_loop(id, rx, state)));
    }

    (MembershipHandle { tx, state }, workers)
}

async fn worker_loop(id: usize, rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>, state: Arc<State>) {
    let mut batch: Vec<MembershipDelta> = Vec::new();
    let mut oldest_pending_at: Option<Instant> = None;

    loop {
        let deadline = oldest_pending_at.map(|at| at + state.flush_interval);
        let item = {
            let mut guard = rx.lock().await;
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        item = guard.recv() => item,
                        _ = tokio::time::sleep_until(deadline) => {
                            drop(guard);
                            flush(&state, &mut batch).await;
                            oldest_pending_at = None;
                            continue;
                        }
                    }
                }
                None => guard.recv().await,
            }
        };

        let Some(item) = item else {
            break;
        };

        let result = match &item {
            WorkItem::EvaluateAssetAgainstAllRules(asset) => evaluate_asset(&state, asset).await,
            WorkItem::EvaluateRuleAgainstAllAssets(rule_id) => evaluate_rule(&state, *rule_id).await,
        };

        match result {
            Ok(deltas) => {
                if !deltas.is_empty() {
                    if batch.is_empty() {
                        oldest_pending_at = Some(Instant::now());
                    }
                    batch.extend(deltas);
                }
            }
            Err(e) => warn!(worker = id, kind = %state.kind, error = %e, "membership evaluation failed"),
        }

        if batch.len() >= state.batch_size {
            flush(&state, &mut batch).await;
            oldest_pending_at = None;
        }

        state.pending.fetch_sub(1, Ordering::SeqCst);
        if state.pending.load(Ordering::SeqCst) == 0 {
            state.drained.notify_waiters();
        }
    }

    flush(&state, &mut batch).await;
}

async fn evaluate_asset(state: &State, asset: &Asset) -> Result<Vec<MembershipDelta>, MarmotError> {
    let rules = state.rules.list_enabled().await?;
    let current: HashSet<RuleId> = state.memberships.rules_of_asset(asset.id).await?.into_iter().collect();

    let mut target = HashSet::new();
    for rule in &rules {
        let expr = match state.expr_cache.get(&rule.query_expression) {
            Ok(expr) => expr,
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "skipping rule with malformed query");
                continue;
            }
        };
        if marmot_eval::eval_expr(&expr, asset) {
            target.insert(rule.id);
        }
    }

    Ok(diff_deltas(asset.id, &current, &target))
}

async fn evaluate_rule(state: &State, rule_id: RuleId) -> Result<Vec<MembershipDelta>, MarmotError> {
    let rule = state.rules.get(rule_id).await?;
    let current: HashSet<AssetId> = state.memberships.members_of_rule(rule_id).await?.into_iter().collect();

    let mut target = HashSet::new();
    if let Some(rule) = rule.filter(|r| r.enabled) {
        let expr = state.expr_cache.get(&rule.query_expression).map_err(MarmotError::from)?;
        let mut offset = 0u64;
        loop {
            let page = state.assets.list_page(offset, state.page_size).await?;
            let page_len = page.len() as u64;
            for asset in &page {
                if marmot_eval::eval_expr(&expr, asset) {
                    target.insert(asset.id);
                }
            }
            if page_len < state.page_size {
                break;
            }
            offset += state.page_size;
        }
    }

    let mut deltas = Vec::new();
    for asset_id in target.difference(&current) {
        deltas.push(MembershipDelta::Add { rule_id, asset_id: *asset_id });
    }
    for asset_id in current.difference(&target) {
        deltas.push(MembershipDelta::Remove { rule_id, asset_id: *asset_id });
    }
    Ok(deltas)
}

fn diff_deltas(asset_id: AssetId, current: &HashSet<RuleId>, target: &HashSet<RuleId>) -> Vec<MembershipDelta> {
    let mut deltas = Vec::new();
    for rule_id in target.difference(current) {
        deltas.push(MembershipDelta::Add { rule_id: *rule_id, asset_id });
    }
    for rule_id in current.difference(target) {
        deltas.push(MembershipDelta::Remove { rule_id: *rule_id, asset_id });
    }
    deltas
}

/// Flushes a worker's accumulated batch in one transactional call, per
/// spec.md 4.E. Adds dropped due to a vanished asset FK are retried once;
/// a second drop is logged and abandoned.
async fn flush(state: &State, batch: &mut Vec<MembershipDelta>) {
    if batch.is_empty() {
        return;
    }
    let mut to_flush = std::mem::take(batch);

    for attempt in 0..2 {
        let applied = match state.memberships.flush_deltas(&to_flush).await {
            Ok(applied) => applied,
            Err(e) => {
                warn!(error = %e, "membership flush failed; batch dropped");
                return;
            }
        };
        let applied_adds: HashSet<(RuleId, AssetId)> = applied.iter().map(|m| (m.rule_id, m.asset_id)).collect();

        let mut by_rule: HashMap<RuleId, (Vec<AssetId>, Vec<AssetId>)> = HashMap::new();
        let mut dropped = Vec::new();
        for delta in &to_flush {
            match delta {
                MembershipDelta::Add { rule_id, asset_id } => {
                    if applied_adds.contains(&(*rule_id, *asset_id)) {
                        by_rule.entry(*rule_id).or_default().0.push(*asset_id);
                    } else {
                        dropped.push(delta.clone());
                    }
                }
                MembershipDelta::Remove { rule_id, asset_id } => {
                    by_rule.entry(*rule_id).or_default().1.push(*asset_id);
                }
            }
        }

        let observers = state.observers.read().await;
        for (rule_id, (added, removed)) in by_rule {
            for observer in observers.iter() {
                observer.rule_assets_changed(rule_id, added.clone(), removed.clone()).await;
            }
        }
        drop(observers);

        if dropped.is_empty() {
            return;
        }
        if attempt == 1 {
            warn!(dropped = dropped.len(), "membership adds dropped after retry: asset no longer exists");
            return;
        }
        debug!(dropped = dropped.len(), "retrying membership adds dropped by asset FK violation");
        to_flush = dropped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marmot_domain::{AssetType, RuleCore, RuleKind};
    use marmot_store::{AssetRepository, InMemoryStore};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration as StdDuration;

    fn fresh_rule(query: &str) -> RuleCore {
        let now = chrono::Utc::now();
        RuleCore {
            id: RuleId::new(),
            owner_entity_id: "owner-1".to_string(),
            name: "rule".to_string(),
            query_expression: query.to_string(),
            priority: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        calls: StdMutex<Vec<(RuleId, Vec<AssetId>, Vec<AssetId>)>>,
    }

    #[async_trait]
    impl MembershipObserver for RecordingObserver {
        async fn rule_assets_changed(&self, rule_id: RuleId, added: Vec<AssetId>, removed: Vec<AssetId>) {
            self.calls.lock().unwrap().push((rule_id, added, removed));
        }
    }

    async fn settle(handle: &MembershipHandle) {
        tokio::time::timeout(StdDuration::from_secs(5), handle.drain()).await.expect("drain timed out");
    }

    #[tokio::test]
    async fn evaluating_an_asset_adds_it_to_matching_rules() {
        let store = InMemoryStore::new();
        let rule = fresh_rule("type = 'table'");
        store.seed_rule(RuleKind::AssetRule, rule.clone()).await;

        let rules = store.rule_repository(RuleKind::AssetRule);
        let memberships: Arc<dyn marmot_store::MembershipRepository> = Arc::new(store.clone());
        let assets: Arc<dyn AssetRepository> = Arc::new(store.clone());

        let mut config = MembershipServiceConfig::new(RuleKind::AssetRule);
        config.workers = 1;
        let (handle, _workers) = spawn(config, rules, memberships, assets.clone());

        let observer = Arc::new(RecordingObserver::default());
        handle.register_observer(observer.clone()).await;

        let asset = Asset::fresh(marmot_domain::Mrn::new("mrn://pg/db/orders"), "orders", AssetType::new("table"));
        assets.upsert(&asset).await.unwrap();
        handle.try_evaluate_asset(asset.clone()).unwrap();

        settle(&handle).await;

        let members = handle.state.memberships.members_of_rule(rule.id).await.unwrap();
        assert_eq!(members, vec![asset.id]);
        assert_eq!(observer.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn evaluating_a_rule_pages_through_all_assets() {
        let store = InMemoryStore::new();
        let rule = fresh_rule("tag contains 'pii'");
        store.seed_rule(RuleKind::AssetRule, rule.clone()).await;

        let rules = store.rule_repository(RuleKind::AssetRule);
        let memberships: Arc<dyn marmot_store::MembershipRepository> = Arc::new(store.clone());
        let assets: Arc<dyn AssetRepository> = Arc::new(store.clone());

        for i in 0..5 {
            let mut asset = Asset::fresh(
                marmot_domain::Mrn::new(format!("mrn://pg/db/t{i}")),
                format!("t{i}"),
                AssetType::new("table"),
            );
            if i % 2 == 0 {
                asset.tags.push("pii".to_string());
            }
            assets.upsert(&asset).await.unwrap();
        }

        let mut config = MembershipServiceConfig::new(RuleKind::AssetRule);
        config.workers = 1;
        config.page_size = 2;
        let (handle, _workers) = spawn(config, rules, memberships, assets);

        handle.try_evaluate_rule(rule.id).unwrap();
        settle(&handle).await;

        let members = handle.state.memberships.members_of_rule(rule.id).await.unwrap();
        assert_eq!(members.len(), 3);
    }

    #[tokio::test]
    async fn deleted_rule_removes_all_its_memberships() {
        let store = InMemoryStore::new();
        let rule = fresh_rule("type = 'table'");

        let rules = store.rule_repository(RuleKind::AssetRule);
        let memberships: Arc<dyn marmot_store::MembershipRepository> = Arc::new(store.clone());
        let assets: Arc<dyn AssetRepository> = Arc::new(store.clone());

        let asset = Asset::fresh(marmot_domain::Mrn::new("mrn://pg/db/orders"), "orders", AssetType::new("table"));
        assets.upsert(&asset).await.unwrap();
        memberships.flush_deltas(&[MembershipDelta::Add { rule_id: rule.id, asset_id: asset.id }]).await.unwrap();

        let mut config = MembershipServiceConfig::new(RuleKind::AssetRule);
        config.workers = 1;
        let (handle, _workers) = spawn(config, rules, memberships.clone(), assets);

        // Rule was never seeded into this repository — simulates RuleDeleted.
        handle.try_evaluate_rule(rule.id).unwrap();
        settle(&handle).await;

        assert!(memberships.members_of_rule(rule.id).await.unwrap().is_empty());
    }
}
