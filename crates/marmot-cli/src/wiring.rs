//! Builds and runs the whole control plane in one process: one scheduler,
//! two membership services, two reconcilers, one notification aggregator
//! and one webhook dispatcher, wired together only through the capability
//! traits each crate already exposes (Design Notes §9 — no component here
//! imports another's concrete implementation, `marmot-cli` is the one place
//! allowed to know about all of them at once).

use std::sync::Arc;
use std::time::Duration;

use marmot_domain::RuleKind;
use marmot_membership::{MembershipHandle, MembershipServiceConfig};
use marmot_notify::{NoTeamsProvider, NotifyConfig};
use marmot_plugin::{HttpCatalogSource, ManifestSource, PluginRegistry};
use marmot_reconciler::ReconcilerConfig;
use marmot_scheduler::SchedulerConfig;
use marmot_store::{
    AdvisoryLock, AssetRepository, InMemoryStore, LineageRepository, MembershipRepository,
    NotificationRepository, PostgresStore, RuleRepository, ScheduleStore, WebhookRepository,
};
use marmot_webhook::WebhookDispatcherConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::notify_adapters::{NotifyMembershipObserver, NotifyRunObserver};

/// Everything the daemon needs, already resolved to trait objects so the
/// rest of this module never branches on which backing store is in use.
pub struct Backend {
    pub schedules: Arc<dyn ScheduleStore>,
    pub assets: Arc<dyn AssetRepository>,
    pub lineage: Arc<dyn LineageRepository>,
    pub memberships: Arc<dyn MembershipRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub webhooks: Arc<dyn WebhookRepository>,
    pub lock: Arc<dyn AdvisoryLock>,
    pub rules_data_product: Arc<dyn RuleRepository>,
    pub rules_asset_rule: Arc<dyn RuleRepository>,
}

impl Backend {
    pub fn ephemeral() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Backend {
            schedules: store.clone(),
            assets: store.clone(),
            lineage: store.clone(),
            memberships: store.clone(),
            notifications: store.clone(),
            webhooks: store.clone(),
            lock: store.clone(),
            rules_data_product: store.rule_repository(RuleKind::DataProduct),
            rules_asset_rule: store.rule_repository(RuleKind::AssetRule),
        }
    }

    pub async fn postgres(database_url: &str) -> anyhow::Result<Self> {
        let store = Arc::new(PostgresStore::connect(database_url).await?);
        Ok(Backend {
            schedules: store.clone(),
            assets: store.clone(),
            lineage: store.clone(),
            memberships: store.clone(),
            notifications: store.clone(),
            webhooks: store.clone(),
            lock: store.clone(),
            rules_data_product: store.rule_repository(RuleKind::DataProduct),
            rules_asset_rule: store.rule_repository(RuleKind::AssetRule),
        })
    }
}

/// Every worker task spawned across the five subsystems, kept around so
/// shutdown can wait on them after each stage's cancellation token fires.
///
/// Membership and webhook shut down the way their own docs say: once the
/// last clone of their handle is dropped, their channel closes and their
/// workers drain and exit. The reconcilers hold the last live
/// `MembershipHandle` for their rule kind, and the scheduler/membership
/// observers hold the last live `NotifyHandle`/`WebhookHandle`, so cancelling
/// the reconcilers and the scheduler releases those in turn without this
/// module tracking it explicitly. Notify's flush loop runs on its own ticker
/// rather than a channel, so it additionally takes its own
/// `CancellationToken`.
pub struct Daemon {
    membership_tasks: Vec<JoinHandle<()>>,
    reconciler_tasks: Vec<JoinHandle<()>>,
    webhook_tasks: Vec<JoinHandle<()>>,
    notify_tasks: Vec<JoinHandle<()>>,
    scheduler_task: JoinHandle<()>,
    reconciler_cancel: CancellationToken,
    scheduler_cancel: CancellationToken,
    notify_cancel: CancellationToken,
}

impl Daemon {
    pub fn start(backend: Backend, owner_id: String, encryption_key: Option<[u8; 32]>) -> Self {
        let (webhook_handle, webhook_tasks) = marmot_webhook::spawn(WebhookDispatcherConfig::default(), backend.webhooks.clone());

        let notify_cancel = CancellationToken::new();
        let (notify_handle, notify_tasks) = marmot_notify::spawn(
            NotifyConfig::default(),
            backend.notifications.clone(),
            webhook_handle,
            Arc::new(NoTeamsProvider),
            notify_cancel.clone(),
        );

        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(ManifestSource::new()));
        registry.register(Arc::new(HttpCatalogSource::new()));
        let registry = Arc::new(registry);

        let mut membership_tasks = Vec::new();

        let (dp_handle, dp_tasks) = spawn_membership(
            RuleKind::DataProduct,
            backend.rules_data_product.clone(),
            backend.memberships.clone(),
            backend.assets.clone(),
            &notify_handle,
        );
        membership_tasks.extend(dp_tasks);

        let (ar_handle, ar_tasks) = spawn_membership(
            RuleKind::AssetRule,
            backend.rules_asset_rule.clone(),
            backend.memberships.clone(),
            backend.assets.clone(),
            &notify_handle,
        );
        membership_tasks.extend(ar_tasks);

        let reconciler_cancel = CancellationToken::new();
        let reconciler_tasks = vec![
            marmot_reconciler::spawn(
                ReconcilerConfig::new("data_product_reconciler", owner_id.clone()),
                backend.lock.clone(),
                backend.rules_data_product.clone(),
                dp_handle,
                reconciler_cancel.clone(),
            ),
            marmot_reconciler::spawn(
                ReconcilerConfig::new("asset_rule_reconciler", owner_id.clone()),
                backend.lock.clone(),
                backend.rules_asset_rule.clone(),
                ar_handle,
                reconciler_cancel.clone(),
            ),
        ];

        let mut scheduler_config = SchedulerConfig::new(owner_id);
        scheduler_config.encryption_key = encryption_key;
        let scheduler_cancel = CancellationToken::new();
        let run_observer: Arc<dyn marmot_scheduler::RunObserver> = Arc::new(NotifyRunObserver { notify: notify_handle });
        let scheduler_task = marmot_scheduler::spawn(
            scheduler_config,
            backend.schedules.clone(),
            backend.assets.clone(),
            backend.lineage.clone(),
            registry,
            vec![run_observer],
            scheduler_cancel.clone(),
        );

        Daemon {
            membership_tasks,
            reconciler_tasks,
            webhook_tasks,
            notify_tasks,
            scheduler_task,
            reconciler_cancel,
            scheduler_cancel,
            notify_cancel,
        }
    }

    /// Shuts down in reverse-dependency order per spec.md §5. Cancelling the
    /// reconcilers and the scheduler releases the last handles feeding the
    /// membership services, which in turn releases the last handles feeding
    /// notify and webhook, so waiting on each stage in this order drains the
    /// whole pipeline without any other component needing its own token.
    pub async fn shutdown(self, deadline: Duration) {
        self.reconciler_cancel.cancel();
        wait_all(self.reconciler_tasks, deadline, "reconciler").await;

        self.scheduler_cancel.cancel();
        if tokio::time::timeout(deadline, self.scheduler_task).await.is_err() {
            tracing::warn!("scheduler did not shut down within deadline");
        }
        info!("scheduler shut down");

        wait_all(self.membership_tasks, deadline, "membership").await;

        self.notify_cancel.cancel();
        wait_all(self.notify_tasks, deadline, "notify").await;

        wait_all(self.webhook_tasks, deadline, "webhook").await;
    }
}

fn spawn_membership(
    kind: RuleKind,
    rules: Arc<dyn RuleRepository>,
    memberships: Arc<dyn MembershipRepository>,
    assets: Arc<dyn AssetRepository>,
    notify_handle: &marmot_notify::NotifyHandle,
) -> (MembershipHandle, Vec<JoinHandle<()>>) {
    let (handle, tasks) = marmot_membership::spawn(MembershipServiceConfig::new(kind), rules.clone(), memberships, assets.clone());
    let observer = Arc::new(NotifyMembershipObserver { notify: notify_handle.clone(), rules, assets });
    let register_handle = handle.clone();
    tokio::spawn(async move { register_handle.register_observer(observer).await });
    (handle, tasks)
}

async fn wait_all(tasks: Vec<JoinHandle<()>>, deadline: Duration, label: &str) {
    for task in tasks {
        if tokio::time::timeout(deadline, task).await.is_err() {
            tracing::warn!(%label, "worker did not shut down within deadline");
        }
    }
    info!(%label, "subsystem shut down");
}
