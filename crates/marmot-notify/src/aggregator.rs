use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use marmot_domain::{AssetId, MarmotError, Mrn, Notification, NotificationId, NotificationKind, Recipient, UserId};
use marmot_store::NotificationRepository;
use marmot_webhook::{WebhookEvent, WebhookHandle};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::NotifyError;
use crate::team::TeamMembershipProvider;

pub const DEFAULT_CREATE_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_PENDING: usize = 1000;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_REQUEUE_ATTEMPTS: u32 = 3;

pub struct NotifyConfig {
    pub create_queue_capacity: usize,
    pub max_pending: usize,
    pub flush_interval: Duration,
    pub sweep_interval: Duration,
    pub max_requeue_attempts: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            create_queue_capacity: DEFAULT_CREATE_QUEUE_CAPACITY,
            max_pending: DEFAULT_MAX_PENDING,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_requeue_attempts: DEFAULT_MAX_REQUEUE_ATTEMPTS,
        }
    }
}

/// One immediately-delivered notification. Never coalesced and never
/// dropped under queue pressure — callers get backpressure instead.
#[derive(Debug, Clone)]
pub struct CreateInput {
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: HashMap<String, serde_json::Value>,
    pub link: Option<String>,
}

/// One candidate change event for one or more recipients, fed into the
/// coalescing path. Covers `QueueAssetChange` / `QueueLineageChange` /
/// `QueueSchemaChange` / `QueueMention`, which differ only in `kind`.
#[derive(Debug, Clone)]
pub struct QueueChangeInput {
    pub kind: NotificationKind,
    pub asset_id: AssetId,
    pub mrn: Mrn,
    pub name: String,
    pub recipients: Vec<Recipient>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    recipient: Recipient,
    kind: NotificationKind,
    asset_id: AssetId,
}

struct PendingEntry {
    mrn: Mrn,
    name: String,
    count: u32,
    first_seen: Instant,
    last_seen: DateTime<Utc>,
    requeue_attempts: u32,
}

/// `Mention` is a direct, user-targeted notification and is never evicted
/// while a less urgent kind is still pending, per spec.md 4.D's "drops the
/// oldest non-critical kinds first."
fn is_critical(kind: NotificationKind) -> bool {
    matches!(kind, NotificationKind::Mention)
}

struct PendingMap {
    entries: HashMap<PendingKey, PendingEntry>,
    order: VecDeque<PendingKey>,
}

impl PendingMap {
    fn new() -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new() }
    }

    fn insert(&mut self, key: PendingKey, mrn: Mrn, name: String, capacity: usize, dropped: &AtomicU64) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.count += 1;
            entry.mrn = mrn;
            entry.name = name;
            entry.last_seen = Utc::now();
            return;
        }
        if self.entries.len() >= capacity {
            self.evict_one(dropped);
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            PendingEntry { mrn, name, count: 1, first_seen: Instant::now(), last_seen: Utc::now(), requeue_attempts: 0 },
        );
    }

    /// Evicts the oldest entry whose kind is not critical; falls back to
    /// the oldest entry overall only once every pending entry is critical.
    fn evict_one(&mut self, dropped: &AtomicU64) {
        let evict_pos = self.order.iter().position(|key| !is_critical(key.kind)).unwrap_or(0);
        if let Some(evict_key) = self.order.remove(evict_pos) {
            self.entries.remove(&evict_key);
            dropped.fetch_add(1, Ordering::Relaxed);
            debug!(?evict_key, "evicted pending notification under queue pressure");
        }
    }

    fn take_expired(&mut self, window: Duration) -> Vec<(PendingKey, PendingEntry)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut still_pending = VecDeque::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            let Some(entry) = self.entries.get(&key) else { continue };
            if now.duration_since(entry.first_seen) >= window {
                let entry = self.entries.remove(&key).expect("checked present above");
                expired.push((key, entry));
            } else {
                still_pending.push_back(key);
            }
        }
        self.order = still_pending;
        expired
    }

    fn requeue(&mut self, key: PendingKey, mut entry: PendingEntry) {
        entry.first_seen = Instant::now();
        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
    }
}

enum Ingress {
    Create(CreateInput),
    QueueChange(QueueChangeInput),
}

#[derive(Clone)]
pub struct NotifyHandle {
    create_tx: mpsc::Sender<CreateInput>,
    pending: Arc<Mutex<PendingMap>>,
    dropped: Arc<AtomicU64>,
    max_pending: usize,
}

impl NotifyHandle {
    /// Immediate path: persisted and forwarded once, never coalesced.
    pub async fn create(&self, input: CreateInput) -> Result<(), NotifyError> {
        self.create_tx.try_send(input).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }

    /// Coalesced path: expands `recipients` into one pending entry per
    /// `(recipient, kind, asset_id)` key, per spec.md 4.D's coalescing
    /// contract.
    pub async fn queue_change(&self, input: QueueChangeInput) {
        let mut pending = self.pending.lock().await;
        for recipient in input.recipients {
            let key = PendingKey { recipient, kind: input.kind, asset_id: input.asset_id };
            pending.insert(key, input.mrn.clone(), input.name.clone(), self.max_pending, &self.dropped);
        }
    }

    /// Count of pending entries dropped under queue saturation since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct State {
    repo: Arc<dyn NotificationRepository>,
    webhook: WebhookHandle,
    teams: Arc<dyn TeamMembershipProvider>,
    max_requeue_attempts: u32,
}

pub fn spawn(
    config: NotifyConfig,
    repo: Arc<dyn NotificationRepository>,
    webhook: WebhookHandle,
    teams: Arc<dyn TeamMembershipProvider>,
    cancel: tokio_util::sync::CancellationToken,
) -> (NotifyHandle, Vec<JoinHandle<()>>) {
    let (create_tx, create_rx) = mpsc::channel(config.create_queue_capacity);
    let pending = Arc::new(Mutex::new(PendingMap::new()));
    let dropped = Arc::new(AtomicU64::new(0));

    let state = Arc::new(State { repo, webhook, teams, max_requeue_attempts: config.max_requeue_attempts });

    let create_task = tokio::spawn(create_loop(create_rx, state.clone()));
    let flush_task = tokio::spawn(flush_loop(pending.clone(), state, config.flush_interval, config.sweep_interval, cancel));

    (NotifyHandle { create_tx, pending, dropped, max_pending: config.max_pending }, vec![create_task, flush_task])
}

async fn create_loop(mut rx: mpsc::Receiver<CreateInput>, state: Arc<State>) {
    while let Some(input) = rx.recv().await {
        deliver_create(&state, input).await;
    }
}

async fn deliver_create(state: &State, input: CreateInput) {
    for_each_user(state, &input.recipient, input.kind, |user_id| {
        let input = input.clone();
        async move {
            let notification = Notification {
                id: NotificationId::new(),
                recipient: Recipient::User(user_id),
                kind: input.kind,
                title: input.title,
                message: input.message,
                data: input.data,
                link: input.link,
                created_at: Utc::now(),
                read_at: None,
            };
            persist_and_forward(state, notification).await;
        }
    })
    .await;
}

/// Sweeps expired entries on `sweep_interval` until `cancel` fires, then
/// drains whatever is still pending (regardless of window age) one last
/// time before returning — mirrors `marmot-reconciler`'s
/// cancel-then-drain shutdown shape.
async fn flush_loop(
    pending: Arc<Mutex<PendingMap>>,
    state: Arc<State>,
    flush_interval: Duration,
    sweep_interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let expired = {
            let mut guard = pending.lock().await;
            guard.take_expired(flush_interval)
        };
        for (key, entry) in expired {
            flush_entry(&pending, &state, key, entry).await;
        }
    }

    let remaining = {
        let mut guard = pending.lock().await;
        guard.take_expired(Duration::ZERO)
    };
    if !remaining.is_empty() {
        warn!(count = remaining.len(), "dropping pending notifications that had not yet reached their flush window at shutdown");
    }
}

async fn flush_entry(pending: &Arc<Mutex<PendingMap>>, state: &State, key: PendingKey, entry: PendingEntry) {
    let (title, message) = summarize(key.kind, &entry.name, entry.count);
    let mut data = HashMap::new();
    data.insert("count".to_string(), serde_json::json!(entry.count));
    data.insert("asset_id".to_string(), serde_json::json!(key.asset_id.to_string()));
    data.insert("mrn".to_string(), serde_json::json!(entry.mrn.to_string()));
    data.insert("last_seen".to_string(), serde_json::json!(entry.last_seen.to_rfc3339()));

    let result = deliver_to_recipient(state, &key.recipient, key.kind, &title, &message, &data).await;

    match result {
        Ok(()) => {}
        Err(e) if entry.requeue_attempts + 1 < state.max_requeue_attempts => {
            warn!(error = %e, attempts = entry.requeue_attempts + 1, "notification persistence failed, re-queuing");
            let mut guard = pending.lock().await;
            guard.requeue(key, PendingEntry { requeue_attempts: entry.requeue_attempts + 1, ..entry });
        }
        Err(e) => {
            warn!(error = %e, "notification persistence failed, requeue attempts exhausted, dropping");
        }
    }
}

/// Resolves `recipient` (expanding teams via the injected provider), skips
/// users who disabled `kind`, and persists + forwards one notification per
/// remaining user. The first persistence error aborts the remaining
/// fan-out and is returned so the caller can requeue the whole entry —
/// already-delivered users may see a duplicate on retry, an accepted
/// tradeoff for the bounded-retry semantics spec.md 4.D asks for.
async fn deliver_to_recipient(
    state: &State,
    recipient: &Recipient,
    kind: NotificationKind,
    title: &str,
    message: &str,
    data: &HashMap<String, serde_json::Value>,
) -> Result<(), MarmotError> {
    let user_ids = match recipient {
        Recipient::User(id) => vec![id.clone()],
        Recipient::Team(team) => match state.teams.members_of(team).await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, team = ?team, "failed to resolve team membership, skipping");
                return Ok(());
            }
        },
    };

    let disabled: HashSet<UserId> = state
        .repo
        .preferences_for(&user_ids, kind)
        .await?
        .into_iter()
        .filter(|p| !p.enabled)
        .map(|p| p.user_id)
        .collect();

    for user_id in user_ids {
        if disabled.contains(&user_id) {
            continue;
        }
        let notification = Notification {
            id: NotificationId::new(),
            recipient: Recipient::User(user_id),
            kind,
            title: title.to_string(),
            message: message.to_string(),
            data: data.clone(),
            link: None,
            created_at: Utc::now(),
            read_at: None,
        };
        state.repo.create(&notification).await?;
        forward_to_webhook(state, &notification).await;
    }
    Ok(())
}

/// Batched per-user preference check, then persist + single forward to the
/// webhook dispatcher — shared by both ingress paths once a concrete
/// `Recipient::User` notification has been built.
async fn persist_and_forward(state: &State, notification: Notification) {
    if let Err(e) = state.repo.create(&notification).await {
        warn!(error = %e, "failed to persist immediate notification");
        return;
    }
    forward_to_webhook(state, &notification).await;
}

async fn forward_to_webhook(state: &State, notification: &Notification) {
    let event = WebhookEvent {
        id: Uuid::new_v4(),
        kind: notification.kind,
        created_at: notification.created_at,
        data: serde_json::json!({
            "notification_id": notification.id.to_string(),
            "title": notification.title,
            "message": notification.message,
            "data": notification.data,
        }),
    };
    if let Err(e) = state.webhook.try_enqueue(event).await {
        warn!(error = %e, "failed to forward notification to webhook dispatcher");
    }
}

/// Expands `recipient` to concrete user ids (team membership errors for one
/// recipient never block the rest per spec.md 4.D) and, for each resolved
/// user with `kind` enabled, runs `f`.
async fn for_each_user<F, Fut>(state: &State, recipient: &Recipient, kind: NotificationKind, f: F)
where
    F: Fn(UserId) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let user_ids = match recipient {
        Recipient::User(id) => vec![id.clone()],
        Recipient::Team(team) => match state.teams.members_of(team).await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, team = ?team, "failed to resolve team membership, skipping");
                return;
            }
        },
    };

    let disabled: HashSet<UserId> = match state.repo.preferences_for(&user_ids, kind).await {
        Ok(prefs) => prefs.into_iter().filter(|p| !p.enabled).map(|p| p.user_id).collect(),
        Err(e) => {
            warn!(error = %e, "failed to batch-load notification preferences, defaulting to enabled");
            HashSet::new()
        }
    };

    for user_id in user_ids {
        if disabled.contains(&user_id) {
            continue;
        }
        f(user_id).await;
    }
}

fn summarize(kind: NotificationKind, name: &str, count: u32) -> (String, String) {
    let title = match kind {
        NotificationKind::AssetChange => format!("{name} changed"),
        NotificationKind::SchemaChange => format!("{name} schema changed"),
        NotificationKind::LineageChange => format!("{name} lineage changed"),
        NotificationKind::Mention => format!("You were mentioned on {name}"),
        NotificationKind::JobCompletion => format!("{name} job completed"),
    };
    let message = if count <= 1 { "updated once".to_string() } else { format!("updated {count} times") };
    (title, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_domain::{NotificationPreference, WebhookSubscription};
    use marmot_store::InMemoryStore;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn webhook_handle_to(server: &MockServer) -> (WebhookHandle, Arc<InMemoryStore>) {
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(server).await;
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_webhook(WebhookSubscription {
                id: marmot_domain::WebhookId::new(),
                url: format!("{}/hook", server.uri()),
                secret: "s".to_string(),
                event_filters: Vec::new(),
                enabled: true,
                owner_id: UserId("owner".to_string()),
            })
            .await;
        let repo: Arc<dyn marmot_store::WebhookRepository> = store.clone();
        let (handle, _workers) = marmot_webhook::spawn(Default::default(), repo);
        (handle, store)
    }

    #[tokio::test]
    async fn coalesces_repeated_changes_into_one_notification_with_count() {
        let server = MockServer::start().await;
        let (webhook, _webhook_store) = webhook_handle_to(&server).await;
        let notif_store = Arc::new(InMemoryStore::new());
        let repo: Arc<dyn NotificationRepository> = notif_store.clone();

        let config = NotifyConfig { flush_interval: Duration::from_millis(200), sweep_interval: Duration::from_millis(20), ..Default::default() };
        let (handle, _tasks) =
            spawn(config, repo, webhook, Arc::new(crate::team::NoTeamsProvider), tokio_util::sync::CancellationToken::new());

        let asset_id = AssetId::new();
        let mrn = Mrn::new("mrn://pg/db/orders");
        for _ in 0..5 {
            handle
                .queue_change(QueueChangeInput {
                    kind: NotificationKind::AssetChange,
                    asset_id,
                    mrn: mrn.clone(),
                    name: "orders".to_string(),
                    recipients: vec![Recipient::User(UserId("alice".to_string()))],
                })
                .await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        let notifications = notif_store.all_notifications_for_test().await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].data.get("count"), Some(&serde_json::json!(5)));
    }

    #[tokio::test]
    async fn disabled_preference_suppresses_coalesced_notification() {
        let server = MockServer::start().await;
        let (webhook, _webhook_store) = webhook_handle_to(&server).await;
        let notif_store = Arc::new(InMemoryStore::new());
        notif_store
            .set_preference(NotificationPreference { user_id: UserId("bob".to_string()), kind: NotificationKind::AssetChange, enabled: false })
            .await;
        let repo: Arc<dyn NotificationRepository> = notif_store.clone();

        let config = NotifyConfig { flush_interval: Duration::from_millis(50), sweep_interval: Duration::from_millis(10), ..Default::default() };
        let (handle, _tasks) =
            spawn(config, repo, webhook, Arc::new(crate::team::NoTeamsProvider), tokio_util::sync::CancellationToken::new());

        handle
            .queue_change(QueueChangeInput {
                kind: NotificationKind::AssetChange,
                asset_id: AssetId::new(),
                mrn: Mrn::new("mrn://pg/db/orders"),
                name: "orders".to_string(),
                recipients: vec![Recipient::User(UserId("bob".to_string()))],
            })
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(notif_store.all_notifications_for_test().await.is_empty());
    }

    #[tokio::test]
    async fn create_path_delivers_immediately_without_waiting_for_flush_window() {
        let server = MockServer::start().await;
        let (webhook, _webhook_store) = webhook_handle_to(&server).await;
        let notif_store = Arc::new(InMemoryStore::new());
        let repo: Arc<dyn NotificationRepository> = notif_store.clone();

        let config = NotifyConfig { flush_interval: Duration::from_secs(30), ..Default::default() };
        let (handle, _tasks) =
            spawn(config, repo, webhook, Arc::new(crate::team::NoTeamsProvider), tokio_util::sync::CancellationToken::new());

        handle
            .create(CreateInput {
                recipient: Recipient::User(UserId("carol".to_string())),
                kind: NotificationKind::JobCompletion,
                title: "Run finished".to_string(),
                message: "Run 42 completed".to_string(),
                data: HashMap::new(),
                link: None,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(notif_store.all_notifications_for_test().await.len(), 1);
    }

    #[tokio::test]
    async fn pending_map_evicts_oldest_entry_under_capacity_pressure() {
        let dropped = AtomicU64::new(0);
        let mut map = PendingMap::new();
        for i in 0..3 {
            let key = PendingKey { recipient: Recipient::User(UserId(format!("u{i}"))), kind: NotificationKind::AssetChange, asset_id: AssetId::new() };
            map.insert(key, Mrn::new("mrn://x"), "x".to_string(), 2, &dropped);
        }
        assert_eq!(map.entries.len(), 2);
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn pending_map_eviction_prefers_non_critical_kinds_over_mentions() {
        let dropped = AtomicU64::new(0);
        let mut map = PendingMap::new();
        let mention_key = PendingKey { recipient: Recipient::User(UserId("u0".to_string())), kind: NotificationKind::Mention, asset_id: AssetId::new() };
        map.insert(mention_key.clone(), Mrn::new("mrn://x"), "x".to_string(), 2, &dropped);
        let change_key = PendingKey { recipient: Recipient::User(UserId("u1".to_string())), kind: NotificationKind::AssetChange, asset_id: AssetId::new() };
        map.insert(change_key.clone(), Mrn::new("mrn://x"), "x".to_string(), 2, &dropped);

        let third_key = PendingKey { recipient: Recipient::User(UserId("u2".to_string())), kind: NotificationKind::SchemaChange, asset_id: AssetId::new() };
        map.insert(third_key, Mrn::new("mrn://x"), "x".to_string(), 2, &dropped);

        assert!(map.entries.contains_key(&mention_key), "mention must survive eviction while a non-critical entry is pending");
        assert!(!map.entries.contains_key(&change_key), "oldest non-critical entry is evicted first");
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn pending_map_insert_updates_name_and_last_seen_on_coalesce() {
        let dropped = AtomicU64::new(0);
        let mut map = PendingMap::new();
        let key = PendingKey { recipient: Recipient::User(UserId("u0".to_string())), kind: NotificationKind::AssetChange, asset_id: AssetId::new() };
        map.insert(key.clone(), Mrn::new("mrn://orders/v1"), "orders".to_string(), 10, &dropped);
        let first_seen = map.entries.get(&key).unwrap().last_seen;

        tokio::time::sleep(Duration::from_millis(5)).await;
        map.insert(key.clone(), Mrn::new("mrn://orders/v2"), "orders_renamed".to_string(), 10, &dropped);

        let entry = map.entries.get(&key).unwrap();
        assert_eq!(entry.count, 2);
        assert_eq!(entry.name, "orders_renamed");
        assert_eq!(entry.mrn.to_string(), "mrn://orders/v2");
        assert!(entry.last_seen > first_seen, "last_seen must advance on coalesce");
    }
}
