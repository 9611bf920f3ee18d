use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use marmot_domain::{DeliveryStatus, MarmotError, NotificationKind, WebhookDelivery, WebhookId};
use marmot_store::WebhookRepository;
use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::WebhookError;
use crate::signing::sign;

/// Default bounded channel capacity, per spec.md 4.C.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Default worker pool size, per spec.md 4.C.
pub const DEFAULT_WORKERS: usize = 5;
/// Default max retry attempts before a delivery is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Request timeout per attempt, per spec.md 4.C.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Base of the exponential backoff schedule.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Cap of the exponential backoff schedule.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// An event broadcast to every webhook subscription that accepts its kind.
/// The dispatcher fans it out to one delivery attempt per subscription —
/// filtering (disabled / event-kind filter) happens per-subscription inside
/// the worker, exactly as spec.md 4.C describes.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

pub struct WebhookDispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for WebhookDispatcherConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

struct PendingDelivery {
    subscription_id: WebhookId,
    event: Arc<WebhookEvent>,
}

struct State {
    repo: Arc<dyn WebhookRepository>,
    client: reqwest::Client,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

#[derive(Clone)]
pub struct WebhookHandle {
    tx: mpsc::Sender<PendingDelivery>,
    repo: Arc<dyn WebhookRepository>,
}

impl WebhookHandle {
    /// Fans `event` out to one pending delivery per registered subscription;
    /// per-subscription filtering happens inside the worker. Non-blocking —
    /// per spec.md 4.C the fast path must never block on a full queue.
    pub async fn try_enqueue(&self, event: WebhookEvent) -> Result<(), MarmotError> {
        let subscriptions = self.repo.list_subscriptions().await?;
        let event = Arc::new(event);
        for sub in subscriptions {
            self.tx
                .try_send(PendingDelivery { subscription_id: sub.id, event: event.clone() })
                .map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => WebhookError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => WebhookError::Closed,
                })?;
        }
        Ok(())
    }
}

/// Spawns the bounded worker pool. Dropping every clone of the returned
/// handle closes the channel; callers should then join the returned handles
/// (optionally racing a deadline) for graceful shutdown.
pub fn spawn(config: WebhookDispatcherConfig, repo: Arc<dyn WebhookRepository>) -> (WebhookHandle, Vec<JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let state = Arc::new(State {
        repo: repo.clone(),
        client: reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client builder with static config never fails"),
        max_attempts: config.max_attempts,
        backoff_base: config.backoff_base,
        backoff_cap: config.backoff_cap,
    });

    let mut workers = Vec::with_capacity(config.workers);
    for id in 0..config.workers {
        let rx = rx.clone();
        let state = state.clone();
        workers.push(tokio::spawn(worker_loop(id, rx, state)));
    }

    (WebhookHandle { tx, repo }, workers)
}

async fn worker_loop(id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PendingDelivery>>>, state: Arc<State>) {
    loop {
        let delivery = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(delivery) = delivery else { break };
        deliver(id, &state, delivery).await;
    }
}

async fn deliver(worker_id: usize, state: &State, delivery: PendingDelivery) {
    let subscription = match state.repo.get_subscription(delivery.subscription_id).await {
        Ok(Some(sub)) => sub,
        Ok(None) => return,
        Err(e) => {
            warn!(worker = worker_id, error = %e, "failed to load webhook subscription");
            return;
        }
    };

    if !subscription.accepts(delivery.event.kind) {
        debug!(worker = worker_id, subscription_id = %subscription.id, "delivery dropped: disabled or filtered");
        return;
    }

    let body = canonical_payload(&delivery.event);
    let signature = sign(&subscription.secret, body.as_bytes());

    let mut attempt_n: u32 = 1;
    loop {
        let result = state
            .client
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header("X-Marmot-Event", delivery.event.kind.to_string())
            .header("X-Marmot-Delivery", delivery.event.id.to_string())
            .header("X-Marmot-Signature", &signature)
            .body(body.clone())
            .send()
            .await;

        let (status, next_retry_at) = match result {
            Ok(resp) if resp.status().is_success() => (DeliveryStatus::Success, None),
            Ok(resp) if is_retryable(resp.status()) && attempt_n < state.max_attempts => {
                let wait = backoff(state.backoff_base, state.backoff_cap, attempt_n);
                (DeliveryStatus::Retrying, Some(Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default()))
            }
            Ok(resp) if is_retryable(resp.status()) => (DeliveryStatus::Failed, None),
            Ok(_) => (DeliveryStatus::Failed, None), // non-retryable 4xx: permanent
            Err(e) if attempt_n < state.max_attempts => {
                debug!(worker = worker_id, error = %e, "webhook request error; will retry");
                let wait = backoff(state.backoff_base, state.backoff_cap, attempt_n);
                (DeliveryStatus::Retrying, Some(Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default()))
            }
            Err(e) => {
                warn!(worker = worker_id, error = %e, "webhook request failed; attempts exhausted");
                (DeliveryStatus::Failed, None)
            }
        };

        let record = WebhookDelivery {
            subscription_id: subscription.id,
            event_id: delivery.event.id,
            attempt_n,
            status,
            next_retry_at,
        };
        if let Err(e) = state.repo.record_delivery(&record).await {
            warn!(worker = worker_id, error = %e, "failed to record webhook delivery attempt");
        }

        if status != DeliveryStatus::Retrying {
            return;
        }

        let wait = next_retry_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(state.backoff_base);
        tokio::time::sleep(wait).await;
        attempt_n += 1;
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// `min(cap, base * 2^attempt) ± jitter`, per spec.md 4.C.
fn backoff(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exp.min(cap);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64 / 5);
    capped + Duration::from_millis(jitter_ms)
}

fn canonical_payload(event: &WebhookEvent) -> String {
    let body = serde_json::json!({
        "id": event.id.to_string(),
        "kind": event.kind.to_string(),
        "created_at": event.created_at.to_rfc3339(),
        "data": event.data,
    });
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use marmot_domain::{UserId, WebhookSubscription};
    use marmot_store::InMemoryStore;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fresh_subscription(url: String) -> WebhookSubscription {
        WebhookSubscription {
            id: WebhookId::new(),
            url,
            secret: "s3cr3t".to_string(),
            event_filters: Vec::new(),
            enabled: true,
            owner_id: UserId("u1".to_string()),
        }
    }

    #[tokio::test]
    async fn successful_delivery_is_recorded_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Marmot-Event", "asset_change"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        store.insert_webhook(fresh_subscription(format!("{}/hook", server.uri()))).await;
        let repo: Arc<dyn WebhookRepository> = store.clone();

        let mut config = WebhookDispatcherConfig::default();
        config.workers = 1;
        let (handle, _workers) = spawn(config, repo);

        let event_id = Uuid::new_v4();
        handle
            .try_enqueue(WebhookEvent { id: event_id, kind: NotificationKind::AssetChange, created_at: Utc::now(), data: serde_json::json!({}) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let deliveries = store.deliveries_for_event(event_id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn retries_on_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(InMemoryStore::new());
        store.insert_webhook(fresh_subscription(format!("{}/hook", server.uri()))).await;
        let repo: Arc<dyn WebhookRepository> = store.clone();

        let mut config = WebhookDispatcherConfig::default();
        config.workers = 1;
        config.backoff_base = Duration::from_millis(5);
        config.backoff_cap = Duration::from_millis(20);
        let (handle, _workers) = spawn(config, repo);

        let event_id = Uuid::new_v4();
        handle
            .try_enqueue(WebhookEvent { id: event_id, kind: NotificationKind::AssetChange, created_at: Utc::now(), data: serde_json::json!({}) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let deliveries = store.deliveries_for_event(event_id).await.unwrap();
        assert_eq!(deliveries.len(), 3);
        assert_eq!(deliveries[0].status, DeliveryStatus::Retrying);
        assert_eq!(deliveries[1].status, DeliveryStatus::Retrying);
        assert_eq!(deliveries[2].status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn non_retryable_4xx_is_recorded_as_failed_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/hook")).respond_with(ResponseTemplate::new(400)).mount(&server).await;

        let store = Arc::new(InMemoryStore::new());
        store.insert_webhook(fresh_subscription(format!("{}/hook", server.uri()))).await;
        let repo: Arc<dyn WebhookRepository> = store.clone();

        let mut config = WebhookDispatcherConfig::default();
        config.workers = 1;
        let (handle, _workers) = spawn(config, repo);

        let event_id = Uuid::new_v4();
        handle
            .try_enqueue(WebhookEvent { id: event_id, kind: NotificationKind::AssetChange, created_at: Utc::now(), data: serde_json::json!({}) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let deliveries = store.deliveries_for_event(event_id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn disabled_subscription_receives_no_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/hook")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let store = Arc::new(InMemoryStore::new());
        let mut sub = fresh_subscription(format!("{}/hook", server.uri()));
        sub.enabled = false;
        store.insert_webhook(sub).await;
        let repo: Arc<dyn WebhookRepository> = store.clone();

        let mut config = WebhookDispatcherConfig::default();
        config.workers = 1;
        let (handle, _workers) = spawn(config, repo);

        let event_id = Uuid::new_v4();
        handle
            .try_enqueue(WebhookEvent { id: event_id, kind: NotificationKind::AssetChange, created_at: Utc::now(), data: serde_json::json!({}) })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.deliveries_for_event(event_id).await.unwrap().is_empty());
    }
}
