use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ───────────────────────────────────────────────────────────────

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                $name(u)
            }
        }
    };
}

uuid_id!(AssetId);
uuid_id!(RuleId);
uuid_id!(ScheduleId);
uuid_id!(RunId);
uuid_id!(NotificationId);
uuid_id!(WebhookId);
uuid_id!(TermId);

/// Marmot Resource Name — a qualified, provider-scoped asset identifier
/// (e.g. `mrn://postgres/db/schema/table`). Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mrn(pub String);

impl Mrn {
    pub fn new(s: impl Into<String>) -> Self {
        Mrn(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Mrn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Open-ended asset type — providers register whatever string fits their
/// domain ("table", "topic", "queue", "bucket", "dag", ...), so this is not
/// a closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetType(pub String);

impl AssetType {
    pub fn new(s: impl Into<String>) -> Self {
        AssetType(s.into())
    }
}

impl std::fmt::Display for AssetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user or team id, as resolved by the caller. Marmot's core treats both
/// uniformly as opaque strings; identity resolution (logins, OAuth) is out
/// of scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamId(pub String);

// ── Asset ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub label: String,
    pub url: String,
}

/// An asset discovered by a provider — a table, topic, queue, bucket, DAG,
/// etc. `mrn` uniquely identifies it across re-ingestions; re-ingestion
/// merges fields by `mrn` and bumps `updated_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub mrn: Mrn,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub providers: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub schema: HashMap<String, serde_json::Value>,
    pub external_links: Vec<ExternalLink>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    /// Build a new asset as it would look fresh off a discovery run, before
    /// any repository has assigned timestamps/id.
    pub fn fresh(mrn: Mrn, name: impl Into<String>, asset_type: AssetType) -> Self {
        let now = Utc::now();
        Asset {
            id: AssetId::new(),
            mrn,
            name: name.into(),
            asset_type,
            providers: Vec::new(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            schema: HashMap::new(),
            external_links: Vec::new(),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.providers.iter().any(|p| p == provider)
    }
}

// ── Lineage ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineageType {
    DataFlow,
    Derivation,
    SchemaReference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEdge {
    pub source_mrn: Mrn,
    pub target_mrn: Mrn,
    #[serde(rename = "type")]
    pub edge_type: LineageType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistic {
    pub asset_mrn: Mrn,
    pub metric_name: String,
    pub value: f64,
}

// ── Pipeline schedule / run ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSchedule {
    pub id: ScheduleId,
    pub name: String,
    pub plugin_id: String,
    /// Encrypted config blob (AES-GCM ciphertext, base64-free — raw bytes).
    pub config: Vec<u8>,
    pub cron_expr: String,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_entities: u64,
    pub by_type: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub schedule_id: Option<ScheduleId>,
    pub pipeline_name: String,
    pub created_by: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    pub error_message: Option<String>,
}

impl PipelineRun {
    pub fn new_pending(pipeline_name: impl Into<String>, created_by: impl Into<String>, schedule_id: Option<ScheduleId>) -> Self {
        PipelineRun {
            id: RunId::new(),
            schedule_id,
            pipeline_name: pipeline_name.into(),
            created_by: created_by.into(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            ended_at: None,
            summary: RunSummary::default(),
            error_message: None,
        }
    }

    /// `created_by ∈ {"scheduler", "system"}` runs are not manually
    /// triggered and don't get a user-facing completion notification.
    pub fn is_manually_triggered(&self) -> bool {
        self.created_by != "scheduler" && self.created_by != "system"
    }
}

// ── Rules ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    DataProduct,
    AssetRule,
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleKind::DataProduct => write!(f, "data_product"),
            RuleKind::AssetRule => write!(f, "asset_rule"),
        }
    }
}

/// The shape shared by Data-Product rules and Asset-Rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCore {
    pub id: RuleId,
    pub owner_entity_id: String,
    pub name: String,
    pub query_expression: String,
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProductRule {
    pub core: RuleCore,
    pub assets_manual: Vec<AssetId>,
    pub rules: Vec<RuleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRule {
    pub core: RuleCore,
    pub links: Vec<ExternalLink>,
    pub term_ids: Vec<TermId>,
}

// ── Membership ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub rule_id: RuleId,
    pub asset_id: AssetId,
    pub created_at: DateTime<Utc>,
}

// ── Notification ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    User(UserId),
    Team(TeamId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AssetChange,
    SchemaChange,
    LineageChange,
    Mention,
    JobCompletion,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationKind::AssetChange => "asset_change",
            NotificationKind::SchemaChange => "schema_change",
            NotificationKind::LineageChange => "lineage_change",
            NotificationKind::Mention => "mention",
            NotificationKind::JobCompletion => "job_completion",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: HashMap<String, serde_json::Value>,
    pub link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Per-user opt-out for a notification kind. Absence means "enabled".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub enabled: bool,
}

// ── Webhooks ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: WebhookId,
    pub url: String,
    pub secret: String,
    pub event_filters: Vec<NotificationKind>,
    pub enabled: bool,
    pub owner_id: UserId,
}

impl WebhookSubscription {
    pub fn accepts(&self, kind: NotificationKind) -> bool {
        self.enabled && (self.event_filters.is_empty() || self.event_filters.contains(&kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub subscription_id: WebhookId,
    pub event_id: Uuid,
    pub attempt_n: u32,
    pub status: DeliveryStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
}
