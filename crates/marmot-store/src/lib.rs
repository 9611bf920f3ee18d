//! Repository traits owning each table family named in the persisted
//! state layout, plus `PostgresStore` (the production backend) and
//! `InMemoryStore` (tests / local bootstrap).

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repo;

pub use memory::{InMemoryStore, MemoryRuleRepository};
pub use postgres::{PostgresRuleRepository, PostgresStore};
pub use repo::{
    AdvisoryLock, AssetRepository, LineageRepository, MembershipDelta, MembershipRepository,
    NotificationRepository, RuleRepository, ScheduleStore, WebhookRepository,
};
