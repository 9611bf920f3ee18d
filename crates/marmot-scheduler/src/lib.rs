mod crypto;
mod cron_util;
mod error;
mod observer;
mod scheduler;

pub use crypto::{decrypt_config, encrypt_config};
pub use cron_util::next_run_at;
pub use error::SchedulerError;
pub use observer::RunObserver;
pub use scheduler::{
    spawn, SchedulerConfig, DEFAULT_LEASE_EXPIRY, DEFAULT_MAX_WORKERS, DEFAULT_SAFETY_MARGIN, DEFAULT_SCHEDULER_INTERVAL,
};
