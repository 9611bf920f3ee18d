pub mod error;
pub mod observer;
mod service;
mod work;

pub use error::EnqueueError;
pub use observer::MembershipObserver;
pub use service::{
    spawn, MembershipHandle, MembershipServiceConfig, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_PAGE_SIZE, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS,
};
pub use work::WorkItem;
