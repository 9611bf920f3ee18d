mod aggregator;
mod error;
mod team;

pub use aggregator::{spawn, CreateInput, NotifyConfig, NotifyHandle, QueueChangeInput};
pub use error::NotifyError;
pub use team::{NoTeamsProvider, TeamMembershipProvider};
