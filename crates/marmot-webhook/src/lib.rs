mod dispatcher;
mod error;
mod signing;

pub use dispatcher::{spawn, WebhookDispatcherConfig, WebhookEvent, WebhookHandle};
pub use error::WebhookError;
pub use signing::sign;
