use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook delivery queue is full")]
    QueueFull,
    #[error("webhook dispatcher has shut down")]
    Closed,
}

impl From<WebhookError> for marmot_domain::MarmotError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::QueueFull => {
                marmot_domain::MarmotError::new(marmot_domain::ErrorKind::TransientIo, e.to_string())
            }
            WebhookError::Closed => marmot_domain::MarmotError::new(marmot_domain::ErrorKind::Conflict, e.to_string()),
        }
    }
}
