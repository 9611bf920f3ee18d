use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification aggregator queue is full")]
    QueueFull,
    #[error("notification aggregator has shut down")]
    Closed,
}

impl From<NotifyError> for marmot_domain::MarmotError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::QueueFull => marmot_domain::MarmotError::new(marmot_domain::ErrorKind::TransientIo, e.to_string()),
            NotifyError::Closed => marmot_domain::MarmotError::new(marmot_domain::ErrorKind::Conflict, e.to_string()),
        }
    }
}
