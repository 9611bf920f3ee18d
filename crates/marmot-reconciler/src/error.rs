use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] marmot_domain::MarmotError),

    #[error("enqueue error: {0}")]
    Enqueue(#[from] marmot_membership::EnqueueError),
}

impl From<ReconcileError> for marmot_domain::MarmotError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Store(err) => err,
            ReconcileError::Enqueue(err) => marmot_domain::MarmotError::new(marmot_domain::ErrorKind::TransientIo, err.to_string()),
        }
    }
}
