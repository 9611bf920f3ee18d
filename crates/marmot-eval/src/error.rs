use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("malformed query at position {pos}: {message}")]
    Malformed { pos: usize, message: String },
}

impl From<EvalError> for marmot_domain::MarmotError {
    fn from(e: EvalError) -> Self {
        marmot_domain::MarmotError::malformed_query(e.to_string())
    }
}
