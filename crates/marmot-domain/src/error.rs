use std::fmt;

/// Coarse error classification shared across the whole core. Crate-local
/// error enums (`thiserror`-derived) convert into `MarmotError` at their
/// boundary so callers can `match` on `kind` instead of on concrete error
/// types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; surfaced to the caller.
    Validation,
    /// Missing resource.
    NotFound,
    /// Unique-constraint or state-machine violation.
    Conflict,
    /// Scheduler/run lost its lease.
    LeaseLost,
    /// Network/DB blip; retried with backoff upstream.
    TransientIo,
    /// 4xx from a webhook endpoint, malformed plugin result; not retried.
    PermanentIo,
    /// Rule expression failed to parse.
    MalformedQuery,
    /// Missing required config; terminates the process.
    FatalInit,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::LeaseLost => "lease_lost",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::PermanentIo => "permanent_io",
            ErrorKind::MalformedQuery => "malformed_query",
            ErrorKind::FatalInit => "fatal_init",
        };
        write!(f, "{s}")
    }
}

/// The single tagged error type every subsystem can convert into at its
/// boundary. Carries a human-readable message and, where useful, the
/// original error for `source()` chaining.
#[derive(Debug)]
pub struct MarmotError {
    pub kind: ErrorKind,
    pub message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl MarmotError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { kind, message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn lease_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LeaseLost, message)
    }

    pub fn malformed_query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedQuery, message)
    }

    pub fn fatal_init(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FatalInit, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::TransientIo
    }
}

impl fmt::Display for MarmotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for MarmotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// The run/schedule state machine only allows transitions out of
/// non-terminal states; anything else is this error.
#[derive(Debug, thiserror::Error)]
#[error("invalid transition: cannot move {kind} from {from} to {to}")]
pub struct InvalidTransitionError {
    pub kind: &'static str,
    pub from: String,
    pub to: String,
}

impl From<InvalidTransitionError> for MarmotError {
    fn from(e: InvalidTransitionError) -> Self {
        MarmotError::new(ErrorKind::Conflict, e.to_string())
    }
}
