use marmot_domain::MarmotError;

/// Maps a raw `sqlx` error onto the shared `Kind` taxonomy. Connection/
/// pool/timeout errors are transient; everything else (constraint
/// violations included, since callers that care about conflicts check
/// `rows_affected` explicitly) is treated as a permanent I/O failure.
pub fn map_sqlx(context: &str, err: sqlx::Error) -> MarmotError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            MarmotError::new(marmot_domain::ErrorKind::TransientIo, format!("{context}: {err}"))
        }
        sqlx::Error::RowNotFound => MarmotError::not_found(format!("{context}: {err}")),
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            MarmotError::conflict(format!("{context}: {err}"))
        }
        _ => MarmotError::with_source(marmot_domain::ErrorKind::PermanentIo, context.to_string(), err),
    }
}
