use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule config is encrypted but no process encryption key is configured")]
    EncryptionRequired,

    #[error("failed to decrypt schedule config: {0}")]
    Decrypt(String),

    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron { expr: String, source: cron::error::Error },

    #[error("cron expression {0:?} has no upcoming run time")]
    NoUpcomingRun(String),

    #[error(transparent)]
    Plugin(#[from] marmot_plugin::PluginError),

    #[error(transparent)]
    Store(#[from] marmot_domain::MarmotError),
}

impl From<SchedulerError> for marmot_domain::MarmotError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Store(err) => err,
            SchedulerError::Plugin(err) => err.into(),
            SchedulerError::EncryptionRequired => {
                marmot_domain::MarmotError::new(marmot_domain::ErrorKind::FatalInit, e.to_string())
            }
            SchedulerError::Decrypt(_) => marmot_domain::MarmotError::new(marmot_domain::ErrorKind::PermanentIo, e.to_string()),
            SchedulerError::InvalidCron { .. } | SchedulerError::NoUpcomingRun(_) => {
                marmot_domain::MarmotError::validation(e.to_string())
            }
        }
    }
}
