use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("discovery failed: {0}")]
    DiscoverFailed(String),

    #[error("discovery canceled")]
    Canceled,

    #[error("plugin not registered: {0}")]
    NotRegistered(String),

    #[error("internal plugin error: {0}")]
    Internal(String),
}

impl From<PluginError> for marmot_domain::MarmotError {
    fn from(e: PluginError) -> Self {
        match &e {
            PluginError::InvalidConfig(_) => marmot_domain::MarmotError::validation(e.to_string()),
            PluginError::NotRegistered(_) => marmot_domain::MarmotError::not_found(e.to_string()),
            PluginError::Canceled => {
                marmot_domain::MarmotError::new(marmot_domain::ErrorKind::TransientIo, e.to_string())
            }
            PluginError::DiscoverFailed(_) | PluginError::Internal(_) => {
                marmot_domain::MarmotError::new(marmot_domain::ErrorKind::PermanentIo, e.to_string())
            }
        }
    }
}
