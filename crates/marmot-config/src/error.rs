use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("conversion error in {path}: {message}")]
    Conversion { path: String, message: String },

    #[error("missing required environment variable {0}")]
    MissingVar(String),

    #[error("invalid value for environment variable {name}: {message}")]
    InvalidVar { name: String, message: String },
}

impl From<ConfigError> for marmot_domain::MarmotError {
    fn from(e: ConfigError) -> Self {
        marmot_domain::MarmotError::fatal_init(e.to_string())
    }
}
