use std::time::Duration;

use base64::Engine;

use crate::error::ConfigError;

/// Process-wide configuration read once at startup, per spec.md §6/§9.
///
/// `encryption_key` is `None` only when `ALLOW_UNENCRYPTED=true` was set
/// explicitly — absence of `SERVER_ENCRYPTION_KEY` otherwise is a
/// `FatalInitError` that aborts startup before any component is wired up.
#[derive(Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub encryption_key: Option<[u8; 32]>,
    pub allow_unencrypted: bool,
    pub max_workers: usize,
    pub scheduler_interval: Duration,
    pub lease_expiry: Duration,
    pub claim_expiry: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require_var("DATABASE_URL")?;
        let allow_unencrypted = bool_var("ALLOW_UNENCRYPTED", false)?;

        let encryption_key = match std::env::var("SERVER_ENCRYPTION_KEY") {
            Ok(raw) => Some(decode_key(&raw)?),
            Err(_) if allow_unencrypted => {
                tracing::warn!(
                    "SERVER_ENCRYPTION_KEY is not set; ALLOW_UNENCRYPTED=true so sensitive \
                     schedule config fields will be stored in plaintext"
                );
                None
            }
            Err(_) => return Err(ConfigError::MissingVar("SERVER_ENCRYPTION_KEY".into())),
        };

        Ok(ServerConfig {
            database_url,
            encryption_key,
            allow_unencrypted,
            max_workers: usize_var("MAX_WORKERS", 5)?,
            scheduler_interval: seconds_var("SCHEDULER_INTERVAL", 10)?,
            lease_expiry: seconds_var("LEASE_EXPIRY", 300)?,
            claim_expiry: seconds_var("CLAIM_EXPIRY", 30)?,
        })
    }
}

fn require_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn bool_var(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
            name: name.to_string(),
            message: format!("expected 'true' or 'false', got '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

fn usize_var(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
            name: name.to_string(),
            message: format!("expected a positive integer, got '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

fn seconds_var(name: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::InvalidVar {
                name: name.to_string(),
                message: format!("expected seconds as an integer, got '{raw}'"),
            })?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn decode_key(raw: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(raw).map_err(|e| ConfigError::InvalidVar {
        name: "SERVER_ENCRYPTION_KEY".to_string(),
        message: format!("not valid base64: {e}"),
    })?;
    bytes.try_into().map_err(|v: Vec<u8>| ConfigError::InvalidVar {
        name: "SERVER_ENCRYPTION_KEY".to_string(),
        message: format!("expected 32 raw bytes after base64 decoding, got {}", v.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_vars() {
        for var in ["DATABASE_URL", "SERVER_ENCRYPTION_KEY", "ALLOW_UNENCRYPTED", "MAX_WORKERS"] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn missing_encryption_key_without_allow_unencrypted_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        std::env::set_var("DATABASE_URL", "postgres://localhost/marmot");
        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(v) if v == "SERVER_ENCRYPTION_KEY"));
        clear_vars();
    }

    #[test]
    fn allow_unencrypted_permits_missing_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        std::env::set_var("DATABASE_URL", "postgres://localhost/marmot");
        std::env::set_var("ALLOW_UNENCRYPTED", "true");
        let cfg = ServerConfig::from_env().unwrap();
        assert!(cfg.encryption_key.is_none());
        clear_vars();
    }

    #[test]
    fn valid_key_is_decoded() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_vars();
        std::env::set_var("DATABASE_URL", "postgres://localhost/marmot");
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        std::env::set_var("SERVER_ENCRYPTION_KEY", key);
        let cfg = ServerConfig::from_env().unwrap();
        assert_eq!(cfg.encryption_key, Some([7u8; 32]));
        clear_vars();
    }
}
