pub mod error;
pub mod manifest;
pub mod server;

pub use error::ConfigError;
pub use manifest::{load_manifest, ManifestDocument};
pub use server::ServerConfig;
