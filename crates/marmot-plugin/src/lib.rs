pub mod error;
mod http_catalog_source;
mod manifest_source;
pub mod registry;
pub mod source;

pub use error::PluginError;
pub use http_catalog_source::HttpCatalogSource;
pub use manifest_source::ManifestSource;
pub use registry::PluginRegistry;
pub use source::{DiscoverContext, DiscoverResult, PluginMeta, Source};
