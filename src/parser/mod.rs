pub mod errors;
pub mod manifest;
pub mod models;
pub mod playurl;
pub mod resolver;
pub mod source;
pub mod stream_utils;

pub use errors::ResolutionError;
pub use manifest::Manifest;
pub use resolver::{refresh_urls, resolve, resolve_extra};
pub use source::{ManifestSource, PlayUrlSource};
pub use stream_utils::StreamOptions;
