//! Registry error types.

use thiserror::Error;

/// Errors raised while sourcing specs from a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry configuration invalid: {0}")]
    Config(String),

    #[error("invalid registry url '{url}': {reason}")]
    Url { url: String, reason: String },

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unable to authenticate to the registry, registry credentials could be invalid")]
    Unauthorized,

    #[error("unexpected registry response code {code}: {body}")]
    Response { code: u16, body: String },

    #[error("failed to resolve registry credentials: {0}")]
    Auth(String),

    #[error("image listing incomplete, a page fetch failed")]
    IncompleteListing,

    #[error("failed to read manifest for image '{image}': {reason}")]
    Manifest { image: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml decode error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
