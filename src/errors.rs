use thiserror::Error;

/// Errors surfaced across the allocator and launcher core.
///
/// Every variant that can occur after ports have been handed out carries
/// the container name so callers can correlate failures with the
/// allocation they (may) need to roll back.
#[derive(Error, Debug)]
pub enum NekoError {
    #[error("invalid container name '{0}': must match ^[A-Za-z0-9][A-Za-z0-9_.-]*$")]
    ValidationError(String),

    #[error("port exhaustion for '{name}': no free {kind} slot below 65535")]
    PortExhaustion { name: String, kind: &'static str },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("port conflict starting '{0}': runtime reported ports already allocated")]
    PortConflict(String),

    #[error("name conflict starting '{0}': a container with this name already exists")]
    NameConflict(String),

    #[error("'{name}' did not become ready within {timeout_s}s")]
    ReadinessTimeout { name: String, timeout_s: u64 },

    #[error("image '{0}' is missing and the build step failed: {1}")]
    ImageMissing(String, String),

    #[error("cleanup error for '{name}': {message}")]
    CleanupError { name: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, NekoError>;
