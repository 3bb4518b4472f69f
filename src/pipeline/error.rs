//! Error type shared by the pipeline collaborators
//!
//! The scoring core itself never fails; errors come from the edges
//! (SQLite, HTTP, JSON, notification delivery, malformed snapshots).

#[derive(Debug)]
pub enum PipelineError {
    Database(String),
    Serialization(serde_json::Error),
    Http(reqwest::Error),
    Api(String),
    InvalidSnapshot(String),
    Notification(String),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Http(err)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Database(e) => write!(f, "Database error: {}", e),
            PipelineError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PipelineError::Http(e) => write!(f, "HTTP error: {}", e),
            PipelineError::Api(msg) => write!(f, "API error: {}", msg),
            PipelineError::InvalidSnapshot(msg) => write!(f, "Invalid snapshot: {}", msg),
            PipelineError::Notification(msg) => write!(f, "Notification error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Serialization(e) => Some(e),
            PipelineError::Http(e) => Some(e),
            _ => None,
        }
    }
}
