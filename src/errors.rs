use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Permanent fetch error: {0}")]
    PermanentFetch(String),

    #[error("Job queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Track not ready: {0}")]
    NotReady(String),

    #[error("Timed out waiting for track: {0}")]
    LoadTimeout(String),

    #[error("Cache write error: {0}")]
    CacheWrite(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Audio output error: {0}")]
    Output(String),

    #[error("Invalid transition: cannot {command} while {state}")]
    InvalidTransition { command: &'static str, state: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Player is not running")]
    PlayerGone,
}

impl AppError {
    /// Whether a failed fetch attempt may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::TransientFetch(_) | AppError::Io(_) => true,
            AppError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() {
                    return true;
                }
                match e.status() {
                    Some(status) => is_transient_status(status.as_u16()),
                    None => true,
                }
            }
            _ => false,
        }
    }
}

/// 408, 429 and every 5xx are worth retrying; other 4xx are not.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_classify() {
        assert!(AppError::TransientFetch("reset".into()).is_transient());
        assert!(!AppError::PermanentFetch("404".into()).is_transient());
        assert!(AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).is_transient());
        assert!(!AppError::QueueFull(2).is_transient());
        assert!(!AppError::Cancelled.is_transient());
    }

    #[test]
    fn status_classification() {
        assert!(is_transient_status(503));
        assert!(is_transient_status(429));
        assert!(is_transient_status(408));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(401));
        assert!(!is_transient_status(200));
    }
}
