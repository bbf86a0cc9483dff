// Error types
use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, TradeError>;

#[derive(Error, Debug)]
pub enum TradeError {
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Signal rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How the loop and the supervisor should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// External call failed; count it and back off
    Transient,
    /// Admission control said no; not an error condition
    Rejection,
    /// Contract or configuration problem
    Fatal,
}

impl TradeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TradeError::Exchange(_)
            | TradeError::Database(_)
            | TradeError::Cache(_)
            | TradeError::Http(_)
            | TradeError::Io(_)
            | TradeError::Timeout { .. }
            | TradeError::Other(_) => ErrorKind::Transient,
            TradeError::Rejected(_) => ErrorKind::Rejection,
            TradeError::Serialization(_)
            | TradeError::Config(_)
            | TradeError::NotFound(_)
            | TradeError::InvalidInput(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        TradeError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Run a future under a deadline, mapping expiry to `TradeError::Timeout`
pub async fn with_deadline<T, F>(operation: &str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(TradeError::timeout(operation, after)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TradeError::Exchange("down".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            TradeError::Rejected("stage 4".into()).kind(),
            ErrorKind::Rejection
        );
        assert_eq!(
            TradeError::InvalidInput("bad".into()).kind(),
            ErrorKind::Fatal
        );
        assert!(TradeError::timeout("ticker", Duration::from_secs(1)).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_expires() {
        let result: Result<()> = with_deadline("slow call", Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        match result {
            Err(TradeError::Timeout { operation, after }) => {
                assert_eq!(operation, "slow call");
                assert_eq!(after, Duration::from_secs(2));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
