use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid work order {path}: {reason}")]
    InvalidWorkOrder { path: PathBuf, reason: String },

    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    #[error("Unknown task kind `{0}`: not present in the routing table")]
    UnknownTaskKind(String),

    #[error("Dispatch to {queue} failed: {reason}")]
    Dispatch { queue: String, reason: String },

    #[error("Store unreachable at {path}: {reason}")]
    StoreUnavailable { path: PathBuf, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T, E = ConductorError> = std::result::Result<T, E>;

impl ConductorError {
    /// True for errors the control loops log and move past instead of exiting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConductorError::MalformedEntry(_)
                | ConductorError::UnknownTaskKind(_)
                | ConductorError::Dispatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_error_display() {
        let err = ConductorError::Dispatch {
            queue: "queue_cloud".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "Dispatch to queue_cloud failed: connection reset"
        );
    }

    #[test]
    fn invalid_work_order_display_names_the_file() {
        let err = ConductorError::InvalidWorkOrder {
            path: PathBuf::from("/jobs/a/work_order.yaml"),
            reason: "missing field `backlog_key`".into(),
        };
        assert!(err.to_string().contains("/jobs/a/work_order.yaml"));
        assert!(err.to_string().contains("backlog_key"));
    }

    #[test]
    fn recoverable_classification() {
        assert!(ConductorError::MalformedEntry("x".into()).is_recoverable());
        assert!(ConductorError::UnknownTaskKind("x".into()).is_recoverable());
        assert!(
            ConductorError::Dispatch {
                queue: "q".into(),
                reason: "r".into()
            }
            .is_recoverable()
        );
        assert!(!ConductorError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConductorError>();
    }
}
