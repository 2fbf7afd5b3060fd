use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Context errors
    #[error("Context validation failed for node {node}: {message}")]
    Validation { node: String, message: String },

    #[error("Expression error: {0}")]
    Expression(String),

    // Node errors
    #[error("{0}")]
    Execution(String),

    #[error("Execution timeout after {timeout_ms}ms: {node}")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Gate condition not met: {condition}")]
    GateFailure { condition: String },

    #[error("No executor registered for node type: {0}")]
    Dependency(String),

    #[error("Approval rejected for node {node}: {reason}")]
    ApprovalRejected { node: String, reason: String },

    // Run errors
    #[error("Workflow run cancelled: {0}")]
    Cancelled(String),

    #[error("Duplicate node id in run: {0}")]
    DuplicateNode(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Shorthand for an executor-level failure.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Whether the retry guard may attempt the node again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Timeout { .. })
    }

    /// Stable category name used in node outputs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Expression(_) => "ExpressionError",
            Self::Execution(_) | Self::Io(_) | Self::Json(_) => "ExecutionError",
            Self::Timeout { .. } => "TimeoutError",
            Self::GateFailure { .. } => "GateFailure",
            Self::Dependency(_) => "DependencyError",
            Self::ApprovalRejected { .. } => "ApprovalRejected",
            Self::Cancelled(_) => "Cancelled",
            Self::DuplicateNode(_) => "ValidationError",
            Self::WorkflowNotFound(_) => "ExecutionError",
            Self::Config(_) | Self::ConfigNotFound(_) => "ConfigError",
            Self::Database(_) => "DatabaseError",
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_failure_message() {
        let err = WeftError::GateFailure {
            condition: "output.score >= 80".into(),
        };
        assert!(err.to_string().contains("Gate condition not met"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_message_mentions_timeout() {
        let err = WeftError::Timeout {
            node: "fetch".into(),
            timeout_ms: 1000,
        };
        assert!(err.to_string().contains("timeout"));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "TimeoutError");
    }

    #[test]
    fn execution_message_is_verbatim() {
        let err = WeftError::execution("Persistent failure");
        assert_eq!(err.to_string(), "Persistent failure");
        assert!(err.is_retryable());
    }

    #[test]
    fn io_errors_are_not_retried() {
        let err: WeftError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "ExecutionError");
    }
}
