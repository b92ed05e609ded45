use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the coordinator
#[derive(Debug, Error)]
pub enum CoordError {
    /// Misuse of the coordinator or an invalid configuration
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A file lock could not be obtained in time
    #[error("Lock timeout on '{file}' for worker {worker_id} after {timeout_ms}ms")]
    LockTimeout {
        file: String,
        worker_id: String,
        timeout_ms: u64,
    },

    /// The executor reported failure or returned an error for a block
    #[error("Execution failed for {block_id}: {message}")]
    Execution {
        block_id: String,
        message: String,
        context: HashMap<String, String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Post-change verification rejected a block
    #[error("Verification failed for {block_id}: {failed_checks:?}")]
    Verification {
        block_id: String,
        failed_checks: Vec<String>,
    },

    /// The run was cancelled while this operation was waiting
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// An operation is not valid in the current state
    #[error("Invalid state for {operation}: {message}")]
    InvalidState {
        operation: String,
        message: String,
    },

    /// A referenced worker, block or conflict does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        kind: String,
        id: String,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CoordError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a lock timeout error
    pub fn lock_timeout<F: Into<String>, W: Into<String>>(
        file: F,
        worker_id: W,
        timeout_ms: u64,
    ) -> Self {
        Self::LockTimeout {
            file: file.into(),
            worker_id: worker_id.into(),
            timeout_ms,
        }
    }

    /// Create an execution error
    pub fn execution<B: Into<String>, M: Into<String>>(block_id: B, message: M) -> Self {
        Self::Execution {
            block_id: block_id.into(),
            message: message.into(),
            context: HashMap::new(),
            source: None,
        }
    }

    /// Add context to an execution error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Execution { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    /// Create a verification error
    pub fn verification<B: Into<String>>(block_id: B, failed_checks: Vec<String>) -> Self {
        Self::Verification {
            block_id: block_id.into(),
            failed_checks,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    /// Create an invalid state error
    pub fn invalid_state<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<K: Into<String>, I: Into<String>>(kind: K, id: I) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Whether a block that hit this error may be attempted again
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::Execution { .. } | Self::Verification { .. } => true,
            // Collaborator errors raised through anyhow land in Internal
            Self::Io { .. } | Self::Internal { .. } => true,
            Self::Configuration { .. } | Self::InvalidState { .. } | Self::NotFound { .. } => false,
            Self::Cancelled { .. } | Self::Serialization { .. } => false,
        }
    }

    /// Whether this error is the cooperative cancellation signal
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Execution { .. } => "execution",
            Self::Verification { .. } => "verification",
            Self::Cancelled { .. } => "cancelled",
            Self::InvalidState { .. } => "invalid_state",
            Self::NotFound { .. } => "not_found",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CoordError>;

impl From<std::io::Error> for CoordError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for CoordError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<anyhow::Error> for CoordError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
            source: Some(err.into()),
        }
    }
}
