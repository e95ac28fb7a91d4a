use facet::Facet;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RoostError {
    #[error("instance \"{name}\" already exists")]
    AlreadyExists { name: String },

    #[error("instance \"{name}\" does not exist")]
    NotFound { name: String },

    #[error("unable to find \"{query}\" in manifest")]
    ImageNotFound { query: String },

    #[error("{message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{message}")]
    Timeout { message: String },

    #[error("{message}")]
    PreconditionFailed { message: String },

    #[error("{command} is not implemented")]
    Unimplemented { command: String },

    #[error("{message}")]
    ProcessExited { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("failed to persist {what}: {message}")]
    Persist { what: String, message: String },

    #[error("{command} failed: {message}")]
    #[diagnostic(help("make sure {command} is installed and on PATH"))]
    ExternalCommand { command: String, message: String },

    #[error("daemon error: {message}")]
    Daemon { message: String },
}

impl RoostError {
    pub fn network(message: impl Into<String>) -> Self {
        RoostError::Network {
            message: message.into(),
            source: None,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        RoostError::Io {
            context: context.into(),
            source,
        }
    }

    /// Short machine-readable code carried on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            RoostError::AlreadyExists { .. } => "already_exists",
            RoostError::NotFound { .. } | RoostError::ImageNotFound { .. } => "not_found",
            RoostError::Network { .. } => "network_error",
            RoostError::Timeout { .. } => "timeout",
            RoostError::PreconditionFailed { .. } => "failed_precondition",
            RoostError::Unimplemented { .. } => "unimplemented",
            RoostError::ProcessExited { .. } => "process_exited",
            _ => "internal",
        }
    }

    /// Collapse any failure into `PreconditionFailed`, keeping the message.
    /// Name collisions keep their own kind.
    pub fn into_precondition(self) -> Self {
        match self {
            e @ (RoostError::AlreadyExists { .. } | RoostError::PreconditionFailed { .. }) => e,
            other => RoostError::PreconditionFailed {
                message: other.to_string(),
            },
        }
    }
}

/// Structured error returned by every RPC.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

impl From<RoostError> for RpcError {
    fn from(e: RoostError) -> Self {
        RpcError {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
