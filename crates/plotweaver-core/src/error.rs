//! Error types for PlotWeaver

use std::time::Duration;

use thiserror::Error;

/// Result type alias using PlotWeaver's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single logical request issued through the request client.
///
/// `Clone` because coalesced callers all observe the same settled result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The call never produced a response (connection refused, reset, DNS...)
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The attempt exceeded its timeout
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The request was cancelled before it settled
    #[error("Request cancelled")]
    Cancelled,

    /// The response body could not be decoded
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Every retry attempt failed
    #[error("Request to {endpoint} failed after {attempts} attempts: {last}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last: Box<RequestError>,
    },
}

impl RequestError {
    /// Whether another attempt may succeed.
    ///
    /// Client errors (4xx) and timeout-class failures fail immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status >= 500,
            Self::Timeout(_) | Self::Cancelled | Self::Decode(_) | Self::Exhausted { .. } => false,
        }
    }

    /// True for timeouts and manual cancellations
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Cancelled => true,
            Self::Exhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// HTTP status of the failure, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Exhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Get error code for this request error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "E100",
            Self::Http { status, .. } if *status < 500 => "E101",
            Self::Http { .. } => "E102",
            Self::Timeout(_) => "E103",
            Self::Cancelled => "E104",
            Self::Decode(_) => "E105",
            Self::Exhausted { .. } => "E106",
        }
    }
}

/// PlotWeaver error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Request errors (E100-E199)
    #[error(transparent)]
    Request(#[from] RequestError),

    // Lock errors (E300-E399)
    #[error("Failed to {operation} in project '{project_id}': {source}")]
    LockOperation {
        operation: &'static str,
        project_id: String,
        #[source]
        source: RequestError,
    },

    #[error("{unresolved} conflict(s) still need a resolution before the operation can be confirmed")]
    UnresolvedConflicts { unresolved: usize },

    #[error("A conflict resolution is already being submitted")]
    ResolutionInProgress,

    #[error("No conflict is pending for component '{0}'")]
    UnknownConflict(String),

    // Channel errors (E400-E499)
    #[error("Malformed push payload: {0}")]
    Parse(String),

    #[error("Push channel error: {0}")]
    Channel(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    Validation(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Request(e) => e.code(),
            Self::LockOperation { .. } => "E300",
            Self::UnresolvedConflicts { .. } => "E301",
            Self::ResolutionInProgress => "E302",
            Self::UnknownConflict(_) => "E303",
            Self::Parse(_) => "E400",
            Self::Channel(_) => "E401",
            Self::ConfigError(_) => "E600",
            Self::Validation(_) => "E800",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Request(RequestError::Network(_)) => {
                Some("Check that the PlotWeaver API is reachable (`plotweaver doctor`)".to_string())
            }
            Self::LockOperation { source, .. } if source.status() == Some(401) => {
                Some("Set the PLOTWEAVER_API_TOKEN environment variable".to_string())
            }
            Self::LockOperation { .. } => Some("Retry the operation".to_string()),
            Self::UnresolvedConflicts { .. } => {
                Some("Choose a resolution for every conflicting component".to_string())
            }
            Self::ConfigError(_) => Some("plotweaver config list".to_string()),
            _ => None,
        }
    }

    /// Whether the user can simply retry the failed action
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(e) | Self::LockOperation { source: e, .. } => {
                e.is_retryable() || matches!(e, RequestError::Exhausted { .. })
            }
            _ => false,
        }
    }
}
