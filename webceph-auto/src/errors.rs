use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("No strategy located '{target}' (attempted: {})", .attempts.join("; "))]
    LocatorNotFound {
        target: String,
        attempts: Vec<String>,
    },

    #[error("No window matched any pattern tier (candidates: {})", .candidates.join("; "))]
    AcquisitionFailed { candidates: Vec<String> },

    #[error("Stage '{stage}' cannot run before '{blocking}' has completed")]
    OutOfOrderExecution { stage: String, blocking: String },

    #[error("Stage '{stage}' failed: {cause}")]
    StageFailed {
        stage: String,
        #[source]
        cause: Box<AutomationError>,
    },

    #[error("Remote sync '{action}' failed: {reason}{}", queued_suffix(.queued))]
    RemoteSyncFailed {
        action: String,
        reason: String,
        queued: bool,
    },

    #[error("Queued operation '{id}' ({action}) dropped after {attempts} attempts: {last_error}")]
    QueueExhausted {
        id: String,
        action: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Credentials are not configured: {0}")]
    MissingCredentials(String),

    #[error("Pipeline is blocked until the operator clears: {0}")]
    PipelineBlocked(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Platform-specific error: {0}")]
    PlatformError(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn queued_suffix(queued: &bool) -> &'static str {
    if *queued {
        " (queued for replay)"
    } else {
        ""
    }
}

impl AutomationError {
    /// Failures that must be corrected by the operator before anything else runs.
    pub fn is_fatal(&self) -> bool {
        match self {
            AutomationError::MissingCredentials(_) | AutomationError::UnsupportedPlatform(_) => {
                true
            }
            AutomationError::StageFailed { cause, .. } => cause.is_fatal(),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AutomationError::Timeout(_)
            | AutomationError::Http(_)
            | AutomationError::PlatformError(_)
            | AutomationError::LocatorNotFound { .. } => true,
            AutomationError::StageFailed { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AutomationError {
    fn from(e: reqwest::Error) -> Self {
        AutomationError::Http(e.to_string())
    }
}
