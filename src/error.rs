use thiserror::Error;

/// Domain failures raised while interpreting a single command.
///
/// A command whose `optional` flag (or whose selector's `optional` flag) is
/// set demotes any of these into a `Warned` outcome instead of failing the
/// flow. Errors outside this enum (driver transport failures, script engine
/// faults, …) are never eligible for that demotion.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("element not found: {description} ({debug_hint})")]
    ElementNotFound {
        description: String,
        root_snapshot: String,
        debug_hint: String,
    },

    #[error("assertion failed: {description} ({debug_hint})")]
    AssertionFailure {
        description: String,
        root_snapshot: String,
        debug_hint: String,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unable to copy text from element: {description}")]
    UnableToCopyTextFromElement { description: String },

    #[error("unable to launch app {app_id}: {reason}")]
    UnableToLaunchApp { app_id: String, reason: String },

    #[error("unable to clear state for {app_id}: {reason}")]
    UnableToClearState { app_id: String, reason: String },

    #[error("unicode input not supported by this driver: {sample:?}")]
    UnicodeNotSupported { sample: String },

    #[error("AI engine not configured; command requires a cloud API key")]
    CloudApiKeyNotAvailable,
}

/// Everything that can go wrong while running a flow.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("script engine error: {0}")]
    ScriptEngine(String),

    #[error("flow was cancelled")]
    Cancelled,
}

impl FlowError {
    /// True for the subset of failures the interpreter will demote to a
    /// warning when the offending command (or its selector) is `optional`.
    pub fn is_domain(&self) -> bool {
        matches!(self, FlowError::Domain(_))
    }
}

/// Distinguishes the two ways a command can fail, so the loop can apply
/// optional-demotion only to `Domain(_)`.
#[derive(Debug)]
pub enum CommandFailure {
    Domain(DomainError),
    Other(FlowError),
}

impl From<DomainError> for CommandFailure {
    fn from(e: DomainError) -> Self {
        CommandFailure::Domain(e)
    }
}

impl From<FlowError> for CommandFailure {
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::Domain(d) => CommandFailure::Domain(d),
            other => CommandFailure::Other(other),
        }
    }
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandFailure::Domain(e) => write!(f, "{e}"),
            CommandFailure::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommandFailure {}
