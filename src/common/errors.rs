//! Error types for the orchestrator

use thiserror::Error;

use crate::resilience::retry::CallFailure;

/// Result type alias using our OrchestratorError
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for orchestrator operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Building a domain context failed
    #[error("Context build failed for {domain}: {message}")]
    Context { domain: String, message: String },

    /// A decision worker failed to produce a decision
    #[error("Worker error for {domain}: {message}")]
    Worker { domain: String, message: String },

    /// Executing an approved decision failed
    #[error("Execution error: {0}")]
    Execution(String),

    /// Persistence collaborator errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A hook returned an error
    #[error("Hook {hook} failed: {message}")]
    Hook { hook: String, message: String },

    /// HTTP request errors
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Retry, cooldown and fallback failures
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Build a worker error for a domain
    pub fn worker(domain: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Worker {
            domain: domain.into(),
            message: message.into(),
        }
    }

    /// Build a context error for a domain
    pub fn context(domain: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Context {
            domain: domain.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by the resilient call wrapper and fallback executor
///
/// Every variant answers [`ResilienceError::is_retryable`], which lets a
/// caller decide whether to wait and try later or abandon the operation.
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    /// The call failed for good, either after exhausting retries or on a
    /// non-retryable outcome
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    CallFailed {
        operation: String,
        attempts: u32,
        last_error: CallFailure,
        last_status: Option<u16>,
        last_body: Option<String>,
        retryable: bool,
    },

    /// A shutdown signal aborted the call
    #[error("{operation} cancelled after {attempts} attempt(s)")]
    Cancelled { operation: String, attempts: u32 },

    /// Every resource in a fallback chain was cooling down or failed
    #[error("no resource available for {operation} (skipped: {skipped:?}, failed: {failed:?})")]
    NoResourceAvailable {
        operation: String,
        skipped: Vec<String>,
        failed: Vec<(String, String)>,
    },

    /// A resource returned an error that would fail identically everywhere
    #[error("{operation} aborted on {resource}: {error}")]
    NonRetryable {
        operation: String,
        resource: String,
        error: CallFailure,
    },
}

impl ResilienceError {
    /// Whether waiting and trying again later could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::CallFailed { retryable, .. } => *retryable,
            ResilienceError::Cancelled { .. } => false,
            ResilienceError::NoResourceAvailable { .. } => true,
            ResilienceError::NonRetryable { .. } => false,
        }
    }

    /// Number of attempts made before giving up, when known
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ResilienceError::CallFailed { attempts, .. }
            | ResilienceError::Cancelled { attempts, .. } => Some(*attempts),
            ResilienceError::NoResourceAvailable { failed, .. } => Some(failed.len() as u32),
            ResilienceError::NonRetryable { .. } => None,
        }
    }
}
