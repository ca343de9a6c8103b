//! Run-level error taxonomy
//!
//! Per-item failures inside the Enricher never surface here; they are absorbed
//! and recorded as "detail unavailable". Everything in [`SyncError`] is a
//! phase-level failure that marks the run `failed`.

use crate::api::ApiError;
use crate::run::state::{RunPhase, TransitionError};
use crate::storage::StorageError;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, exit_status, ErrorCode};

/// Result alias used by the pipeline components
pub type SyncResult<T> = Result<T, SyncError>;

/// The unified error type for a synchronization run
#[derive(Error, Debug)]
pub enum SyncError {
    /// Credential rejected or expired; never retried
    #[error("[E{:04}] Authentication failed: {message}", ErrorCode::AUTH_FAILED)]
    AuthenticationFailed { message: String },

    /// Network or server failure that outlived its retry budget
    #[error("[E{:04}] Transient network failure: {message}", ErrorCode::API_TRANSIENT)]
    TransientNetworkFailure { message: String },

    /// Lister could not produce a complete roster
    #[error(
        "[E{:04}] Listing failed on page {page} after {attempts} attempts: {message}",
        ErrorCode::API_LISTING_FAILED
    )]
    ListingFailed {
        page: u32,
        attempts: u32,
        message: String,
    },

    /// Conflicting identities that the configured policy refuses to resolve
    #[error("[E{:04}] Data integrity violation: {message}", ErrorCode::DATA_INTEGRITY_VIOLATION)]
    DataIntegrityViolation { message: String },

    /// Enricher or Merger aborted mid-phase
    #[error("[E{:04}] {phase} phase failed: {message}", ErrorCode::RUN_PARTIAL_FAILURE)]
    PartialRunFailure {
        phase: RunPhase,
        message: String,
        checkpoint_retained: bool,
    },

    /// Shutdown requested while the run was in progress
    #[error("[E{:04}] Run interrupted during {phase}", ErrorCode::RUN_INTERRUPTED)]
    Interrupted { phase: RunPhase },

    #[error("[E{:04}] Configuration error: {message}", ErrorCode::CONFIG_GENERIC)]
    Config { message: String },

    #[error("[E{:04}] Run not found: {name}", ErrorCode::RUN_NOT_FOUND)]
    RunNotFound { name: String },

    #[error("[E{code:04}] {0}", code = ErrorCode::RUN_INVALID_TRANSITION)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Create a partial-run failure for the given phase
    pub fn partial(phase: RunPhase, message: impl Into<String>, checkpoint_retained: bool) -> Self {
        Self::PartialRunFailure {
            phase,
            message: message.into(),
            checkpoint_retained,
        }
    }

    /// Numeric error code for this error
    pub fn code(&self) -> u16 {
        match self {
            Self::AuthenticationFailed { .. } => ErrorCode::AUTH_FAILED,
            Self::TransientNetworkFailure { .. } => ErrorCode::API_TRANSIENT,
            Self::ListingFailed { .. } => ErrorCode::API_LISTING_FAILED,
            Self::DataIntegrityViolation { .. } => ErrorCode::DATA_INTEGRITY_VIOLATION,
            Self::PartialRunFailure { .. } => ErrorCode::RUN_PARTIAL_FAILURE,
            Self::Interrupted { .. } => ErrorCode::RUN_INTERRUPTED,
            Self::Config { .. } => ErrorCode::CONFIG_GENERIC,
            Self::RunNotFound { .. } => ErrorCode::RUN_NOT_FOUND,
            Self::Transition(_) => ErrorCode::RUN_INVALID_TRANSITION,
            Self::Storage(err) => err.code(),
        }
    }

    /// Whether this error invalidates the credential for every later request
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::AuthenticationFailed { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized(message) => Self::AuthenticationFailed { message },
            other => Self::TransientNetworkFailure {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::state::RunState;

    #[test]
    fn test_display_carries_code() {
        let err = SyncError::auth("token expired");
        assert_eq!(
            err.to_string(),
            "[E2000] Authentication failed: token expired"
        );
        assert!(err.is_authentication());
    }

    #[test]
    fn test_api_error_conversion() {
        let err: SyncError = ApiError::Unauthorized("401".into()).into();
        assert!(err.is_authentication());

        let err: SyncError = ApiError::Transient("connection reset".into()).into();
        assert_eq!(err.code(), ErrorCode::API_TRANSIENT);
    }

    #[test]
    fn test_storage_error_code_passthrough() {
        let err: SyncError = StorageError::lock("held by run-1").into();
        assert_eq!(err.code(), ErrorCode::STORAGE_LOCK_BUSY);
    }

    #[test]
    fn test_partial_failure_message() {
        let err = SyncError::partial(RunPhase::Enriching, "worker crashed", true);
        assert_eq!(err.to_string(), "[E5000] enriching phase failed: worker crashed");
    }

    #[test]
    fn test_transition_error_display() {
        let err: SyncError = TransitionError::Invalid {
            from: RunState::Completed,
            to: RunState::Enriching,
        }
        .into();
        assert_eq!(err.code(), ErrorCode::RUN_INVALID_TRANSITION);
        assert_eq!(
            err.to_string(),
            "[E5002] Invalid run transition from completed to enriching"
        );
    }
}
