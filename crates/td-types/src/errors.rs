use thiserror::Error;

use crate::trial::{StudyId, TrialId};

/// Main error type for the Tandem system
#[derive(Error, Debug)]
pub enum TdError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{guidance} (the underlying error was: {source})")]
    CapabilityUnavailable {
        guidance: String,
        #[source]
        source: ProbeError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Objective failed on trial {trial_id}: {source}")]
    ObjectiveFailed {
        trial_id: TrialId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TdError {
    /// Classify an error returned by an objective for `trial_id`.
    ///
    /// Objectives that failed because a ledger or transport call failed carry
    /// a `TdError` inside the `anyhow::Error`; that error is surfaced as is.
    pub fn from_objective(trial_id: TrialId, error: anyhow::Error) -> Self {
        match error.downcast::<TdError>() {
            Ok(inner) => inner,
            Err(error) => match error.downcast::<LedgerError>() {
                Ok(ledger) => TdError::Ledger(ledger),
                Err(error) => match error.downcast::<TransportError>() {
                    Ok(transport) => TdError::Transport(transport),
                    Err(source) => TdError::ObjectiveFailed { trial_id, source },
                },
            },
        }
    }

    /// Whether the error is one of the fatal infrastructure kinds that a
    /// catch policy must never swallow.
    pub fn is_infrastructure(error: &anyhow::Error) -> bool {
        error.is::<TdError>() || error.is::<LedgerError>() || error.is::<TransportError>()
    }
}

/// Failure of the transport capability probe run at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProbeError(pub String);

/// Ledger (study storage) errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Study already exists: {name}")]
    DuplicatedStudy { name: String },

    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Unknown study id: {study_id}")]
    UnknownStudy { study_id: StudyId },

    #[error("Trial not found: {trial_id}")]
    TrialNotFound { trial_id: TrialId },

    #[error("Trial {trial_id} is already finished")]
    TrialFinished { trial_id: TrialId },

    #[error("Parameter {name} of trial {trial_id} was already suggested from a different distribution")]
    IncompatibleDistribution { trial_id: TrialId, name: String },

    #[error("No completed trials in study {study_name}")]
    NoCompletedTrials { study_name: String },

    #[error("Journal is corrupt at byte {offset}: {message}")]
    CorruptJournal { offset: u64, message: String },

    #[error("Journal IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Transport (collective communication) errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("rank {rank} is outside a group of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("root rank {root} did not supply a payload to broadcast")]
    MissingPayload { root: usize },

    #[error("peer {peer} disconnected")]
    Disconnected { peer: usize },

    #[error("timed out after {timeout_ms} ms waiting for rank {peer}")]
    Timeout { peer: usize, timeout_ms: u64 },

    #[error("collective mismatch with rank {peer}: expected {expected}, received {received}")]
    CollectiveMismatch {
        peer: usize,
        expected: String,
        received: String,
    },

    #[error("failed to encode collective payload: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result type alias for Tandem operations
pub type TdResult<T> = Result<T, TdError>;

/// Result type alias for storage operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! invalid_config {
    ($($arg:tt)*) => {
        $crate::TdError::InvalidConfiguration(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TdError::Internal(format!($($arg)*))
    };
}
