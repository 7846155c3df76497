//! Engine-wide error model.
//!
//! Every failure in the ingestion core carries one of four kinds
//! ([`ErrorKind`]): `validation` failures are terminal and never retried,
//! `transient` failures feed the retry policy, `data_integrity` failures abort
//! without retry because the source material is suspect, and `cancelled` marks
//! a user-requested stop. The retry policy ([`retry_decision`]) is a pure
//! function of the kind and the attempt count, so the job manager never
//! inspects error payloads.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Stage;
use crate::providers::ProviderError;
use crate::stores::StoreError;

/// Classification tag attached to every [`EngineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input or unsupported source. Terminal, never retried.
    Validation,
    /// Network, provider, or timeout failure. Retried with backoff.
    Transient,
    /// The derived data contradicts its source. Terminal, not auto-retried.
    DataIntegrity,
    /// User or operator cancellation.
    Cancelled,
}

/// Errors surfaced by the ingestion pipeline and its collaborators.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("invalid input: {reason}")]
    #[diagnostic(
        code(citeweave::validation),
        help("The request cannot succeed as given; fix the input and resubmit.")
    )]
    Validation { reason: String },

    #[error("transient failure: {reason}")]
    #[diagnostic(
        code(citeweave::transient),
        help("The operation may succeed on retry; the retry policy applies.")
    )]
    Transient { reason: String },

    #[error("data integrity violation: {reason}")]
    #[diagnostic(
        code(citeweave::integrity),
        help("Derived data no longer matches its source; the job will not be auto-retried.")
    )]
    Integrity { reason: String },

    #[error("cancelled")]
    #[diagnostic(code(citeweave::cancelled))]
    Cancelled,

    #[error("stage {stage} timed out after {seconds}s")]
    #[diagnostic(
        code(citeweave::stage_timeout),
        help("Stage timeouts are treated as transient; the retry policy applies.")
    )]
    StageTimeout { stage: Stage, seconds: u64 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Provider(#[from] ProviderError),
}

impl EngineError {
    pub fn validation(reason: impl Into<String>) -> Self {
        EngineError::Validation {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        EngineError::Transient {
            reason: reason.into(),
        }
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        EngineError::Integrity {
            reason: reason.into(),
        }
    }

    /// Classify this error for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::Transient { .. } => ErrorKind::Transient,
            EngineError::Integrity { .. } => ErrorKind::DataIntegrity,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::StageTimeout { .. } => ErrorKind::Transient,
            EngineError::Store(err) => err.kind(),
            EngineError::Provider(err) => err.kind(),
        }
    }
}

/// What the job manager should do with a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after the given backoff.
    Retry { backoff_seconds: u64 },
    /// Park the job as FAILED (may still be retried manually).
    Fail,
    /// Park the job as CANCELLED.
    Cancel,
}

/// Pure retry policy: kind + attempt count in, decision out.
///
/// `attempt_count` is the number of attempts already consumed (the failing
/// attempt included). Backoff doubles per attempt, capped at five minutes.
pub fn retry_decision(kind: ErrorKind, attempt_count: u32, max_attempts: u32) -> RetryDecision {
    match kind {
        ErrorKind::Cancelled => RetryDecision::Cancel,
        ErrorKind::Validation | ErrorKind::DataIntegrity => RetryDecision::Fail,
        ErrorKind::Transient => {
            if attempt_count < max_attempts {
                let backoff = 2u64
                    .saturating_pow(attempt_count.min(16))
                    .min(300);
                RetryDecision::Retry {
                    backoff_seconds: backoff,
                }
            } else {
                RetryDecision::Fail
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_never_retried() {
        assert_eq!(
            retry_decision(ErrorKind::Validation, 0, 3),
            RetryDecision::Fail
        );
        assert_eq!(
            retry_decision(ErrorKind::DataIntegrity, 0, 3),
            RetryDecision::Fail
        );
    }

    #[test]
    fn transient_backs_off_exponentially_until_exhausted() {
        assert_eq!(
            retry_decision(ErrorKind::Transient, 1, 3),
            RetryDecision::Retry { backoff_seconds: 2 }
        );
        assert_eq!(
            retry_decision(ErrorKind::Transient, 2, 3),
            RetryDecision::Retry { backoff_seconds: 4 }
        );
        assert_eq!(retry_decision(ErrorKind::Transient, 3, 3), RetryDecision::Fail);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(
            retry_decision(ErrorKind::Transient, 9, 10),
            RetryDecision::Retry {
                backoff_seconds: 300
            }
        );
    }

    #[test]
    fn cancellation_is_terminal() {
        assert_eq!(retry_decision(ErrorKind::Cancelled, 0, 3), RetryDecision::Cancel);
    }
}
