// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::format_units;

/// Errors produced by the settlement, deposit and reconciliation pipelines.
///
/// Validation rejections (`is_rejection() == true`) are expected, frequent
/// outcomes: they are resolved inside the pipeline and reported to the caller
/// as a rejection message, never as a crash. Everything after a submitted
/// external transfer is surfaced for reconciliation or operator attention,
/// never blindly retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    // Requested amount is under the configured minimum
    BelowMinimum { requested: u64, minimum: u64 },
    // Requested amount exceeds the account's withdrawable profit
    InsufficientBalance { requested: u64, available: u64 },
    // Another settlement for this account is already in flight
    LockContention,
    // Custodial address holds nothing above fee + reserve
    NothingToSweep { observed: u64, required: u64 },
    // Treasury cannot fund the transfer; requires operator intervention
    TreasuryUnderfunded { required: u64, available: u64 },
    // Transient RPC failure (rate limit, congestion); retried with backoff
    RpcTransient(String),
    // Non-retryable RPC failure (malformed transaction, invalid address)
    RpcFatal(String),
    // Transient retries exhausted without an answer
    RpcExhausted(String),
    // Transfer submitted but confirmation never observed in time; resolved
    // by the reconciler, never by resubmission
    ConfirmationTimeout { signature: String },
    // Database failure
    Storage(String),
    // Uncategorized internal error
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Short stable string for metrics labels.
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::BelowMinimum { .. } => "below_minimum",
            EngineError::InsufficientBalance { .. } => "insufficient_balance",
            EngineError::LockContention => "lock_contention",
            EngineError::NothingToSweep { .. } => "nothing_to_sweep",
            EngineError::TreasuryUnderfunded { .. } => "treasury_underfunded",
            EngineError::RpcTransient(_) => "rpc_transient",
            EngineError::RpcFatal(_) => "rpc_fatal",
            EngineError::RpcExhausted(_) => "rpc_exhausted",
            EngineError::ConfirmationTimeout { .. } => "confirmation_timeout",
            EngineError::Storage(_) => "storage",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Expected validation outcome, reported to the caller as a rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::BelowMinimum { .. }
                | EngineError::InsufficientBalance { .. }
                | EngineError::LockContention
                | EngineError::NothingToSweep { .. }
        )
    }

    /// Safe to retry with backoff before anything was submitted.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::RpcTransient(_))
    }

    /// User-facing rejection text, formatted in display units.
    pub fn user_message(&self, decimals: u32) -> String {
        match self {
            EngineError::BelowMinimum { requested, minimum } => format!(
                "Amount {} is below the minimum of {}.",
                format_units(*requested, decimals),
                format_units(*minimum, decimals)
            ),
            EngineError::InsufficientBalance {
                requested,
                available,
            } => format!(
                "Requested {} but only {} of profit is available.",
                format_units(*requested, decimals),
                format_units(*available, decimals)
            ),
            EngineError::LockContention => {
                "Another operation is already in progress for this account.".to_string()
            }
            EngineError::NothingToSweep { observed, required } => format!(
                "Nothing to deposit: balance {} does not cover fee and reserve of {}.",
                format_units(*observed, decimals),
                format_units(*required, decimals)
            ),
            EngineError::TreasuryUnderfunded { .. } => {
                "Payouts are temporarily delayed. The operators have been notified.".to_string()
            }
            EngineError::ConfirmationTimeout { .. } => {
                "Transfer submitted; confirmation is taking longer than usual. \
                 Your balance will update once the transfer is confirmed."
                    .to_string()
            }
            _ => "Temporary problem talking to the network, please try again later.".to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::BelowMinimum { requested, minimum } => {
                write!(f, "amount {} below minimum {}", requested, minimum)
            }
            EngineError::InsufficientBalance {
                requested,
                available,
            } => write!(
                f,
                "amount {} exceeds available profit {}",
                requested, available
            ),
            EngineError::LockContention => write!(f, "settlement already in progress"),
            EngineError::NothingToSweep { observed, required } => {
                write!(f, "balance {} under fee+reserve {}", observed, required)
            }
            EngineError::TreasuryUnderfunded {
                required,
                available,
            } => write!(
                f,
                "treasury underfunded: need {}, have {}",
                required, available
            ),
            EngineError::RpcTransient(msg) => write!(f, "transient rpc error: {}", msg),
            EngineError::RpcFatal(msg) => write!(f, "rpc error: {}", msg),
            EngineError::RpcExhausted(msg) => write!(f, "rpc retries exhausted: {}", msg),
            EngineError::ConfirmationTimeout { signature } => {
                write!(f, "confirmation timed out for {}", signature)
            }
            EngineError::Storage(msg) => write!(f, "storage error: {}", msg),
            EngineError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<diesel::result::Error> for EngineError {
    fn from(e: diesel::result::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels_are_valid_prometheus_labels() {
        let errors = vec![
            EngineError::BelowMinimum {
                requested: 1,
                minimum: 2,
            },
            EngineError::InsufficientBalance {
                requested: 1,
                available: 0,
            },
            EngineError::LockContention,
            EngineError::NothingToSweep {
                observed: 1,
                required: 2,
            },
            EngineError::TreasuryUnderfunded {
                required: 1,
                available: 0,
            },
            EngineError::RpcTransient("x".to_string()),
            EngineError::RpcFatal("x".to_string()),
            EngineError::RpcExhausted("x".to_string()),
            EngineError::ConfirmationTimeout {
                signature: "sig".to_string(),
            },
            EngineError::Storage("x".to_string()),
            EngineError::Internal("x".to_string()),
        ];

        for error in errors {
            let label = error.error_type();
            assert!(!label.is_empty());
            for c in label.chars() {
                assert!(
                    c.is_ascii_lowercase() || c == '_',
                    "label '{}' contains invalid character '{}'",
                    label,
                    c
                );
            }
        }
    }

    #[test]
    fn test_rejections_vs_failures() {
        assert!(EngineError::LockContention.is_rejection());
        assert!(EngineError::BelowMinimum {
            requested: 1,
            minimum: 2
        }
        .is_rejection());
        assert!(!EngineError::TreasuryUnderfunded {
            required: 1,
            available: 0
        }
        .is_rejection());
        assert!(!EngineError::RpcExhausted("x".to_string()).is_rejection());
    }

    #[test]
    fn test_only_transient_is_transient() {
        assert!(EngineError::RpcTransient("rate limited".to_string()).is_transient());
        assert!(!EngineError::RpcFatal("bad address".to_string()).is_transient());
        assert!(!EngineError::RpcExhausted("gave up".to_string()).is_transient());
    }

    #[test]
    fn test_user_messages_use_display_units() {
        let err = EngineError::BelowMinimum {
            requested: 500_000_000,
            minimum: 1_000_000_000,
        };
        let msg = err.user_message(9);
        assert!(msg.contains("0.5"));
        assert!(msg.contains("1"));
    }
}
