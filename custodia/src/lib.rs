// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Balance accrual and withdrawal settlement engine for user-linked
//! custodial wallets. Balances grow on a deterministic time-based curve;
//! settlement ties an irreversible external transfer to a transactional
//! ledger commit so the two never diverge.

pub mod accrual;
pub mod config;
pub mod deposit;
pub mod error;
pub mod guard;
pub mod ledger_client;
pub mod metrics;
pub mod reconcile;
pub mod referral;
pub mod scheduler;
pub mod settlement;
pub mod store;
pub mod telegram;
pub mod types;

#[cfg(test)]
pub mod mock_ledger;

#[cfg(all(test, feature = "db-tests"))]
mod pipeline_tests;

/// Retry an async operation with exponential backoff until it succeeds, a
/// permanent error is hit, or `max_elapsed_time` runs out. Only errors whose
/// `is_transient()` is true are retried; everything else is surfaced
/// immediately. On exhaustion the last transient error is returned.
#[macro_export]
macro_rules! retry_transient_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // Delay sequence (in secs), applied with jitter:
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 30 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(30),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                match $func.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_transient() => {
                        tracing::debug!("Retrying transient ledger error: {}", e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}

#[cfg(test)]
mod tests {
    use crate::error::{EngineError, EngineResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn flaky(calls: &AtomicUsize, succeed_after: usize) -> EngineResult<u64> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < succeed_after {
            Err(EngineError::RpcTransient("congestion".to_string()))
        } else {
            Ok(7)
        }
    }

    async fn always_fatal(calls: &AtomicUsize) -> EngineResult<u64> {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::RpcFatal("invalid address".to_string()))
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        telemetry_subscribers::init_for_testing();
        let calls = AtomicUsize::new(0);
        let result = retry_transient_with_max_elapsed_time!(
            flaky(&calls, 2),
            Duration::from_secs(10)
        );
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: EngineResult<u64> = retry_transient_with_max_elapsed_time!(
            always_fatal(&calls),
            Duration::from_secs(10)
        );
        assert!(matches!(result, Err(EngineError::RpcFatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_transient_error() {
        let calls = AtomicUsize::new(0);
        let result: EngineResult<u64> = retry_transient_with_max_elapsed_time!(
            flaky(&calls, usize::MAX),
            Duration::from_millis(100)
        );
        assert!(matches!(result, Err(EngineError::RpcTransient(_))));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
