// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Periodic background sweeps.
//!
//! Every sweep goes through the same pipeline entry points as interactive
//! requests: same guard, same row-locked re-verification. There is no
//! privileged fast path for background work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::deposit::DepositPipeline;
use crate::error::EngineError;
use crate::guard::SettlementGuard;
use crate::reconcile::Reconciler;
use crate::settlement::{account_balance, SettlementPipeline};
use crate::store::AccountStore;
use crate::telegram::SharedNotifier;
use crate::types::format_units;

/// A periodically executed background task.
#[async_trait]
pub trait SweepTask: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn run_once(&self);
}

/// Spawn one loop per task. A sweep in flight always runs to completion;
/// cancellation takes effect between ticks, so a settlement that passed
/// submission still reaches a terminal state.
pub fn spawn_sweeps(
    tasks: Vec<Arc<dyn SweepTask>>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    tasks
        .into_iter()
        .map(|task| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(task.interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(
                    "[Scheduler] {} every {:?}",
                    task.name(),
                    task.interval()
                );
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("[Scheduler] {} stopped", task.name());
                            break;
                        }
                        _ = ticker.tick() => {}
                    }
                    task.run_once().await;
                }
            })
        })
        .collect()
}

/// Detect funds sitting in custodial addresses and sweep them into the
/// treasury.
pub struct DepositScanSweep {
    pub store: AccountStore,
    pub pipeline: Arc<DepositPipeline>,
    pub config: Arc<EngineConfig>,
}

#[async_trait]
impl SweepTask for DepositScanSweep {
    fn name(&self) -> &str {
        "deposit_scan"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sweeps.deposit_scan_secs)
    }

    async fn run_once(&self) {
        let accounts = match self.store.list_all().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("[Scheduler] deposit_scan failed: {}", e);
                return;
            }
        };

        futures::stream::iter(accounts)
            .for_each_concurrent(self.config.settlement_concurrency, |account| async move {
                match self.pipeline.sweep(account.user_id).await {
                    Ok(_) => {}
                    Err(e) if e.is_rejection() => debug!(
                        "[Scheduler] deposit_scan: account {} nothing to do: {}",
                        account.user_id, e
                    ),
                    Err(e) => warn!(
                        "[Scheduler] deposit_scan: account {} failed: {}",
                        account.user_id, e
                    ),
                }
            })
            .await;
    }
}

/// Settle accrued profit for accounts that opted into automatic payouts.
pub struct AutoWithdrawalSweep {
    pub store: AccountStore,
    pub pipeline: Arc<SettlementPipeline>,
    pub config: Arc<EngineConfig>,
}

#[async_trait]
impl SweepTask for AutoWithdrawalSweep {
    fn name(&self) -> &str {
        "auto_withdrawal"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sweeps.auto_withdrawal_secs)
    }

    async fn run_once(&self) {
        let accounts = match self.store.list_auto_withdrawal().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("[Scheduler] auto_withdrawal scan failed: {}", e);
                return;
            }
        };

        let now = Utc::now();
        futures::stream::iter(accounts)
            .for_each_concurrent(self.config.settlement_concurrency, |account| async move {
                let (_, profit) = account_balance(&account, now, self.config.growth_period_days);
                if profit < self.config.min_withdrawal {
                    return;
                }
                match self.pipeline.withdraw(account.user_id, profit).await {
                    Ok(_) => {}
                    Err(EngineError::LockContention) => debug!(
                        "[Scheduler] auto_withdrawal: account {} busy, skipping",
                        account.user_id
                    ),
                    Err(e) if e.is_rejection() => debug!(
                        "[Scheduler] auto_withdrawal: account {} rejected: {}",
                        account.user_id, e
                    ),
                    // Failures already alerted inside the pipeline.
                    Err(e) => warn!(
                        "[Scheduler] auto_withdrawal: account {} failed: {}",
                        account.user_id, e
                    ),
                }
            })
            .await;
    }
}

/// Fold profit back into principal for accounts that opted into compounding.
pub struct AutoReinvestSweep {
    pub store: AccountStore,
    pub pipeline: Arc<SettlementPipeline>,
    pub config: Arc<EngineConfig>,
}

#[async_trait]
impl SweepTask for AutoReinvestSweep {
    fn name(&self) -> &str {
        "auto_reinvest"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sweeps.auto_reinvest_secs)
    }

    async fn run_once(&self) {
        let accounts = match self.store.list_auto_reinvest().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("[Scheduler] auto_reinvest scan failed: {}", e);
                return;
            }
        };

        let now = Utc::now();
        futures::stream::iter(accounts)
            .for_each_concurrent(self.config.settlement_concurrency, |account| async move {
                let (_, profit) = account_balance(&account, now, self.config.growth_period_days);
                if profit == 0 {
                    return;
                }
                match self.pipeline.reinvest(account.user_id).await {
                    Ok(_) => {}
                    Err(EngineError::LockContention) => debug!(
                        "[Scheduler] auto_reinvest: account {} busy, skipping",
                        account.user_id
                    ),
                    Err(e) => warn!(
                        "[Scheduler] auto_reinvest: account {} failed: {}",
                        account.user_id, e
                    ),
                }
            })
            .await;
    }
}

/// Keep the display cache roughly in step with the accrual curve.
pub struct BalanceRefreshSweep {
    pub store: AccountStore,
    pub guard: Arc<SettlementGuard>,
    pub config: Arc<EngineConfig>,
}

#[async_trait]
impl SweepTask for BalanceRefreshSweep {
    fn name(&self) -> &str {
        "balance_refresh"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sweeps.balance_refresh_secs)
    }

    async fn run_once(&self) {
        let accounts = match self.store.list_funded().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("[Scheduler] balance_refresh scan failed: {}", e);
                return;
            }
        };

        let now = Utc::now();
        for account in accounts {
            // A settlement in flight will write the authoritative value on
            // commit; don't race it with a stale recomputation.
            if self.guard.held(account.user_id) {
                continue;
            }
            let (balance, _) = account_balance(&account, now, self.config.growth_period_days);
            if let Err(e) = self
                .store
                .refresh_balance_cache(account.user_id, balance)
                .await
            {
                warn!(
                    "[Scheduler] balance_refresh: account {} failed: {}",
                    account.user_id, e
                );
            }
        }
    }
}

/// Resolve ambiguous transfers by observation.
pub struct ReconcileSweep {
    pub reconciler: Arc<Reconciler>,
    pub config: Arc<EngineConfig>,
}

#[async_trait]
impl SweepTask for ReconcileSweep {
    fn name(&self) -> &str {
        "reconcile"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sweeps.reconcile_secs)
    }

    async fn run_once(&self) {
        if let Err(e) = self.reconciler.run_once().await {
            warn!("[Scheduler] reconcile pass failed: {}", e);
        }
    }
}

/// Remind users with withdrawable profit who have no automatic policy set.
pub struct ProfitReminderSweep {
    pub store: AccountStore,
    pub notifier: SharedNotifier,
    pub config: Arc<EngineConfig>,
}

#[async_trait]
impl SweepTask for ProfitReminderSweep {
    fn name(&self) -> &str {
        "profit_reminder"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sweeps.reminder_secs)
    }

    async fn run_once(&self) {
        let accounts = match self.store.list_funded().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!("[Scheduler] profit_reminder scan failed: {}", e);
                return;
            }
        };

        let now = Utc::now();
        for account in accounts {
            if account.auto_withdrawal || account.auto_reinvest {
                continue;
            }
            let (_, profit) = account_balance(&account, now, self.config.growth_period_days);
            if profit < self.config.min_withdrawal {
                continue;
            }
            self.notifier
                .notify(
                    account.user_id,
                    &format!(
                        "📈 You have {} of profit ready to withdraw or reinvest.",
                        format_units(profit, self.config.unit_decimals)
                    ),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl SweepTask for CountingTask {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn run_once(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_sweep_runs_and_stops_on_cancel() {
        let task = Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let handles = spawn_sweeps(vec![task.clone()], cancel.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let runs_before_cancel = task.runs.load(Ordering::SeqCst);
        assert!(runs_before_cancel >= 2, "expected several runs");

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let runs_after_join = task.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), runs_after_join);
    }
}
