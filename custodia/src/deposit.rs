// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deposit ingestion: sweep funds observed in a per-user custodial address
//! into the treasury and credit the ledger.
//!
//! The sweep amount is what the address holds above the network fee and the
//! chain's minimum reserve. The ledger credit happens in one database
//! transaction only after the sweep transfer is confirmed; the referral
//! cascade and the user notification run strictly after that commit.

use std::sync::Arc;

use chrono::Utc;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use scoped_futures::ScopedFutureExt;
use tracing::{debug, info, warn};

use custodia_schema::models::{NewLedgerTransaction, TransactionKind, TransactionStatus};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::guard::SettlementGuard;
use crate::ledger_client::{await_confirmation, LedgerClient};
use crate::metrics::EngineMetrics;
use crate::referral;
use crate::store::{self, AccountStore};
use crate::telegram::SharedNotifier;
use crate::types::{format_units, AccountId};

/// A committed deposit sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swept {
    pub signature: String,
    pub amount: u64,
}

/// How much of an observed custodial balance can be swept once the network
/// fee and the minimum reserve are left behind.
pub fn sweep_amount(observed: u64, fee: u64, reserve: u64) -> u64 {
    observed.saturating_sub(fee.saturating_add(reserve))
}

#[derive(Clone)]
pub struct DepositPipeline {
    store: AccountStore,
    ledger: Arc<dyn LedgerClient>,
    guard: Arc<SettlementGuard>,
    notifier: SharedNotifier,
    metrics: Arc<EngineMetrics>,
    config: Arc<EngineConfig>,
}

impl DepositPipeline {
    pub fn new(
        store: AccountStore,
        ledger: Arc<dyn LedgerClient>,
        guard: Arc<SettlementGuard>,
        notifier: SharedNotifier,
        metrics: Arc<EngineMetrics>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            ledger,
            guard,
            notifier,
            metrics,
            config,
        }
    }

    /// Sweep the account's custodial address into the treasury and credit
    /// the principal.
    pub async fn sweep(&self, account_id: AccountId) -> EngineResult<Swept> {
        if !self.guard.acquire(account_id) {
            return Err(EngineError::LockContention);
        }

        // Detached for the same reason as the withdrawal pipeline: the sweep
        // transfer, once submitted, cannot be undone, so an abandoned caller
        // must not cancel it mid-flight.
        let pipeline = self.clone();
        let task = tokio::spawn(async move {
            let result = pipeline.execute_sweep(account_id).await;
            pipeline.guard.release(account_id);
            pipeline.report(account_id, &result).await;
            result
        });

        task.await.unwrap_or_else(|e| {
            Err(EngineError::Internal(format!(
                "sweep task for account {} failed: {}",
                account_id, e
            )))
        })
    }

    async fn report(&self, account_id: AccountId, result: &EngineResult<Swept>) {
        match result {
            Ok(swept) => {
                self.metrics.deposits_swept.inc();
                self.metrics.deposit_amount_total.inc_by(swept.amount);
                self.notifier
                    .notify(
                        account_id,
                        &format!(
                            "💰 Deposit of {} credited. It is now growing.",
                            format_units(swept.amount, self.config.unit_decimals)
                        ),
                    )
                    .await;
            }
            Err(e) if e.is_rejection() => {
                debug!("[Deposit] account {} sweep rejected: {}", account_id, e);
            }
            Err(EngineError::ConfirmationTimeout { signature }) => {
                warn!(
                    "[Deposit] account {} sweep unconfirmed, sig={} left to reconciliation",
                    account_id, signature
                );
            }
            Err(e) => {
                warn!("[Deposit] account {} sweep failed: {}", account_id, e);
                self.notifier
                    .alert(&format!(
                        "Deposit sweep failure for account {} ({}): {}",
                        account_id,
                        e.error_type(),
                        e
                    ))
                    .await;
            }
        }
    }

    async fn execute_sweep(&self, account_id: AccountId) -> EngineResult<Swept> {
        let account = self
            .store
            .get(account_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("account {} does not exist", account_id)))?;

        let observed = self.ledger.get_balance(&account.address).await?;
        let fee = self.ledger.estimate_fee().await?;
        let reserve = self.ledger.minimum_reserve().await?;

        let amount = sweep_amount(observed, fee, reserve);
        if amount == 0 {
            return Err(EngineError::NothingToSweep {
                observed,
                required: fee.saturating_add(reserve),
            });
        }
        if amount < self.config.min_deposit {
            return Err(EngineError::BelowMinimum {
                requested: amount,
                minimum: self.config.min_deposit,
            });
        }

        let signature = self
            .ledger
            .submit_transfer(&account.key_ref, &self.config.treasury.address, amount)
            .await?;
        info!(
            "[Deposit] account {} sweeping {} to treasury, sig={}",
            account_id, amount, signature
        );

        match await_confirmation(
            self.ledger.as_ref(),
            &signature,
            self.config.confirm_poll_interval(),
            self.config.confirm_timeout(),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(EngineError::RpcFatal(format!(
                    "sweep transfer {} failed on the ledger",
                    signature
                )));
            }
            Err(EngineError::ConfirmationTimeout { signature }) => {
                // The funds may have left the custodial address. Journal a
                // pending deposit keyed by the signature; the reconciler
                // credits it once the transfer is observed.
                if let Err(journal_err) = self
                    .journal_pending(account_id, amount, &signature, account.ledger_balance)
                    .await
                {
                    warn!(
                        "[Deposit] could not journal pending row for sig={}: {}",
                        signature, journal_err
                    );
                }
                return Err(EngineError::ConfirmationTimeout { signature });
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.commit_credit(account_id, amount, &signature).await {
            // The sweep is confirmed on the ledger; a lost credit would be a
            // divergence. Park a pending row so the reconciler applies the
            // credit by observation.
            warn!(
                "[Deposit] account {} credit commit failed (sig={}): {}",
                account_id, signature, e
            );
            if let Err(journal_err) = self
                .journal_pending(account_id, amount, &signature, account.ledger_balance)
                .await
            {
                warn!(
                    "[Deposit] could not journal pending row for sig={}: {}",
                    signature, journal_err
                );
            }
            return Err(e);
        }

        // Best-effort side effect, strictly after the deposit commit: its
        // failure never rolls the deposit back.
        referral::disburse_bonus(
            &self.store,
            self.ledger.as_ref(),
            &self.notifier,
            &self.metrics,
            &self.config,
            &account,
            amount,
        )
        .await;

        Ok(Swept { signature, amount })
    }

    async fn commit_credit(
        &self,
        account_id: AccountId,
        amount: u64,
        signature: &str,
    ) -> EngineResult<()> {
        let now = Utc::now();
        let row_signature = signature.to_string();
        let mut conn = self.store.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        conn.transaction::<(), EngineError, _>(|conn| {
            async move {
                let account = store::lock_account(&mut *conn, account_id).await?;
                store::apply_deposit_credit(&mut *conn, &account, amount, now).await?;
                store::insert_transaction(
                    &mut *conn,
                    &NewLedgerTransaction {
                        account_id,
                        kind: TransactionKind::Deposit.as_str().to_string(),
                        amount: amount as i64,
                        external_signature: Some(row_signature),
                        balance_after: account.ledger_balance + amount as i64,
                        status: TransactionStatus::Completed.as_str().to_string(),
                    },
                )
                .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn journal_pending(
        &self,
        account_id: AccountId,
        amount: u64,
        signature: &str,
        ledger_balance: i64,
    ) -> EngineResult<()> {
        let mut conn = self.store.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        store::insert_transaction(
            conn,
            &NewLedgerTransaction {
                account_id,
                kind: TransactionKind::Deposit.as_str().to_string(),
                amount: amount as i64,
                external_signature: Some(signature.to_string()),
                balance_after: ledger_balance + amount as i64,
                status: TransactionStatus::Pending.as_str().to_string(),
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_amount_leaves_fee_and_reserve() {
        assert_eq!(sweep_amount(1_000, 10, 90), 900);
    }

    #[test]
    fn test_sweep_amount_zero_when_underfunded() {
        assert_eq!(sweep_amount(99, 10, 90), 0);
        assert_eq!(sweep_amount(100, 10, 90), 0);
        assert_eq!(sweep_amount(0, 10, 90), 0);
    }

    #[test]
    fn test_sweep_amount_does_not_overflow() {
        assert_eq!(sweep_amount(u64::MAX, u64::MAX, u64::MAX), 0);
        assert_eq!(sweep_amount(u64::MAX, 0, 0), u64::MAX);
    }
}
