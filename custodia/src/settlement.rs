// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Withdrawal settlement pipeline.
//!
//! State machine: Requested -> Locked -> BalanceVerified ->
//! TransferSubmitted -> TransferConfirmed -> LedgerCommitted, with failure
//! edges to Rejected / TransferFailed and the ambiguous ConfirmationPending
//! edge handed to the reconciler.
//!
//! The account row lock taken at BalanceVerified is held (in one open
//! database transaction) across the external transfer and released by the
//! commit that writes the journal row, so no concurrent settlement can
//! verify against a stale balance. The external transfer is always confirmed
//! before the local debit is committed.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use diesel_async::{AsyncConnection, AsyncPgConnection};
use scoped_futures::ScopedFutureExt;
use tracing::{debug, info, warn};

use custodia_schema::models::{Account, NewLedgerTransaction, TransactionKind, TransactionStatus};

use crate::accrual;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::guard::SettlementGuard;
use crate::ledger_client::{await_confirmation, LedgerClient};
use crate::metrics::EngineMetrics;
use crate::store::{self, AccountStore};
use crate::telegram::SharedNotifier;
use crate::types::{format_units, AccountId, Settled, SettlementState};

/// What the settlement transaction committed. `Err` paths of the transaction
/// roll back and leave no trace; these variants all commit *something*.
enum TxnOutcome {
    Settled(Settled),
    ConfirmationPending { signature: String },
    TransferFailed { signature: String },
}

#[derive(Clone)]
pub struct SettlementPipeline {
    store: AccountStore,
    ledger: Arc<dyn LedgerClient>,
    guard: Arc<SettlementGuard>,
    notifier: SharedNotifier,
    metrics: Arc<EngineMetrics>,
    config: Arc<EngineConfig>,
}

impl SettlementPipeline {
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

    /// Settle a withdrawal of `amount` (smallest units) of accrued profit to
    /// the account's custodial address.
    pub async fn withdraw(&self, account_id: AccountId, amount: u64) -> EngineResult<Settled> {
        if amount < self.config.min_withdrawal {
            let err = EngineError::BelowMinimum {
                requested: amount,
                minimum: self.config.min_withdrawal,
            };
            self.record_rejection(&err);
            return Err(err);
        }

        if !self.guard.acquire(account_id) {
            let err = EngineError::LockContention;
            self.record_rejection(&err);
            return Err(err);
        }
        debug!(
            "[Settlement] account {}: {}",
            account_id,
            SettlementState::Locked.as_str()
        );

        // Once the guard is held the attempt runs detached: a caller that
        // times out and drops this future must not cancel a transfer that
        // may already be submitted. The guard is held for the full state
        // machine duration and released only at a terminal state.
        let pipeline = self.clone();
        let task = tokio::spawn(async move {
            pipeline.metrics.inflight_settlements.inc();
            let started = Instant::now();
            let result = pipeline.execute(account_id, amount).await;
            pipeline
                .metrics
                .settlement_latency
                .observe(started.elapsed().as_secs_f64());
            pipeline.metrics.inflight_settlements.dec();
            pipeline.guard.release(account_id);
            pipeline.report(account_id, amount, &result).await;
            result
        });

        task.await.unwrap_or_else(|e| {
            Err(EngineError::Internal(format!(
                "settlement task for account {} failed: {}",
                account_id, e
            )))
        })
    }

    /// Fold accrued profit into the principal, restarting the growth curve.
    /// Purely internal: no external transfer. Returns the reinvested profit
    /// (zero is a successful no-op).
    pub async fn reinvest(&self, account_id: AccountId) -> EngineResult<u64> {
        if !self.guard.acquire(account_id) {
            return Err(EngineError::LockContention);
        }
        let result = self.execute_reinvest(account_id).await;
        self.guard.release(account_id);

        match &result {
            Ok(0) => {}
            Ok(profit) => {
                self.metrics.reinvests_completed.inc();
                info!(
                    "[Settlement] account {} reinvested {}",
                    account_id, profit
                );
                self.notifier
                    .notify(
                        account_id,
                        &format!(
                            "Reinvested {} of profit. Your new principal is growing from today.",
                            format_units(*profit, self.config.unit_decimals)
                        ),
                    )
                    .await;
            }
            Err(e) => warn!(
                "[Settlement] account {} reinvest failed: {}",
                account_id, e
            ),
        }
        result
    }

    async fn execute(&self, account_id: AccountId, amount: u64) -> EngineResult<Settled> {
        let mut conn = self.store.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let now = Utc::now();
        let ledger = self.ledger.clone();
        let metrics = self.metrics.clone();
        let config = self.config.clone();

        // Filled in once a transfer is submitted. If the transaction fails
        // past that point the transfer is out regardless, so the journal
        // entry must survive on a fresh connection.
        let submitted: Arc<std::sync::Mutex<Option<(String, u64)>>> =
            Arc::new(std::sync::Mutex::new(None));
        let submitted_slot = submitted.clone();

        let outcome = conn
            .transaction::<TxnOutcome, EngineError, _>(|conn| {
                async move {
                    // BalanceVerified: re-read under a row lock and recompute
                    // with current time. Mandatory even if the caller
                    // pre-validated; time has passed and state may have
                    // changed concurrently.
                    let account = store::lock_account(&mut *conn, account_id).await?;
                    let check = verify_withdrawable(&account, now, config.growth_period_days, amount)?;
                    debug!(
                        "[Settlement] account {}: {} balance={} profit={}",
                        account_id,
                        SettlementState::BalanceVerified.as_str(),
                        check.balance,
                        check.profit
                    );

                    // The treasury must cover the transfer right now; a
                    // shortfall is fatal for this attempt and needs a human.
                    let treasury_balance = ledger.get_balance(&config.treasury.address).await?;
                    metrics.record_treasury_balance(treasury_balance);
                    if treasury_balance < amount {
                        return Err(EngineError::TreasuryUnderfunded {
                            required: amount,
                            available: treasury_balance,
                        });
                    }

                    let signature = ledger
                        .submit_transfer(&config.treasury.key_ref, &account.address, amount)
                        .await?;
                    *submitted_slot.lock().unwrap() = Some((signature.clone(), check.balance));
                    info!(
                        "[Settlement] account {}: {} amount={} sig={}",
                        account_id,
                        SettlementState::TransferSubmitted.as_str(),
                        amount,
                        signature
                    );

                    match await_confirmation(
                        ledger.as_ref(),
                        &signature,
                        config.confirm_poll_interval(),
                        config.confirm_timeout(),
                    )
                    .await
                    {
                        Ok(true) => {
                            // TransferConfirmed -> LedgerCommitted, in the
                            // same transaction that held the row lock.
                            let balance_after = check.balance - amount;
                            store::apply_withdrawal_debit(&mut *conn, account_id, balance_after, now)
                                .await?;
                            store::insert_transaction(
                                &mut *conn,
                                &NewLedgerTransaction {
                                    account_id,
                                    kind: TransactionKind::Withdrawal.as_str().to_string(),
                                    amount: amount as i64,
                                    external_signature: Some(signature.clone()),
                                    balance_after: balance_after as i64,
                                    status: TransactionStatus::Completed.as_str().to_string(),
                                },
                            )
                            .await?;
                            Ok(TxnOutcome::Settled(Settled {
                                signature,
                                amount,
                                balance_after,
                            }))
                        }
                        Ok(false) => {
                            // The ledger dropped the transfer: journal the
                            // attempt, no debit.
                            store::insert_transaction(
                                &mut *conn,
                                &NewLedgerTransaction {
                                    account_id,
                                    kind: TransactionKind::Withdrawal.as_str().to_string(),
                                    amount: amount as i64,
                                    external_signature: Some(signature.clone()),
                                    balance_after: check.balance as i64,
                                    status: TransactionStatus::Failed.as_str().to_string(),
                                },
                            )
                            .await?;
                            Ok(TxnOutcome::TransferFailed { signature })
                        }
                        Err(EngineError::ConfirmationTimeout { signature }) => {
                            // Ambiguous: the transfer may or may not land.
                            // Commit only a pending journal row keyed by the
                            // signature; the reconciler resolves it by
                            // observation, never by resubmission.
                            store::insert_transaction(
                                &mut *conn,
                                &NewLedgerTransaction {
                                    account_id,
                                    kind: TransactionKind::Withdrawal.as_str().to_string(),
                                    amount: amount as i64,
                                    external_signature: Some(signature.clone()),
                                    balance_after: (check.balance - amount) as i64,
                                    status: TransactionStatus::Pending.as_str().to_string(),
                                },
                            )
                            .await?;
                            Ok(TxnOutcome::ConfirmationPending { signature })
                        }
                        Err(e) => Err(e),
                    }
                }
                .scope_boxed()
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // A rolled-back transaction is harmless before submission.
                // After it, the transfer is on the ledger with no journal
                // entry; park a pending row out-of-band so the reconciler
                // can commit the debit by observation.
                let slot = submitted.lock().unwrap().clone();
                if let Some((signature, balance)) = slot {
                    warn!(
                        "[Settlement] account {} commit failed after submit (sig={}): {}",
                        account_id, signature, e
                    );
                    if let Err(journal_err) = self
                        .journal_pending_withdrawal(account_id, amount, &signature, balance)
                        .await
                    {
                        warn!(
                            "[Settlement] could not journal pending row for sig={}: {}",
                            signature, journal_err
                        );
                    }
                }
                return Err(e);
            }
        };

        match outcome {
            TxnOutcome::Settled(settled) => {
                info!(
                    "[Settlement] account {}: {} sig={}",
                    account_id,
                    SettlementState::LedgerCommitted.as_str(),
                    settled.signature
                );
                Ok(settled)
            }
            TxnOutcome::ConfirmationPending { signature } => {
                warn!(
                    "[Settlement] account {}: {} sig={}",
                    account_id,
                    SettlementState::ConfirmationPending.as_str(),
                    signature
                );
                Err(EngineError::ConfirmationTimeout { signature })
            }
            TxnOutcome::TransferFailed { signature } => {
                warn!(
                    "[Settlement] account {}: {} sig={}",
                    account_id,
                    SettlementState::TransferFailed.as_str(),
                    signature
                );
                Err(EngineError::RpcFatal(format!(
                    "transfer {} failed on the ledger",
                    signature
                )))
            }
        }
    }

    async fn journal_pending_withdrawal(
        &self,
        account_id: AccountId,
        amount: u64,
        signature: &str,
        balance: u64,
    ) -> EngineResult<()> {
        let mut conn = self.store.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        store::insert_transaction(
            conn,
            &NewLedgerTransaction {
                account_id,
                kind: TransactionKind::Withdrawal.as_str().to_string(),
                amount: amount as i64,
                external_signature: Some(signature.to_string()),
                balance_after: balance.saturating_sub(amount) as i64,
                status: TransactionStatus::Pending.as_str().to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn execute_reinvest(&self, account_id: AccountId) -> EngineResult<u64> {
        let mut conn = self.store.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let now = Utc::now();
        let period_days = self.config.growth_period_days;

        conn.transaction::<u64, EngineError, _>(|conn| {
            async move {
                let account = store::lock_account(&mut *conn, account_id).await?;
                let (balance, profit) = account_balance(&account, now, period_days);
                if profit == 0 {
                    return Ok(0);
                }

                store::apply_reinvest(&mut *conn, account_id, balance, now).await?;
                store::insert_transaction(
                    &mut *conn,
                    &NewLedgerTransaction {
                        account_id,
                        kind: TransactionKind::Reinvest.as_str().to_string(),
                        amount: profit as i64,
                        external_signature: None,
                        balance_after: balance as i64,
                        status: TransactionStatus::Completed.as_str().to_string(),
                    },
                )
                .await?;
                Ok(profit)
            }
            .scope_boxed()
        })
        .await
    }

    fn record_rejection(&self, err: &EngineError) {
        self.metrics
            .settlements_rejected
            .with_label_values(&[err.error_type()])
            .inc();
    }

    async fn report(&self, account_id: AccountId, amount: u64, result: &EngineResult<Settled>) {
        let decimals = self.config.unit_decimals;
        match result {
            Ok(settled) => {
                self.metrics.settlements_completed.inc();
                self.metrics.withdrawal_amount_total.inc_by(settled.amount);
                self.notifier
                    .notify(
                        account_id,
                        &format!(
                            "✅ Withdrawal of {} confirmed.\nSignature: <code>{}</code>",
                            format_units(settled.amount, decimals),
                            settled.signature
                        ),
                    )
                    .await;
            }
            Err(err) => {
                self.record_rejection(err);
                match err {
                    EngineError::TreasuryUnderfunded {
                        required,
                        available,
                    } => {
                        warn!(
                            "[Settlement] treasury underfunded: need {}, have {}",
                            required, available
                        );
                        self.notifier
                            .alert(&format!(
                                "Treasury underfunded: withdrawal of {} for account {} needs {}, \
                                 treasury holds {}. Manual refill required.",
                                format_units(amount, decimals),
                                account_id,
                                format_units(*required, decimals),
                                format_units(*available, decimals)
                            ))
                            .await;
                        self.notifier.notify(account_id, &err.user_message(decimals)).await;
                    }
                    e if e.is_rejection() => {
                        self.notifier.notify(account_id, &e.user_message(decimals)).await;
                    }
                    EngineError::ConfirmationTimeout { .. } => {
                        self.notifier.notify(account_id, &err.user_message(decimals)).await;
                    }
                    e => {
                        warn!(
                            "[Settlement] account {} withdrawal failed: {}",
                            account_id, e
                        );
                        self.notifier
                            .alert(&format!(
                                "Withdrawal failure for account {} ({}): {}",
                                account_id,
                                e.error_type(),
                                e
                            ))
                            .await;
                        self.notifier.notify(account_id, &e.user_message(decimals)).await;
                    }
                }
            }
        }
    }
}

/// Recomputed balance and withdrawable profit for an account row at `now`.
/// An account with no growth anchor (never deposited) sits at its principal.
pub fn account_balance(account: &Account, now: DateTime<Utc>, period_days: f64) -> (u64, u64) {
    let principal = account.principal.max(0) as u64;
    let balance = match accrual::growth_anchor(account.principal_since, account.last_withdrawal_at)
    {
        Some(anchor) => accrual::balance(principal, anchor, now, period_days),
        None => principal,
    };
    (balance, accrual::profit(principal, balance))
}

#[derive(Debug)]
struct WithdrawalCheck {
    balance: u64,
    profit: u64,
}

fn verify_withdrawable(
    account: &Account,
    now: DateTime<Utc>,
    period_days: f64,
    amount: u64,
) -> EngineResult<WithdrawalCheck> {
    let (balance, profit) = account_balance(account, now, period_days);
    if amount > profit {
        return Err(EngineError::InsufficientBalance {
            requested: amount,
            available: profit,
        });
    }
    Ok(WithdrawalCheck { balance, profit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const UNIT: u64 = 1_000_000_000;

    fn account_at(
        principal: u64,
        principal_since: Option<DateTime<Utc>>,
        last_withdrawal_at: Option<DateTime<Utc>>,
    ) -> Account {
        Account {
            user_id: 1,
            address: "ADDR".to_string(),
            key_ref: "key".to_string(),
            principal: principal as i64,
            principal_since,
            last_withdrawal_at,
            ledger_balance: principal as i64,
            referred_by: None,
            auto_withdrawal: false,
            auto_reinvest: false,
            created_at: Utc::now(),
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_profit_after_one_period_is_principal() {
        let account = account_at(UNIT, Some(t0()), None);
        let now = t0() + Duration::days(10);
        let (balance, profit) = account_balance(&account, now, 10.0);
        assert_eq!(balance, 2 * UNIT);
        assert_eq!(profit, UNIT);
    }

    #[test]
    fn test_withdrawal_anchor_resets_growth() {
        // A withdrawal 10 days in resets the clock; 5 more days only give
        // half a period of growth from the anchor.
        let account = account_at(UNIT, Some(t0()), Some(t0() + Duration::days(10)));
        let now = t0() + Duration::days(15);
        let (balance, _) = account_balance(&account, now, 10.0);
        assert_eq!(balance, (UNIT as f64 * 2f64.sqrt()).floor() as u64);
    }

    #[test]
    fn test_no_anchor_means_no_growth() {
        let account = account_at(UNIT, None, None);
        let now = t0() + Duration::days(100);
        let (balance, profit) = account_balance(&account, now, 10.0);
        assert_eq!(balance, UNIT);
        assert_eq!(profit, 0);
    }

    #[test]
    fn test_verify_rejects_amount_over_profit() {
        let account = account_at(UNIT, Some(t0()), None);
        let now = t0() + Duration::days(10);
        let err = verify_withdrawable(&account, now, 10.0, UNIT + 1).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientBalance {
                requested: UNIT + 1,
                available: UNIT,
            }
        );
    }

    #[test]
    fn test_verify_allows_exact_profit() {
        let account = account_at(UNIT, Some(t0()), None);
        let now = t0() + Duration::days(10);
        let check = verify_withdrawable(&account, now, 10.0, UNIT).unwrap();
        assert_eq!(check.balance, 2 * UNIT);
        assert_eq!(check.profit, UNIT);
    }
}
