// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation of ambiguous transfers by observation.
//!
//! A pipeline that submitted a transfer but never saw its confirmation
//! leaves a `pending` journal row keyed by the external signature. This pass
//! re-queries the ledger for each such signature and either applies the
//! deferred ledger effect or marks the row failed. It never resubmits.
//!
//! Exactly-once: the effect is applied in a transaction that row-locks both
//! the account and the journal row and re-checks that the row is still
//! pending, so concurrent or repeated passes cannot double-apply.

use std::sync::Arc;

use chrono::Utc;
use diesel_async::{AsyncConnection, AsyncPgConnection};
use scoped_futures::ScopedFutureExt;
use tracing::{debug, info, warn};

use custodia_schema::models::{LedgerTransaction, TransactionKind, TransactionStatus};

use crate::accrual;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::guard::SettlementGuard;
use crate::ledger_client::{ConfirmationStatus, LedgerClient};
use crate::metrics::EngineMetrics;
use crate::referral;
use crate::store::{self, AccountStore};
use crate::telegram::SharedNotifier;
use crate::types::format_units;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    StillPending,
    AlreadyTerminal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub completed: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub skipped: usize,
}

pub struct Reconciler {
    store: AccountStore,
    ledger: Arc<dyn LedgerClient>,
    guard: Arc<SettlementGuard>,
    notifier: SharedNotifier,
    metrics: Arc<EngineMetrics>,
    config: Arc<EngineConfig>,
}

impl Reconciler {
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

    pub async fn run_once(&self) -> EngineResult<ReconcileSummary> {
        let pending = self.store.list_pending_with_signature().await?;
        if pending.is_empty() {
            return Ok(ReconcileSummary::default());
        }
        debug!("[Reconcile] {} pending rows to check", pending.len());

        let mut summary = ReconcileSummary::default();
        for tx in pending {
            let Some(signature) = tx.external_signature.clone() else {
                continue;
            };

            // Same guard as live settlements: never touch an account that
            // has a pipeline in flight.
            if !self.guard.acquire(tx.account_id) {
                summary.skipped += 1;
                continue;
            }
            let outcome = self.reconcile_one(&tx, &signature).await;
            self.guard.release(tx.account_id);

            match outcome {
                Ok(Outcome::Completed) => {
                    summary.completed += 1;
                    self.record("completed");
                    self.notify_completed(&tx).await;
                    // A deposit commit, however late, still owes the
                    // referrer their cut.
                    if TransactionKind::try_from(tx.kind.as_str()) == Ok(TransactionKind::Deposit)
                    {
                        if let Ok(Some(depositor)) = self.store.get(tx.account_id).await {
                            referral::disburse_bonus(
                                &self.store,
                                self.ledger.as_ref(),
                                &self.notifier,
                                &self.metrics,
                                &self.config,
                                &depositor,
                                tx.amount.max(0) as u64,
                            )
                            .await;
                        }
                    }
                }
                Ok(Outcome::Failed) => {
                    summary.failed += 1;
                    self.record("failed");
                    warn!(
                        "[Reconcile] transfer {} for account {} failed on the ledger; \
                         row {} marked failed, no balance effect",
                        signature, tx.account_id, tx.id
                    );
                }
                Ok(Outcome::StillPending) => {
                    summary.still_pending += 1;
                    self.record("still_pending");
                }
                Ok(Outcome::AlreadyTerminal) => {
                    summary.skipped += 1;
                    self.record("already_terminal");
                }
                Err(e) => {
                    summary.skipped += 1;
                    self.record("error");
                    warn!(
                        "[Reconcile] could not resolve {} for account {}: {}",
                        signature, tx.account_id, e
                    );
                }
            }
        }

        if summary.completed + summary.failed > 0 {
            info!(
                "[Reconcile] pass done: {} completed, {} failed, {} still pending, {} skipped",
                summary.completed, summary.failed, summary.still_pending, summary.skipped
            );
        }
        Ok(summary)
    }

    async fn reconcile_one(
        &self,
        tx: &LedgerTransaction,
        signature: &str,
    ) -> EngineResult<Outcome> {
        match self.ledger.confirm(signature).await? {
            ConfirmationStatus::Confirmed => self.apply_terminal(tx, TransactionStatus::Completed).await,
            ConfirmationStatus::Failed => self.apply_terminal(tx, TransactionStatus::Failed).await,
            ConfirmationStatus::Pending => Ok(Outcome::StillPending),
        }
    }

    /// Apply the deferred ledger effect (for completions) and transition the
    /// journal row. The row-lock + pending re-check makes this idempotent.
    async fn apply_terminal(
        &self,
        tx: &LedgerTransaction,
        status: TransactionStatus,
    ) -> EngineResult<Outcome> {
        let kind = TransactionKind::try_from(tx.kind.as_str())
            .map_err(EngineError::Internal)?;
        let tx_id = tx.id;
        let account_id = tx.account_id;
        let amount = tx.amount.max(0) as u64;
        let period_days = self.config.growth_period_days;
        let now = Utc::now();

        let mut conn = self.store.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        conn.transaction::<Outcome, EngineError, _>(|conn| {
            async move {
                let account = store::lock_account(&mut *conn, account_id).await?;
                let row = store::lock_transaction(&mut *conn, tx_id).await?;
                if TransactionStatus::try_from(row.status.as_str())
                    .map_err(EngineError::Internal)?
                    .is_terminal()
                {
                    return Ok(Outcome::AlreadyTerminal);
                }

                if status == TransactionStatus::Completed {
                    match kind {
                        TransactionKind::Withdrawal => {
                            let principal = account.principal.max(0) as u64;
                            let anchor = accrual::growth_anchor(
                                account.principal_since,
                                account.last_withdrawal_at,
                            );
                            let balance = anchor
                                .map(|a| accrual::balance(principal, a, now, period_days))
                                .unwrap_or(principal);
                            store::apply_withdrawal_debit(
                                &mut *conn,
                                account_id,
                                balance.saturating_sub(amount),
                                now,
                            )
                            .await?;
                        }
                        TransactionKind::Deposit => {
                            store::apply_deposit_credit(&mut *conn, &account, amount, now).await?;
                        }
                        // Paid on-chain to the referrer's address; no
                        // internal balance effect.
                        TransactionKind::ReferralBonus => {}
                        // Reinvest rows never carry a signature.
                        TransactionKind::Reinvest => {
                            return Err(EngineError::Internal(format!(
                                "pending reinvest row {} has a signature",
                                tx_id
                            )));
                        }
                    }
                }

                if !store::mark_transaction_terminal(&mut *conn, tx_id, status).await? {
                    return Ok(Outcome::AlreadyTerminal);
                }
                Ok(match status {
                    TransactionStatus::Completed => Outcome::Completed,
                    _ => Outcome::Failed,
                })
            }
            .scope_boxed()
        })
        .await
    }

    async fn notify_completed(&self, tx: &LedgerTransaction) {
        let decimals = self.config.unit_decimals;
        let amount = tx.amount.max(0) as u64;
        let message = match TransactionKind::try_from(tx.kind.as_str()) {
            Ok(TransactionKind::Withdrawal) => format!(
                "✅ Your withdrawal of {} is now confirmed.",
                format_units(amount, decimals)
            ),
            Ok(TransactionKind::Deposit) => format!(
                "💰 Your deposit of {} is now confirmed and growing.",
                format_units(amount, decimals)
            ),
            Ok(TransactionKind::ReferralBonus) => format!(
                "🎁 Your referral bonus of {} is now confirmed.",
                format_units(amount, decimals)
            ),
            _ => return,
        };
        self.notifier.notify(tx.account_id, &message).await;
    }

    fn record(&self, outcome: &str) {
        self.metrics
            .reconcile_outcomes
            .with_label_values(&[outcome])
            .inc();
    }
}
