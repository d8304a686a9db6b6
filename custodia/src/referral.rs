// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Referral bonus cascade.
//!
//! On a committed deposit, the referrer (if any) receives an on-chain bonus
//! from the treasury. This is a best-effort side effect: it runs strictly
//! after the deposit commit, its failure is logged and counted but never
//! propagated to the triggering deposit.

use diesel_async::AsyncPgConnection;
use tracing::{debug, info, warn};

use custodia_schema::models::{Account, NewLedgerTransaction, TransactionKind, TransactionStatus};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ledger_client::{await_confirmation, LedgerClient};
use crate::metrics::EngineMetrics;
use crate::retry_transient_with_max_elapsed_time;
use crate::store::{self, AccountStore};
use crate::telegram::SharedNotifier;
use crate::types::format_units;

/// Bonus owed on a deposit, in smallest units. The rate is in basis points
/// so the arithmetic stays integral; the result is floored.
pub fn bonus_amount(deposit_amount: u64, rate_bps: u32) -> u64 {
    ((deposit_amount as u128 * rate_bps as u128) / 10_000) as u64
}

pub async fn disburse_bonus(
    store: &AccountStore,
    ledger: &dyn LedgerClient,
    notifier: &SharedNotifier,
    metrics: &EngineMetrics,
    config: &EngineConfig,
    depositor: &Account,
    deposit_amount: u64,
) {
    let Some(referrer_id) = depositor.referred_by else {
        return;
    };

    let bonus = bonus_amount(deposit_amount, config.referral_rate_bps);
    if bonus == 0 {
        debug!(
            "[Referral] deposit of {} by account {} yields no bonus",
            deposit_amount, depositor.user_id
        );
        return;
    }

    if let Err(e) = try_disburse(store, ledger, notifier, config, referrer_id, bonus).await {
        metrics.referral_bonus_failures.inc();
        warn!(
            "[Referral] bonus of {} to account {} failed ({}): {}",
            bonus,
            referrer_id,
            e.error_type(),
            e
        );
        return;
    }

    metrics.referral_bonuses_paid.inc();
    info!(
        "[Referral] paid bonus of {} to account {} for deposit by account {}",
        bonus, referrer_id, depositor.user_id
    );
}

async fn try_disburse(
    store: &AccountStore,
    ledger: &dyn LedgerClient,
    notifier: &SharedNotifier,
    config: &EngineConfig,
    referrer_id: i64,
    bonus: u64,
) -> Result<(), EngineError> {
    let referrer = store
        .get(referrer_id)
        .await?
        .ok_or_else(|| EngineError::Internal(format!("referrer {} does not exist", referrer_id)))?;

    // Only connect-level submit failures classify as transient, so this
    // retry cannot double-send.
    let signature = retry_transient_with_max_elapsed_time!(
        ledger.submit_transfer(&config.treasury.key_ref, &referrer.address, bonus),
        config.rpc_max_elapsed()
    )?;

    let status = match await_confirmation(
        ledger,
        &signature,
        config.confirm_poll_interval(),
        config.confirm_timeout(),
    )
    .await
    {
        Ok(true) => TransactionStatus::Completed,
        Ok(false) => {
            return Err(EngineError::RpcFatal(format!(
                "bonus transfer {} failed on the ledger",
                signature
            )))
        }
        // Ambiguous: journal as pending and let the reconciler settle it.
        Err(EngineError::ConfirmationTimeout { .. }) => TransactionStatus::Pending,
        Err(e) => return Err(e),
    };

    let mut conn = store.connect().await?;
    let conn: &mut AsyncPgConnection = &mut conn;
    store::insert_transaction(
        conn,
        &NewLedgerTransaction {
            account_id: referrer_id,
            kind: TransactionKind::ReferralBonus.as_str().to_string(),
            amount: bonus as i64,
            external_signature: Some(signature.clone()),
            // The bonus is paid on-chain, directly to the referrer's
            // address; the internal balance is untouched.
            balance_after: referrer.ledger_balance,
            status: status.as_str().to_string(),
        },
    )
    .await?;

    if status == TransactionStatus::Completed {
        notifier
            .notify(
                referrer_id,
                &format!(
                    "🎁 Referral bonus of {} sent to your wallet.\nSignature: <code>{}</code>",
                    format_units(bonus, config.unit_decimals),
                    signature
                ),
            )
            .await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bonus_at_six_percent() {
        assert_eq!(bonus_amount(1_000_000_000, 600), 60_000_000);
    }

    #[test]
    fn test_bonus_floors() {
        // 6% of 33 units floors to 1.
        assert_eq!(bonus_amount(33, 600), 1);
        assert_eq!(bonus_amount(16, 600), 0);
    }

    #[test]
    fn test_bonus_zero_rate() {
        assert_eq!(bonus_amount(1_000_000_000, 0), 0);
    }

    #[test]
    fn test_bonus_no_overflow_on_large_deposits() {
        assert_eq!(
            bonus_amount(u64::MAX, 10_000),
            u64::MAX,
        );
    }
}
