// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::schema::{accounts, ledger_transactions};

/// A custodial account row.
///
/// `ledger_balance` is a display cache; the source of truth for the live
/// balance is `principal` plus elapsed time from the growth anchor
/// (`last_withdrawal_at` if set, else `principal_since`).
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = accounts)]
pub struct Account {
    pub user_id: i64,
    pub address: String,
    pub key_ref: String,
    pub principal: i64,
    pub principal_since: Option<DateTime<Utc>>,
    pub last_withdrawal_at: Option<DateTime<Utc>>,
    pub ledger_balance: i64,
    pub referred_by: Option<i64>,
    pub auto_withdrawal: bool,
    pub auto_reinvest: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = accounts)]
pub struct NewAccount {
    pub user_id: i64,
    pub address: String,
    pub key_ref: String,
    pub referred_by: Option<i64>,
}

/// One row of the append-only audit journal. Rows are inserted exactly once
/// per operation attempt and only ever transition `pending -> completed` or
/// `pending -> failed`.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ledger_transactions)]
pub struct LedgerTransaction {
    pub id: i64,
    pub account_id: i64,
    pub kind: String,
    pub amount: i64,
    pub external_signature: Option<String>,
    pub balance_after: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = ledger_transactions)]
pub struct NewLedgerTransaction {
    pub account_id: i64,
    pub kind: String,
    pub amount: i64,
    pub external_signature: Option<String>,
    pub balance_after: i64,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Reinvest,
    ReferralBonus,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Reinvest => "reinvest",
            TransactionKind::ReferralBonus => "referral_bonus",
        }
    }
}

impl AsRef<str> for TransactionKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for TransactionKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            "reinvest" => Ok(TransactionKind::Reinvest),
            "referral_bonus" => Ok(TransactionKind::ReferralBonus),
            other => Err(format!("unknown transaction kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl AsRef<str> for TransactionStatus {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for TransactionStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            TransactionKind::Deposit,
            TransactionKind::Withdrawal,
            TransactionKind::Reinvest,
            TransactionKind::ReferralBonus,
        ] {
            assert_eq!(TransactionKind::try_from(kind.as_str()), Ok(kind));
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
        ] {
            assert_eq!(TransactionStatus::try_from(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn test_unknown_values_rejected() {
        assert!(TransactionKind::try_from("payout").is_err());
        assert!(TransactionStatus::try_from("settled").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Completed.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
    }
}
