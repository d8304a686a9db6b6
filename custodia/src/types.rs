// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared engine types. Amounts are carried in the ledger's smallest integer
//! unit everywhere; conversion to the display unit happens only at
//! formatting boundaries, never inside balance arithmetic.

/// Externally assigned, stable user identifier.
pub type AccountId = i64;

/// States of the withdrawal settlement state machine. Used for logging and
/// metrics labels; terminal states are `LedgerCommitted`, `Rejected` and
/// `TransferFailed`, with `ConfirmationPending` handed off to the
/// reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementState {
    Requested,
    Locked,
    BalanceVerified,
    TransferSubmitted,
    TransferConfirmed,
    LedgerCommitted,
    Rejected,
    TransferFailed,
    ConfirmationPending,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Requested => "requested",
            SettlementState::Locked => "locked",
            SettlementState::BalanceVerified => "balance_verified",
            SettlementState::TransferSubmitted => "transfer_submitted",
            SettlementState::TransferConfirmed => "transfer_confirmed",
            SettlementState::LedgerCommitted => "ledger_committed",
            SettlementState::Rejected => "rejected",
            SettlementState::TransferFailed => "transfer_failed",
            SettlementState::ConfirmationPending => "confirmation_pending",
        }
    }
}

/// The settled outcome of a completed withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub signature: String,
    pub amount: u64,
    pub balance_after: u64,
}

/// Render an amount in smallest units as a decimal display string,
/// e.g. `1_500_000_000` with 9 decimals -> `"1.5"`.
pub fn format_units(amount: u64, decimals: u32) -> String {
    let scale = 10u64.pow(decimals);
    let whole = amount / scale;
    let frac = amount % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_units_whole() {
        assert_eq!(format_units(2_000_000_000, 9), "2");
        assert_eq!(format_units(0, 9), "0");
    }

    #[test]
    fn test_format_units_fractional() {
        assert_eq!(format_units(1_500_000_000, 9), "1.5");
        assert_eq!(format_units(1, 9), "0.000000001");
        assert_eq!(format_units(1_000_000_001, 9), "1.000000001");
    }

    #[test]
    fn test_state_labels_are_stable() {
        // These labels feed metrics and log lines; keep them stable.
        assert_eq!(SettlementState::LedgerCommitted.as_str(), "ledger_committed");
        assert_eq!(SettlementState::Rejected.as_str(), "rejected");
        assert_eq!(
            SettlementState::ConfirmationPending.as_str(),
            "confirmation_pending"
        );
    }
}
