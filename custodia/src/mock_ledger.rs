// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Programmable in-memory ledger client for pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{EngineError, EngineResult};
use crate::ledger_client::{ConfirmationStatus, LedgerClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransfer {
    pub from_key_ref: String,
    pub to_address: String,
    pub amount: u64,
    pub signature: String,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfirmMode {
    AlwaysConfirm,
    // Report `pending` for this many polls, then confirm.
    ConfirmAfterPolls(u64),
    NeverConfirm,
    FailAll,
}

pub struct MockLedgerClient {
    balances: Mutex<HashMap<String, u64>>,
    fee: AtomicU64,
    reserve: AtomicU64,
    submits: Mutex<Vec<SubmittedTransfer>>,
    confirm_mode: Mutex<ConfirmMode>,
    polls_remaining: AtomicU64,
    next_submit_error: Mutex<Option<EngineError>>,
    signature_counter: AtomicU64,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            fee: AtomicU64::new(0),
            reserve: AtomicU64::new(0),
            submits: Mutex::new(Vec::new()),
            confirm_mode: Mutex::new(ConfirmMode::AlwaysConfirm),
            polls_remaining: AtomicU64::new(0),
            next_submit_error: Mutex::new(None),
            signature_counter: AtomicU64::new(1),
        }
    }

    pub fn set_balance(&self, address: &str, amount: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), amount);
    }

    pub fn set_fee(&self, fee: u64) {
        self.fee.store(fee, Ordering::SeqCst);
    }

    pub fn set_reserve(&self, reserve: u64) {
        self.reserve.store(reserve, Ordering::SeqCst);
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        if let ConfirmMode::ConfirmAfterPolls(n) = mode {
            self.polls_remaining.store(n, Ordering::SeqCst);
        }
        *self.confirm_mode.lock().unwrap() = mode;
    }

    pub fn fail_next_submit(&self, error: EngineError) {
        *self.next_submit_error.lock().unwrap() = Some(error);
    }

    pub fn submitted(&self) -> Vec<SubmittedTransfer> {
        self.submits.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submits.lock().unwrap().len()
    }
}

impl Default for MockLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn get_balance(&self, address: &str) -> EngineResult<u64> {
        Ok(*self.balances.lock().unwrap().get(address).unwrap_or(&0))
    }

    async fn estimate_fee(&self) -> EngineResult<u64> {
        Ok(self.fee.load(Ordering::SeqCst))
    }

    async fn minimum_reserve(&self) -> EngineResult<u64> {
        Ok(self.reserve.load(Ordering::SeqCst))
    }

    async fn submit_transfer(
        &self,
        from_key_ref: &str,
        to_address: &str,
        amount: u64,
    ) -> EngineResult<String> {
        if let Some(error) = self.next_submit_error.lock().unwrap().take() {
            return Err(error);
        }
        let signature = format!(
            "MOCKSIG{}",
            self.signature_counter.fetch_add(1, Ordering::SeqCst)
        );
        self.submits.lock().unwrap().push(SubmittedTransfer {
            from_key_ref: from_key_ref.to_string(),
            to_address: to_address.to_string(),
            amount,
            signature: signature.clone(),
        });
        Ok(signature)
    }

    async fn confirm(&self, _signature: &str) -> EngineResult<ConfirmationStatus> {
        let mode = *self.confirm_mode.lock().unwrap();
        Ok(match mode {
            ConfirmMode::AlwaysConfirm => ConfirmationStatus::Confirmed,
            ConfirmMode::NeverConfirm => ConfirmationStatus::Pending,
            ConfirmMode::FailAll => ConfirmationStatus::Failed,
            ConfirmMode::ConfirmAfterPolls(_) => {
                let before = self.polls_remaining.load(Ordering::SeqCst);
                if before == 0 {
                    ConfirmationStatus::Confirmed
                } else {
                    self.polls_remaining.store(before - 1, Ordering::SeqCst);
                    ConfirmationStatus::Pending
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger_client::await_confirmation;
    use std::time::Duration;

    #[tokio::test]
    async fn test_await_confirmation_confirms_after_polls() {
        let ledger = MockLedgerClient::new();
        ledger.set_confirm_mode(ConfirmMode::ConfirmAfterPolls(2));
        let result = await_confirmation(
            &ledger,
            "sig",
            Duration::from_millis(5),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(result.unwrap(), true);
    }

    #[tokio::test]
    async fn test_await_confirmation_times_out() {
        let ledger = MockLedgerClient::new();
        ledger.set_confirm_mode(ConfirmMode::NeverConfirm);
        let result = await_confirmation(
            &ledger,
            "sig",
            Duration::from_millis(10),
            Duration::from_millis(40),
        )
        .await;
        assert_eq!(
            result.unwrap_err(),
            EngineError::ConfirmationTimeout {
                signature: "sig".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_await_confirmation_reports_dropped_transfer() {
        let ledger = MockLedgerClient::new();
        ledger.set_confirm_mode(ConfirmMode::FailAll);
        let result = await_confirmation(
            &ledger,
            "sig",
            Duration::from_millis(5),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(result.unwrap(), false);
    }

    #[tokio::test]
    async fn test_submit_records_transfers() {
        let ledger = MockLedgerClient::new();
        let sig = ledger.submit_transfer("treasury", "ADDR", 42).await.unwrap();
        let submits = ledger.submitted();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].amount, 42);
        assert_eq!(submits[0].signature, sig);
    }
}
