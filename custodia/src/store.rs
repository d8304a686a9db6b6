// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Account store operations.
//!
//! [`AccountStore`] carries the pooled reads used by schedulers and the
//! front-end surface. The free functions at the bottom are the row-locked
//! primitives pipelines call *inside* an open transaction; they are the only
//! code that mutates balance-bearing fields.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use custodia_pg_db::Db;
use custodia_schema::models::{Account, LedgerTransaction, NewAccount, NewLedgerTransaction};
use custodia_schema::models::{TransactionKind, TransactionStatus};
use custodia_schema::schema::{accounts, ledger_transactions};

use crate::error::{EngineError, EngineResult};
use crate::types::AccountId;

#[derive(Clone)]
pub struct AccountStore {
    db: Db,
}

impl AccountStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn connect(&self) -> EngineResult<custodia_pg_db::Connection<'_>> {
        self.db
            .connect()
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn get(&self, account_id: AccountId) -> EngineResult<Option<Account>> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let account = accounts::table
            .find(account_id)
            .select(Account::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(account)
    }

    /// Create the account row on first interaction. The address and key
    /// reference come from the external wallet generator.
    pub async fn create(&self, new_account: NewAccount) -> EngineResult<Account> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let account = diesel::insert_into(accounts::table)
            .values(&new_account)
            .returning(Account::as_returning())
            .get_result(conn)
            .await?;
        Ok(account)
    }

    pub async fn list_auto_withdrawal(&self) -> EngineResult<Vec<Account>> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let rows = accounts::table
            .filter(accounts::auto_withdrawal.eq(true))
            .filter(accounts::principal.gt(0))
            .select(Account::as_select())
            .load(conn)
            .await?;
        Ok(rows)
    }

    pub async fn list_auto_reinvest(&self) -> EngineResult<Vec<Account>> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let rows = accounts::table
            .filter(accounts::auto_reinvest.eq(true))
            .filter(accounts::principal.gt(0))
            .select(Account::as_select())
            .load(conn)
            .await?;
        Ok(rows)
    }

    pub async fn list_all(&self) -> EngineResult<Vec<Account>> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let rows = accounts::table
            .select(Account::as_select())
            .load(conn)
            .await?;
        Ok(rows)
    }

    pub async fn list_funded(&self) -> EngineResult<Vec<Account>> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let rows = accounts::table
            .filter(accounts::principal.gt(0))
            .select(Account::as_select())
            .load(conn)
            .await?;
        Ok(rows)
    }

    /// Refresh the display cache. Never used as a source of truth; pipelines
    /// recompute under a row lock.
    pub async fn refresh_balance_cache(
        &self,
        account_id: AccountId,
        balance: u64,
    ) -> EngineResult<()> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        diesel::update(accounts::table.find(account_id))
            .set(accounts::ledger_balance.eq(balance as i64))
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Pending journal rows that carry a signature: the reconciler's work
    /// list.
    pub async fn list_pending_with_signature(&self) -> EngineResult<Vec<LedgerTransaction>> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let rows = ledger_transactions::table
            .filter(ledger_transactions::status.eq(TransactionStatus::Pending.as_str()))
            .filter(ledger_transactions::external_signature.is_not_null())
            .order(ledger_transactions::created_at.asc())
            .select(LedgerTransaction::as_select())
            .load(conn)
            .await?;
        Ok(rows)
    }

    /// Transaction history for an account, newest first.
    pub async fn history(
        &self,
        account_id: AccountId,
        kind: Option<TransactionKind>,
        limit: i64,
    ) -> EngineResult<Vec<LedgerTransaction>> {
        let mut conn = self.connect().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let mut query = ledger_transactions::table
            .filter(ledger_transactions::account_id.eq(account_id))
            .select(LedgerTransaction::as_select())
            .into_boxed();
        if let Some(kind) = kind {
            query = query.filter(ledger_transactions::kind.eq(kind.as_str()));
        }
        let rows = query
            .order(ledger_transactions::created_at.desc())
            .limit(limit)
            .load(conn)
            .await?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Row-locked primitives, called inside an open database transaction.
// ---------------------------------------------------------------------------

/// Read the account row with `FOR UPDATE`. The row lock is held until the
/// surrounding transaction commits or rolls back, which is what ties balance
/// truth to lock discipline across the external transfer.
pub async fn lock_account(
    conn: &mut AsyncPgConnection,
    account_id: AccountId,
) -> EngineResult<Account> {
    accounts::table
        .find(account_id)
        .for_update()
        .select(Account::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| EngineError::Internal(format!("account {} does not exist", account_id)))
}

/// Read a journal row with `FOR UPDATE` (reconciliation path).
pub async fn lock_transaction(
    conn: &mut AsyncPgConnection,
    tx_id: i64,
) -> EngineResult<LedgerTransaction> {
    ledger_transactions::table
        .find(tx_id)
        .for_update()
        .select(LedgerTransaction::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| EngineError::Internal(format!("ledger transaction {} does not exist", tx_id)))
}

pub async fn insert_transaction(
    conn: &mut AsyncPgConnection,
    row: &NewLedgerTransaction,
) -> EngineResult<i64> {
    let id = diesel::insert_into(ledger_transactions::table)
        .values(row)
        .returning(ledger_transactions::id)
        .get_result(conn)
        .await?;
    Ok(id)
}

/// Transition a pending row to a terminal status. Returns false if the row
/// was no longer pending, which makes completion idempotent under concurrent
/// reconciliation runs.
pub async fn mark_transaction_terminal(
    conn: &mut AsyncPgConnection,
    tx_id: i64,
    status: TransactionStatus,
) -> EngineResult<bool> {
    debug_assert!(status.is_terminal());
    let updated = diesel::update(
        ledger_transactions::table
            .find(tx_id)
            .filter(ledger_transactions::status.eq(TransactionStatus::Pending.as_str())),
    )
    .set(ledger_transactions::status.eq(status.as_str()))
    .execute(conn)
    .await?;
    Ok(updated == 1)
}

/// Debit the account after a confirmed withdrawal: the settled withdrawal
/// resets the compounding clock.
pub async fn apply_withdrawal_debit(
    conn: &mut AsyncPgConnection,
    account_id: AccountId,
    new_ledger_balance: u64,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    diesel::update(accounts::table.find(account_id))
        .set((
            accounts::last_withdrawal_at.eq(Some(now)),
            accounts::ledger_balance.eq(new_ledger_balance as i64),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

/// Credit the account after a confirmed deposit sweep. `principal_since` is
/// only anchored on the first-ever deposit.
pub async fn apply_deposit_credit(
    conn: &mut AsyncPgConnection,
    account: &Account,
    amount: u64,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let new_principal = account.principal + amount as i64;
    let new_balance = account.ledger_balance + amount as i64;
    if account.principal_since.is_none() {
        diesel::update(accounts::table.find(account.user_id))
            .set((
                accounts::principal.eq(new_principal),
                accounts::principal_since.eq(Some(now)),
                accounts::ledger_balance.eq(new_balance),
            ))
            .execute(conn)
            .await?;
    } else {
        diesel::update(accounts::table.find(account.user_id))
            .set((
                accounts::principal.eq(new_principal),
                accounts::ledger_balance.eq(new_balance),
            ))
            .execute(conn)
            .await?;
    }
    Ok(())
}

/// Fold accrued profit into the principal and restart the growth curve.
pub async fn apply_reinvest(
    conn: &mut AsyncPgConnection,
    account_id: AccountId,
    new_principal: u64,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    diesel::update(accounts::table.find(account_id))
        .set((
            accounts::principal.eq(new_principal as i64),
            accounts::principal_since.eq(Some(now)),
            accounts::last_withdrawal_at.eq(None::<DateTime<Utc>>),
            accounts::ledger_balance.eq(new_principal as i64),
        ))
        .execute(conn)
        .await?;
    Ok(())
}
