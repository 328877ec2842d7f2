use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::account::Account;
use crate::error::{LedgerError, Result};
use crate::lot::{Lot, LotDelta, LotStatus};
use crate::store::{
    AccountWrite, CommitBatch, ExpiryCursor, LedgerStore, Page, hash_idempotency_key,
};
use crate::transaction::{Transaction, TransactionKind, TransactionStatus};

const LOT_COLUMNS: &str = "id, account_id, original_amount, remaining_amount, earned_at, expires_at, status, source_transaction_id";

const TRANSACTION_COLUMNS: &str = "id, account_id, kind, amount, idempotency_key, status, deltas, lot_expires_at, reverses, failure_reason, created_at, settled_at";

fn storage(e: sqlx::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Ledger store on PostgreSQL.
///
/// Amounts and versions are stored as BIGINT. A value above `i64::MAX` wraps
/// negative on the way in and is rejected by the CHECK constraints.
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(storage)?;
        Ok(Self::from_pool(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS point_accounts (
                id UUID PRIMARY KEY,
                balance BIGINT NOT NULL CHECK (balance >= 0),
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS point_lots (
                id UUID PRIMARY KEY,
                account_id UUID NOT NULL REFERENCES point_accounts(id),
                original_amount BIGINT NOT NULL CHECK (original_amount > 0),
                remaining_amount BIGINT NOT NULL
                    CHECK (remaining_amount >= 0 AND remaining_amount <= original_amount),
                earned_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ,
                status TEXT NOT NULL CHECK (status IN ('active', 'consumed', 'expired', 'void')),
                source_transaction_id UUID NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_point_lots_account_status
            ON point_lots(account_id, status)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        // Sweep scans
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_point_lots_expiry_status
            ON point_lots(expires_at, status)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS point_transactions (
                id UUID PRIMARY KEY,
                account_id UUID NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('credit', 'debit', 'expire', 'reversal')),
                amount BIGINT NOT NULL CHECK (amount > 0),
                idempotency_key TEXT NOT NULL,
                idempotency_hash TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'applied', 'failed')),
                deltas JSONB NOT NULL,
                lot_expires_at TIMESTAMPTZ,
                reverses UUID,
                failure_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                settled_at TIMESTAMPTZ,
                UNIQUE (account_id, idempotency_hash)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_point_transactions_account_created
            ON point_transactions(account_id, created_at DESC, id DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_point_transactions_reverses
            ON point_transactions(reverses)
            WHERE reverses IS NOT NULL
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        Ok(())
    }

    async fn account_version(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        account_id: Uuid,
    ) -> Result<Option<u64>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM point_accounts WHERE id = $1")
                .bind(account_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(storage)?;
        Ok(version.map(|v| v as u64))
    }

    /// Insert or version-checked update of the account row.
    async fn write_account(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        write: &AccountWrite,
        at: DateTime<Utc>,
    ) -> Result<Account> {
        let row = match write.expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO point_accounts (id, balance, version, created_at, updated_at)
                    VALUES ($1, $2, 1, $3, $3)
                    ON CONFLICT (id) DO NOTHING
                    RETURNING id, balance, version, created_at, updated_at
                    "#,
                )
                .bind(write.account_id)
                .bind(write.balance as i64)
                .bind(at)
                .fetch_optional(&mut **tx)
                .await
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE point_accounts
                    SET balance = $2, version = version + 1, updated_at = $3
                    WHERE id = $1 AND version = $4
                    RETURNING id, balance, version, created_at, updated_at
                    "#,
                )
                .bind(write.account_id)
                .bind(write.balance as i64)
                .bind(at)
                .bind(expected as i64)
                .fetch_optional(&mut **tx)
                .await
            }
        }
        .map_err(storage)?;

        match row {
            Some(row) => account_from_row(&row),
            None => Err(LedgerError::Conflict {
                account_id: write.account_id,
                expected: write.expected_version,
                found: Self::account_version(tx, write.account_id).await?,
            }),
        }
    }

    /// Insert or update a non-final transaction. Returns false if the stored
    /// row is already Applied or Failed.
    async fn upsert_transaction(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        transaction: &Transaction,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO point_transactions
                (id, account_id, kind, amount, idempotency_key, idempotency_hash, status,
                 deltas, lot_expires_at, reverses, failure_reason, created_at, settled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                deltas = EXCLUDED.deltas,
                failure_reason = EXCLUDED.failure_reason,
                settled_at = EXCLUDED.settled_at
            WHERE point_transactions.status = 'pending'
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.account_id)
        .bind(transaction.kind.as_str())
        .bind(transaction.amount as i64)
        .bind(&transaction.idempotency_key)
        .bind(hash_idempotency_key(&transaction.idempotency_key))
        .bind(transaction.status.as_str())
        .bind(Json(&transaction.deltas))
        .bind(transaction.lot_expires_at)
        .bind(transaction.reverses)
        .bind(&transaction.failure_reason)
        .bind(transaction.created_at)
        .bind(transaction.settled_at)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::DuplicateIdempotencyKey {
                account_id: transaction.account_id,
                idempotency_key: transaction.idempotency_key.clone(),
            }),
            Err(e) => Err(storage(e)),
        }
    }
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id").map_err(storage)?,
        balance: row.try_get::<i64, _>("balance").map_err(storage)? as u64,
        version: row.try_get::<i64, _>("version").map_err(storage)? as u64,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

fn lot_from_row(row: &PgRow) -> Result<Lot> {
    let status: String = row.try_get("status").map_err(storage)?;
    Ok(Lot {
        id: row.try_get("id").map_err(storage)?,
        account_id: row.try_get("account_id").map_err(storage)?,
        original_amount: row.try_get::<i64, _>("original_amount").map_err(storage)? as u64,
        remaining_amount: row.try_get::<i64, _>("remaining_amount").map_err(storage)? as u64,
        earned_at: row.try_get("earned_at").map_err(storage)?,
        expires_at: row.try_get("expires_at").map_err(storage)?,
        status: LotStatus::parse(&status)
            .ok_or_else(|| LedgerError::Storage(format!("unknown lot status {}", status)))?,
        source_transaction_id: row.try_get("source_transaction_id").map_err(storage)?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let kind: String = row.try_get("kind").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let deltas: Json<Vec<LotDelta>> = row.try_get("deltas").map_err(storage)?;
    Ok(Transaction {
        id: row.try_get("id").map_err(storage)?,
        account_id: row.try_get("account_id").map_err(storage)?,
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| LedgerError::Storage(format!("unknown transaction kind {}", kind)))?,
        amount: row.try_get::<i64, _>("amount").map_err(storage)? as u64,
        idempotency_key: row.try_get("idempotency_key").map_err(storage)?,
        status: TransactionStatus::parse(&status).ok_or_else(|| {
            LedgerError::Storage(format!("unknown transaction status {}", status))
        })?,
        deltas: deltas.0,
        lot_expires_at: row.try_get("lot_expires_at").map_err(storage)?,
        reverses: row.try_get("reverses").map_err(storage)?,
        failure_reason: row.try_get("failure_reason").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        settled_at: row.try_get("settled_at").map_err(storage)?,
    })
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT id, balance, version, created_at, updated_at FROM point_accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_active_lots(&self, account_id: Uuid, as_of: DateTime<Utc>) -> Result<Vec<Lot>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LOT_COLUMNS}
            FROM point_lots
            WHERE account_id = $1
              AND status = 'active'
              AND remaining_amount > 0
              AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY expires_at ASC NULLS LAST, earned_at ASC, id ASC
            "#
        ))
        .bind(account_id)
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(lot_from_row).collect()
    }

    async fn find_expiring_lots(
        &self,
        before: DateTime<Utc>,
        after: Option<ExpiryCursor>,
        limit: usize,
    ) -> Result<Vec<Lot>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LOT_COLUMNS}
            FROM point_lots
            WHERE status = 'active' AND expires_at <= $1
              AND ($2::timestamptz IS NULL OR (expires_at, id) > ($2, $3))
            ORDER BY expires_at ASC, id ASC
            LIMIT $4
            "#
        ))
        .bind(before)
        .bind(after.map(|c| c.expires_at))
        .bind(after.map(|c| c.lot_id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(lot_from_row).collect()
    }

    async fn find_lots(&self, account_id: Uuid) -> Result<Vec<Lot>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOT_COLUMNS} FROM point_lots WHERE account_id = $1 ORDER BY id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(lot_from_row).collect()
    }

    async fn get_lot(&self, lot_id: Uuid) -> Result<Option<Lot>> {
        let row = sqlx::query(&format!("SELECT {LOT_COLUMNS} FROM point_lots WHERE id = $1"))
            .bind(lot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(lot_from_row).transpose()
    }

    async fn get_lots(&self, lot_ids: &[Uuid]) -> Result<Vec<Lot>> {
        if lot_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {LOT_COLUMNS} FROM point_lots WHERE id = ANY($1)"
        ))
        .bind(lot_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(lot_from_row).collect()
    }

    async fn find_transaction(
        &self,
        account_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM point_transactions
            WHERE account_id = $1 AND idempotency_hash = $2
            "#
        ))
        .bind(account_id)
        .bind(hash_idempotency_key(idempotency_key))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM point_transactions WHERE id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn list_transactions(&self, account_id: Uuid, page: Page) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM point_transactions
            WHERE account_id = $1
            ORDER BY created_at DESC, id DESC
            OFFSET $2 LIMIT $3
            "#
        ))
        .bind(account_id)
        .bind(page.offset as i64)
        .bind(page.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn find_reversals(&self, original_id: Uuid) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM point_transactions
            WHERE reverses = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(original_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn record_pending(&self, transaction: &Transaction) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO point_transactions
                (id, account_id, kind, amount, idempotency_key, idempotency_hash, status,
                 deltas, lot_expires_at, reverses, failure_reason, created_at, settled_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9, NULL, $10, NULL)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.account_id)
        .bind(transaction.kind.as_str())
        .bind(transaction.amount as i64)
        .bind(&transaction.idempotency_key)
        .bind(hash_idempotency_key(&transaction.idempotency_key))
        .bind(Json(&transaction.deltas))
        .bind(transaction.lot_expires_at)
        .bind(transaction.reverses)
        .bind(transaction.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::DuplicateIdempotencyKey {
                account_id: transaction.account_id,
                idempotency_key: transaction.idempotency_key.clone(),
            }),
            Err(e) => Err(storage(e)),
        }
    }

    async fn fail_pending(&self, transaction: &Transaction) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        if !Self::upsert_transaction(&mut tx, transaction).await? {
            return Err(LedgerError::Storage(format!(
                "transaction {} is already final",
                transaction.id
            )));
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn commit(&self, batch: CommitBatch) -> Result<Account> {
        let write = &batch.account;
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let account = Self::write_account(&mut tx, write, batch.committed_at).await?;

        for lot in &batch.lots {
            if lot.account_id != write.account_id {
                return Err(LedgerError::Storage(format!(
                    "lot {} does not belong to account {}",
                    lot.id, write.account_id
                )));
            }
            sqlx::query(
                r#"
                INSERT INTO point_lots
                    (id, account_id, original_amount, remaining_amount, earned_at, expires_at,
                     status, source_transaction_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    remaining_amount = EXCLUDED.remaining_amount,
                    status = EXCLUDED.status
                "#,
            )
            .bind(lot.id)
            .bind(lot.account_id)
            .bind(lot.original_amount as i64)
            .bind(lot.remaining_amount as i64)
            .bind(lot.earned_at)
            .bind(lot.expires_at)
            .bind(lot.status.as_str())
            .bind(lot.source_transaction_id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        if !Self::upsert_transaction(&mut tx, &batch.transaction).await? {
            return Err(LedgerError::Storage(format!(
                "transaction {} is already final",
                batch.transaction.id
            )));
        }

        tx.commit().await.map_err(storage)?;

        Ok(account)
    }

    async fn write_balance(&self, write: AccountWrite, at: DateTime<Utc>) -> Result<Account> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let account = Self::write_account(&mut tx, &write, at).await?;
        tx.commit().await.map_err(storage)?;
        Ok(account)
    }
}
