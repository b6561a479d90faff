//! Database layer: optional persistence of finalized ledger entries so a
//! restart does not forget what was spent inside the budget window.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{PayanyError, Result};
use crate::ledger::LedgerEntry;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // A single connection keeps `sqlite::memory:` databases coherent and is
    // plenty for one write per payment.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Ledger database ready at {url}");
    Ok(pool)
}

#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        LedgerStore { pool }
    }

    pub async fn open(database_url: &str) -> Result<Self> {
        Ok(LedgerStore::new(init_pool(database_url).await?))
    }

    /// Persist one finalized payment.
    pub async fn insert_entry(&self, entry: &LedgerEntry, payment_hash: Option<&str>) -> Result<()> {
        let amount = i64::try_from(entry.amount_msat).map_err(|_| {
            PayanyError::InvalidParameter(format!(
                "amount_msat too large to store: {}",
                entry.amount_msat
            ))
        })?;
        sqlx::query(
            "INSERT INTO ledger_entries (timestamp, amount_msat, payment_hash) VALUES (?1, ?2, ?3)",
        )
        .bind(entry.timestamp)
        .bind(amount)
        .bind(payment_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Entries at or after `cutoff`, oldest first.
    pub async fn load_since(&self, cutoff: i64) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT timestamp, amount_msat
            FROM   ledger_entries
            WHERE  timestamp >= ?1
            ORDER  BY timestamp ASC, id ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(timestamp, amount)| LedgerEntry {
                timestamp,
                amount_msat: amount.max(0) as u64,
            })
            .collect())
    }

    /// Delete entries older than `cutoff`; returns how many went away.
    pub async fn prune_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ledger_entries WHERE timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
