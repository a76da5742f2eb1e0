//! Coordination records shared between simulation workers.
//!
//! Holds one nonce record per account and the set of token approvals already
//! granted. The in-memory store serves a single process; the SQLite store lets
//! several worker processes on one machine drive the same accounts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NonceRecord {
    pub next_nonce: u64,
    /// Block height at the last sync with the node
    pub last_seen_block: Option<u64>,
    pub locked: bool,
    pub locked_at_ms: i64,
    /// Identifies the current lease; meaningless while unlocked
    pub lock_token: u64,
}

impl NonceRecord {
    fn lease_expired(&self, now_ms: i64, lease_ms: i64) -> bool {
        now_ms.saturating_sub(self.locked_at_ms) >= lease_ms
    }

    fn held_by(&self, token: u64) -> bool {
        self.locked && self.lock_token == token
    }
}

/// Lock-protected key/value records. Every method is atomic with respect to
/// every other caller of the same store.
pub trait CoordinationStore: Send + Sync {
    /// Take the account's nonce lock under `token` if it is free, or held
    /// longer than `lease_ms`. Returns the record as it stood, now locked, or
    /// `None` when someone else holds it.
    fn try_lock_nonce(
        &self,
        account: Address,
        token: u64,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<NonceRecord>, StoreError>;

    /// Persist a resynchronised nonce. Writes nothing and returns `false`
    /// unless the lock is still held under `token`.
    fn write_nonce(
        &self,
        account: Address,
        token: u64,
        next_nonce: u64,
        last_seen_block: Option<u64>,
    ) -> Result<bool, StoreError>;

    /// Release the lock held under `token`. `consumed_next` raises the stored
    /// next nonce, never lowers it, even when the lease has been taken over.
    /// Returns `false` and leaves the lock alone if `token` no longer holds it.
    fn unlock_nonce(
        &self,
        account: Address,
        token: u64,
        consumed_next: Option<u64>,
    ) -> Result<bool, StoreError>;

    fn nonce_record(&self, account: Address) -> Result<Option<NonceRecord>, StoreError>;

    fn is_approved(&self, token: Address, owner: Address, spender: Address) -> Result<bool, StoreError>;

    fn record_approval(&self, token: Address, owner: Address, spender: Address) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    nonces: HashMap<Address, NonceRecord>,
    approvals: HashSet<(Address, Address, Address)>,
}

/// Single-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, MemoryTables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl CoordinationStore for MemoryStore {
    fn try_lock_nonce(
        &self,
        account: Address,
        token: u64,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<NonceRecord>, StoreError> {
        let mut tables = self.tables()?;
        let record = tables.nonces.entry(account).or_default();
        if record.locked && !record.lease_expired(now_ms, lease_ms) {
            return Ok(None);
        }
        if record.locked {
            warn!(%account, "taking over abandoned nonce lock");
        }
        record.locked = true;
        record.locked_at_ms = now_ms;
        record.lock_token = token;
        Ok(Some(*record))
    }

    fn write_nonce(
        &self,
        account: Address,
        token: u64,
        next_nonce: u64,
        last_seen_block: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        match tables.nonces.get_mut(&account) {
            Some(record) if record.held_by(token) => {
                record.next_nonce = next_nonce;
                record.last_seen_block = last_seen_block;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn unlock_nonce(
        &self,
        account: Address,
        token: u64,
        consumed_next: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let record = tables.nonces.entry(account).or_default();
        if let Some(next) = consumed_next {
            record.next_nonce = record.next_nonce.max(next);
        }
        if !record.held_by(token) {
            return Ok(false);
        }
        record.locked = false;
        Ok(true)
    }

    fn nonce_record(&self, account: Address) -> Result<Option<NonceRecord>, StoreError> {
        Ok(self.tables()?.nonces.get(&account).copied())
    }

    fn is_approved(&self, token: Address, owner: Address, spender: Address) -> Result<bool, StoreError> {
        Ok(self.tables()?.approvals.contains(&(token, owner, spender)))
    }

    fn record_approval(&self, token: Address, owner: Address, spender: Address) -> Result<(), StoreError> {
        self.tables()?.approvals.insert((token, owner, spender));
        Ok(())
    }
}

/// Embedded transactional store. Each worker process opens its own handle on
/// the same file; SQLite's write lock serialises the read-modify-write cycles.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn to_sql_u64(v: u64) -> i64 {
    v.min(i64::MAX as u64) as i64
}

/// Lease tokens use the full u64 range and are stored bit-for-bit.
fn token_to_sql(token: u64) -> i64 {
    token as i64
}

fn token_from_sql(v: i64) -> u64 {
    v as u64
}

fn from_sql_u64(account: Address, v: i64) -> Result<u64, StoreError> {
    u64::try_from(v).map_err(|_| StoreError::Corrupt {
        account: account.to_string(),
        reason: format!("negative value {}", v),
    })
}

impl SqliteStore {
    /// Open or create the store, migrating it if needed.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        debug!(path, "opened coordination store");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nonce_records (
                account TEXT PRIMARY KEY,
                next_nonce INTEGER NOT NULL DEFAULT 0,
                last_seen_block INTEGER,
                locked INTEGER NOT NULL DEFAULT 0,
                locked_at_ms INTEGER NOT NULL DEFAULT 0,
                lock_token INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS approvals (
                token TEXT NOT NULL,
                owner TEXT NOT NULL,
                spender TEXT NOT NULL,
                PRIMARY KEY (token, owner, spender)
            );
            "#,
        )?;

        // Files created before leases carried a token
        let has_token: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('nonce_records') WHERE name = 'lock_token'",
            [],
            |row| row.get(0),
        )?;
        if has_token == 0 {
            conn.execute_batch(
                "ALTER TABLE nonce_records ADD COLUMN lock_token INTEGER NOT NULL DEFAULT 0;",
            )?;
        }
        Ok(())
    }

    fn read_record(conn: &Connection, account: Address) -> Result<Option<NonceRecord>, StoreError> {
        let row = conn
            .query_row(
                "SELECT next_nonce, last_seen_block, locked, locked_at_ms, lock_token
                 FROM nonce_records WHERE account = ?1",
                params![account.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((next, seen, locked, locked_at_ms, lock_token)) = row else {
            return Ok(None);
        };
        Ok(Some(NonceRecord {
            next_nonce: from_sql_u64(account, next)?,
            last_seen_block: seen.map(|b| from_sql_u64(account, b)).transpose()?,
            locked: locked != 0,
            locked_at_ms,
            lock_token: token_from_sql(lock_token),
        }))
    }
}

impl CoordinationStore for SqliteStore {
    fn try_lock_nonce(
        &self,
        account: Address,
        token: u64,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<NonceRecord>, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut record = Self::read_record(&tx, account)?.unwrap_or_default();
        if record.locked && !record.lease_expired(now_ms, lease_ms) {
            tx.commit()?;
            return Ok(None);
        }
        if record.locked {
            warn!(%account, "taking over abandoned nonce lock");
        }
        record.locked = true;
        record.locked_at_ms = now_ms;
        record.lock_token = token;

        tx.execute(
            "INSERT INTO nonce_records
                (account, next_nonce, last_seen_block, locked, locked_at_ms, lock_token)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(account) DO UPDATE SET
                locked = 1,
                locked_at_ms = excluded.locked_at_ms,
                lock_token = excluded.lock_token",
            params![
                account.to_string(),
                to_sql_u64(record.next_nonce),
                record.last_seen_block.map(to_sql_u64),
                now_ms,
                token_to_sql(token),
            ],
        )?;
        tx.commit()?;
        Ok(Some(record))
    }

    fn write_nonce(
        &self,
        account: Address,
        token: u64,
        next_nonce: u64,
        last_seen_block: Option<u64>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let changed = conn.execute(
            "UPDATE nonce_records SET next_nonce = ?3, last_seen_block = ?4
             WHERE account = ?1 AND locked = 1 AND lock_token = ?2",
            params![
                account.to_string(),
                token_to_sql(token),
                to_sql_u64(next_nonce),
                last_seen_block.map(to_sql_u64),
            ],
        )?;
        Ok(changed == 1)
    }

    fn unlock_nonce(
        &self,
        account: Address,
        token: u64,
        consumed_next: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(next) = consumed_next {
            tx.execute(
                "UPDATE nonce_records SET next_nonce = MAX(next_nonce, ?2) WHERE account = ?1",
                params![account.to_string(), to_sql_u64(next)],
            )?;
        }
        let released = tx.execute(
            "UPDATE nonce_records SET locked = 0
             WHERE account = ?1 AND locked = 1 AND lock_token = ?2",
            params![account.to_string(), token_to_sql(token)],
        )?;
        tx.commit()?;
        Ok(released == 1)
    }

    fn nonce_record(&self, account: Address) -> Result<Option<NonceRecord>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Self::read_record(&conn, account)
    }

    fn is_approved(&self, token: Address, owner: Address, spender: Address) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let found = conn
            .query_row(
                "SELECT 1 FROM approvals WHERE token = ?1 AND owner = ?2 AND spender = ?3",
                params![token.to_string(), owner.to_string(), spender.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn record_approval(&self, token: Address, owner: Address, spender: Address) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT OR IGNORE INTO approvals (token, owner, spender) VALUES (?1, ?2, ?3)",
            params![token.to_string(), owner.to_string(), spender.to_string()],
        )?;
        Ok(())
    }
}

/// Pick the backend named by `path`.
pub fn open_store(path: Option<&str>) -> Result<Arc<dyn CoordinationStore>, StoreError> {
    match path {
        Some(p) => Ok(Arc::new(SqliteStore::open(p)?)),
        None => Ok(Arc::new(MemoryStore::new())),
    }
}
