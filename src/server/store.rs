//! Per-branch authoritative databases for the reconciliation service.
//!
//! Branch databases are physically separate SQLite files under
//! `{data_dir}/branches/`. Each `BranchDb` holds its connection behind a
//! `Mutex`, which is the per-branch single-writer discipline: concurrent
//! requests for different branches proceed fully in parallel, requests for
//! the same branch serialize on this lock, and the sync ledger's UNIQUE
//! constraint remains the correctness backstop underneath it.

use rusqlite::Connection;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Current branch schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// One branch's authoritative store.
pub struct BranchDb {
    pub branch_id: String,
    pub conn: Mutex<Connection>,
}

impl BranchDb {
    /// Open (or create) the branch database at `path`.
    pub fn open(path: &Path, branch_id: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
        configure_and_migrate(&conn, branch_id)?;
        Ok(Self {
            branch_id: branch_id.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// In-memory branch store for tests.
    pub fn open_in_memory(branch_id: &str) -> Result<Self, String> {
        let conn =
            Connection::open_in_memory().map_err(|e| format!("sqlite open in-memory: {e}"))?;
        configure_and_migrate(&conn, branch_id)?;
        Ok(Self {
            branch_id: branch_id.to_string(),
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn seed_product_for_test(&self, product_id: &str, name: &str, stock_level: i64) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO products (id, name, stock_level) VALUES (?1, ?2, ?3)",
            rusqlite::params![product_id, name, stock_level],
        )
        .unwrap();
    }

    #[cfg(test)]
    pub fn product_stock_for_test(&self, product_id: &str) -> (i64, bool) {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT stock_level, has_discrepancy FROM products WHERE id = ?1",
            rusqlite::params![product_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0)),
        )
        .unwrap()
    }

    #[cfg(test)]
    pub fn sales_count_for_test(&self) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM sales", [], |row| row.get(0))
            .unwrap()
    }
}

fn configure_and_migrate(conn: &Connection, branch_id: &str) -> Result<(), String> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    run_migrations(conn, branch_id)
}

fn run_migrations(conn: &Connection, branch_id: &str) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!(
        branch_id,
        "Migrating branch database from v{current} to v{CURRENT_SCHEMA_VERSION}"
    );

    if current < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration v1: inventory, domain records, and the sync ledger.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- products: stock_level is signed on purpose. Negative stock is a
        -- flagged state, not an error; sales are never rejected for it.
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            unit_price REAL NOT NULL DEFAULT 0,
            stock_level INTEGER NOT NULL DEFAULT 0,
            has_discrepancy INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            transaction_id TEXT UNIQUE NOT NULL,
            terminal_id TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            total_amount REAL NOT NULL DEFAULT 0,
            client_created_at TEXT,
            recorded_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS purchases (
            id TEXT PRIMARY KEY,
            transaction_id TEXT UNIQUE NOT NULL,
            terminal_id TEXT,
            supplier_name TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            total_cost REAL NOT NULL DEFAULT 0,
            client_created_at TEXT,
            recorded_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS expenses (
            id TEXT PRIMARY KEY,
            transaction_id TEXT UNIQUE NOT NULL,
            terminal_id TEXT,
            category TEXT,
            amount REAL NOT NULL DEFAULT 0,
            note TEXT,
            client_created_at TEXT,
            recorded_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS stock_adjustments (
            id TEXT PRIMARY KEY,
            transaction_id TEXT UNIQUE NOT NULL,
            product_id TEXT NOT NULL,
            previous_level INTEGER NOT NULL,
            new_level INTEGER NOT NULL,
            reason TEXT,
            recorded_at TEXT DEFAULT (datetime('now'))
        );

        -- sync_ledger: the idempotency ledger. One row per terminal
        -- transaction outcome; the primary key is what makes at-least-once
        -- delivery safe.
        CREATE TABLE IF NOT EXISTS sync_ledger (
            transaction_id TEXT PRIMARY KEY,
            outcome TEXT NOT NULL,
            result_entity_id TEXT,
            discrepancy_details TEXT,
            error_message TEXT,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_products_discrepancy ON products(has_discrepancy);
        CREATE INDEX IF NOT EXISTS idx_sync_ledger_recorded_at ON sync_ledger(recorded_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Branch migration v1 failed: {e}");
        format!("branch migration v1: {e}")
    })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lazily opened branch handles, one per branch id. The registry hands out
/// `Arc<BranchDb>` so request handlers never hold the registry lock while
/// touching a branch database.
pub struct BranchRegistry {
    branches_dir: PathBuf,
    branches: Mutex<HashMap<String, Arc<BranchDb>>>,
}

impl BranchRegistry {
    pub fn new(branches_dir: PathBuf) -> Self {
        Self {
            branches_dir,
            branches: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or open the database for `branch_id`.
    pub fn open(&self, branch_id: &str) -> Result<Arc<BranchDb>, String> {
        let branch_id = branch_id.trim();
        validate_branch_id(branch_id)?;

        let mut branches = self.branches.lock().map_err(|e| e.to_string())?;
        if let Some(existing) = branches.get(branch_id) {
            return Ok(Arc::clone(existing));
        }

        fs::create_dir_all(&self.branches_dir)
            .map_err(|e| format!("create branches dir: {e}"))?;
        let path = self.branches_dir.join(format!("{branch_id}.db"));
        info!(branch_id, path = %path.display(), "Opening branch database");
        let branch = Arc::new(BranchDb::open(&path, branch_id)?);
        branches.insert(branch_id.to_string(), Arc::clone(&branch));
        Ok(branch)
    }
}

/// Branch ids become file names; restrict them accordingly.
fn validate_branch_id(branch_id: &str) -> Result<(), String> {
    if branch_id.is_empty() || branch_id.len() > 64 {
        return Err("Invalid branch id".to_string());
    }
    let valid = branch_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid || branch_id.starts_with('.') {
        return Err("Invalid branch id".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_opens_each_branch_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = BranchRegistry::new(dir.path().join("branches"));

        let a1 = registry.open("branch-a").unwrap();
        let a2 = registry.open("branch-a").unwrap();
        let b = registry.open("branch-b").unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert!(dir.path().join("branches/branch-a.db").exists());
        assert!(dir.path().join("branches/branch-b.db").exists());
    }

    #[test]
    fn test_registry_rejects_path_escaping_branch_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = BranchRegistry::new(dir.path().join("branches"));

        assert!(registry.open("").is_err());
        assert!(registry.open("../evil").is_err());
        assert!(registry.open("a/b").is_err());
        assert!(registry.open(".hidden").is_err());
    }
}
