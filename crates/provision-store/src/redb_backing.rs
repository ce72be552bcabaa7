//! ReDB backing store
//!
//! Local embedded database for standalone deployments. One table per
//! prefix, keyed by object key, holding the JSON body.

use crate::backing::BackingStore;
use crate::error::{Result, StoreError};
use provision_models::Prefix;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

fn table(prefix: Prefix) -> TableDefinition<'static, &'static str, &'static [u8]> {
    TableDefinition::new(prefix.as_str())
}

/// ReDB backing store
pub struct RedbBacking {
    db: Arc<Database>,
}

impl RedbBacking {
    /// Open or create a ReDB database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)
            .map_err(|e| StoreError::Database(format!("failed to open database: {}", e)))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| StoreError::Database(format!("failed to begin transaction: {}", e)))?;
        for prefix in Prefix::ALL {
            write_txn.open_table(table(prefix)).map_err(|e| {
                StoreError::Database(format!("failed to create {} table: {}", prefix, e))
            })?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(format!("failed to commit: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl BackingStore for RedbBacking {
    fn list(&self, prefix: Prefix) -> Result<Vec<(String, Vec<u8>)>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Database(format!("failed to begin read: {}", e)))?;
        let tbl = read_txn
            .open_table(table(prefix))
            .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;

        let mut out = Vec::new();
        for entry in tbl
            .iter()
            .map_err(|e| StoreError::Database(format!("iter failed: {}", e)))?
        {
            let (key, value) =
                entry.map_err(|e| StoreError::Database(format!("read failed: {}", e)))?;
            out.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(out)
    }

    fn save(&self, prefix: Prefix, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Database(format!("failed to begin write: {}", e)))?;
        {
            let mut tbl = write_txn
                .open_table(table(prefix))
                .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;
            tbl.insert(key, value)
                .map_err(|e| StoreError::Database(format!("insert failed: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(format!("failed to commit: {}", e)))
    }

    fn remove(&self, prefix: Prefix, key: &str) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Database(format!("failed to begin write: {}", e)))?;
        {
            let mut tbl = write_txn
                .open_table(table(prefix))
                .map_err(|e| StoreError::Database(format!("failed to open table: {}", e)))?;
            tbl.remove(key)
                .map_err(|e| StoreError::Database(format!("remove failed: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| StoreError::Database(format!("failed to commit: {}", e)))
    }
}
