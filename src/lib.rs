//! Embeddable storage/transaction core: page-addressed files, MVCC heap
//! tables, a B+-tree index, record locking, write-ahead logging, and crash
//! recovery, wired together behind a single [`StorageEngine`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;

pub mod btree;
pub mod config;
pub mod error;
pub mod heap;
pub mod lock_manager;
pub mod log;
pub mod page_server;
pub mod recovery;
pub mod rid;
pub mod transaction;
pub mod value;

pub use btree::BTreeIndex;
pub use config::StorageConfig;
pub use error::{CoreError, Result};
pub use heap::HeapTable;
pub use lock_manager::LockManager;
pub use log::LogManager;
pub use page_server::PageServer;
pub use recovery::{CheckpointMarker, RecoveryManager, RecoveryOutcome};
pub use rid::Rid;
pub use transaction::{IsolationLevel, TransactionManager};
pub use value::{Column, Schema, Tuple, Value, ValueType};

struct Runtime {
    log_manager: Arc<LogManager>,
    lock_manager: Arc<LockManager>,
    txn_manager: Arc<TransactionManager>,
}

/// Owns a data directory's page server, catalog of open tables/indexes, and
/// (once [`StorageEngine::start`] has run) the log/lock/transaction
/// managers. Split into two phases because recovery must replay against
/// already-open tables before the log manager starts accepting new writes:
/// `open` sets up storage, callers open the tables/indexes they need, then
/// `start` recovers and brings the write path online.
pub struct StorageEngine {
    config: StorageConfig,
    page_server: Arc<PageServer>,
    recovery: RecoveryManager,
    tables: Mutex<HashMap<String, Arc<HeapTable>>>,
    indexes: Mutex<HashMap<String, Arc<BTreeIndex>>>,
    runtime: Mutex<Option<Runtime>>,
}

impl StorageEngine {
    pub fn open(config: StorageConfig) -> Result<Self> {
        let page_server = Arc::new(PageServer::open(&config.data_dir, config.page_size)?);
        let recovery = RecoveryManager::new(config.log_path(), config.checkpoint_path());
        Ok(Self {
            config,
            page_server,
            recovery,
            tables: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
            runtime: Mutex::new(None),
        })
    }

    pub fn data_dir(&self) -> &std::path::Path {
        self.config.data_dir.as_path()
    }

    pub fn page_server(&self) -> &Arc<PageServer> {
        &self.page_server
    }

    /// Open (creating if absent) a heap table and register it with the
    /// engine's catalog so `start` can recover it and the transaction
    /// manager can undo against it.
    pub fn open_table(&self, name: &str, schema: Schema) -> Result<Arc<HeapTable>> {
        let table = Arc::new(HeapTable::new(name, Arc::clone(&self.page_server), schema));
        table.create()?;
        self.tables.lock().unwrap().insert(name.to_string(), Arc::clone(&table));
        if let Some(runtime) = self.runtime.lock().unwrap().as_ref() {
            runtime.txn_manager.register_table(name, Arc::clone(&table));
        }
        Ok(table)
    }

    pub fn open_index(&self, name: &str, key_type: ValueType, unique: bool) -> Result<Arc<BTreeIndex>> {
        let index = Arc::new(BTreeIndex::new(name, key_type, Arc::clone(&self.page_server), unique));
        index.create()?;
        self.indexes.lock().unwrap().insert(name.to_string(), Arc::clone(&index));
        Ok(index)
    }

    pub fn table(&self, name: &str) -> Option<Arc<HeapTable>> {
        self.tables.lock().unwrap().get(name).cloned()
    }

    pub fn index(&self, name: &str) -> Option<Arc<BTreeIndex>> {
        self.indexes.lock().unwrap().get(name).cloned()
    }

    /// Replay the write-ahead log against every table open at the time of
    /// the call, then start the log manager's background flusher and build
    /// the lock/transaction managers resumed from where recovery left off.
    /// Idempotent only in the sense that calling it twice re-recovers
    /// against whatever checkpoint is on disk; callers should call it once,
    /// after opening every table the engine should own.
    pub fn start(&self) -> Result<RecoveryOutcome> {
        let tables = self.tables.lock().unwrap().clone();
        let outcome = self.recovery.recover(&tables)?;
        info!("recovery replayed {} redo and {} undo records, resuming at lsn {}", outcome.redone, outcome.undone, outcome.resumed_lsn);

        let log_manager = Arc::new(LogManager::new(
            self.config.log_path(),
            self.config.log_buffer_capacity(),
            Duration::from_millis(self.config.flush_interval_ms),
            outcome.resumed_lsn,
        )?);
        log_manager.run_flush_thread();

        let lock_manager = Arc::new(LockManager::new(self.config.lock_timeout_ms.map(Duration::from_millis)));
        let txn_manager = Arc::new(TransactionManager::new(Arc::clone(&log_manager), Arc::clone(&lock_manager)));
        txn_manager.resume_txn_counter(outcome.resumed_next_txn_id.saturating_sub(1));
        for (name, table) in tables.iter() {
            txn_manager.register_table(name, Arc::clone(table));
        }

        *self.runtime.lock().unwrap() = Some(Runtime { log_manager, lock_manager, txn_manager });
        Ok(outcome)
    }

    pub fn transactions(&self) -> Result<Arc<TransactionManager>> {
        self.runtime
            .lock()
            .unwrap()
            .as_ref()
            .map(|rt| Arc::clone(&rt.txn_manager))
            .ok_or_else(|| CoreError::Invariant("storage engine has not been started".to_string()))
    }

    pub fn log_manager(&self) -> Result<Arc<LogManager>> {
        self.runtime
            .lock()
            .unwrap()
            .as_ref()
            .map(|rt| Arc::clone(&rt.log_manager))
            .ok_or_else(|| CoreError::Invariant("storage engine has not been started".to_string()))
    }

    pub fn lock_manager(&self) -> Result<Arc<LockManager>> {
        self.runtime
            .lock()
            .unwrap()
            .as_ref()
            .map(|rt| Arc::clone(&rt.lock_manager))
            .ok_or_else(|| CoreError::Invariant("storage engine has not been started".to_string()))
    }

    /// Write a fresh checkpoint and cleanly stop the background flusher.
    pub fn shutdown(&self) -> Result<()> {
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            let marker = CheckpointMarker {
                lsn: runtime.log_manager.persistent_lsn(),
                next_txn_id: {
                    let active = runtime.txn_manager.active_ids();
                    active.into_iter().max().unwrap_or(0) + 1
                },
                active_txns: runtime.txn_manager.active_ids(),
            };
            self.recovery.write_checkpoint(&marker)?;
            runtime.log_manager.stop_flush_thread()?;
            runtime.log_manager.shutdown()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![Column::new("id", ValueType::Int64, false)])
    }

    #[test]
    fn engine_opens_table_and_recovers_an_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::open(StorageConfig { data_dir: dir.path().to_path_buf(), ..StorageConfig::default() }).unwrap();
        engine.open_table("accounts", schema()).unwrap();
        let outcome = engine.start().unwrap();
        assert_eq!(outcome.redone, 0);
        assert_eq!(outcome.undone, 0);

        let txns = engine.transactions().unwrap();
        let txn = txns.begin(IsolationLevel::ReadCommitted).unwrap();
        let table = engine.table("accounts").unwrap();
        let rid = table.insert(&[Value::Int64(1)], txn).unwrap();
        txns.log_insert(txn, "accounts", rid, &vec![Value::Int64(1)]).unwrap();
        txns.commit(txn).unwrap();

        assert_eq!(table.tuple_count().unwrap(), 1);
        engine.shutdown().unwrap();
    }

    #[test]
    fn restart_recovers_committed_work_and_discards_in_flight_work() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig { data_dir: dir.path().to_path_buf(), ..StorageConfig::default() };

        {
            let engine = StorageEngine::open(config.clone()).unwrap();
            engine.open_table("accounts", schema()).unwrap();
            engine.start().unwrap();
            let txns = engine.transactions().unwrap();
            let table = engine.table("accounts").unwrap();

            let committed = txns.begin(IsolationLevel::ReadCommitted).unwrap();
            let rid = table.insert(&[Value::Int64(100)], committed).unwrap();
            txns.log_insert(committed, "accounts", rid, &vec![Value::Int64(100)]).unwrap();
            txns.commit(committed).unwrap();

            let in_flight = txns.begin(IsolationLevel::ReadCommitted).unwrap();
            let _rid2 = table.insert(&[Value::Int64(200)], in_flight).unwrap();
            txns.log_insert(in_flight, "accounts", _rid2, &vec![Value::Int64(200)]).unwrap();
            // No commit/abort: simulate an unclean shutdown.
            txns.log_manager().flush(true).unwrap();
            engine.log_manager().unwrap().shutdown().unwrap();
        }

        let engine = StorageEngine::open(config).unwrap();
        engine.open_table("accounts", schema()).unwrap();
        let outcome = engine.start().unwrap();
        assert_eq!(outcome.redone, 1);
        assert_eq!(outcome.undone, 1);

        let table = engine.table("accounts").unwrap();
        assert_eq!(table.tuple_count().unwrap(), 1);
        engine.shutdown().unwrap();
    }
}
