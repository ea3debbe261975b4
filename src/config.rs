//! Configuration knobs for the storage core.
//!
//! Loading these from a file or CLI flags belongs to the (out-of-scope)
//! configuration-loading layer; this struct is just the typed surface the
//! core's constructors accept, in the shape of the teacher's `GraniteConfig`.

use std::path::PathBuf;

/// Configuration for a single storage-core instance.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding `<table>.heap`, `<index>.idx`, the log file, and
    /// the checkpoint marker.
    pub data_dir: PathBuf,
    /// Size in bytes of a heap/index page. Must be consistent across every
    /// heap and index opened against the same data directory.
    pub page_size: usize,
    /// Log buffer capacity, expressed in pages of `page_size` bytes.
    pub log_buffer_pages: usize,
    /// How often the background flusher wakes to drain a non-empty buffer.
    pub flush_interval_ms: u64,
    /// Maximum time a lock acquire may block before it is cancelled as if
    /// the waiter had aborted. `None` disables the timeout.
    pub lock_timeout_ms: Option<u64>,
    /// File name (relative to `data_dir`) of the write-ahead log.
    pub log_file_name: String,
    /// File name (relative to `data_dir`) of the checkpoint marker.
    pub checkpoint_file_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: 4096,
            log_buffer_pages: 16,
            flush_interval_ms: 30,
            lock_timeout_ms: None,
            log_file_name: "wal.log".to_string(),
            checkpoint_file_name: "checkpoint.json".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file_name)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(&self.checkpoint_file_name)
    }

    pub fn log_buffer_capacity(&self) -> usize {
        self.log_buffer_pages * self.page_size
    }
}
