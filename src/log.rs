//! Write-ahead log: record format, buffered appender, and background flush.
//!
//! A single background thread owns the log file and the in-memory buffer;
//! callers reach it over a bounded channel rather than contending for a
//! shared mutex, the same shape as the teacher's WAL worker. LSN assignment
//! and durability tracking live in [`FlushState`], mirroring `FsyncState`'s
//! split between "written" and "durable".

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::value::{decode_values, encode_values, Value};

/// Log sequence number. `-1` denotes "none" (e.g. a transaction's `prev_lsn`
/// before it has logged anything).
pub type Lsn = i64;
pub const NO_LSN: Lsn = -1;

/// Transaction identifier. `0` is reserved to mean "no transaction".
pub type TxnId = u64;
pub const NO_TXN: TxnId = 0;

/// The operation a log record describes. Table names are carried as plain
/// strings (the catalog they refer to is out of scope); RIDs are carried as
/// raw `(page, slot)` pairs rather than the `Rid` type so this enum stays a
/// plain `serde` derive. Value payloads are pre-encoded through the shared
/// value codec ([`crate::value`]) rather than derived via `serde` on
/// [`Value`] itself — this is the wire shape §4.5 calls out as shared with
/// heap records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOperation {
    Begin,
    Commit,
    Abort,
    Insert { table: String, page: u32, slot: u16, values: Vec<u8> },
    MarkDelete { table: String, page: u32, slot: u16, old_values: Vec<u8> },
    ApplyDelete { table: String, page: u32, slot: u16, old_values: Vec<u8> },
    RollbackDelete { table: String, page: u32, slot: u16, old_values: Vec<u8> },
    Update {
        table: String,
        old_page: u32,
        old_slot: u16,
        new_page: u32,
        new_slot: u16,
        old_values: Vec<u8>,
        new_values: Vec<u8>,
    },
    NewPage { page_index: u32 },
    Checkpoint { active_txns: Vec<TxnId> },
}

pub fn encode_tuple(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_values(&mut buf, values);
    buf
}

pub fn decode_tuple(bytes: &[u8]) -> Result<Vec<Value>> {
    let mut pos = 0;
    decode_values(bytes, &mut pos)
}

/// A single WAL entry. `size` is not a stored field — it's the bincode
/// framing length the file format already carries (see
/// [`write_framed`]/[`read_framed`]), so there is nothing to keep in sync by
/// hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txn_id: TxnId,
    pub op: LogOperation,
}

fn write_framed(file: &mut File, record: &LogRecord) -> Result<usize> {
    let encoded = bincode::serialize(record)?;
    let len = encoded.len() as u32;
    file.write_all(&len.to_le_bytes())?;
    file.write_all(&encoded)?;
    Ok(4 + encoded.len())
}

fn append_framed_to_buffer(buf: &mut Vec<u8>, record: &LogRecord) -> Result<()> {
    let encoded = bincode::serialize(record)?;
    buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    buf.extend_from_slice(&encoded);
    Ok(())
}

/// Read one framed record from `bytes` at `*pos`. Returns `None` at a torn
/// tail (a length prefix or body that doesn't fully fit) rather than an
/// error — recovery treats that as "stop scanning here".
pub fn read_framed(bytes: &[u8], pos: &mut usize) -> Option<LogRecord> {
    if *pos + 4 > bytes.len() {
        return None;
    }
    let len = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap()) as usize;
    if *pos + 4 + len > bytes.len() {
        return None;
    }
    let body = &bytes[*pos + 4..*pos + 4 + len];
    let record = bincode::deserialize(body).ok()?;
    *pos += 4 + len;
    Some(record)
}

/// Read the whole log file into memory. Callers that only need to scan once
/// (recovery) prefer this over incremental reads.
pub fn read_log_file(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Shared durability state: the LSN counter and the high-water mark the
/// background thread has actually fsynced, with a condvar for waiters.
struct FlushState {
    next_lsn: AtomicI64,
    persistent_lsn: AtomicI64,
    condvar: Condvar,
    mutex: Mutex<()>,
    shutdown: AtomicBool,
}

impl FlushState {
    fn new(resume_lsn: Lsn) -> Self {
        Self {
            next_lsn: AtomicI64::new(resume_lsn),
            persistent_lsn: AtomicI64::new(NO_LSN),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            shutdown: AtomicBool::new(false),
        }
    }

    fn signal_persistent(&self, lsn: Lsn) {
        let mut current = self.persistent_lsn.load(Ordering::Acquire);
        while lsn > current {
            match self.persistent_lsn.compare_exchange_weak(current, lsn, Ordering::Release, Ordering::Acquire) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
        self.condvar.notify_all();
    }

    fn wait_for_persistent(&self, target: Lsn, timeout: Duration) -> Result<()> {
        if self.persistent_lsn.load(Ordering::Acquire) >= target {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock().unwrap();
        loop {
            if self.persistent_lsn.load(Ordering::Acquire) >= target {
                return Ok(());
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(CoreError::Invariant("log manager shut down while awaiting durability".to_string()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out waiting for lsn {} to persist", target),
                )));
            }
            let (g, _) = self.condvar.wait_timeout(guard, remaining).unwrap();
            guard = g;
        }
    }
}

enum LogMessage {
    Append {
        prev_lsn: Lsn,
        txn_id: TxnId,
        op: LogOperation,
        responder: mpsc::SyncSender<Result<Lsn>>,
    },
    Flush {
        force: bool,
        responder: mpsc::SyncSender<Result<Lsn>>,
    },
    Stop {
        responder: mpsc::SyncSender<Result<Lsn>>,
    },
}

/// Single-writer WAL appender with a bounded buffer and a dedicated
/// background thread for both ordinary traffic and periodic flush ticks.
pub struct LogManager {
    sender: mpsc::SyncSender<LogMessage>,
    state: Arc<FlushState>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    periodic: Mutex<Option<(Arc<AtomicBool>, thread::JoinHandle<()>)>>,
    flush_interval: Duration,
}

impl LogManager {
    /// Open (or create) `log_path` in append mode and start the worker
    /// thread. `resume_lsn` is the first LSN to assign — the recovery
    /// manager supplies this after a restart; fresh instances pass `1`.
    pub fn new(log_path: impl AsRef<Path>, buffer_capacity: usize, flush_interval: Duration, resume_lsn: Lsn) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(log_path.as_ref())?;
        let (tx, rx) = mpsc::sync_channel::<LogMessage>(4096);
        let state = Arc::new(FlushState::new(resume_lsn));
        let worker_state = Arc::clone(&state);
        let handle = thread::spawn(move || log_worker_thread(file, rx, buffer_capacity, worker_state));
        Ok(Self {
            sender: tx,
            state,
            worker: Mutex::new(Some(handle)),
            periodic: Mutex::new(None),
            flush_interval,
        })
    }

    /// Assign the next LSN, frame the record, and queue it for write.
    /// Returns once the record is in the worker's buffer (or written
    /// directly, if oversize) — not once it is durable; pair with
    /// [`LogManager::flush`] for a durability guarantee.
    pub fn append(&self, txn_id: TxnId, prev_lsn: Lsn, op: LogOperation) -> Result<Lsn> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(LogMessage::Append { prev_lsn, txn_id, op, responder: tx })
            .map_err(|_| CoreError::Invariant("log worker channel closed".to_string()))?;
        rx.recv().map_err(|_| CoreError::Invariant("log worker response lost".to_string()))?
    }

    /// Drain the buffer to disk; if `force`, also fsync and block until the
    /// highest written LSN is durable. Returns the resulting persistent LSN.
    pub fn flush(&self, force: bool) -> Result<Lsn> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(LogMessage::Flush { force, responder: tx })
            .map_err(|_| CoreError::Invariant("log worker channel closed".to_string()))?;
        rx.recv().map_err(|_| CoreError::Invariant("log worker response lost".to_string()))?
    }

    pub fn persistent_lsn(&self) -> Lsn {
        self.state.persistent_lsn.load(Ordering::Acquire)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.state.next_lsn.load(Ordering::Acquire)
    }

    /// Block until `target` is durable or `timeout` elapses.
    pub fn wait_for_durable(&self, target: Lsn, timeout: Duration) -> Result<()> {
        self.state.wait_for_persistent(target, timeout)
    }

    /// Start the periodic background flusher (wakes every `flush_interval`,
    /// default 30ms, and performs a non-forced flush if the buffer holds
    /// anything). A no-op if already running.
    pub fn run_flush_thread(self: &Arc<Self>) {
        let mut guard = self.periodic.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let mgr = Arc::clone(self);
        let interval = self.flush_interval;
        let handle = thread::spawn(move || {
            while !stop_clone.load(Ordering::Acquire) {
                thread::sleep(interval);
                let _ = mgr.flush(false);
            }
        });
        *guard = Some((stop, handle));
    }

    /// Stop the periodic flusher, if running, and perform one final forced
    /// flush so nothing buffered is lost.
    pub fn stop_flush_thread(&self) -> Result<()> {
        if let Some((stop, handle)) = self.periodic.lock().unwrap().take() {
            stop.store(true, Ordering::Release);
            let _ = handle.join();
        }
        self.flush(true)?;
        Ok(())
    }

    /// Shut the worker thread down entirely. Used at the end of a process
    /// lifetime (tests, or an embedding executor's graceful shutdown).
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.stop_flush_thread();
        let (tx, rx) = mpsc::sync_channel(1);
        if self.sender.send(LogMessage::Stop { responder: tx }).is_ok() {
            let _ = rx.recv();
        }
        self.state.shutdown.store(true, Ordering::Release);
        self.state.condvar.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn log_worker_thread(mut file: File, rx: mpsc::Receiver<LogMessage>, buffer_capacity: usize, state: Arc<FlushState>) {
    let mut buffer: Vec<u8> = Vec::with_capacity(buffer_capacity);
    let mut unsynced_high_lsn: Lsn = NO_LSN;

    let drain = |file: &mut File, buffer: &mut Vec<u8>| -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        file.write_all(buffer)?;
        file.flush()?;
        buffer.clear();
        Ok(())
    };

    while let Ok(msg) = rx.recv() {
        match msg {
            LogMessage::Append { prev_lsn, txn_id, op, responder } => {
                let lsn = state.next_lsn.fetch_add(1, Ordering::SeqCst);
                let record = LogRecord { lsn, prev_lsn, txn_id, op };
                let result = (|| -> Result<Lsn> {
                    let encoded = bincode::serialize(&record)?;
                    let framed_len = 4 + encoded.len();
                    if framed_len > buffer_capacity {
                        drain(&mut file, &mut buffer)?;
                        write_framed(&mut file, &record)?;
                    } else if buffer.len() + framed_len > buffer_capacity {
                        drain(&mut file, &mut buffer)?;
                        append_framed_to_buffer(&mut buffer, &record)?;
                    } else {
                        append_framed_to_buffer(&mut buffer, &record)?;
                    }
                    unsynced_high_lsn = unsynced_high_lsn.max(lsn);
                    Ok(lsn)
                })();
                let _ = responder.send(result);
            }
            LogMessage::Flush { force, responder } => {
                let result = (|| -> Result<Lsn> {
                    drain(&mut file, &mut buffer)?;
                    if force {
                        file.sync_data()?;
                        state.signal_persistent(unsynced_high_lsn);
                    }
                    Ok(state.persistent_lsn.load(Ordering::Acquire))
                })();
                let _ = responder.send(result);
            }
            LogMessage::Stop { responder } => {
                let result = (|| -> Result<Lsn> {
                    drain(&mut file, &mut buffer)?;
                    file.sync_data()?;
                    state.signal_persistent(unsynced_high_lsn);
                    Ok(state.persistent_lsn.load(Ordering::Acquire))
                })();
                let _ = responder.send(result);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_increasing_lsns() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogManager::new(dir.path().join("wal.log"), 64 * 1024, Duration::from_millis(30), 1).unwrap();
        let l1 = log.append(1, NO_LSN, LogOperation::Begin).unwrap();
        let l2 = log.append(1, l1, LogOperation::Commit).unwrap();
        assert!(l2 > l1);
        log.shutdown().unwrap();
    }

    #[test]
    fn forced_flush_makes_records_durable_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let log = LogManager::new(&path, 64 * 1024, Duration::from_millis(30), 1).unwrap();
        let l1 = log.append(7, NO_LSN, LogOperation::Begin).unwrap();
        let l2 = log.append(
            7,
            l1,
            LogOperation::Insert { table: "t".to_string(), page: 0, slot: 0, values: encode_tuple(&[Value::Int64(1)]) },
        )
        .unwrap();
        let l3 = log.append(7, l2, LogOperation::Commit).unwrap();
        let persistent = log.flush(true).unwrap();
        assert!(persistent >= l3);
        log.shutdown().unwrap();

        let bytes = read_log_file(&path).unwrap();
        let mut pos = 0;
        let mut records = Vec::new();
        while let Some(r) = read_framed(&bytes, &mut pos) {
            records.push(r);
        }
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].lsn, l1);
        assert_eq!(records[2].lsn, l3);
    }

    #[test]
    fn oversize_record_bypasses_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let log = LogManager::new(&path, 128, Duration::from_millis(30), 1).unwrap();
        let big = Value::Blob(vec![7u8; 4096]);
        let lsn = log
            .append(1, NO_LSN, LogOperation::Insert { table: "t".to_string(), page: 0, slot: 0, values: encode_tuple(&[big]) })
            .unwrap();
        log.flush(true).unwrap();
        log.shutdown().unwrap();
        let bytes = read_log_file(&path).unwrap();
        let mut pos = 0;
        let record = read_framed(&bytes, &mut pos).unwrap();
        assert_eq!(record.lsn, lsn);
    }

    #[test]
    fn run_and_stop_flush_thread_persists_buffered_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let log = Arc::new(LogManager::new(&path, 64 * 1024, Duration::from_millis(10), 1).unwrap());
        log.run_flush_thread();
        let lsn = log.append(1, NO_LSN, LogOperation::Begin).unwrap();
        log.stop_flush_thread().unwrap();
        assert!(log.persistent_lsn() >= lsn);
        log.shutdown().unwrap();
    }
}
