//! Page-addressed file I/O and open-file lifecycle.
//!
//! Owns a mapping from filename to an open read/write file handle under a
//! single data directory. Every page is read and written at `page_size`
//! granularity; a short read (the file doesn't yet reach that page) is
//! treated as "uninitialized" and zero-filled rather than an error, which is
//! the contract heap and index callers rely on.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Monotonic, lock-free counters exposed for observability.
#[derive(Debug, Default)]
pub struct PageServerStats {
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub files_opened: AtomicU64,
}

/// An open file paired with the mutex that serializes access to it. Taking
/// this lock across a read-modify-write cycle (see [`PageServer::read_modify_write`])
/// is what makes concurrent writers to the same page safe — the reference
/// prototype this crate is based on left that gap open (§9 Open Questions).
struct OpenFile {
    file: Mutex<File>,
}

/// Opens/creates files under a data directory and serves fixed-size pages
/// by `(filename, page index)`.
pub struct PageServer {
    data_dir: PathBuf,
    page_size: usize,
    files: Mutex<HashMap<String, Arc<OpenFile>>>,
    stats: PageServerStats,
}

impl PageServer {
    /// Create (mode 0755) the data directory if absent and construct a page
    /// server serving pages of `page_size` bytes.
    pub fn open(data_dir: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o755);
            let _ = fs::set_permissions(&data_dir, perms);
        }
        Ok(Self {
            data_dir,
            page_size,
            files: Mutex::new(HashMap::new()),
            stats: PageServerStats::default(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Idempotent: a file already open is a no-op success. A file that does
    /// not exist on disk is created (zero-length) and opened read/write.
    pub fn open_file(&self, name: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(name) {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.path_for(name))?;
        files.insert(name.to_string(), Arc::new(OpenFile { file: Mutex::new(file) }));
        self.stats.files_opened.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop the open handle for `name`, if any.
    pub fn close(&self, name: &str) -> Result<()> {
        self.files.lock().unwrap().remove(name);
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.files.lock().unwrap().contains_key(name) || self.path_for(name).exists()
    }

    fn handle(&self, name: &str) -> Result<Arc<OpenFile>> {
        self.open_file(name)?;
        Ok(self.files.lock().unwrap().get(name).unwrap().clone())
    }

    /// Read one page into `buffer` (must be exactly `page_size` bytes). On a
    /// short read the remainder is zero-filled and treated as uninitialized.
    pub fn read_page(&self, name: &str, index: u32, buffer: &mut [u8]) -> Result<()> {
        let handle = self.handle(name)?;
        let mut file = handle.file.lock().unwrap();
        self.read_page_locked(&mut file, index, buffer)
    }

    fn read_page_locked(&self, file: &mut File, index: u32, buffer: &mut [u8]) -> Result<()> {
        for b in buffer.iter_mut() {
            *b = 0;
        }
        let offset = index as u64 * self.page_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        let mut read_total = 0usize;
        loop {
            match file.read(&mut buffer[read_total..])? {
                0 => break,
                n => {
                    read_total += n;
                    if read_total >= buffer.len() {
                        break;
                    }
                }
            }
        }
        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(read_total as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write exactly `page_size` bytes to the page at `index` and flush the
    /// OS-level buffer. Does not fsync — durability is the log manager's job.
    pub fn write_page(&self, name: &str, index: u32, buffer: &[u8]) -> Result<()> {
        let handle = self.handle(name)?;
        let mut file = handle.file.lock().unwrap();
        self.write_page_locked(&mut file, index, buffer)
    }

    fn write_page_locked(&self, file: &mut File, index: u32, buffer: &[u8]) -> Result<()> {
        let offset = index as u64 * self.page_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buffer)?;
        file.flush()?;
        self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(buffer.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Read a page, hand it to `f` for in-place modification, and write the
    /// result back, all while holding the file's mutex for the whole cycle.
    /// This is the primitive that makes a heap/index page's read-modify-write
    /// atomic relative to other writers targeting the same file.
    pub fn read_modify_write<F>(&self, name: &str, index: u32, mut f: F) -> Result<()>
    where
        F: FnMut(&mut Vec<u8>) -> Result<()>,
    {
        let handle = self.handle(name)?;
        let mut file = handle.file.lock().unwrap();
        let mut buffer = vec![0u8; self.page_size];
        self.read_page_locked(&mut file, index, &mut buffer)?;
        f(&mut buffer)?;
        self.write_page_locked(&mut file, index, &buffer)
    }

    pub fn pages_read(&self) -> u64 {
        self.stats.pages_read.load(Ordering::Relaxed)
    }
    pub fn pages_written(&self) -> u64 {
        self.stats.pages_written.load(Ordering::Relaxed)
    }
    pub fn bytes_read(&self) -> u64 {
        self.stats.bytes_read.load(Ordering::Relaxed)
    }
    pub fn bytes_written(&self) -> u64 {
        self.stats.bytes_written.load(Ordering::Relaxed)
    }
    pub fn files_opened(&self) -> u64 {
        self.stats.files_opened.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ps = PageServer::open(dir.path(), 4096).unwrap();
        let mut buf = vec![0u8; 4096];
        buf[10] = 42;
        ps.write_page("t.heap", 0, &buf).unwrap();
        let mut buf2 = vec![1u8; 4096];
        ps.read_page("t.heap", 0, &mut buf2).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn reading_past_eof_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let ps = PageServer::open(dir.path(), 4096).unwrap();
        ps.open_file("t.heap").unwrap();
        let mut buf = vec![9u8; 4096];
        ps.read_page("t.heap", 3, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ps = PageServer::open(dir.path(), 4096).unwrap();
        ps.open_file("t.heap").unwrap();
        ps.open_file("t.heap").unwrap();
        assert_eq!(ps.files_opened(), 1);
    }

    #[test]
    fn read_modify_write_is_atomic_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let ps = PageServer::open(dir.path(), 4096).unwrap();
        ps.read_modify_write("t.heap", 0, |buf| {
            buf[0] = 7;
            Ok(())
        })
        .unwrap();
        let mut buf = vec![0u8; 4096];
        ps.read_page("t.heap", 0, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
    }
}
