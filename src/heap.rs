//! Slotted-page heap tables with MVCC tuple headers.
//!
//! A heap table manages a single physical `<table>.heap` file through a
//! [`PageServer`]. Each page is a fixed header, a slot directory of 16-bit
//! offsets, and record data growing upward from `free_space_offset`. Records
//! are self-describing (an MVCC header followed by a binary-encoded tuple),
//! so the slot directory never needs to store a record length alongside the
//! offset — decoding a record tells you exactly how many bytes it occupied.

use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::page_server::PageServer;
use crate::rid::Rid;
use crate::value::{decode_values, encode_values, Schema, Tuple, Value};

/// Bytes in the fixed page header: `next_page`(4) + `num_slots`(2) +
/// `free_space_offset`(2) + `flags`(2).
const HEADER_SIZE: usize = 10;
/// Slot directory capacity reserved at page-init time, so that growing the
/// directory up to this many slots never requires relocating already-placed
/// record data.
const RESERVED_SLOT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
struct PageHeader {
    next_page: u32,
    num_slots: u16,
    free_space_offset: u16,
    flags: u16,
}

fn parse_header(buf: &[u8]) -> PageHeader {
    PageHeader {
        next_page: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        num_slots: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
        free_space_offset: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
        flags: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
    }
}

fn write_header(buf: &mut [u8], h: &PageHeader) {
    buf[0..4].copy_from_slice(&h.next_page.to_le_bytes());
    buf[4..6].copy_from_slice(&h.num_slots.to_le_bytes());
    buf[6..8].copy_from_slice(&h.free_space_offset.to_le_bytes());
    buf[8..10].copy_from_slice(&h.flags.to_le_bytes());
}

fn slot_dir_offset(slot: u16) -> usize {
    HEADER_SIZE + slot as usize * 2
}

fn read_slot_offset(buf: &[u8], slot: u16) -> u16 {
    let at = slot_dir_offset(slot);
    u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
}

fn write_slot_offset(buf: &mut [u8], slot: u16, offset: u16) {
    let at = slot_dir_offset(slot);
    buf[at..at + 2].copy_from_slice(&offset.to_le_bytes());
}

/// Encode an MVCC record: `xmin`(8) + `xmax`(8) + the tuple's value codec.
fn encode_record(xmin: u64, xmax: u64, values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + values.len() * 8);
    buf.extend_from_slice(&xmin.to_le_bytes());
    buf.extend_from_slice(&xmax.to_le_bytes());
    encode_values(&mut buf, values);
    buf
}

/// Decode a record starting at `start`. Returns `(xmin, xmax, values)`; the
/// caller can recover the consumed length from `decode_values`'s position if
/// needed, but most callers only need the logical content.
fn decode_record(buf: &[u8], start: usize) -> Result<(u64, u64, Vec<Value>)> {
    if start + 16 > buf.len() {
        return Err(CoreError::Corrupt("truncated record header".to_string()));
    }
    let xmin = u64::from_le_bytes(buf[start..start + 8].try_into().unwrap());
    let xmax = u64::from_le_bytes(buf[start + 8..start + 16].try_into().unwrap());
    let mut pos = start + 16;
    let values = decode_values(buf, &mut pos)?;
    Ok((xmin, xmax, values))
}

/// Streaming read interface shared by heap scans and (later) index scans: a
/// single `next` call that returns the next item or `None` at end of stream.
pub trait RowStream {
    type Item;
    fn next(&mut self) -> Result<Option<Self::Item>>;
}

/// A slotted-page heap table over a single `<name>.heap` file.
pub struct HeapTable {
    file_name: String,
    page_server: Arc<PageServer>,
    schema: Schema,
    page_size: usize,
}

impl HeapTable {
    pub fn new(name: &str, page_server: Arc<PageServer>, schema: Schema) -> Self {
        let page_size = page_server.page_size();
        Self { file_name: format!("{}.heap", name), page_server, schema, page_size }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn initial_free_offset(&self) -> u16 {
        (HEADER_SIZE + RESERVED_SLOT_CAPACITY * 2) as u16
    }

    fn max_record_size(&self) -> usize {
        self.page_size - HEADER_SIZE - RESERVED_SLOT_CAPACITY * 2 - 1
    }

    /// Initialize page 0 so `free_space_offset` sits past the header and the
    /// reserved slot directory.
    pub fn create(&self) -> Result<()> {
        self.page_server.open_file(&self.file_name)?;
        let initial_offset = self.initial_free_offset();
        self.page_server.read_modify_write(&self.file_name, 0, |buf| {
            let mut header = parse_header(buf);
            if header.free_space_offset == 0 {
                header.free_space_offset = initial_offset;
                header.num_slots = 0;
                header.next_page = 0;
                header.flags = 0;
                write_header(buf, &header);
            }
            Ok(())
        })
    }

    pub fn drop_table(&self) -> Result<()> {
        self.page_server.close(&self.file_name)
    }

    /// Walk pages in ascending order, placing `tuple` on the first page with
    /// room. Never fails for a tuple within the per-page capacity bound.
    pub fn insert(&self, tuple: &[Value], xmin: u64) -> Result<Rid> {
        let record = encode_record(xmin, 0, tuple);
        if record.len() > self.max_record_size() {
            return Err(CoreError::Capacity(format!(
                "record of {} bytes exceeds the {}-byte per-page limit",
                record.len(),
                self.max_record_size()
            )));
        }
        let initial_offset = self.initial_free_offset();
        let page_size = self.page_size;

        let mut page_idx: u32 = 0;
        loop {
            let mut placed: Option<u16> = None;
            self.page_server.read_modify_write(&self.file_name, page_idx, |buf| {
                let mut header = parse_header(buf);
                if header.free_space_offset == 0 {
                    header.free_space_offset = initial_offset;
                    header.num_slots = 0;
                }
                let new_free = header.free_space_offset as usize + record.len();
                let dir_end = HEADER_SIZE + (header.num_slots as usize + 1) * 2;
                if (header.num_slots as usize) < RESERVED_SLOT_CAPACITY
                    && new_free <= page_size
                    && dir_end < header.free_space_offset as usize
                {
                    let slot = header.num_slots;
                    write_slot_offset(buf, slot, header.free_space_offset);
                    let at = header.free_space_offset as usize;
                    buf[at..at + record.len()].copy_from_slice(&record);
                    header.num_slots += 1;
                    header.free_space_offset = new_free as u16;
                    write_header(buf, &header);
                    placed = Some(slot);
                } else {
                    write_header(buf, &header);
                }
                Ok(())
            })?;
            if let Some(slot) = placed {
                return Ok(Rid::new(page_idx, slot));
            }
            page_idx = page_idx.checked_add(1).ok_or_else(|| {
                CoreError::Invariant("heap file exceeds addressable page range".to_string())
            })?;
        }
    }

    /// Logical delete: stamps `xmax` on the existing version. Reorganizes
    /// the page if the new encoding is larger than the old one.
    pub fn remove(&self, rid: Rid, xmax: u64) -> Result<()> {
        let initial_offset = self.initial_free_offset();
        let page_size = self.page_size;
        self.page_server.read_modify_write(&self.file_name, rid.page, |buf| {
            let header = parse_header(buf);
            if rid.slot >= header.num_slots {
                return Err(CoreError::Corrupt(format!("rid {} has no such slot", rid)));
            }
            let old_off = read_slot_offset(buf, rid.slot);
            if old_off == 0 {
                return Err(CoreError::Corrupt(format!("rid {} is empty", rid)));
            }
            let (xmin, old_xmax, values) = decode_record(buf, old_off as usize)?;
            if old_xmax != 0 {
                return Err(CoreError::Invariant(format!(
                    "rid {} was already logically deleted by txn {}",
                    rid, old_xmax
                )));
            }
            let new_record = encode_record(xmin, xmax, &values);
            if new_record.len() <= (page_size - old_off as usize) {
                // Fits in place; overwrite the prefix, leave any stale tail bytes.
                let at = old_off as usize;
                buf[at..at + new_record.len()].copy_from_slice(&new_record);
                Ok(())
            } else {
                reorganize_page(buf, header, initial_offset, page_size, rid.slot, &new_record)
            }
        })
    }

    /// Undo a logical delete: clears `xmax` back to `0`. The encoded record
    /// is exactly the same length either way (`xmax` is a fixed 8 bytes), so
    /// this always fits in place.
    pub fn unmark_delete(&self, rid: Rid) -> Result<()> {
        self.set_xmax(rid, 0)
    }

    /// Physical remove: zero the slot's offset. Never reuses the slot index.
    pub fn physical_remove(&self, rid: Rid) -> Result<()> {
        self.page_server.read_modify_write(&self.file_name, rid.page, |buf| {
            let header = parse_header(buf);
            if rid.slot >= header.num_slots {
                return Err(CoreError::Corrupt(format!("rid {} has no such slot", rid)));
            }
            write_slot_offset(buf, rid.slot, 0);
            Ok(())
        })
    }

    /// `remove(rid, txn)` followed by `insert(new_tuple, txn)`. The new RID
    /// is not returned to the caller — the transaction's undo log is what
    /// records the act, keyed on the original `rid`.
    pub fn update(&self, rid: Rid, new_tuple: &[Value], txn_id: u64) -> Result<()> {
        self.remove(rid, txn_id)?;
        self.insert(new_tuple, txn_id)?;
        Ok(())
    }

    /// Physical redo of an insert: place `values` at exactly `rid`, growing
    /// the slot directory up to `rid.slot` if needed. Used only by crash
    /// recovery, which redoes at the rid the log recorded rather than
    /// re-running `insert`'s page-search — the log already decided where
    /// the record landed.
    pub fn redo_insert(&self, rid: Rid, xmin: u64, values: &[Value]) -> Result<()> {
        let record = encode_record(xmin, 0, values);
        let initial_offset = self.initial_free_offset();
        let page_size = self.page_size;
        self.page_server.read_modify_write(&self.file_name, rid.page, |buf| {
            let mut header = parse_header(buf);
            if header.free_space_offset == 0 {
                header.free_space_offset = initial_offset;
                header.num_slots = 0;
            }
            let at = header.free_space_offset as usize;
            if at + record.len() > page_size {
                return Err(CoreError::Capacity("redo insert does not fit on page".to_string()));
            }
            buf[at..at + record.len()].copy_from_slice(&record);
            write_slot_offset(buf, rid.slot, header.free_space_offset);
            if rid.slot >= header.num_slots {
                header.num_slots = rid.slot + 1;
            }
            header.free_space_offset = (at + record.len()) as u16;
            write_header(buf, &header);
            Ok(())
        })
    }

    /// Physical redo/undo of a delete: stamp `xmax` at `rid` unconditionally,
    /// without the double-delete guard `remove` enforces. `0` undoes a
    /// delete; nonzero redoes one.
    pub fn set_xmax(&self, rid: Rid, xmax: u64) -> Result<()> {
        self.page_server.read_modify_write(&self.file_name, rid.page, |buf| {
            let header = parse_header(buf);
            if rid.slot >= header.num_slots {
                return Err(CoreError::Corrupt(format!("rid {} has no such slot", rid)));
            }
            let off = read_slot_offset(buf, rid.slot);
            if off == 0 {
                return Err(CoreError::Corrupt(format!("rid {} is empty", rid)));
            }
            let (xmin, _old_xmax, values) = decode_record(buf, off as usize)?;
            let new_record = encode_record(xmin, xmax, &values);
            let at = off as usize;
            buf[at..at + new_record.len()].copy_from_slice(&new_record);
            Ok(())
        })
    }

    /// Raw tuple at `rid`, ignoring visibility. `None` if the slot is empty
    /// or the record fails to parse.
    pub fn get(&self, rid: Rid) -> Result<Option<Tuple>> {
        Ok(self.get_meta(rid)?.map(|(tuple, _, _)| tuple))
    }

    /// Raw tuple plus `(xmin, xmax)`, ignoring visibility.
    pub fn get_meta(&self, rid: Rid) -> Result<Option<(Tuple, u64, u64)>> {
        let mut buf = vec![0u8; self.page_size];
        self.page_server.read_page(&self.file_name, rid.page, &mut buf)?;
        let header = parse_header(&buf);
        if header.free_space_offset == 0 || rid.slot >= header.num_slots {
            return Ok(None);
        }
        let off = read_slot_offset(&buf, rid.slot);
        if off == 0 {
            return Ok(None);
        }
        match decode_record(&buf, off as usize) {
            Ok((xmin, xmax, values)) => Ok(Some((values, xmin, xmax))),
            Err(_) => Ok(None),
        }
    }

    /// Number of live versions (`xmax == 0`), via a full scan.
    pub fn tuple_count(&self) -> Result<usize> {
        let mut scan = self.scan_with_meta();
        let mut count = 0;
        while let Some((_, _, _, xmax)) = scan.next()? {
            if xmax == 0 {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Forward-only scan yielding `(rid, tuple, xmin, xmax)` for every
    /// non-empty, parseable slot.
    pub fn scan_with_meta(&self) -> HeapScan<'_> {
        HeapScan {
            heap: self,
            cur_page: 0,
            cur_slot: 0,
            page_buf: vec![0u8; self.page_size],
            loaded_page: None,
            finished: false,
        }
    }

    /// Live-only scan yielding `(rid, tuple)` for versions with `xmax == 0`.
    pub fn scan(&self) -> LiveHeapScan<'_> {
        LiveHeapScan { inner: self.scan_with_meta() }
    }
}

/// Assumes `header.num_slots <= RESERVED_SLOT_CAPACITY`, which `insert`'s
/// fit check guarantees; `initial_offset` is only a valid restart point for
/// `cursor` because the directory never grows past its reserved size.
fn reorganize_page(
    buf: &mut [u8],
    header: PageHeader,
    initial_offset: u16,
    page_size: usize,
    updated_slot: u16,
    updated_record: &[u8],
) -> Result<()> {
    let mut live: Vec<(u16, Vec<u8>)> = Vec::with_capacity(header.num_slots as usize);
    for slot in 0..header.num_slots {
        let off = read_slot_offset(buf, slot);
        if off == 0 {
            continue;
        }
        let bytes = if slot == updated_slot {
            updated_record.to_vec()
        } else {
            let (xmin, xmax, values) = decode_record(buf, off as usize)?;
            encode_record(xmin, xmax, &values)
        };
        live.push((slot, bytes));
    }

    let mut cursor = initial_offset as usize;
    // Clear every slot first so tombstoned indexes stay zero.
    for slot in 0..header.num_slots {
        write_slot_offset(buf, slot, 0);
    }
    for (slot, bytes) in &live {
        if cursor + bytes.len() > page_size {
            return Err(CoreError::Capacity(
                "page reorganization does not fit after growth".to_string(),
            ));
        }
        write_slot_offset(buf, *slot, cursor as u16);
        buf[cursor..cursor + bytes.len()].copy_from_slice(bytes);
        cursor += bytes.len();
    }

    let mut new_header = header;
    new_header.free_space_offset = cursor as u16;
    write_header(buf, &new_header);
    Ok(())
}

/// Forward scan over every slot in a heap file, with MVCC metadata.
pub struct HeapScan<'a> {
    heap: &'a HeapTable,
    cur_page: u32,
    cur_slot: u16,
    page_buf: Vec<u8>,
    loaded_page: Option<u32>,
    finished: bool,
}

impl<'a> HeapScan<'a> {
    fn ensure_loaded(&mut self) -> Result<bool> {
        if self.loaded_page == Some(self.cur_page) {
            return Ok(true);
        }
        self.heap.page_server.read_page(&self.heap.file_name, self.cur_page, &mut self.page_buf)?;
        let header = parse_header(&self.page_buf);
        if header.free_space_offset == 0 {
            self.finished = true;
            return Ok(false);
        }
        self.loaded_page = Some(self.cur_page);
        self.cur_slot = 0;
        Ok(true)
    }
}

impl<'a> RowStream for HeapScan<'a> {
    type Item = (Rid, Tuple, u64, u64);

    fn next(&mut self) -> Result<Option<Self::Item>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if !self.ensure_loaded()? {
                return Ok(None);
            }
            let header = parse_header(&self.page_buf);
            if self.cur_slot >= header.num_slots {
                self.cur_page += 1;
                self.loaded_page = None;
                continue;
            }
            let slot = self.cur_slot;
            self.cur_slot += 1;
            let off = read_slot_offset(&self.page_buf, slot);
            if off == 0 {
                continue;
            }
            match decode_record(&self.page_buf, off as usize) {
                Ok((xmin, xmax, values)) => {
                    return Ok(Some((Rid::new(self.cur_page, slot), values, xmin, xmax)))
                }
                Err(_) => continue,
            }
        }
    }
}

/// Live-only wrapper over [`HeapScan`], filtering out `xmax != 0` versions.
pub struct LiveHeapScan<'a> {
    inner: HeapScan<'a>,
}

impl<'a> RowStream for LiveHeapScan<'a> {
    type Item = (Rid, Tuple);

    fn next(&mut self) -> Result<Option<Self::Item>> {
        while let Some((rid, tuple, _xmin, xmax)) = self.inner.next()? {
            if xmax == 0 {
                return Ok(Some((rid, tuple)));
            }
        }
        Ok(None)
    }
}
