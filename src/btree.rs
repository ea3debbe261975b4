//! Secondary B+-tree-shaped index: key → RID, equality lookup, range scan,
//! and leaf split / root promotion on overflow.
//!
//! Node pages are addressed in the same `<index>.idx` file as page 0, which
//! is reserved as a meta page (`root_page`, `next_free_page`). Because page 0
//! can never be a real node, `0` doubles as the "no parent" / "no next leaf"
//! / "no child" sentinel — a freshly zero-filled page already decodes as an
//! empty leaf with no parent and no next sibling, which is exactly the
//! desired state for a brand new root.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, Result};
use crate::heap::RowStream;
use crate::page_server::PageServer;
use crate::rid::Rid;
use crate::value::{compare_values, decode_value, encode_value, Value, ValueType};

const META_TAG: u8 = 0xAA;
const LEAF_TAG: u8 = 0;
const INTERNAL_TAG: u8 = 1;
const NONE_PAGE: u32 = 0;
const NODE_HEADER_SIZE: usize = 1 + 2 + 4 + 4; // tag, num_keys, parent, next_leaf/unused

struct LeafNode {
    parent: u32,
    next_leaf: u32,
    entries: Vec<(Value, Rid)>,
}

struct InternalNode {
    parent: u32,
    children: Vec<u32>,
    keys: Vec<Value>,
}

fn key_less(a: &Value, b: &Value) -> bool {
    matches!(compare_values(a, b), Some(Ordering::Less))
}

fn key_le(a: &Value, b: &Value) -> bool {
    matches!(compare_values(a, b), Some(Ordering::Less) | Some(Ordering::Equal))
}

fn key_eq(a: &Value, b: &Value) -> bool {
    matches!(compare_values(a, b), Some(Ordering::Equal))
}

fn pad(mut bytes: Vec<u8>, page_size: usize) -> Result<Vec<u8>> {
    if bytes.len() > page_size {
        return Err(CoreError::Capacity(format!(
            "node encodes to {} bytes, exceeding the {}-byte page",
            bytes.len(),
            page_size
        )));
    }
    bytes.resize(page_size, 0);
    Ok(bytes)
}

fn encode_leaf(n: &LeafNode) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(LEAF_TAG);
    buf.extend_from_slice(&(n.entries.len() as u16).to_le_bytes());
    buf.extend_from_slice(&n.parent.to_le_bytes());
    buf.extend_from_slice(&n.next_leaf.to_le_bytes());
    for (k, rid) in &n.entries {
        encode_value(&mut buf, k);
        buf.extend_from_slice(&rid.page.to_le_bytes());
        buf.extend_from_slice(&rid.slot.to_le_bytes());
    }
    buf
}

fn decode_leaf(buf: &[u8]) -> Result<LeafNode> {
    if buf.len() < NODE_HEADER_SIZE {
        return Err(CoreError::Corrupt("truncated leaf header".to_string()));
    }
    let num = u16::from_le_bytes(buf[1..3].try_into().unwrap());
    let parent = u32::from_le_bytes(buf[3..7].try_into().unwrap());
    let next_leaf = u32::from_le_bytes(buf[7..11].try_into().unwrap());
    let mut pos = NODE_HEADER_SIZE;
    let mut entries = Vec::with_capacity(num as usize);
    for _ in 0..num {
        let key = decode_value(buf, &mut pos)?;
        if pos + 6 > buf.len() {
            return Err(CoreError::Corrupt("truncated leaf entry".to_string()));
        }
        let page = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let slot = u16::from_le_bytes(buf[pos..pos + 2].try_into().unwrap());
        pos += 2;
        entries.push((key, Rid::new(page, slot)));
    }
    Ok(LeafNode { parent, next_leaf, entries })
}

fn encode_internal(n: &InternalNode) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(INTERNAL_TAG);
    buf.extend_from_slice(&(n.keys.len() as u16).to_le_bytes());
    buf.extend_from_slice(&n.parent.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // unused, mirrors leaf header width
    buf.extend_from_slice(&n.children[0].to_le_bytes());
    for i in 0..n.keys.len() {
        encode_value(&mut buf, &n.keys[i]);
        buf.extend_from_slice(&n.children[i + 1].to_le_bytes());
    }
    buf
}

fn decode_internal(buf: &[u8]) -> Result<InternalNode> {
    if buf.len() < NODE_HEADER_SIZE + 4 {
        return Err(CoreError::Corrupt("truncated internal header".to_string()));
    }
    let num_keys = u16::from_le_bytes(buf[1..3].try_into().unwrap()) as usize;
    let parent = u32::from_le_bytes(buf[3..7].try_into().unwrap());
    let mut pos = NODE_HEADER_SIZE;
    let first_child = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
    pos += 4;
    let mut children = vec![first_child];
    let mut keys = Vec::with_capacity(num_keys);
    for _ in 0..num_keys {
        let key = decode_value(buf, &mut pos)?;
        if pos + 4 > buf.len() {
            return Err(CoreError::Corrupt("truncated internal entry".to_string()));
        }
        let child = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;
        keys.push(key);
        children.push(child);
    }
    Ok(InternalNode { parent, children, keys })
}

/// A named single-column index mapping key → a multiset of RIDs.
pub struct BTreeIndex {
    file_name: String,
    page_server: Arc<PageServer>,
    key_type: ValueType,
    page_size: usize,
    unique: bool,
    write_lock: Mutex<()>,
}

impl BTreeIndex {
    pub fn new(name: &str, key_type: ValueType, page_server: Arc<PageServer>, unique: bool) -> Self {
        let page_size = page_server.page_size();
        Self {
            file_name: format!("{}.idx", name),
            page_server,
            key_type,
            page_size,
            unique,
            write_lock: Mutex::new(()),
        }
    }

    pub fn key_type(&self) -> ValueType {
        self.key_type
    }

    pub fn create(&self) -> Result<()> {
        self.page_server.open_file(&self.file_name)?;
        self.page_server.read_modify_write(&self.file_name, 0, |buf| {
            if buf[0] != META_TAG {
                buf[0] = META_TAG;
                buf[1..5].copy_from_slice(&1u32.to_le_bytes());
                buf[5..9].copy_from_slice(&2u32.to_le_bytes());
            }
            Ok(())
        })?;
        let empty = LeafNode { parent: NONE_PAGE, next_leaf: NONE_PAGE, entries: vec![] };
        let bytes = pad(encode_leaf(&empty), self.page_size)?;
        self.page_server.write_page(&self.file_name, 1, &bytes)
    }

    pub fn open(&self) -> Result<()> {
        self.page_server.open_file(&self.file_name)
    }

    pub fn close(&self) -> Result<()> {
        self.page_server.close(&self.file_name)
    }

    pub fn drop_index(&self) -> Result<()> {
        self.close()
    }

    fn read_root(&self) -> Result<u32> {
        let mut buf = vec![0u8; self.page_size];
        self.page_server.read_page(&self.file_name, 0, &mut buf)?;
        if buf[0] != META_TAG {
            return Ok(1);
        }
        Ok(u32::from_le_bytes(buf[1..5].try_into().unwrap()))
    }

    fn write_root(&self, page: u32) -> Result<()> {
        self.page_server.read_modify_write(&self.file_name, 0, |buf| {
            buf[0] = META_TAG;
            buf[1..5].copy_from_slice(&page.to_le_bytes());
            Ok(())
        })
    }

    fn allocate_page(&self) -> Result<u32> {
        let mut allocated = 0u32;
        self.page_server.read_modify_write(&self.file_name, 0, |buf| {
            if buf[0] != META_TAG {
                buf[0] = META_TAG;
                buf[1..5].copy_from_slice(&1u32.to_le_bytes());
                buf[5..9].copy_from_slice(&2u32.to_le_bytes());
            }
            let next = u32::from_le_bytes(buf[5..9].try_into().unwrap());
            allocated = next;
            buf[5..9].copy_from_slice(&(next + 1).to_le_bytes());
            Ok(())
        })?;
        Ok(allocated)
    }

    fn read_node_tag(&self, page_idx: u32) -> Result<(u8, Vec<u8>)> {
        let mut buf = vec![0u8; self.page_size];
        self.page_server.read_page(&self.file_name, page_idx, &mut buf)?;
        let tag = buf[0];
        Ok((tag, buf))
    }

    fn find_leaf(&self, key: &Value) -> Result<u32> {
        let mut cur = self.read_root()?;
        loop {
            let (tag, buf) = self.read_node_tag(cur)?;
            if tag == INTERNAL_TAG {
                let node = decode_internal(&buf)?;
                let idx = node.keys.partition_point(|k| key_le(k, key));
                cur = node.children[idx];
            } else {
                return Ok(cur);
            }
        }
    }

    fn find_leftmost_leaf(&self) -> Result<u32> {
        let mut cur = self.read_root()?;
        loop {
            let (tag, buf) = self.read_node_tag(cur)?;
            if tag == INTERNAL_TAG {
                let node = decode_internal(&buf)?;
                cur = node.children[0];
            } else {
                return Ok(cur);
            }
        }
    }

    fn set_parent(&self, page_idx: u32, parent: u32) -> Result<()> {
        let (tag, buf) = self.read_node_tag(page_idx)?;
        match tag {
            LEAF_TAG => {
                let mut n = decode_leaf(&buf)?;
                n.parent = parent;
                let bytes = pad(encode_leaf(&n), self.page_size)?;
                self.page_server.write_page(&self.file_name, page_idx, &bytes)
            }
            INTERNAL_TAG => {
                let mut n = decode_internal(&buf)?;
                n.parent = parent;
                let bytes = pad(encode_internal(&n), self.page_size)?;
                self.page_server.write_page(&self.file_name, page_idx, &bytes)
            }
            other => Err(CoreError::Corrupt(format!("unknown node tag {}", other))),
        }
    }

    /// Insert `key -> rid`. Splits the target leaf (and, recursively, any
    /// internal ancestor) on overflow, promoting a new root when the node
    /// being split has no parent.
    pub fn insert(&self, key: &Value, rid: Rid) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        if self.unique {
            let existing = self.search_unlocked(key)?;
            if existing.iter().any(|r| *r != rid) {
                return Err(CoreError::Invariant(format!(
                    "unique index violation for key on existing rid(s) {:?}",
                    existing
                )));
            }
        }
        let leaf_page = self.find_leaf(key)?;
        self.insert_into_leaf(leaf_page, key.clone(), rid)
    }

    fn insert_into_leaf(&self, page_idx: u32, key: Value, rid: Rid) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        self.page_server.read_page(&self.file_name, page_idx, &mut buf)?;
        let mut leaf = decode_leaf(&buf)?;
        let pos = leaf.entries.partition_point(|(k, _)| key_less(k, &key));
        leaf.entries.insert(pos, (key, rid));
        let encoded = encode_leaf(&leaf);
        if encoded.len() <= self.page_size {
            let bytes = pad(encoded, self.page_size)?;
            return self.page_server.write_page(&self.file_name, page_idx, &bytes);
        }

        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);
        let separator = right_entries[0].0.clone();
        let parent = leaf.parent;
        let old_next = leaf.next_leaf;
        let new_page = self.allocate_page()?;
        let left = LeafNode { parent, next_leaf: new_page, entries: leaf.entries };
        let right = LeafNode { parent, next_leaf: old_next, entries: right_entries };
        if encode_leaf(&left).len() > self.page_size || encode_leaf(&right).len() > self.page_size {
            return Err(CoreError::Capacity(
                "a single index key is too large to fit half a page after split".to_string(),
            ));
        }
        let left_bytes = pad(encode_leaf(&left), self.page_size)?;
        let right_bytes = pad(encode_leaf(&right), self.page_size)?;
        self.page_server.write_page(&self.file_name, page_idx, &left_bytes)?;
        self.page_server.write_page(&self.file_name, new_page, &right_bytes)?;
        self.insert_into_parent(parent, page_idx, separator, new_page)
    }

    fn insert_into_parent(
        &self,
        parent_page: u32,
        left_child: u32,
        separator: Value,
        right_child: u32,
    ) -> Result<()> {
        if parent_page == NONE_PAGE {
            let new_root = self.allocate_page()?;
            let root_node =
                InternalNode { parent: NONE_PAGE, children: vec![left_child, right_child], keys: vec![separator] };
            let bytes = pad(encode_internal(&root_node), self.page_size)?;
            self.page_server.write_page(&self.file_name, new_root, &bytes)?;
            self.set_parent(left_child, new_root)?;
            self.set_parent(right_child, new_root)?;
            return self.write_root(new_root);
        }

        let mut buf = vec![0u8; self.page_size];
        self.page_server.read_page(&self.file_name, parent_page, &mut buf)?;
        let mut node = decode_internal(&buf)?;
        let child_pos = node.children.iter().position(|&c| c == left_child).ok_or_else(|| {
            CoreError::Invariant("btree parent is missing the expected child pointer".to_string())
        })?;
        node.keys.insert(child_pos, separator);
        node.children.insert(child_pos + 1, right_child);
        let encoded = encode_internal(&node);
        if encoded.len() <= self.page_size {
            let bytes = pad(encoded, self.page_size)?;
            return self.page_server.write_page(&self.file_name, parent_page, &bytes);
        }

        let mid = node.keys.len() / 2;
        let up_key = node.keys[mid].clone();
        let right_keys = node.keys.split_off(mid + 1);
        node.keys.pop();
        let right_children = node.children.split_off(mid + 1);
        let grandparent = node.parent;
        let new_page = self.allocate_page()?;
        let left = InternalNode { parent: grandparent, children: node.children, keys: node.keys };
        let right = InternalNode { parent: grandparent, children: right_children, keys: right_keys };
        let left_bytes = pad(encode_internal(&left), self.page_size)?;
        let right_bytes = pad(encode_internal(&right), self.page_size)?;
        self.page_server.write_page(&self.file_name, parent_page, &left_bytes)?;
        self.page_server.write_page(&self.file_name, new_page, &right_bytes)?;
        for &c in &right.children {
            self.set_parent(c, new_page)?;
        }
        self.insert_into_parent(grandparent, parent_page, up_key, new_page)
    }

    /// Remove one `(key, rid)` entry. Fails if the pair is not present —
    /// callers keeping an index consistent with its heap already know
    /// whether the entry exists.
    pub fn remove(&self, key: &Value, rid: Rid) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let leaf_page = self.find_leaf(key)?;
        let mut buf = vec![0u8; self.page_size];
        self.page_server.read_page(&self.file_name, leaf_page, &mut buf)?;
        let mut leaf = decode_leaf(&buf)?;
        let before = leaf.entries.len();
        leaf.entries.retain(|(k, r)| !(key_eq(k, key) && *r == rid));
        if leaf.entries.len() == before {
            return Err(CoreError::Corrupt(format!("index entry for rid {} not found", rid)));
        }
        let bytes = pad(encode_leaf(&leaf), self.page_size)?;
        self.page_server.write_page(&self.file_name, leaf_page, &bytes)
    }

    fn search_unlocked(&self, key: &Value) -> Result<Vec<Rid>> {
        let mut results = Vec::new();
        let mut page = self.find_leaf(key)?;
        loop {
            let (_tag, buf) = self.read_node_tag(page)?;
            let leaf = decode_leaf(&buf)?;
            let mut matched_here = false;
            for (k, rid) in &leaf.entries {
                if key_eq(k, key) {
                    results.push(*rid);
                    matched_here = true;
                }
            }
            let continues = matched_here
                && leaf.entries.last().map(|(k, _)| key_eq(k, key)).unwrap_or(false)
                && leaf.next_leaf != NONE_PAGE;
            if !continues {
                break;
            }
            page = leaf.next_leaf;
        }
        Ok(results)
    }

    /// Equality search; duplicates from a non-unique index are all returned.
    pub fn search(&self, key: &Value) -> Result<Vec<Rid>> {
        self.search_unlocked(key)
    }

    /// Inclusive range search over `[min, max]`; either bound may be open.
    pub fn range_search(&self, min: Option<&Value>, max: Option<&Value>) -> Result<Vec<Rid>> {
        let mut page = match min {
            Some(k) => self.find_leaf(k)?,
            None => self.find_leftmost_leaf()?,
        };
        let mut results = Vec::new();
        'outer: loop {
            let (_tag, buf) = self.read_node_tag(page)?;
            let leaf = decode_leaf(&buf)?;
            for (k, rid) in &leaf.entries {
                if let Some(lo) = min {
                    if key_less(k, lo) {
                        continue;
                    }
                }
                if let Some(hi) = max {
                    if key_less(hi, k) {
                        break 'outer;
                    }
                }
                results.push(*rid);
            }
            if leaf.next_leaf == NONE_PAGE {
                break;
            }
            page = leaf.next_leaf;
        }
        Ok(results)
    }

    /// Forward scan over every `(key, rid)` entry in key order.
    pub fn scan(&self) -> Result<BTreeScan<'_>> {
        let page = self.find_leftmost_leaf()?;
        Ok(BTreeScan { index: self, page, idx_in_leaf: 0, entries: Vec::new(), loaded: false, finished: false })
    }
}

/// Forward iterator over an index's leaf chain, in key order.
pub struct BTreeScan<'a> {
    index: &'a BTreeIndex,
    page: u32,
    idx_in_leaf: usize,
    entries: Vec<(Value, Rid)>,
    loaded: bool,
    finished: bool,
}

impl<'a> BTreeScan<'a> {
    fn ensure_loaded(&mut self) -> Result<bool> {
        if self.loaded {
            return Ok(true);
        }
        let (_tag, buf) = self.index.read_node_tag(self.page)?;
        let leaf = decode_leaf(&buf)?;
        self.entries = leaf.entries;
        self.idx_in_leaf = 0;
        self.loaded = true;
        self.page = leaf.next_leaf;
        Ok(true)
    }
}

impl<'a> RowStream for BTreeScan<'a> {
    type Item = (Value, Rid);

    fn next(&mut self) -> Result<Option<Self::Item>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            self.ensure_loaded()?;
            if self.idx_in_leaf < self.entries.len() {
                let item = self.entries[self.idx_in_leaf].clone();
                self.idx_in_leaf += 1;
                return Ok(Some(item));
            }
            if self.page == NONE_PAGE {
                self.finished = true;
                return Ok(None);
            }
            self.loaded = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(unique: bool) -> (tempfile::TempDir, BTreeIndex) {
        let dir = tempfile::tempdir().unwrap();
        let ps = Arc::new(PageServer::open(dir.path(), 4096).unwrap());
        let idx = BTreeIndex::new("t_id", ValueType::Int64, ps, unique);
        idx.create().unwrap();
        (dir, idx)
    }

    #[test]
    fn insert_and_search_single_leaf() {
        let (_dir, idx) = index(false);
        idx.insert(&Value::Int64(1), Rid::new(0, 0)).unwrap();
        idx.insert(&Value::Int64(2), Rid::new(0, 1)).unwrap();
        assert_eq!(idx.search(&Value::Int64(1)).unwrap(), vec![Rid::new(0, 0)]);
        assert_eq!(idx.search(&Value::Int64(3)).unwrap(), Vec::<Rid>::new());
    }

    #[test]
    fn split_keeps_every_key_searchable() {
        let (_dir, idx) = index(false);
        for i in 0..400i64 {
            idx.insert(&Value::Int64(i), Rid::new(0, (i % 60) as u16)).unwrap();
        }
        for i in 0..400i64 {
            let found = idx.search(&Value::Int64(i)).unwrap();
            assert_eq!(found.len(), 1, "key {} missing after splits", i);
        }
    }

    #[test]
    fn scan_visits_keys_in_order() {
        let (_dir, idx) = index(false);
        for i in [5i64, 1, 3, 2, 4] {
            idx.insert(&Value::Int64(i), Rid::new(0, i as u16)).unwrap();
        }
        let mut scan = idx.scan().unwrap();
        let mut keys = Vec::new();
        while let Some((k, _)) = scan.next().unwrap() {
            keys.push(k);
        }
        assert_eq!(keys, vec![Value::Int64(1), Value::Int64(2), Value::Int64(3), Value::Int64(4), Value::Int64(5)]);
    }

    #[test]
    fn range_search_respects_bounds() {
        let (_dir, idx) = index(false);
        for i in 0..20i64 {
            idx.insert(&Value::Int64(i), Rid::new(0, i as u16)).unwrap();
        }
        let rids = idx.range_search(Some(&Value::Int64(5)), Some(&Value::Int64(9))).unwrap();
        assert_eq!(rids.len(), 5);
    }

    #[test]
    fn unique_index_rejects_conflicting_key() {
        let (_dir, idx) = index(true);
        idx.insert(&Value::Int64(1), Rid::new(0, 0)).unwrap();
        assert!(idx.insert(&Value::Int64(1), Rid::new(0, 1)).is_err());
    }

    #[test]
    fn remove_then_search_returns_empty() {
        let (_dir, idx) = index(false);
        idx.insert(&Value::Int64(1), Rid::new(0, 0)).unwrap();
        idx.remove(&Value::Int64(1), Rid::new(0, 0)).unwrap();
        assert!(idx.search(&Value::Int64(1)).unwrap().is_empty());
    }
}
