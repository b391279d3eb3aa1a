//! Bucket B-tree
//!
//! Index entries `(key bytes, record id)` live in fixed-capacity bucket
//! pages: each bucket holds a heap region of key bytes and a sorted slot
//! array pointing into it, with one used-bit per slot. Deletion tombstones
//! the slot in place; a bucket compacts when more than half its slots are
//! unused and splits when full. Buckets partition the key space in order, so
//! a seek binary-searches the bucket chain and then the slot array.
//!
//! Cursors re-locate by `(key, rid)` value on every step instead of caching
//! slot positions, which makes them stable across concurrent splits and
//! compactions by construction.

use parking_lot::RwLock;
use rook_core::{Error, RecordId, Result};
use rook_storage::UnitOfWork;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Maximum slots per bucket.
pub const BUCKET_MAX_SLOTS: usize = 64;
/// Maximum key-heap bytes per bucket.
pub const BUCKET_MAX_DATA: usize = 8192;

#[derive(Debug, Clone)]
struct Slot {
    offset: u32,
    /// Length of the ordering key bytes.
    klen: u32,
    /// Length of the typebits trailer stored after the key bytes.
    tblen: u32,
    rid: RecordId,
    used: bool,
}

#[derive(Debug, Default)]
struct Bucket {
    data: Vec<u8>,
    slots: Vec<Slot>,
}

impl Bucket {
    fn key(&self, i: usize) -> &[u8] {
        let s = &self.slots[i];
        &self.data[s.offset as usize..(s.offset + s.klen) as usize]
    }

    fn type_bits(&self, i: usize) -> &[u8] {
        let s = &self.slots[i];
        let start = (s.offset + s.klen) as usize;
        &self.data[start..start + s.tblen as usize]
    }

    fn cmp_slot(&self, i: usize, key: &[u8], rid: RecordId) -> Ordering {
        self.key(i)
            .cmp(key)
            .then_with(|| self.slots[i].rid.cmp(&rid))
    }

    /// Binary search for `(key, rid)`: `Ok` on exact slot, `Err` on the
    /// insertion point.
    fn find(&self, key: &[u8], rid: RecordId) -> std::result::Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.cmp_slot(mid, key, rid) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= BUCKET_MAX_SLOTS || self.data.len() >= BUCKET_MAX_DATA
    }

    fn unused_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.used).count()
    }

    fn insert_slot(&mut self, at: usize, key: &[u8], type_bits: &[u8], rid: RecordId) {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(key);
        self.data.extend_from_slice(type_bits);
        self.slots.insert(
            at,
            Slot {
                offset,
                klen: key.len() as u32,
                tblen: type_bits.len() as u32,
                rid,
                used: true,
            },
        );
    }

    /// Drop unused slots and rebuild the heap region.
    fn compact(&mut self) {
        let mut data = Vec::with_capacity(self.data.len());
        let mut slots = Vec::with_capacity(self.slots.len());
        for i in 0..self.slots.len() {
            if !self.slots[i].used {
                continue;
            }
            let offset = data.len() as u32;
            data.extend_from_slice(self.key(i));
            data.extend_from_slice(self.type_bits(i));
            slots.push(Slot {
                offset,
                klen: self.slots[i].klen,
                tblen: self.slots[i].tblen,
                rid: self.slots[i].rid,
                used: true,
            });
        }
        self.data = data;
        self.slots = slots;
    }

    /// Split into halves, rebuilding both heap regions.
    fn split(&mut self) -> Bucket {
        let mid = self.slots.len() / 2;
        let mut lower = Bucket::default();
        let mut upper = Bucket::default();
        for i in 0..self.slots.len() {
            let target = if i < mid { &mut lower } else { &mut upper };
            let offset = target.data.len() as u32;
            target.data.extend_from_slice(self.key(i));
            target.data.extend_from_slice(self.type_bits(i));
            target.slots.push(Slot {
                offset,
                klen: self.slots[i].klen,
                tblen: self.slots[i].tblen,
                rid: self.slots[i].rid,
                used: self.slots[i].used,
            });
        }
        *self = lower;
        upper
    }
}

/// One entry as seen by a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Encoded key bytes.
    pub key: Vec<u8>,
    /// Typebits trailer (empty for V0 entries).
    pub type_bits: Vec<u8>,
    /// Record id of the document the entry points at.
    pub rid: RecordId,
    /// False when the entry is a tombstone awaiting reclamation.
    pub used: bool,
}

/// Position of an entry within the tree (transient; valid only under the
/// read lock that produced it).
type Pos = (usize, usize);

/// The index tree.
pub struct BucketTree {
    name: String,
    buckets: RwLock<Vec<Bucket>>,
    dropped: AtomicBool,
}

impl BucketTree {
    /// Create an empty tree.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            buckets: RwLock::new(vec![Bucket::default()]),
            dropped: AtomicBool::new(false),
        })
    }

    /// Index name the tree serves (diagnostics).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the tree dropped; open cursors fail restore with
    /// `CursorInvalidated`.
    pub fn mark_dropped(&self) {
        self.dropped.store(true, AtomicOrdering::SeqCst);
    }

    /// True once dropped.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(AtomicOrdering::SeqCst)
    }

    /// Insert an entry. With `dup_check`, fails `DuplicateKey` when a live
    /// entry with the same key bytes but a different record id exists.
    pub fn insert(
        self: &Arc<Self>,
        uow: &mut UnitOfWork,
        key: &[u8],
        type_bits: &[u8],
        rid: RecordId,
        dup_check: bool,
    ) -> Result<()> {
        let mut buckets = self.buckets.write();
        if dup_check {
            if let Some(existing) = live_with_key(&buckets, key) {
                if existing != rid {
                    return Err(duplicate_entry_error(key, existing));
                }
            }
        }
        let b = locate_bucket(&buckets, key, rid);
        match buckets[b].find(key, rid) {
            Ok(i) => {
                // Tombstone resurrection.
                if !buckets[b].slots[i].used {
                    buckets[b].slots[i].used = true;
                    let this = self.clone();
                    let key = key.to_vec();
                    uow.register_undo(move || this.set_used(&key, rid, false));
                }
            }
            Err(i) => {
                if buckets[b].is_full() && buckets[b].unused_count() > buckets[b].slots.len() / 2 {
                    buckets[b].compact();
                    drop(buckets);
                    return self.insert(uow, key, type_bits, rid, dup_check);
                }
                if buckets[b].is_full() {
                    let upper = buckets[b].split();
                    buckets.insert(b + 1, upper);
                    drop(buckets);
                    return self.insert(uow, key, type_bits, rid, dup_check);
                }
                buckets[b].insert_slot(i, key, type_bits, rid);
                let this = self.clone();
                let key = key.to_vec();
                uow.register_undo(move || this.physical_remove(&key, rid));
            }
        }
        Ok(())
    }

    /// Tombstone an entry. Returns false when no live entry matched.
    pub fn remove(
        self: &Arc<Self>,
        uow: &mut UnitOfWork,
        key: &[u8],
        rid: RecordId,
    ) -> Result<bool> {
        let mut buckets = self.buckets.write();
        let b = locate_bucket(&buckets, key, rid);
        match buckets[b].find(key, rid) {
            Ok(i) if buckets[b].slots[i].used => {
                buckets[b].slots[i].used = false;
                let this = self.clone();
                let key = key.to_vec();
                uow.register_undo(move || this.set_used(&key, rid, true));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn set_used(&self, key: &[u8], rid: RecordId, used: bool) {
        let mut buckets = self.buckets.write();
        let b = locate_bucket(&buckets, key, rid);
        if let Ok(i) = buckets[b].find(key, rid) {
            buckets[b].slots[i].used = used;
        }
    }

    fn physical_remove(&self, key: &[u8], rid: RecordId) {
        let mut buckets = self.buckets.write();
        let b = locate_bucket(&buckets, key, rid);
        if let Ok(i) = buckets[b].find(key, rid) {
            buckets[b].slots.remove(i);
            if buckets[b].slots.is_empty() && buckets.len() > 1 {
                buckets.remove(b);
            }
        }
    }

    /// First entry at-or-past `(key, rid)` in ascending order, tombstones
    /// included.
    pub fn seek_ge(&self, key: &[u8], rid: RecordId) -> Option<Entry> {
        let buckets = self.buckets.read();
        let pos = position_ge(&buckets, key, rid)?;
        Some(entry_at(&buckets, pos))
    }

    /// Last entry at-or-before `(key, rid)` in ascending order.
    pub fn seek_le(&self, key: &[u8], rid: RecordId) -> Option<Entry> {
        let buckets = self.buckets.read();
        match position_ge(&buckets, key, rid) {
            Some(pos) => {
                if cmp_at(&buckets, pos, key, rid) == Ordering::Equal {
                    Some(entry_at(&buckets, pos))
                } else {
                    let prev = step_backward(&buckets, pos)?;
                    Some(entry_at(&buckets, prev))
                }
            }
            None => last_position(&buckets).map(|p| entry_at(&buckets, p)),
        }
    }

    /// First entry strictly past `(key, rid)` ascending.
    pub fn next_after(&self, key: &[u8], rid: RecordId) -> Option<Entry> {
        let buckets = self.buckets.read();
        let pos = position_ge(&buckets, key, rid)?;
        if cmp_at(&buckets, pos, key, rid) == Ordering::Equal {
            let next = step_forward(&buckets, pos)?;
            Some(entry_at(&buckets, next))
        } else {
            Some(entry_at(&buckets, pos))
        }
    }

    /// Last entry strictly before `(key, rid)` ascending.
    pub fn prev_before(&self, key: &[u8], rid: RecordId) -> Option<Entry> {
        let buckets = self.buckets.read();
        let pos = match position_ge(&buckets, key, rid) {
            Some(pos) => step_backward(&buckets, pos)?,
            None => last_position(&buckets)?,
        };
        Some(entry_at(&buckets, pos))
    }

    /// First entry of the tree.
    pub fn first(&self) -> Option<Entry> {
        let buckets = self.buckets.read();
        first_position(&buckets).map(|p| entry_at(&buckets, p))
    }

    /// Last entry of the tree.
    pub fn last(&self) -> Option<Entry> {
        let buckets = self.buckets.read();
        last_position(&buckets).map(|p| entry_at(&buckets, p))
    }

    /// Record id of any live entry with exactly these key bytes.
    pub fn live_with_key(&self, key: &[u8]) -> Option<RecordId> {
        let buckets = self.buckets.read();
        live_with_key(&buckets, key)
    }

    /// Number of live entries.
    pub fn live_entries(&self) -> usize {
        let buckets = self.buckets.read();
        buckets
            .iter()
            .flat_map(|b| b.slots.iter())
            .filter(|s| s.used)
            .count()
    }

    /// Number of bucket pages.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Load pre-sorted `(key, type_bits, rid)` triples into an empty tree.
    pub fn bulk_load(&self, entries: &[(Vec<u8>, Vec<u8>, RecordId)]) -> Result<()> {
        let mut buckets = self.buckets.write();
        if buckets.len() != 1 || !buckets[0].slots.is_empty() {
            return Err(Error::internal("bulk load into non-empty index tree"));
        }
        for w in entries.windows(2) {
            if (&w[0].0, w[0].2) >= (&w[1].0, w[1].2) {
                return Err(Error::internal("bulk load input out of order"));
            }
        }
        buckets.clear();
        let mut current = Bucket::default();
        for (key, type_bits, rid) in entries {
            if current.is_full() {
                buckets.push(std::mem::take(&mut current));
            }
            let at = current.slots.len();
            current.insert_slot(at, key, type_bits, *rid);
        }
        buckets.push(current);
        Ok(())
    }
}

/// DuplicateKey with a byte-rendered key; callers with the descriptor in
/// hand re-wrap it with the index name and decoded key.
fn duplicate_entry_error(key: &[u8], rid: RecordId) -> Error {
    Error::DuplicateKey {
        index: String::new(),
        key: format!("{:02x?} held by {}", &key[..key.len().min(16)], rid),
    }
}

fn live_with_key(buckets: &[Bucket], key: &[u8]) -> Option<RecordId> {
    let mut pos = position_ge(buckets, key, RecordId::MIN)?;
    loop {
        let b = &buckets[pos.0];
        if b.key(pos.1) != key {
            return None;
        }
        if b.slots[pos.1].used {
            return Some(b.slots[pos.1].rid);
        }
        pos = step_forward(buckets, pos)?;
    }
}

/// First bucket whose last slot is `>= (key, rid)`, else the last bucket.
fn locate_bucket(buckets: &[Bucket], key: &[u8], rid: RecordId) -> usize {
    let mut lo = 0usize;
    let mut hi = buckets.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        let b = &buckets[mid];
        if b.slots.is_empty() || b.cmp_slot(b.slots.len() - 1, key, rid) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo.min(buckets.len() - 1)
}

fn position_ge(buckets: &[Bucket], key: &[u8], rid: RecordId) -> Option<Pos> {
    let mut b = locate_bucket(buckets, key, rid);
    loop {
        let bucket = &buckets[b];
        let i = match bucket.find(key, rid) {
            Ok(i) => i,
            Err(i) => i,
        };
        if i < bucket.slots.len() {
            return Some((b, i));
        }
        b += 1;
        if b >= buckets.len() {
            return None;
        }
        if !buckets[b].slots.is_empty() {
            return Some((b, 0));
        }
    }
}

fn first_position(buckets: &[Bucket]) -> Option<Pos> {
    buckets
        .iter()
        .position(|b| !b.slots.is_empty())
        .map(|b| (b, 0))
}

fn last_position(buckets: &[Bucket]) -> Option<Pos> {
    buckets
        .iter()
        .rposition(|b| !b.slots.is_empty())
        .map(|b| (b, buckets[b].slots.len() - 1))
}

fn step_forward(buckets: &[Bucket], (b, s): Pos) -> Option<Pos> {
    if s + 1 < buckets[b].slots.len() {
        return Some((b, s + 1));
    }
    buckets
        .iter()
        .enumerate()
        .skip(b + 1)
        .find(|(_, bucket)| !bucket.slots.is_empty())
        .map(|(nb, _)| (nb, 0))
}

fn step_backward(buckets: &[Bucket], (b, s): Pos) -> Option<Pos> {
    if s > 0 {
        return Some((b, s - 1));
    }
    buckets[..b]
        .iter()
        .rposition(|bucket| !bucket.slots.is_empty())
        .map(|nb| (nb, buckets[nb].slots.len() - 1))
}

fn cmp_at(buckets: &[Bucket], (b, s): Pos, key: &[u8], rid: RecordId) -> Ordering {
    buckets[b].cmp_slot(s, key, rid)
}

fn entry_at(buckets: &[Bucket], (b, s): Pos) -> Entry {
    Entry {
        key: buckets[b].key(s).to_vec(),
        type_bits: buckets[b].type_bits(s).to_vec(),
        rid: buckets[b].slots[s].rid,
        used: buckets[b].slots[s].used,
    }
}
