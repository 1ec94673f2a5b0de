//! Multi-version tuple visibility and the key index.
//!
//! Each key maps to one version chain stored on heap pages: the index points
//! at the oldest surviving version, and chains are walked oldest to newest
//! through each header's `next` pointer. Readers never block writers; a
//! snapshot decides which single version of a chain a transaction sees.
//! Write-write conflicts fail immediately (first committer wins), there is
//! no lock-wait queue.
//!
//! Mutations here are the apply level shared by normal execution and WAL
//! redo: they change pages and the index but never touch the log. The
//! engine wraps them with logging and LSN stamping.

use std::collections::{BTreeMap, HashSet};

use tracing::trace;

use crate::error::{HeartwoodError, Result};
use crate::storage::heap::Heap;
use crate::storage::page::{encode_tuple, TupleHeader, ITEM_LEN, PAGE_HDR_LEN, TUPLE_HDR_LEN};
use crate::txn::{Transaction, TxnManager, TxnStatus};
use crate::types::{Lsn, PageId, TxnId, VersionId, INVALID_XID};

/// Decides whether one tuple version is visible to `txn`'s snapshot.
///
/// A version is visible iff its creator committed before the snapshot was
/// taken (frozen xmin counts as committed before everything) and its
/// deleter, if any, did not. The reading transaction sees its own writes
/// from earlier commands and none of its own deletions.
pub fn version_visible(hdr: &TupleHeader, txn: &Transaction, txns: &TxnManager) -> bool {
    let snap = &txn.snapshot;

    // xmin side: was the creating transaction committed in our snapshot?
    if hdr.xmin == txn.id {
        if hdr.cmin >= txn.command {
            return false;
        }
    } else if !hdr.xmin.is_frozen() {
        if txns.status(hdr.xmin) != TxnStatus::Committed
            || snap.saw_in_progress(hdr.xmin)
            || snap.saw_as_future(hdr.xmin)
        {
            return false;
        }
    }

    // xmax side: is the version deleted in our snapshot?
    if hdr.xmax.is_invalid() {
        return true;
    }
    if hdr.xmax == txn.id {
        return false;
    }
    txns.status(hdr.xmax) != TxnStatus::Committed
        || snap.saw_in_progress(hdr.xmax)
        || snap.saw_as_future(hdr.xmax)
}

/// Outcome of placing a new version: where it landed and, for a chained
/// insert, which version now points at it.
#[derive(Clone, Copy, Debug)]
pub struct Placed {
    /// The new version.
    pub version: VersionId,
    /// Chain tail whose `next` was set to the new version, if any.
    pub linked_from: Option<VersionId>,
}

/// Version chains over a heap, plus the in-memory key index.
pub struct VersionStore {
    heap: Heap,
    index: BTreeMap<Vec<u8>, VersionId>,
}

impl VersionStore {
    /// Wraps a heap with an empty index. Call
    /// [`rebuild_index`](Self::rebuild_index) after recovery replay.
    pub fn new(heap: Heap) -> Self {
        Self {
            heap,
            index: BTreeMap::new(),
        }
    }

    /// The underlying heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable access to the heap (checkpoint write-back, page images).
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Number of keys with at least one surviving version.
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// Oldest surviving version of `key`, if any.
    pub fn chain_head(&self, key: &[u8]) -> Option<VersionId> {
        self.index.get(key).copied()
    }

    /// Largest tuple (header + key + payload) this heap's pages can hold.
    pub fn max_tuple_len(&self) -> usize {
        self.heap.page_size() - PAGE_HDR_LEN - ITEM_LEN
    }

    fn walk_tail(&mut self, head: VersionId) -> Result<VersionId> {
        let mut cur = head;
        loop {
            let hdr = match self.heap.tuple_header(cur) {
                Ok(hdr) => hdr,
                // A reclaimed link means the chain ends here.
                Err(HeartwoodError::NotFound) => return Ok(cur),
                Err(err) => return Err(err),
            };
            if hdr.next.is_null() {
                return Ok(cur);
            }
            cur = hdr.next;
        }
    }

    /// Rebuilds the key index from a full heap scan. A chain head is a live
    /// version no other version points at.
    pub fn rebuild_index(&mut self) -> Result<()> {
        let mut versions: Vec<(VersionId, Vec<u8>)> = Vec::new();
        let mut pointed_to: HashSet<VersionId> = HashSet::new();
        self.heap.for_each_live(|version, hdr, key| {
            versions.push((version, key.to_vec()));
            if !hdr.next.is_null() {
                pointed_to.insert(hdr.next);
            }
            Ok(())
        })?;
        self.index.clear();
        for (version, key) in versions {
            if !pointed_to.contains(&version) {
                self.index.insert(key, version);
            }
        }
        trace!(keys = self.index.len(), "mvcc.index.rebuilt");
        Ok(())
    }

    /// Walks `key`'s chain and returns the newest version visible to `txn`,
    /// with its payload.
    pub fn read(
        &mut self,
        txns: &TxnManager,
        txn: &Transaction,
        key: &[u8],
    ) -> Result<Option<(VersionId, Vec<u8>)>> {
        let Some(head) = self.chain_head(key) else {
            return Ok(None);
        };
        let mut cur = head;
        let mut newest_visible: Option<VersionId> = None;
        loop {
            let hdr = match self.heap.tuple_header(cur) {
                Ok(hdr) => hdr,
                Err(HeartwoodError::NotFound) => break,
                Err(err) => return Err(err),
            };
            if version_visible(&hdr, txn, txns) {
                newest_visible = Some(cur);
            }
            if hdr.next.is_null() {
                break;
            }
            cur = hdr.next;
        }
        match newest_visible {
            Some(version) => {
                let payload = self.heap.tuple_payload(version)?;
                Ok(Some((version, payload)))
            }
            None => Ok(None),
        }
    }

    /// First-committer-wins check before an update or delete of `version`.
    ///
    /// An xmax stamped by any transaction that has not aborted means the
    /// version is already superseded (or about to be): fail immediately.
    /// An aborted stamp is dead and may be overwritten.
    pub fn check_write(
        &mut self,
        txns: &TxnManager,
        txn: &Transaction,
        version: VersionId,
    ) -> Result<TupleHeader> {
        let hdr = self.heap.tuple_header(version)?;
        if !version_visible(&hdr, txn, txns) {
            return Err(HeartwoodError::WriteConflict);
        }
        if !hdr.xmax.is_invalid() && txns.status(hdr.xmax) != TxnStatus::Aborted {
            return Err(HeartwoodError::WriteConflict);
        }
        Ok(hdr)
    }

    /// Pages an insert of `tuple_len` bytes under `key` will touch, and the
    /// slot it will land in. Used to plan logging before the mutation.
    pub fn plan_insert(&mut self, key: &[u8], tuple_len: usize) -> Result<InsertPlan> {
        if tuple_len > self.max_tuple_len() {
            return Err(HeartwoodError::Invalid("tuple larger than a page"));
        }
        let page = self.heap.allocate_for(tuple_len)?;
        let slot = self.heap.page(page)?.next_slot();
        let tail = match self.chain_head(key) {
            Some(head) => Some(self.walk_tail(head)?),
            None => None,
        };
        Ok(InsertPlan { page, slot, tail })
    }

    /// Places a new version at `page`/`slot` with the given origin. When
    /// `chained`, the version is linked from the key's existing chain tail;
    /// otherwise linkage is the caller's job (update links via the old
    /// version). Both normal execution and redo go through here.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_insert(
        &mut self,
        xid: TxnId,
        cmin: u16,
        key: &[u8],
        payload: &[u8],
        page: PageId,
        slot: u16,
        chained: bool,
        lsn: Lsn,
    ) -> Result<Placed> {
        let hdr = TupleHeader {
            xmin: xid,
            xmax: INVALID_XID,
            cmin,
            flags: 0,
            next: VersionId::NULL,
            key_len: key.len() as u16,
            payload_len: payload.len() as u32,
        };
        let bytes = encode_tuple(&hdr, key, payload);
        self.heap.place_tuple_at(page, slot, &bytes, lsn)?;
        let version = VersionId::new(page, slot);
        let mut linked_from = None;
        if chained {
            match self.chain_head(key) {
                Some(head) if head != version => {
                    let tail = self.walk_tail(head)?;
                    self.heap.set_next(tail, version, lsn)?;
                    linked_from = Some(tail);
                }
                _ => {
                    self.index.insert(key.to_vec(), version);
                }
            }
        }
        Ok(Placed {
            version,
            linked_from,
        })
    }

    /// Stamps `xid` as the deleter of `version` and, for an update, links
    /// the superseding version.
    pub fn apply_mark_deleted(
        &mut self,
        xid: TxnId,
        version: VersionId,
        next: VersionId,
        lsn: Lsn,
    ) -> Result<()> {
        self.heap.set_xmax(version, xid, lsn)?;
        if !next.is_null() {
            self.heap.set_next(version, next, lsn)?;
        }
        Ok(())
    }

    /// Rewrites `version`'s xmin to the frozen sentinel.
    pub fn apply_freeze(&mut self, version: VersionId, lsn: Lsn) -> Result<()> {
        self.heap.freeze(version, lsn)
    }

    /// Reclaims `version`'s slot and repoints (or drops) the key's index
    /// entry when the chain head is being reclaimed.
    pub fn apply_reclaim(&mut self, version: VersionId, lsn: Lsn) -> Result<()> {
        let hdr = self.heap.tuple_header(version)?;
        let key = self.heap.tuple_key(version)?;
        if self.chain_head(&key) == Some(version) {
            if hdr.next.is_null() {
                self.index.remove(&key);
            } else {
                self.index.insert(key, hdr.next);
            }
        }
        self.heap.reclaim(version, lsn)
    }
}

/// Placement plan for one insert: the pages it will touch.
#[derive(Clone, Copy, Debug)]
pub struct InsertPlan {
    /// Page the tuple will be placed on.
    pub page: PageId,
    /// Slot it will land in.
    pub slot: u16,
    /// Existing chain tail whose page the linkage will touch, if any.
    pub tail: Option<VersionId>,
}
