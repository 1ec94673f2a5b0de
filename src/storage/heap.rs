//! In-memory heap layer over the page store.
//!
//! All tuple mutation happens against cached page images; the store is only
//! written at checkpoint, after the WAL covering each page is durable. The
//! heap carries no locking of its own; the engine guards it with
//! one mutex and keeps critical sections narrow (pointer/offset updates,
//! never I/O on the commit path).

use std::collections::{HashMap, HashSet};

use crate::error::{HeartwoodError, Result};
use crate::storage::page::{Page, TupleHeader, PAGE_FLAG_ALL_FROZEN};
use crate::storage::store::PageStore;
use crate::types::{Lsn, PageId, TxnId, VersionId};

/// Cached, mutable view of the page store.
pub struct Heap {
    store: PageStore,
    cache: HashMap<PageId, Page>,
    dirty: HashSet<PageId>,
}

impl Heap {
    /// Wraps a page store with an empty cache.
    pub fn new(store: PageStore) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &PageStore {
        &self.store
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Number of allocated pages (persisted or cache-only).
    pub fn page_count(&self) -> u32 {
        self.store.page_count()
    }

    fn load(&mut self, id: PageId) -> Result<&mut Page> {
        if !self.cache.contains_key(&id) {
            let page = self.store.read_page(id)?;
            self.cache.insert(id, page);
        }
        self.cache.get_mut(&id).ok_or(HeartwoodError::NotFound)
    }

    /// Read access to a page, faulting it in from the store if needed.
    pub fn page(&mut self, id: PageId) -> Result<&Page> {
        self.load(id).map(|page| &*page)
    }

    /// True when the page exists in cache or on disk.
    pub fn page_exists(&mut self, id: PageId) -> bool {
        matches!(self.page(id), Ok(_))
    }

    /// Installs a full page image (WAL replay), replacing any cached copy.
    pub fn install_page(&mut self, page: Page) {
        self.store.ensure_allocated(page.id());
        self.store.note_free_space(page.id(), page.free_space());
        self.dirty.insert(page.id());
        self.cache.insert(page.id(), page);
    }

    /// Picks a page with room for `tuple_len` bytes, extending the heap
    /// when no existing page qualifies. The free-space index is coarse, so
    /// candidates are re-verified and corrected here.
    pub fn allocate_for(&mut self, tuple_len: usize) -> Result<PageId> {
        let mut rejected: Vec<PageId> = Vec::new();
        loop {
            let Some(candidate) = self.store.find_candidate(tuple_len, &rejected) else {
                break;
            };
            match self.page(candidate) {
                Ok(page) if page.can_fit(tuple_len) => return Ok(candidate),
                Ok(page) => {
                    let free = page.free_space();
                    self.store.note_free_space(candidate, free);
                    rejected.push(candidate);
                }
                Err(HeartwoodError::NotFound) => {
                    // Index entry for a page that was never persisted.
                    self.store.note_free_space(candidate, 0);
                    rejected.push(candidate);
                }
                Err(err) => return Err(err),
            }
        }
        let id = self.store.allocate_page();
        let page = Page::new(id, self.store.page_size());
        self.cache.insert(id, page);
        Ok(id)
    }

    /// Places serialized tuple bytes on `page`, returning the version id.
    pub fn place_tuple(&mut self, page_id: PageId, tuple: &[u8], lsn: Lsn) -> Result<VersionId> {
        let page = self.load(page_id)?;
        let slot = page.insert_tuple(tuple)?;
        page.set_lsn(lsn);
        let free = page.free_space();
        self.dirty.insert(page_id);
        self.store.note_free_space(page_id, free);
        Ok(VersionId::new(page_id, slot))
    }

    /// Places a tuple at a specific slot during WAL redo, verifying the
    /// deterministic slot choice.
    pub fn place_tuple_at(
        &mut self,
        page_id: PageId,
        slot: u16,
        tuple: &[u8],
        lsn: Lsn,
    ) -> Result<()> {
        let page = self.load(page_id)?;
        let got = page.insert_tuple(tuple)?;
        if got != slot {
            return Err(HeartwoodError::Corruption("redo slot mismatch"));
        }
        page.set_lsn(lsn);
        self.dirty.insert(page_id);
        Ok(())
    }

    /// Decoded tuple header at `version`.
    pub fn tuple_header(&mut self, version: VersionId) -> Result<TupleHeader> {
        self.load(version.page())?.tuple_header(version.slot())
    }

    /// Key bytes at `version`.
    pub fn tuple_key(&mut self, version: VersionId) -> Result<Vec<u8>> {
        Ok(self.load(version.page())?.tuple_key(version.slot())?.to_vec())
    }

    /// Payload bytes at `version`.
    pub fn tuple_payload(&mut self, version: VersionId) -> Result<Vec<u8>> {
        Ok(self
            .load(version.page())?
            .tuple_payload(version.slot())?
            .to_vec())
    }

    fn mutate(&mut self, page_id: PageId, lsn: Lsn) -> Result<&mut Page> {
        self.dirty.insert(page_id);
        let page = self.load(page_id)?;
        page.set_lsn(lsn);
        Ok(page)
    }

    /// Stamps a page with a record LSN without other changes (full-page
    /// image bookkeeping).
    pub fn stamp_lsn(&mut self, page_id: PageId, lsn: Lsn) -> Result<()> {
        self.mutate(page_id, lsn).map(|_| ())
    }

    // The all-frozen bit is derived state: recomputed after every freeze or
    // reclaim so redo reproduces it bit for bit.
    fn refresh_all_frozen(page: &mut Page) {
        let mut all = true;
        for slot in 0..page.item_count() {
            if !page.slot_live(slot) {
                continue;
            }
            match page.tuple_header(slot) {
                Ok(hdr) if hdr.xmin.is_frozen() => {}
                _ => {
                    all = false;
                    break;
                }
            }
        }
        let flags = page.flags();
        page.set_flags(if all {
            flags | PAGE_FLAG_ALL_FROZEN
        } else {
            flags & !PAGE_FLAG_ALL_FROZEN
        });
    }

    /// Stamps a deleter xid on the tuple.
    pub fn set_xmax(&mut self, version: VersionId, xmax: TxnId, lsn: Lsn) -> Result<()> {
        self.mutate(version.page(), lsn)?
            .set_tuple_xmax(version.slot(), xmax)
    }

    /// Links a version to its successor.
    pub fn set_next(&mut self, version: VersionId, next: VersionId, lsn: Lsn) -> Result<()> {
        self.mutate(version.page(), lsn)?
            .set_tuple_next(version.slot(), next)
    }

    /// Freezes the tuple's xmin to the permanent sentinel and refreshes the
    /// page's all-frozen bit.
    pub fn freeze(&mut self, version: VersionId, lsn: Lsn) -> Result<()> {
        let page = self.mutate(version.page(), lsn)?;
        page.freeze_tuple(version.slot())?;
        Self::refresh_all_frozen(page);
        Ok(())
    }

    /// Reclaims the tuple's slot, compacts the page, and feeds the freed
    /// space back to the store's availability index.
    pub fn reclaim(&mut self, version: VersionId, lsn: Lsn) -> Result<()> {
        let page_id = version.page();
        let page = self.mutate(page_id, lsn)?;
        page.reclaim_slot(version.slot())?;
        page.compact();
        Self::refresh_all_frozen(page);
        let free = page.free_space();
        self.store.note_free_space(page_id, free);
        Ok(())
    }

    /// Header flag bits of a page.
    pub fn page_flags(&mut self, page_id: PageId) -> Result<u16> {
        Ok(self.load(page_id)?.flags())
    }

    /// Sets or clears header flag bits on a page.
    pub fn set_page_flags(&mut self, page_id: PageId, flags: u16, lsn: Lsn) -> Result<()> {
        self.mutate(page_id, lsn)?.set_flags(flags);
        Ok(())
    }

    /// Full bytes of a page, for full-page-image records.
    pub fn page_image(&mut self, page_id: PageId) -> Result<Vec<u8>> {
        Ok(self.load(page_id)?.bytes().to_vec())
    }

    /// Pages mutated since the last write-back.
    pub fn dirty_pages(&self) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self.dirty.iter().copied().collect();
        pages.sort();
        pages
    }

    /// Writes every dirty page to the store. `durable_lsn` must cover the
    /// newest page LSN being written (the write-ahead invariant).
    pub fn write_back(&mut self, durable_lsn: Lsn) -> Result<()> {
        let pages = self.dirty_pages();
        for id in pages {
            if let Some(page) = self.cache.get_mut(&id) {
                self.store.write_page(page, durable_lsn)?;
            }
        }
        self.dirty.clear();
        Ok(())
    }

    /// Fsyncs the heap file after a write-back.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    /// Visits every live tuple in the heap: `(version, header, key)`.
    /// Pages that were allocated but never materialized are skipped.
    pub fn for_each_live<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(VersionId, &TupleHeader, &[u8]) -> Result<()>,
    {
        for raw in 0..self.page_count() {
            let id = PageId(raw);
            let page = match self.page(id) {
                Ok(page) => page,
                Err(HeartwoodError::NotFound) => continue,
                Err(err) => return Err(err),
            };
            let count = page.item_count();
            for slot in 0..count {
                if !page.slot_live(slot) {
                    continue;
                }
                let header = page.tuple_header(slot)?;
                let key = page.tuple_key(slot)?.to_vec();
                f(VersionId::new(id, slot), &header, &key)?;
            }
        }
        Ok(())
    }
}
