//! The durable page store: a single heap file of fixed-size pages plus a
//! coarse free-space index.
//!
//! Pages are only written here after the WAL covering the change is durable;
//! `write_page` enforces that ordering. The free-space index is quantized
//! into a small number of buckets so allocation cost stays bounded; callers
//! re-verify the byte-exact fit and report back the real availability.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{HeartwoodError, Result};
use crate::primitives::io::FileIo;
use crate::storage::page::Page;
use crate::types::{Lsn, PageId};

/// Number of quantized free-space buckets.
pub const FSM_BUCKETS: u8 = 8;

/// Page store configuration.
#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Size of each page in bytes.
    pub page_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { page_size: 8192 }
    }
}

struct StoreState {
    page_count: u32,
    // One availability category per page, 0 = unknown/full .. 7 = empty.
    fsm: Vec<u8>,
}

/// Fixed-size block storage with checksummed pages.
pub struct PageStore {
    io: Arc<dyn FileIo>,
    page_size: usize,
    state: Mutex<StoreState>,
}

impl PageStore {
    /// Opens a page store over the given file.
    pub fn open(io: Arc<dyn FileIo>, options: StoreOptions) -> Result<Self> {
        if options.page_size < 64 || options.page_size % 2 != 0 {
            return Err(HeartwoodError::Invalid("unsupported page size"));
        }
        let len = io.len()?;
        let page_size = options.page_size as usize;
        if len % page_size as u64 != 0 {
            return Err(HeartwoodError::Corruption("heap file length misaligned"));
        }
        let page_count = (len / page_size as u64) as u32;
        Ok(Self {
            io,
            page_size,
            state: Mutex::new(StoreState {
                page_count,
                fsm: vec![0; page_count as usize],
            }),
        })
    }

    /// Size of each page in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages allocated, including pages not yet persisted.
    pub fn page_count(&self) -> u32 {
        self.state.lock().page_count
    }

    fn category(&self, free: usize) -> u8 {
        ((free * FSM_BUCKETS as usize) / self.page_size).min(FSM_BUCKETS as usize - 1) as u8
    }

    /// Allocates a fresh page id, extending the logical file. The page is
    /// persisted later, by checkpoint write-back.
    pub fn allocate_page(&self) -> PageId {
        let mut state = self.state.lock();
        let id = PageId(state.page_count);
        state.page_count += 1;
        state.fsm.push(FSM_BUCKETS - 1);
        debug!(page = id.0, "store.allocate_page");
        id
    }

    /// Extends the logical page count during WAL replay, when a full-page
    /// image references a page beyond the persisted file.
    pub fn ensure_allocated(&self, page: PageId) {
        let mut state = self.state.lock();
        while state.page_count <= page.0 {
            state.page_count += 1;
            state.fsm.push(0);
        }
    }

    /// Records the actual free space available on a page.
    pub fn note_free_space(&self, page: PageId, free: usize) {
        let cat = self.category(free);
        let mut state = self.state.lock();
        if let Some(slot) = state.fsm.get_mut(page.0 as usize) {
            *slot = cat;
        }
    }

    /// Picks the first page whose quantized availability suggests room for
    /// `needed` bytes. The answer is coarse; the caller must verify the fit
    /// and call [`note_free_space`](Self::note_free_space) when it does not.
    pub fn find_candidate(&self, needed: usize, skip: &[PageId]) -> Option<PageId> {
        let wanted = self.category(needed).saturating_add(1).min(FSM_BUCKETS - 1);
        let state = self.state.lock();
        state
            .fsm
            .iter()
            .enumerate()
            .map(|(idx, &cat)| (PageId(idx as u32), cat))
            .find(|(id, cat)| *cat >= wanted && !skip.contains(id))
            .map(|(id, _)| id)
    }

    /// Reads and checksum-verifies a page from durable storage.
    pub fn read_page(&self, id: PageId) -> Result<Page> {
        let persisted = (self.io.len()? / self.page_size as u64) as u32;
        if id.0 >= persisted {
            return Err(HeartwoodError::NotFound);
        }
        let mut buf = vec![0u8; self.page_size];
        self.io.read_at(u64::from(id.0) * self.page_size as u64, &mut buf)?;
        Page::verified(id, buf)
    }

    /// Writes a page to durable storage, refreshing its checksum.
    ///
    /// Must be called only after every WAL record covering the page is
    /// durable; `durable_lsn` is the caller's proof.
    pub fn write_page(&self, page: &mut Page, durable_lsn: Lsn) -> Result<()> {
        if page.lsn() > durable_lsn {
            return Err(HeartwoodError::Invalid(
                "page write ahead of durable WAL position",
            ));
        }
        let id = page.id();
        let off = u64::from(id.0) * self.page_size as u64;
        self.io.write_at(off, page.checksummed_bytes())?;
        let free = page.free_space();
        self.note_free_space(id, free);
        Ok(())
    }

    /// Fsyncs the heap file.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}
