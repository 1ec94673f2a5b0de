//! Record redo, shared by crash recovery and the standby apply loop.
//!
//! Full-page images install wholesale; incremental records apply only when
//! the record's LSN is newer than the target page's, so replaying from any
//! retained redo point is idempotent. Index bookkeeping happens inside the
//! apply functions, which keeps a continuously-applying standby readable;
//! recovery still rebuilds the index from a heap scan afterwards.

use tracing::trace;

use crate::error::{HeartwoodError, Result};
use crate::mvcc::VersionStore;
use crate::storage::page::Page;
use crate::txn::TxnManager;
use crate::types::{Lsn, PageId};
use crate::wal::reader::ReadRecord;
use crate::wal::RecordBody;

fn page_behind(vs: &mut VersionStore, page: PageId, lsn: Lsn) -> Result<bool> {
    match vs.heap_mut().page(page) {
        Ok(existing) => Ok(existing.lsn() < lsn),
        Err(HeartwoodError::NotFound) => Ok(true),
        Err(err) => Err(err),
    }
}

/// Applies one WAL record to the version store and transaction table.
pub(crate) fn apply_record(
    vs: &mut VersionStore,
    txns: &TxnManager,
    read: &ReadRecord,
) -> Result<()> {
    let lsn = read.lsn;
    let record = &read.record;
    match &record.body {
        RecordBody::FullPageImage { page, image } => {
            if page_behind(vs, *page, lsn)? {
                let mut installed = Page::from_bytes(*page, image.clone());
                installed.set_lsn(lsn);
                vs.heap_mut().install_page(installed);
                trace!(page = page.0, %lsn, "redo.page_image.installed");
            }
        }
        RecordBody::Insert {
            page,
            slot,
            cmin,
            chained,
            key,
            payload,
        } => {
            txns.observe_replayed(record.xid);
            if page_behind(vs, *page, lsn)? {
                vs.apply_insert(
                    record.xid, *cmin, key, payload, *page, *slot, *chained, lsn,
                )?;
            }
        }
        RecordBody::MarkDeleted { version, next } => {
            txns.observe_replayed(record.xid);
            if page_behind(vs, version.page(), lsn)? {
                vs.apply_mark_deleted(record.xid, *version, *next, lsn)?;
            }
        }
        RecordBody::Freeze { version } => {
            if page_behind(vs, version.page(), lsn)? {
                vs.apply_freeze(*version, lsn)?;
            }
        }
        RecordBody::Reclaim { version } => {
            if page_behind(vs, version.page(), lsn)? {
                vs.apply_reclaim(*version, lsn)?;
            }
        }
        RecordBody::Commit => {
            txns.observe_replayed(record.xid);
            txns.mark_committed(record.xid);
        }
        RecordBody::Abort => {
            txns.observe_replayed(record.xid);
            txns.mark_aborted(record.xid);
        }
        RecordBody::Checkpoint {
            next_xid,
            frozen_watermark,
            ..
        } => {
            txns.observe_next_xid(*next_xid);
            txns.advance_frozen_watermark(*frozen_watermark);
        }
    }
    Ok(())
}
