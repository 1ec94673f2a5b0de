//! Durable page storage: the slotted page format, the page store with its
//! free-space index, and the in-memory heap layer that the MVCC engine
//! mutates.

pub mod heap;
pub mod page;
pub mod store;

pub use heap::Heap;
pub use page::{Page, TupleHeader, PAGE_FLAG_ALL_FROZEN};
pub use store::{PageStore, StoreOptions};
