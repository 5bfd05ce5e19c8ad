//! binstore - a durable, crash-recoverable allocating object store
//!
//! Three layers, bottom up:
//!
//! 1. [`FileSliceAccessor`] maps one logical byte resource onto a run
//!    of fixed-size file slices.
//! 2. The journalled buffer manager ([`BufferManager`]) caches pages
//!    over journalled resources; every mutation is a write-ahead
//!    journal append, checkpoints are the durability barrier, and
//!    roll-forward recovery replays whatever a crash left behind.
//! 3. [`AllocatingStore`] is a bin-based best-fit allocator with
//!    boundary tags and a wilderness tail, handing out byte areas
//!    through cursor handles.
//!
//! A typical journalled session:
//!
//! ```no_run
//! use std::sync::Arc;
//! use binstore::{AllocatingStore, BufferManager, JournaledStoreData, StoreConfig};
//!
//! # fn main() -> binstore::Result<()> {
//! let config = StoreConfig::new("/var/lib/mydb");
//! let buffers = Arc::new(BufferManager::new(&config));
//! buffers.start()?;
//!
//! let store = AllocatingStore::new(JournaledStoreData::new(Arc::clone(&buffers), "data.bst"));
//! store.open(false)?;
//!
//! let mut writer = store.create_area(128)?;
//! writer.put_i64(42)?;
//! let id = writer.finish()?;
//!
//! buffers.set_checkpoint(true)?;
//! store.close()?;
//! buffers.stop()?;
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod os;
pub mod storage;
pub mod types;
pub mod util;

// Re-export the main public types
pub use error::{Error, ErrorCode, Result};
pub use storage::area::{Area, AreaWriter, MutableArea};
pub use storage::buffer::BufferManager;
pub use storage::journal::{JournalFile, JournalSummary};
pub use storage::resource::JournaledResource;
pub use storage::slices::FileSliceAccessor;
pub use storage::store::{
    AllocatingStore, JournaledStoreData, SliceStoreData, StoreData, DATA_AREA_OFFSET,
    FIXED_AREA_SIZE, MAX_BIN_SIZE, STORE_MAGIC,
};
pub use storage::system::JournaledSystem;
pub use types::{AreaId, PageNumber, ResourceId, StdTerminal, StoreConfig, StoreFlags, UserTerminal};
