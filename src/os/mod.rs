//! OS abstraction layer: positioned file I/O per platform
//!
//! Every read and write in the engine is addressed by absolute file
//! position, never by a shared cursor; the platform modules provide
//! pread/pwrite-style helpers over `std::fs::File` so concurrent
//! readers do not trample each other's offsets.

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use unix::{read_at, sync_data, write_at};

#[cfg(windows)]
pub use windows::{read_at, sync_data, write_at};
