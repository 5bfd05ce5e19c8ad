//! Core type aliases, configuration and collaborator traits
//!
//! This module defines the foundational types shared by the storage
//! layers: identifier aliases, store flags, the engine configuration
//! and the terminal seam used by the structural repair pass.

use std::io::Write;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Session-local resource identifier
pub type ResourceId = u64;

/// Page number within a resource
pub type PageNumber = u64;

/// Area identifier; the file pointer of the area header, or -1 for the
/// fixed area
pub type AreaId = i64;

// ============================================================================
// Store Flags
// ============================================================================

bitflags! {
    /// Behaviour flags for a store session
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StoreFlags: u32 {
        /// Open every layer read-only; journals are neither created nor
        /// replayed
        const READ_ONLY = 0x01;
        /// Verify the write-lock discipline on every page mutation even
        /// in release builds
        const PARANOID_CHECKS = 0x02;
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration consumed by the buffer manager and store constructors.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the resource files and the journal files
    pub base_dir: PathBuf,
    /// Cache page size in bytes
    pub page_size: usize,
    /// Maximum number of cached pages before eviction kicks in
    pub max_pages: usize,
    /// Maximum size of a single file slice in bytes
    pub max_slice_size: u64,
    /// Session behaviour flags
    pub flags: StoreFlags,
}

/// Default cache page size (8 KiB)
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Default maximum number of cached pages
pub const DEFAULT_MAX_PAGES: usize = 256;

/// Default maximum slice size (1 GiB)
pub const DEFAULT_MAX_SLICE_SIZE: u64 = 1024 * 1024 * 1024;

impl StoreConfig {
    /// Create a configuration with defaults rooted at `base_dir`
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        StoreConfig {
            base_dir: base_dir.as_ref().to_path_buf(),
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            max_slice_size: DEFAULT_MAX_SLICE_SIZE,
            flags: StoreFlags::empty(),
        }
    }

    /// Set the cache page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the maximum cached page count
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Set the maximum file slice size
    pub fn with_max_slice_size(mut self, max_slice_size: u64) -> Self {
        self.max_slice_size = max_slice_size;
        self
    }

    /// Set the session flags
    pub fn with_flags(mut self, flags: StoreFlags) -> Self {
        self.flags = flags;
        self
    }

    /// True when the session is read-only
    pub fn read_only(&self) -> bool {
        self.flags.contains(StoreFlags::READ_ONLY)
    }
}

// ============================================================================
// User Terminal
// ============================================================================

/// Interactive sink for the structural repair pass.
///
/// The repair scan reports progress and proposed fixes through this
/// trait, and asks for confirmation before destructive rewrites.
pub trait UserTerminal {
    /// Write a message without a trailing newline
    fn print(&mut self, message: &str);

    /// Write a message with a trailing newline
    fn println(&mut self, message: &str);

    /// Ask a yes/no question; returns true for yes
    fn ask(&mut self, question: &str) -> bool;
}

/// Terminal that writes to stdout and answers every question with yes.
#[derive(Debug, Default)]
pub struct StdTerminal;

impl UserTerminal for StdTerminal {
    fn print(&mut self, message: &str) {
        print!("{}", message);
        let _ = std::io::stdout().flush();
    }

    fn println(&mut self, message: &str) {
        println!("{}", message);
    }

    fn ask(&mut self, question: &str) -> bool {
        println!("{} [assuming yes]", question);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::new("/tmp/db");
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.max_pages, DEFAULT_MAX_PAGES);
        assert!(!config.read_only());
    }

    #[test]
    fn test_config_builders() {
        let config = StoreConfig::new("/tmp/db")
            .with_page_size(1024)
            .with_max_pages(16)
            .with_max_slice_size(4096)
            .with_flags(StoreFlags::READ_ONLY);
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.max_pages, 16);
        assert_eq!(config.max_slice_size, 4096);
        assert!(config.read_only());
    }

    #[test]
    fn test_store_flags() {
        let flags = StoreFlags::READ_ONLY | StoreFlags::PARANOID_CHECKS;
        assert!(flags.contains(StoreFlags::READ_ONLY));
        assert!(flags.contains(StoreFlags::PARANOID_CHECKS));
        assert!(!StoreFlags::empty().contains(StoreFlags::READ_ONLY));
    }
}
