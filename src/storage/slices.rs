//! Scattering file accessor
//!
//! Maps one logical byte sequence onto an ordered run of file slices
//! `name.ext`, `name.001`, `name.002`, … so a resource can outgrow
//! per-file size limits. Every slice except the last holds exactly
//! `max_slice_size` bytes, which keeps `pos / max_slice_size`
//! addressing valid.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, ErrorCode, Result};
use crate::os;

/// Buffer size used when shuffling bytes between slices
const COPY_BUFFER_SIZE: usize = 8192;

/// Accessor presenting a sequence of fixed-size file slices as one
/// logical byte store.
pub struct FileSliceAccessor {
    /// Path of slice 0 (base name plus first extension)
    path: PathBuf,
    /// Maximum bytes per slice
    max_slice_size: u64,
    /// Open slice handles, index 0 first
    slices: Vec<File>,
    /// Total logical size across all slices
    true_size: u64,
    read_only: bool,
    is_open: bool,
}

impl FileSliceAccessor {
    /// Create an accessor for the slice set rooted at `path`. Nothing
    /// is touched on disk until `open`.
    pub fn new(path: impl AsRef<Path>, max_slice_size: u64) -> Self {
        FileSliceAccessor {
            path: path.as_ref().to_path_buf(),
            max_slice_size,
            slices: Vec::new(),
            true_size: 0,
            read_only: false,
            is_open: false,
        }
    }

    /// Path of the numbered slice. Slice 0 keeps the original
    /// extension; later slices use `.001`, `.002`, … (unpadded past
    /// 99).
    fn slice_path(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.path.clone()
        } else if index < 100 {
            self.path.with_extension(format!("{:03}", index))
        } else {
            self.path.with_extension(format!("{}", index))
        }
    }

    /// True when slice 0 exists on disk.
    pub fn exists(&self) -> bool {
        self.slice_path(0).exists()
    }

    /// True when the accessor has been opened.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Current logical size in bytes.
    pub fn size(&self) -> u64 {
        self.true_size
    }

    fn open_slice(&self, index: usize, create: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !self.read_only {
            options.write(true);
        }
        if create {
            options.create_new(true);
        }
        options.open(self.slice_path(index)).map_err(Into::into)
    }

    /// Open the slice set. Creates an empty slice 0 in writable mode
    /// when none exists. An over-large slice 0 left behind by a
    /// non-scattering writer is split in place, which requires write
    /// access.
    pub fn open(&mut self, read_only: bool) -> Result<()> {
        if self.is_open {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "slice accessor already open",
            ));
        }
        self.read_only = read_only;

        if !self.exists() {
            if read_only {
                return Err(Error::with_message(
                    ErrorCode::IoErr,
                    format!("no such file: {}", self.path.display()),
                ));
            }
            let file = self.open_slice(0, true)?;
            self.slices.push(file);
            self.true_size = 0;
            self.is_open = true;
            return Ok(());
        }

        let slice0 = self.open_slice(0, false)?;
        let slice0_size = slice0.metadata().map_err(Error::from)?.len();
        if slice0_size > self.max_slice_size {
            if read_only {
                return Err(Error::with_message(
                    ErrorCode::ReadOnly,
                    "slice 0 exceeds the slice limit and cannot be split read-only",
                ));
            }
            self.split_slice0(&slice0, slice0_size)?;
        }

        let mut total = slice0.metadata().map_err(Error::from)?.len();
        self.slices.push(slice0);
        let mut index = 1;
        while self.slice_path(index).exists() {
            let slice = self.open_slice(index, false)?;
            total += slice.metadata().map_err(Error::from)?.len();
            self.slices.push(slice);
            index += 1;
        }

        self.true_size = total;
        self.is_open = true;
        Ok(())
    }

    /// Move the tail of an over-large slice 0 out into numbered
    /// slices, leaving exactly `max_slice_size` bytes behind.
    fn split_slice0(&self, slice0: &File, total: u64) -> Result<()> {
        let mut index = 1usize;
        let mut pos = self.max_slice_size;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        while pos < total {
            let target = self.open_slice(index, true)?;
            let chunk_end = (pos + self.max_slice_size).min(total);
            let mut write_pos = 0u64;
            while pos < chunk_end {
                let want = ((chunk_end - pos) as usize).min(buf.len());
                let n = os::read_at(slice0, &mut buf[..want], pos)?;
                if n == 0 {
                    return Err(Error::with_message(
                        ErrorCode::IoErr,
                        "unexpected end of file while splitting slice 0",
                    ));
                }
                os::write_at(&target, &buf[..n], write_pos)?;
                pos += n as u64;
                write_pos += n as u64;
            }
            index += 1;
        }
        slice0.set_len(self.max_slice_size).map_err(Error::from)?;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.is_open {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "slice accessor is not open",
            ));
        }
        Ok(())
    }

    /// Read at `position`, clamped to the logical size. Returns the
    /// number of bytes read.
    pub fn read(&self, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if position >= self.true_size {
            return Ok(0);
        }
        let mut remaining = (buf.len() as u64).min(self.true_size - position) as usize;
        let mut pos = position;
        let mut filled = 0usize;
        while remaining > 0 {
            let index = (pos / self.max_slice_size) as usize;
            let offset = pos % self.max_slice_size;
            let chunk = ((self.max_slice_size - offset) as usize).min(remaining);
            let n = os::read_at(&self.slices[index], &mut buf[filled..filled + chunk], offset)?;
            if n == 0 {
                break;
            }
            filled += n;
            pos += n as u64;
            remaining -= n;
        }
        Ok(filled)
    }

    /// Write at `position`. Any part that would extend past the
    /// logical end is silently dropped; grow with `set_size` first.
    pub fn write(&self, position: u64, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if position >= self.true_size {
            return Ok(0);
        }
        let mut remaining = (data.len() as u64).min(self.true_size - position) as usize;
        let written = remaining;
        let mut pos = position;
        let mut taken = 0usize;
        while remaining > 0 {
            let index = (pos / self.max_slice_size) as usize;
            let offset = pos % self.max_slice_size;
            let chunk = ((self.max_slice_size - offset) as usize).min(remaining);
            os::write_at(&self.slices[index], &data[taken..taken + chunk], offset)?;
            taken += chunk;
            pos += chunk as u64;
            remaining -= chunk;
        }
        Ok(written)
    }

    /// Grow the logical size, filling the tail slice to the slice
    /// limit before opening the next. Shrinking is not supported.
    pub fn set_size(&mut self, new_size: u64) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        if new_size < self.true_size {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "a slice store cannot shrink",
            ));
        }
        while self.true_size < new_size {
            let tail_index = self.slices.len() - 1;
            let tail_len = self.true_size - tail_index as u64 * self.max_slice_size;
            if tail_len < self.max_slice_size {
                let grow = (self.max_slice_size - tail_len).min(new_size - self.true_size);
                self.slices[tail_index]
                    .set_len(tail_len + grow)
                    .map_err(Error::from)?;
                self.true_size += grow;
            } else {
                let next = self.open_slice(tail_index + 1, true)?;
                self.slices.push(next);
            }
        }
        Ok(())
    }

    /// Flush OS buffers for every slice. A failed sync is logged and
    /// swallowed; it must never take the engine down.
    pub fn sync(&self) {
        for (index, slice) in self.slices.iter().enumerate() {
            if let Err(err) = os::sync_data(slice) {
                warn!(
                    "sync failed on {} (slice {}): {}",
                    self.path.display(),
                    index,
                    err
                );
            }
        }
    }

    /// Close all slice handles.
    pub fn close(&mut self) {
        self.slices.clear();
        self.true_size = 0;
        self.is_open = false;
    }

    /// Delete every slice file, highest first. Stops at the first
    /// failed delete.
    pub fn delete(&mut self) -> Result<()> {
        self.close();
        let mut count = 0usize;
        while self.slice_path(count).exists() {
            count += 1;
        }
        for index in (0..count).rev() {
            std::fs::remove_file(self.slice_path(index)).map_err(Error::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn accessor(dir: &Path, max_slice_size: u64) -> FileSliceAccessor {
        FileSliceAccessor::new(dir.join("data.bst"), max_slice_size)
    }

    #[test]
    fn test_slice_paths() {
        let acc = FileSliceAccessor::new("/tmp/store/data.bst", 4096);
        assert_eq!(acc.slice_path(0), PathBuf::from("/tmp/store/data.bst"));
        assert_eq!(acc.slice_path(1), PathBuf::from("/tmp/store/data.001"));
        assert_eq!(acc.slice_path(99), PathBuf::from("/tmp/store/data.099"));
        assert_eq!(acc.slice_path(150), PathBuf::from("/tmp/store/data.150"));
    }

    #[test]
    fn test_roundtrip_across_slices() {
        let dir = tempdir().unwrap();
        let mut acc = accessor(dir.path(), 4096);
        acc.open(false).unwrap();
        acc.set_size(12 * 1024).unwrap();

        let data: Vec<u8> = (0..12 * 1024).map(|i| (i % 251) as u8).collect();
        assert_eq!(acc.write(0, &data).unwrap(), data.len());

        // Slice layout: full, full, remainder
        assert!(dir.path().join("data.bst").exists());
        assert!(dir.path().join("data.001").exists());
        assert!(dir.path().join("data.002").exists());
        assert_eq!(
            std::fs::metadata(dir.path().join("data.bst")).unwrap().len(),
            4096
        );
        assert_eq!(
            std::fs::metadata(dir.path().join("data.001")).unwrap().len(),
            4096
        );

        // Read spanning a slice boundary
        let mut buf = vec![0u8; 1000];
        assert_eq!(acc.read(4096 - 500, &mut buf).unwrap(), 1000);
        assert_eq!(&buf[..], &data[4096 - 500..4096 + 500]);

        acc.close();
    }

    #[test]
    fn test_read_write_clamped_at_end() {
        let dir = tempdir().unwrap();
        let mut acc = accessor(dir.path(), 4096);
        acc.open(false).unwrap();
        acc.set_size(100).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(acc.read(80, &mut buf).unwrap(), 20);
        assert_eq!(acc.read(200, &mut buf).unwrap(), 0);

        // Writes past the end become partial or no-ops
        assert_eq!(acc.write(90, &[1u8; 64]).unwrap(), 10);
        assert_eq!(acc.write(100, &[1u8; 8]).unwrap(), 0);
    }

    #[test]
    fn test_set_size_rejects_shrink() {
        let dir = tempdir().unwrap();
        let mut acc = accessor(dir.path(), 4096);
        acc.open(false).unwrap();
        acc.set_size(256).unwrap();
        let err = acc.set_size(128).unwrap_err();
        assert_eq!(err.code, ErrorCode::ReadOnly);
    }

    #[test]
    fn test_split_oversized_slice0_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bst");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut acc = FileSliceAccessor::new(&path, 4096);
        acc.open(false).unwrap();
        assert_eq!(acc.size(), 10_000);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
        assert_eq!(
            std::fs::metadata(dir.path().join("data.001")).unwrap().len(),
            4096
        );
        assert_eq!(
            std::fs::metadata(dir.path().join("data.002")).unwrap().len(),
            10_000 - 2 * 4096
        );

        let mut all = vec![0u8; 10_000];
        assert_eq!(acc.read(0, &mut all).unwrap(), 10_000);
        assert_eq!(all, data);
    }

    #[test]
    fn test_split_refused_read_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bst");
        std::fs::write(&path, vec![7u8; 10_000]).unwrap();

        let mut acc = FileSliceAccessor::new(&path, 4096);
        let err = acc.open(true).unwrap_err();
        assert_eq!(err.code, ErrorCode::ReadOnly);
    }

    #[test]
    fn test_delete_removes_all_slices() {
        let dir = tempdir().unwrap();
        let mut acc = accessor(dir.path(), 4096);
        acc.open(false).unwrap();
        acc.set_size(9000).unwrap();
        acc.close();

        let mut acc = accessor(dir.path(), 4096);
        acc.delete().unwrap();
        assert!(!dir.path().join("data.bst").exists());
        assert!(!dir.path().join("data.001").exists());
        assert!(!dir.path().join("data.002").exists());
    }

    #[test]
    fn test_scatter_matches_single_file() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();

        let mut scattered = FileSliceAccessor::new(dir.path().join("a.bst"), 1024);
        scattered.open(false).unwrap();
        scattered.set_size(data.len() as u64).unwrap();
        scattered.write(0, &data).unwrap();

        let mut single = FileSliceAccessor::new(dir.path().join("b.bst"), 1 << 30);
        single.open(false).unwrap();
        single.set_size(data.len() as u64).unwrap();
        single.write(0, &data).unwrap();

        for (pos, len) in [(0u64, 100usize), (1000, 2048), (4990, 100), (2047, 3)] {
            let mut x = vec![0u8; len];
            let mut y = vec![0u8; len];
            let nx = scattered.read(pos, &mut x).unwrap();
            let ny = single.read(pos, &mut y).unwrap();
            assert_eq!(nx, ny);
            assert_eq!(x, y);
        }
    }
}
