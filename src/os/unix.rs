//! Unix positioned I/O
//!
//! Thin wrappers over pread/pwrite plus a data-sync helper. On Linux
//! the sync uses fdatasync directly; other Unixes fall back to the
//! full fsync path via the standard library.

use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;

use crate::error::Result;

/// Read up to `buf.len()` bytes at `offset`, retrying interrupted
/// calls. Returns the number of bytes read; short only at end of file.
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(total)
}

/// Write the whole of `buf` at `offset`, retrying interrupted calls.
pub fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    let mut total = 0usize;
    while total < buf.len() {
        match file.write_at(&buf[total..], offset + total as u64) {
            Ok(0) => {
                return Err(std::io::Error::new(ErrorKind::WriteZero, "write returned 0").into())
            }
            Ok(n) => total += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Flush file data (not necessarily metadata) to the device.
#[cfg(target_os = "linux")]
pub fn sync_data(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// fdatasync is unreliable on some non-Linux platforms (macOS), so use
/// the standard library's sync there.
#[cfg(not(target_os = "linux"))]
pub fn sync_data(file: &File) -> Result<()> {
    file.sync_data().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn test_positioned_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();

        write_at(&file, b"hello world", 100).unwrap();
        write_at(&file, b"HELLO", 100).unwrap();

        let mut buf = [0u8; 11];
        let n = read_at(&file, &mut buf, 100).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"HELLO world");
    }

    #[test]
    fn test_short_read_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();

        write_at(&file, b"abc", 0).unwrap();
        let mut buf = [0u8; 8];
        let n = read_at(&file, &mut buf, 0).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_sync_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.bin");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        write_at(&file, b"durable", 0).unwrap();
        sync_data(&file).unwrap();
    }
}
