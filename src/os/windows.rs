//! Windows positioned I/O
//!
//! seek_read/seek_write move the file cursor as a side effect, which
//! is why nothing in the engine ever relies on the cursor position.

use std::fs::File;
use std::io::ErrorKind;
use std::os::windows::fs::FileExt;

use crate::error::Result;

/// Read up to `buf.len()` bytes at `offset`. Returns the number of
/// bytes read; short only at end of file.
pub fn read_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        match file.seek_read(&mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(total)
}

/// Write the whole of `buf` at `offset`.
pub fn write_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    let mut total = 0usize;
    while total < buf.len() {
        match file.seek_write(&buf[total..], offset + total as u64) {
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

/// Flush file data to the device.
pub fn sync_data(file: &File) -> Result<()> {
    file.sync_data().map_err(Into::into)
}
