//! Area cursors
//!
//! Positional read/write handles over a single allocated area. A
//! cursor carries its own bounds and position, so concurrent readers
//! of different areas never contend on the store; scalar accessors
//! are big-endian to match the on-disk format.

use std::ops::{Deref, DerefMut};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::store::{AllocatingStore, StoreData};
use crate::types::AreaId;

/// Intermediate buffer size for `copy_to`
const COPY_BUFFER_SIZE: usize = 2048;

// ============================================================================
// Read cursor
// ============================================================================

/// Read-only cursor over an area's user bytes.
pub struct Area<'s, D: StoreData> {
    store: &'s AllocatingStore<D>,
    id: AreaId,
    /// Absolute store position of the first user byte
    start: u64,
    /// Absolute store position one past the last user byte
    end: u64,
    /// Cursor, relative to `start`
    position: u64,
}

impl<'s, D: StoreData> Area<'s, D> {
    pub(crate) fn new(store: &'s AllocatingStore<D>, id: AreaId, start: u64, end: u64) -> Self {
        Area {
            store,
            id,
            start,
            end,
            position: 0,
        }
    }

    /// The area id this cursor reads
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// User-byte capacity
    pub fn capacity(&self) -> u64 {
        self.end - self.start
    }

    /// Current cursor position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor; the new position must lie inside the area.
    pub fn set_position(&mut self, position: u64) -> Result<()> {
        if position >= self.capacity() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!(
                    "position {} outside area of capacity {}",
                    position,
                    self.capacity()
                ),
            ));
        }
        self.position = position;
        Ok(())
    }

    fn check_space(&self, len: u64) -> Result<()> {
        if self.position + len > self.capacity() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!(
                    "read of {} bytes at position {} exceeds capacity {}",
                    len,
                    self.position,
                    self.capacity()
                ),
            ));
        }
        Ok(())
    }

    /// Fill `buf` from the cursor and advance.
    pub fn get_slice(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_space(buf.len() as u64)?;
        self.store.data_read(self.start + self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.get_slice(&mut buf)?;
        Ok(buf[0])
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.get_slice(&mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.get_slice(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.get_slice(&mut buf)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Stream `n` bytes from the cursor into `dst`, advancing both.
    pub fn copy_to(&mut self, dst: &mut AreaWriter<'_, D>, n: u64) -> Result<()> {
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        let mut remaining = n;
        while remaining > 0 {
            let chunk = (remaining as usize).min(COPY_BUFFER_SIZE);
            self.get_slice(&mut buf[..chunk])?;
            dst.put_slice(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }
}

// ============================================================================
// Read-write cursor
// ============================================================================

/// Read-write cursor over an area's user bytes.
pub struct MutableArea<'s, D: StoreData> {
    inner: Area<'s, D>,
}

impl<'s, D: StoreData> MutableArea<'s, D> {
    pub(crate) fn new(store: &'s AllocatingStore<D>, id: AreaId, start: u64, end: u64) -> Self {
        MutableArea {
            inner: Area::new(store, id, start, end),
        }
    }

    /// Write `data` at the cursor and advance.
    pub fn put_slice(&mut self, data: &[u8]) -> Result<()> {
        self.inner.check_space(data.len() as u64)?;
        self.inner
            .store
            .data_write(self.inner.start + self.inner.position, data)?;
        self.inner.position += data.len() as u64;
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_slice(&[value])
    }

    pub fn put_i16(&mut self, value: i16) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_i32(&mut self, value: i32) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_i64(&mut self, value: i64) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }
}

impl<'s, D: StoreData> Deref for MutableArea<'s, D> {
    type Target = Area<'s, D>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'s, D: StoreData> DerefMut for MutableArea<'s, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

// ============================================================================
// Sequential writer
// ============================================================================

/// Sequential initialiser for a freshly allocated area. `finish`
/// hands back the area id once the content is in place.
pub struct AreaWriter<'s, D: StoreData> {
    store: &'s AllocatingStore<D>,
    id: AreaId,
    start: u64,
    end: u64,
    position: u64,
}

impl<'s, D: StoreData> AreaWriter<'s, D> {
    pub(crate) fn new(store: &'s AllocatingStore<D>, id: AreaId, start: u64, end: u64) -> Self {
        AreaWriter {
            store,
            id,
            start,
            end,
            position: 0,
        }
    }

    /// The id the writer will hand back from `finish`
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// User-byte capacity
    pub fn capacity(&self) -> u64 {
        self.end - self.start
    }

    /// Write `data` at the cursor and advance.
    pub fn put_slice(&mut self, data: &[u8]) -> Result<()> {
        if self.position + data.len() as u64 > self.capacity() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!(
                    "write of {} bytes at position {} exceeds capacity {}",
                    data.len(),
                    self.position,
                    self.capacity()
                ),
            ));
        }
        self.store.data_write(self.start + self.position, data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.put_slice(&[value])
    }

    pub fn put_i16(&mut self, value: i16) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_i32(&mut self, value: i32) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    pub fn put_i64(&mut self, value: i64) -> Result<()> {
        self.put_slice(&value.to_be_bytes())
    }

    /// Complete initialisation and return the area id.
    pub fn finish(self) -> Result<AreaId> {
        Ok(self.id)
    }
}
