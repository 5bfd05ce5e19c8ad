//! Journalled resources
//!
//! A `JournaledResource` is the per-resource face of the journalling
//! system: reads merge the backing slice files with any page
//! modifications still pending in journals, writes append to the top
//! journal, and the `persist_*` family is what journal replay calls to
//! push content down into the backing files.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::storage::journal::JournalEntry;
use crate::storage::slices::FileSliceAccessor;
use crate::storage::system::JournalQueue;
use crate::types::{PageNumber, ResourceId};

/// Bucket count for the per-resource page entry table
const PAGE_BUCKETS: usize = 257;

/// A bucket list longer than this triggers an inline sweep of entries
/// whose journals have already been persisted
const BUCKET_SWEEP_THRESHOLD: usize = 35;

fn bucket_index(page_number: PageNumber) -> usize {
    ((page_number & 0x0FFF_FFFF) % PAGE_BUCKETS as u64) as usize
}

struct Backing {
    accessor: FileSliceAccessor,
    /// Logical size; may run ahead of the backing file while size
    /// changes are still journalled
    size: u64,
    /// True when the backing file holds any content
    backing_data: bool,
    /// True while the resource logically exists
    data_exists: bool,
    really_open: bool,
}

/// One named, byte-addressable logical file under the journal.
pub struct JournaledResource {
    name: String,
    id: ResourceId,
    page_size: usize,
    queue: Arc<JournalQueue>,
    backing: Mutex<Backing>,
    /// Pending page modifications, hashed by page number, each bucket
    /// in insertion order
    buckets: Mutex<Vec<Vec<JournalEntry>>>,
}

impl JournaledResource {
    pub(crate) fn new(
        name: String,
        id: ResourceId,
        page_size: usize,
        queue: Arc<JournalQueue>,
        accessor: FileSliceAccessor,
    ) -> Self {
        let data_exists = accessor.exists();
        JournaledResource {
            name,
            id,
            page_size,
            queue,
            backing: Mutex::new(Backing {
                accessor,
                size: 0,
                backing_data: data_exists,
                data_exists,
                really_open: false,
            }),
            buckets: Mutex::new((0..PAGE_BUCKETS).map(|_| Vec::new()).collect()),
        }
    }

    /// Resource name (also the backing file name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session-local numeric id
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Page size the resource is journalled with
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Current logical size in bytes
    pub fn size(&self) -> u64 {
        self.backing.lock().unwrap().size
    }

    /// True while the resource logically exists
    pub fn exists(&self) -> bool {
        self.backing.lock().unwrap().data_exists
    }

    /// Open the backing accessor if there is backing data. Opening a
    /// resource with no backing file is valid; reads are zero-filled
    /// until something is persisted.
    pub fn open(&self, read_only: bool) -> Result<()> {
        let mut backing = self.backing.lock().unwrap();
        if backing.really_open {
            return Ok(());
        }
        if backing.accessor.exists() {
            backing.accessor.open(read_only)?;
            // The journalled size may run ahead of the backing file
            backing.size = backing.size.max(backing.accessor.size());
            backing.backing_data = true;
            backing.data_exists = true;
        } else {
            backing.backing_data = false;
        }
        backing.really_open = true;
        Ok(())
    }

    /// Close the backing accessor.
    pub fn close(&self) {
        let mut backing = self.backing.lock().unwrap();
        if backing.really_open {
            if backing.accessor.is_open() {
                backing.accessor.close();
            }
            backing.really_open = false;
        }
    }

    /// Log deletion on the top journal; the backing file goes away
    /// when the record is persisted.
    pub fn delete(&self) -> Result<()> {
        self.queue.with_top(|top| top.log_resource_delete(&self.name))?;
        let mut backing = self.backing.lock().unwrap();
        backing.data_exists = false;
        backing.size = 0;
        Ok(())
    }

    /// Record the new logical size and journal it.
    pub fn set_size(&self, new_size: u64) -> Result<()> {
        {
            let mut backing = self.backing.lock().unwrap();
            backing.size = new_size;
        }
        self.queue
            .with_top(|top| top.log_resource_size_change(&self.name, new_size))
    }

    // ------------------------------------------------------------------
    // Page I/O for the buffer manager
    // ------------------------------------------------------------------

    /// Fill `buf` (one page) from the backing file, then overlay every
    /// pending journal entry for the page in insertion order. Entries
    /// whose journal has been persisted are swept out afterwards;
    /// their content is already in the backing file.
    pub fn read_page(&self, page_number: PageNumber, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        {
            let backing = self.backing.lock().unwrap();
            if backing.backing_data {
                let position = page_number * self.page_size as u64;
                let n = backing.accessor.read(position, buf)?;
                buf[n..].fill(0);
            } else {
                buf.fill(0);
            }
        }

        let mut buckets = self.buckets.lock().unwrap();
        let chain = &mut buckets[bucket_index(page_number)];
        for entry in chain.iter() {
            if entry.page_number() == page_number {
                entry.journal().build_page(page_number, entry.position(), buf)?;
            }
        }
        chain.retain(|entry| !entry.journal().is_persisted());
        Ok(())
    }

    /// Journal a page modification and pin the resulting entry on the
    /// page's bucket list.
    pub fn write_page(&self, page_number: PageNumber, offset: usize, data: &[u8]) -> Result<()> {
        debug_assert!(offset + data.len() <= self.page_size);
        let entry = self.queue.with_top(|top| {
            top.log_page_modification(&self.name, page_number, offset as u32, data)
        })?;

        let mut buckets = self.buckets.lock().unwrap();
        let chain = &mut buckets[bucket_index(page_number)];
        chain.push(entry);
        if chain.len() > BUCKET_SWEEP_THRESHOLD {
            chain.retain(|entry| !entry.journal().is_persisted());
        }
        Ok(())
    }

    /// Drop every pending entry, releasing the journal references.
    /// Used at shutdown once all pages have been flushed and
    /// checkpointed.
    pub(crate) fn discard_pending(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        for chain in buckets.iter_mut() {
            chain.clear();
        }
    }

    // ------------------------------------------------------------------
    // Persist path (called from journal replay)
    // ------------------------------------------------------------------

    fn ensure_writable(backing: &mut Backing) -> Result<()> {
        if !backing.accessor.is_open() {
            backing.accessor.open(false)?;
        }
        Ok(())
    }

    /// Write replayed bytes straight into the backing file, growing it
    /// as needed.
    pub(crate) fn persist_write(&self, position: u64, data: &[u8]) -> Result<()> {
        let mut backing = self.backing.lock().unwrap();
        Self::ensure_writable(&mut backing)?;
        let end = position + data.len() as u64;
        if end > backing.accessor.size() {
            backing.accessor.set_size(end)?;
        }
        backing.accessor.write(position, data)?;
        backing.backing_data = true;
        backing.data_exists = true;
        Ok(())
    }

    /// Grow the backing file to a replayed size change.
    pub(crate) fn persist_set_size(&self, new_size: u64) -> Result<()> {
        let mut backing = self.backing.lock().unwrap();
        Self::ensure_writable(&mut backing)?;
        if new_size > backing.accessor.size() {
            backing.accessor.set_size(new_size)?;
        }
        backing.backing_data = true;
        Ok(())
    }

    /// Remove the backing file for a replayed delete.
    pub(crate) fn persist_delete(&self) -> Result<()> {
        let mut backing = self.backing.lock().unwrap();
        if backing.accessor.is_open() {
            backing.accessor.close();
        }
        backing.accessor.delete()?;
        backing.backing_data = false;
        backing.data_exists = false;
        Ok(())
    }

    /// Flush the backing file; sync failures are swallowed inside the
    /// accessor.
    pub(crate) fn persist_sync(&self) {
        let backing = self.backing.lock().unwrap();
        if backing.accessor.is_open() {
            backing.accessor.sync();
        }
    }

    /// Close the backing accessor after a recovery replay.
    pub(crate) fn persist_close(&self) {
        let mut backing = self.backing.lock().unwrap();
        if backing.accessor.is_open() {
            backing.accessor.close();
        }
    }

    /// Re-derive the existence flag once recovery has settled.
    pub(crate) fn notify_post_recover(&self) {
        let mut backing = self.backing.lock().unwrap();
        backing.data_exists = backing.accessor.exists();
        backing.backing_data = backing.data_exists;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::system::JournalQueue;
    use tempfile::tempdir;

    fn test_resource(dir: &std::path::Path, page_size: usize) -> (Arc<JournalQueue>, JournaledResource) {
        let queue = Arc::new(JournalQueue::new(
            dir.to_path_buf(),
            page_size,
            1 << 30,
            false,
        ));
        queue.rotate_top_journal().unwrap();
        let accessor = FileSliceAccessor::new(dir.join("res.bst"), 1 << 30);
        let resource = JournaledResource::new(
            "res.bst".to_string(),
            1,
            page_size,
            Arc::clone(&queue),
            accessor,
        );
        (queue, resource)
    }

    #[test]
    fn test_read_page_zero_filled_without_backing() {
        let dir = tempdir().unwrap();
        let (_queue, resource) = test_resource(dir.path(), 128);
        resource.open(false).unwrap();

        let mut page = vec![0xAAu8; 128];
        resource.read_page(0, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_page_visible_through_overlay() {
        let dir = tempdir().unwrap();
        let (_queue, resource) = test_resource(dir.path(), 128);
        resource.open(false).unwrap();

        resource.write_page(2, 8, &[1, 2, 3, 4]).unwrap();
        resource.write_page(2, 10, &[9]).unwrap();

        let mut page = vec![0u8; 128];
        resource.read_page(2, &mut page).unwrap();
        assert_eq!(&page[8..12], &[1, 2, 9, 4]);

        // A different page stays untouched
        let mut other = vec![0u8; 128];
        resource.read_page(3, &mut other).unwrap();
        assert!(other.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_set_size_is_in_memory_until_persist() {
        let dir = tempdir().unwrap();
        let (_queue, resource) = test_resource(dir.path(), 128);
        resource.open(false).unwrap();

        resource.set_size(4096).unwrap();
        assert_eq!(resource.size(), 4096);
        // Nothing persisted yet: no backing file content
        assert!(!dir.path().join("res.bst").exists() || std::fs::metadata(dir.path().join("res.bst")).unwrap().len() == 0);
    }

    #[test]
    fn test_persist_write_lands_in_backing_file() {
        let dir = tempdir().unwrap();
        let (_queue, resource) = test_resource(dir.path(), 128);

        resource.persist_write(256, &[7u8; 16]).unwrap();
        resource.persist_sync();
        resource.persist_close();

        let bytes = std::fs::read(dir.path().join("res.bst")).unwrap();
        assert_eq!(bytes.len(), 272);
        assert!(bytes[256..].iter().all(|&b| b == 7));
    }
}
