//! Buffer manager
//!
//! A fixed-count cache of resource pages in front of the journalled
//! system. Pages are pinned for the duration of each byte operation;
//! a pin of an idle page lazily reads it (backing file plus journal
//! overlays), and the final unpin flushes the dirty range back out as
//! a journal append. Checkpoints drain every cached page and then
//! drive the journal barrier; the write-gate keeps page mutations and
//! checkpoints from overlapping.
//!
//! Lock order: write-gate, then clock, then page map, then page
//! content, then journal state, then a journal file. Never backwards.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::resource::JournaledResource;
use crate::storage::system::JournaledSystem;
use crate::types::{PageNumber, StoreConfig, StoreFlags};

/// Bucket count for the page hash table
const PAGE_MAP_BUCKETS: usize = 257;

/// Access counts saturate here when computing eviction weight
const MAX_WEIGHT_ACCESSES: u32 = 10_000;

fn page_hash(resource_id: u64, page_number: PageNumber) -> usize {
    let mix = (resource_id << 6).wrapping_add(page_number.wrapping_mul(11));
    (mix % PAGE_MAP_BUCKETS as u64) as usize
}

// ============================================================================
// Cached page
// ============================================================================

struct PageContent {
    buffer: Option<Vec<u8>>,
    /// Dirty range [first_write, last_write); clean when empty
    first_write: usize,
    last_write: usize,
}

struct BufferedPage {
    resource: Arc<JournaledResource>,
    page_number: PageNumber,
    page_size: usize,
    content: Mutex<PageContent>,
    /// Pin count; transitions are made under the map lock
    ref_count: AtomicU32,
    /// Logical clock tick of the last access
    t: AtomicU64,
    access_count: AtomicU32,
}

impl BufferedPage {
    fn new(resource: Arc<JournaledResource>, page_number: PageNumber, page_size: usize) -> Self {
        BufferedPage {
            resource,
            page_number,
            page_size,
            content: Mutex::new(PageContent {
                buffer: None,
                first_write: usize::MAX,
                last_write: 0,
            }),
            ref_count: AtomicU32::new(0),
            t: AtomicU64::new(0),
            access_count: AtomicU32::new(0),
        }
    }

    fn ensure_initialised(&self, content: &mut PageContent) -> Result<()> {
        if content.buffer.is_none() {
            let mut buffer = vec![0u8; self.page_size];
            self.resource.read_page(self.page_number, &mut buffer)?;
            content.buffer = Some(buffer);
        }
        Ok(())
    }

    fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let mut content = self.content.lock().unwrap();
        self.ensure_initialised(&mut content)?;
        let buffer = content.buffer.as_ref().expect("initialised page buffer");
        out.copy_from_slice(&buffer[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut content = self.content.lock().unwrap();
        self.ensure_initialised(&mut content)?;
        let buffer = content.buffer.as_mut().expect("initialised page buffer");
        buffer[offset..offset + data.len()].copy_from_slice(data);
        content.first_write = content.first_write.min(offset);
        content.last_write = content.last_write.max(offset + data.len());
        Ok(())
    }

    /// Append the dirty range to the top journal and mark clean.
    fn flush(&self) -> Result<()> {
        let mut content = self.content.lock().unwrap();
        if content.last_write > content.first_write {
            let (first, last) = (content.first_write, content.last_write);
            if let Some(buffer) = &content.buffer {
                self.resource
                    .write_page(self.page_number, first, &buffer[first..last])?;
            }
            content.first_write = usize::MAX;
            content.last_write = 0;
        }
        Ok(())
    }

    /// Drop the buffer and the dirty range; the next pin re-reads.
    fn reset(&self) {
        let mut content = self.content.lock().unwrap();
        content.buffer = None;
        content.first_write = usize::MAX;
        content.last_write = 0;
    }
}

// ============================================================================
// BufferManager
// ============================================================================

struct PageMap {
    buckets: Vec<Vec<Arc<BufferedPage>>>,
}

struct Clock {
    current_t: u64,
    page_count: usize,
    page_list: Vec<Arc<BufferedPage>>,
}

struct WriteGate {
    write_lock_count: u32,
    checkpoint_in_progress: bool,
}

/// Page cache and session root over the journalled system.
pub struct BufferManager {
    system: JournaledSystem,
    page_size: usize,
    max_pages: usize,
    paranoid: bool,
    map: Mutex<PageMap>,
    clock: Mutex<Clock>,
    gate: Mutex<WriteGate>,
    gate_cond: Condvar,
}

impl BufferManager {
    /// Build a buffer manager for the configured session. Nothing
    /// touches disk until `start`.
    pub fn new(config: &StoreConfig) -> Self {
        let system = JournaledSystem::new(
            config.base_dir.clone(),
            config.page_size,
            config.max_slice_size,
            config.read_only(),
        );
        BufferManager {
            system,
            page_size: config.page_size,
            max_pages: config.max_pages.max(2),
            paranoid: config.flags.contains(StoreFlags::PARANOID_CHECKS),
            map: Mutex::new(PageMap {
                buckets: (0..PAGE_MAP_BUCKETS).map(|_| Vec::new()).collect(),
            }),
            clock: Mutex::new(Clock {
                current_t: 0,
                page_count: 0,
                page_list: Vec::new(),
            }),
            gate: Mutex::new(WriteGate {
                write_lock_count: 0,
                checkpoint_in_progress: false,
            }),
            gate_cond: Condvar::new(),
        }
    }

    /// Recover and start the journalled system.
    pub fn start(&self) -> Result<()> {
        self.system.start()
    }

    /// Checkpoint and shut the journalled system down cleanly.
    pub fn stop(&self) -> Result<()> {
        if !self.system.read_only() {
            self.set_checkpoint(false)?;
        }
        self.system.stop()
    }

    /// The configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// True when the session is read-only.
    pub fn read_only(&self) -> bool {
        self.system.read_only()
    }

    /// Find or create the named resource.
    pub fn resource(&self, name: &str) -> Arc<JournaledResource> {
        self.system.resource(name)
    }

    /// Health hook: true once the background persister has
    /// fail-stopped on an I/O error.
    pub fn persister_failed(&self) -> bool {
        self.system.persister_failed()
    }

    // ------------------------------------------------------------------
    // Write gate
    // ------------------------------------------------------------------

    /// Take a write lock; blocks while a checkpoint is running. Every
    /// page mutation must happen under one.
    pub fn lock_for_write(&self) {
        let mut gate = self.gate.lock().unwrap();
        while gate.checkpoint_in_progress {
            gate = self.gate_cond.wait(gate).unwrap();
        }
        gate.write_lock_count += 1;
    }

    /// Release a write lock taken with `lock_for_write`.
    pub fn unlock_for_write(&self) {
        let mut gate = self.gate.lock().unwrap();
        debug_assert!(gate.write_lock_count > 0);
        gate.write_lock_count = gate.write_lock_count.saturating_sub(1);
        self.gate_cond.notify_all();
    }

    fn check_write_locked(&self) -> Result<()> {
        if self.paranoid || cfg!(debug_assertions) {
            let gate = self.gate.lock().unwrap();
            if gate.write_lock_count == 0 {
                return Err(Error::with_message(
                    ErrorCode::ReadOnly,
                    "page mutation outside a write lock",
                ));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pinning
    // ------------------------------------------------------------------

    fn pin(
        &self,
        resource: &Arc<JournaledResource>,
        page_number: PageNumber,
    ) -> Result<Arc<BufferedPage>> {
        let (page, created) = {
            let mut map = self.map.lock().unwrap();
            let bucket = &mut map.buckets[page_hash(resource.id(), page_number)];
            if let Some(index) = bucket
                .iter()
                .position(|p| p.page_number == page_number && p.resource.id() == resource.id())
            {
                let page = bucket.remove(index);
                bucket.insert(0, Arc::clone(&page));
                let previous = page.ref_count.fetch_add(1, Ordering::SeqCst);
                if previous == 0 {
                    // Idle pages hold no buffer; forget any stale state
                    page.reset();
                }
                (page, false)
            } else {
                let page = Arc::new(BufferedPage::new(
                    Arc::clone(resource),
                    page_number,
                    self.page_size,
                ));
                page.ref_count.store(1, Ordering::SeqCst);
                bucket.insert(0, Arc::clone(&page));
                (page, true)
            }
        };
        if created {
            self.page_created(&page)?;
        } else {
            self.page_accessed(&page);
        }
        Ok(page)
    }

    fn release(&self, page: &Arc<BufferedPage>) -> Result<()> {
        let map = self.map.lock().unwrap();
        let previous = page.ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
        let result = if previous == 1 {
            // Last pin gone: push the dirty range into the journal and
            // let go of the buffer
            let flushed = page.flush();
            page.reset();
            flushed
        } else {
            Ok(())
        };
        drop(map);
        result
    }

    fn page_accessed(&self, page: &Arc<BufferedPage>) {
        let mut clock = self.clock.lock().unwrap();
        clock.current_t += 1;
        page.t.store(clock.current_t, Ordering::SeqCst);
        page.access_count.fetch_add(1, Ordering::SeqCst);
    }

    fn page_created(&self, page: &Arc<BufferedPage>) -> Result<()> {
        let mut clock = self.clock.lock().unwrap();
        clock.current_t += 1;
        page.t.store(clock.current_t, Ordering::SeqCst);
        page.access_count.store(1, Ordering::SeqCst);
        clock.page_count += 1;
        clock.page_list.push(Arc::clone(page));
        if clock.page_count > self.max_pages {
            self.evict(&mut clock)?;
        }
        Ok(())
    }

    /// Drop the fifth of the cache that weighs the most: pages that
    /// have sat untouched the longest relative to how often they were
    /// ever accessed.
    fn evict(&self, clock: &mut Clock) -> Result<()> {
        fn weight(page: &BufferedPage, now: u64) -> f64 {
            let accesses = page.access_count.load(Ordering::SeqCst).min(MAX_WEIGHT_ACCESSES);
            let idle = now.saturating_sub(page.t.load(Ordering::SeqCst));
            (1.0 / accesses.max(1) as f64) * idle as f64
        }

        let now = clock.current_t;
        let mut snapshot = clock.page_list.clone();
        snapshot.sort_by(|a, b| weight(a, now).total_cmp(&weight(b, now)));
        let drop_count = (snapshot.len() / 5).max(2).min(snapshot.len());
        let victims = snapshot.split_off(snapshot.len() - drop_count);

        let mut disposed: Vec<Arc<BufferedPage>> = Vec::new();
        {
            let mut map = self.map.lock().unwrap();
            for victim in victims {
                if victim.ref_count.load(Ordering::SeqCst) == 0 {
                    victim.flush()?;
                    victim.reset();
                    let bucket = &mut map.buckets[page_hash(victim.resource.id(), victim.page_number)];
                    bucket.retain(|p| !Arc::ptr_eq(p, &victim));
                    disposed.push(victim);
                }
            }
        }
        if !disposed.is_empty() {
            clock
                .page_list
                .retain(|p| !disposed.iter().any(|d| Arc::ptr_eq(p, d)));
            clock.page_count = clock.page_list.len();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Byte I/O
    // ------------------------------------------------------------------

    /// Read `buf.len()` bytes at `position`, spanning pages as needed.
    pub fn read_bytes(
        &self,
        resource: &Arc<JournaledResource>,
        position: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let page_size = self.page_size as u64;
        let mut position = position;
        let mut filled = 0usize;
        while filled < buf.len() {
            let page_number = position / page_size;
            let offset = (position % page_size) as usize;
            let chunk = (self.page_size - offset).min(buf.len() - filled);
            let page = self.pin(resource, page_number)?;
            let read = page.read(offset, &mut buf[filled..filled + chunk]);
            let released = self.release(&page);
            read?;
            released?;
            position += chunk as u64;
            filled += chunk;
        }
        Ok(())
    }

    /// Write `data` at `position`, spanning pages as needed. Must be
    /// called under a write lock.
    pub fn write_bytes(
        &self,
        resource: &Arc<JournaledResource>,
        position: u64,
        data: &[u8],
    ) -> Result<()> {
        self.check_write_locked()?;
        let page_size = self.page_size as u64;
        let mut position = position;
        let mut taken = 0usize;
        while taken < data.len() {
            let page_number = position / page_size;
            let offset = (position % page_size) as usize;
            let chunk = (self.page_size - offset).min(data.len() - taken);
            let page = self.pin(resource, page_number)?;
            let wrote = page.write(offset, &data[taken..taken + chunk]);
            let released = self.release(&page);
            wrote?;
            released?;
            position += chunk as u64;
            taken += chunk;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoint
    // ------------------------------------------------------------------

    /// Flush every cached page and write the checkpoint barrier.
    /// Blocks until in-flight write locks drain; write locks taken
    /// while the checkpoint runs wait for it.
    pub fn set_checkpoint(&self, flush_journals: bool) -> Result<()> {
        if self.system.read_only() {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        {
            let mut gate = self.gate.lock().unwrap();
            while gate.write_lock_count > 0 {
                gate = self.gate_cond.wait(gate).unwrap();
            }
            gate.checkpoint_in_progress = true;
        }
        let result = self.checkpoint_body(flush_journals);
        {
            let mut gate = self.gate.lock().unwrap();
            gate.checkpoint_in_progress = false;
            self.gate_cond.notify_all();
        }
        result
    }

    fn checkpoint_body(&self, flush_journals: bool) -> Result<()> {
        {
            let mut clock = self.clock.lock().unwrap();
            let mut map = self.map.lock().unwrap();
            let mut removed: Vec<Arc<BufferedPage>> = Vec::new();
            for bucket in map.buckets.iter_mut() {
                for page in bucket.iter() {
                    page.flush()?;
                }
                bucket.retain(|page| {
                    if page.ref_count.load(Ordering::SeqCst) == 0 {
                        page.reset();
                        removed.push(Arc::clone(page));
                        false
                    } else {
                        true
                    }
                });
            }
            if !removed.is_empty() {
                clock
                    .page_list
                    .retain(|p| !removed.iter().any(|d| Arc::ptr_eq(p, d)));
                clock.page_count = clock.page_list.len();
            }
        }
        self.system.set_checkpoint(flush_journals)
    }
}
