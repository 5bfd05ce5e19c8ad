//! Journalled system
//!
//! Owns the rotating top journal, the archive of sealed journals
//! awaiting persistence, the resource map, and the background thread
//! that replays archived journals into the backing files. Roll-forward
//! recovery at startup (and defensively at shutdown) replays whatever
//! checkpointed journal content a previous session left behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{error, info, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::storage::journal::{
    JournalFile, JournalSummary, ResourceResolver, JOURNAL_HEADER_SIZE,
};
use crate::storage::resource::JournaledResource;
use crate::storage::slices::FileSliceAccessor;

/// A top journal larger than this is rotated out at the next
/// checkpoint even when the caller did not ask for a flush
const TOP_JOURNAL_ROTATE_SIZE: u64 = 256 * 1024;

/// Archived-journal backlog above which a checkpoint caller blocks
/// until the persister catches up
const TARGET_BACKLOG: usize = 10;

// ============================================================================
// Journal queue (shared with every resource)
// ============================================================================

struct QueueState {
    top: Option<Arc<JournalFile>>,
    archives: Vec<Arc<JournalFile>>,
    journal_number: u64,
    persister_failed: bool,
    stop: bool,
}

/// Shared journal state: the top journal resources append to, and the
/// sealed archives the persister drains.
pub(crate) struct JournalQueue {
    dir: PathBuf,
    page_size: usize,
    max_slice_size: u64,
    read_only: bool,
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl JournalQueue {
    pub(crate) fn new(
        dir: PathBuf,
        page_size: usize,
        max_slice_size: u64,
        read_only: bool,
    ) -> Self {
        JournalQueue {
            dir,
            page_size,
            max_slice_size,
            read_only,
            state: Mutex::new(QueueState {
                top: None,
                archives: Vec::new(),
                journal_number: 0,
                persister_failed: false,
                stop: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn max_slice_size(&self) -> u64 {
        self.max_slice_size
    }

    pub(crate) fn read_only(&self) -> bool {
        self.read_only
    }

    /// Run `f` against the current top journal, failing fast when the
    /// session is read-only or the persister has died.
    pub(crate) fn with_top<R>(
        &self,
        f: impl FnOnce(&Arc<JournalFile>) -> Result<R>,
    ) -> Result<R> {
        let state = self.state.lock().unwrap();
        if state.persister_failed {
            return Err(Error::with_message(
                ErrorCode::IoErr,
                "background journal persist has failed",
            ));
        }
        match &state.top {
            Some(top) => f(top),
            None => Err(Error::with_message(
                ErrorCode::ReadOnly,
                "no top journal in a read-only session",
            )),
        }
    }

    fn rotate_locked(&self, state: &mut QueueState) -> Result<()> {
        state.journal_number += 1;
        let journal = Arc::new(JournalFile::create(&self.dir, state.journal_number)?);
        if let Some(old) = state.top.replace(journal) {
            state.archives.push(old);
        }
        Ok(())
    }

    /// Create a fresh top journal, archiving the current one if any.
    pub(crate) fn rotate_top_journal(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        self.rotate_locked(&mut state)
    }
}

// ============================================================================
// Resource resolution
// ============================================================================

/// Resolver handing out (and lazily creating) live resources; shared
/// between the session threads and the persister.
#[derive(Clone)]
pub(crate) struct SystemResources {
    queue: Arc<JournalQueue>,
    map: Arc<Mutex<HashMap<String, Arc<JournaledResource>>>>,
    seq_id: Arc<AtomicU64>,
}

impl SystemResources {
    fn get_or_create(&self, name: &str) -> Arc<JournaledResource> {
        let mut map = self.map.lock().unwrap();
        if let Some(resource) = map.get(name) {
            return Arc::clone(resource);
        }
        let id = self.seq_id.fetch_add(1, Ordering::SeqCst);
        let accessor = FileSliceAccessor::new(
            self.queue.dir().join(name),
            self.queue.max_slice_size(),
        );
        let resource = Arc::new(JournaledResource::new(
            name.to_string(),
            id,
            self.queue.page_size(),
            Arc::clone(&self.queue),
            accessor,
        ));
        map.insert(name.to_string(), Arc::clone(&resource));
        resource
    }
}

impl ResourceResolver for SystemResources {
    fn resolve(&self, name: &str) -> Result<Arc<JournaledResource>> {
        Ok(self.get_or_create(name))
    }
}

// ============================================================================
// JournaledSystem
// ============================================================================

/// The journalling root: recovery, checkpointing and the persister.
pub struct JournaledSystem {
    queue: Arc<JournalQueue>,
    resources: SystemResources,
    persister: Mutex<Option<JoinHandle<()>>>,
}

impl JournaledSystem {
    /// Build a system rooted at `dir`. Nothing is touched on disk
    /// until `start`.
    pub fn new(dir: PathBuf, page_size: usize, max_slice_size: u64, read_only: bool) -> Self {
        let queue = Arc::new(JournalQueue::new(dir, page_size, max_slice_size, read_only));
        let resources = SystemResources {
            queue: Arc::clone(&queue),
            map: Arc::new(Mutex::new(HashMap::new())),
            seq_id: Arc::new(AtomicU64::new(1)),
        };
        JournaledSystem {
            queue,
            resources,
            persister: Mutex::new(None),
        }
    }

    /// The configured page size.
    pub fn page_size(&self) -> usize {
        self.queue.page_size()
    }

    /// True when the session is read-only.
    pub fn read_only(&self) -> bool {
        self.queue.read_only()
    }

    /// Find or create the resource named `name`.
    pub fn resource(&self, name: &str) -> Arc<JournaledResource> {
        self.resources.get_or_create(name)
    }

    /// Recover any journals a previous session left behind, then open
    /// a fresh top journal and start the persister (writable mode).
    pub fn start(&self) -> Result<()> {
        if self.queue.read_only() {
            if journal_files_present(self.queue.dir()) {
                warn!(
                    "journals present in {} but the session is read-only; \
                     checkpointed changes are not visible",
                    self.queue.dir().display()
                );
            }
            return Ok(());
        }

        self.roll_forward_recover()?;
        self.queue.rotate_top_journal()?;

        let queue = Arc::clone(&self.queue);
        let resources = self.resources.clone();
        let handle = std::thread::Builder::new()
            .name("binstore-journal-persist".to_string())
            .spawn(move || persister_main(queue, resources))
            .map_err(Error::from)?;
        *self.persister.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Scan for leftover journal files, replay the recoverable ones in
    /// journal-number order, and delete them all. Numbering continues
    /// past the highest journal seen so a fresh top journal can never
    /// collide with a file the previous session still references.
    fn roll_forward_recover(&self) -> Result<()> {
        let mut found: Vec<(JournalFile, JournalSummary)> = Vec::new();
        let mut highest_seen = 0u64;
        for n in 10..=73u32 {
            let path = self.queue.dir().join(format!("jnl{}", n));
            if !path.exists() {
                continue;
            }
            match JournalFile::open_for_recovery(&path) {
                Ok((journal, summary)) if summary.can_be_recovered => {
                    highest_seen = highest_seen.max(summary.journal_number);
                    found.push((journal, summary));
                }
                Ok((journal, summary)) => {
                    warn!(
                        "discarding journal {} with no checkpoint",
                        path.display()
                    );
                    highest_seen = highest_seen.max(summary.journal_number);
                    journal.close_and_delete()?;
                }
                Err(err) => {
                    warn!("discarding unreadable journal {}: {}", path.display(), err);
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        {
            let mut state = self.queue.state.lock().unwrap();
            state.journal_number = state.journal_number.max(highest_seen);
        }
        found.sort_by_key(|(_, summary)| summary.journal_number);

        for (journal, summary) in found {
            info!(
                "recovering journal {} up to checkpoint offset {}",
                summary.journal_number, summary.last_checkpoint
            );
            let touched: Vec<Arc<JournaledResource>> = summary
                .resource_names
                .iter()
                .map(|name| self.resources.get_or_create(name))
                .collect();
            journal.persist(JOURNAL_HEADER_SIZE, summary.last_checkpoint, &self.resources)?;
            journal.remove_reference()?;
            for resource in touched {
                resource.persist_close();
                resource.notify_post_recover();
            }
        }
        Ok(())
    }

    /// Write the checkpoint barrier, rotating the top journal first
    /// when it has grown past the threshold or the caller asked for a
    /// flush. The outgoing journal is sealed with its own checkpoint
    /// before it is archived, so a crash between rotation and
    /// background persist cannot discard its tail.
    pub fn set_checkpoint(&self, flush_journals: bool) -> Result<()> {
        let something_to_persist = {
            let mut state = self.queue.state.lock().unwrap();
            if state.persister_failed {
                return Err(Error::with_message(
                    ErrorCode::IoErr,
                    "background journal persist has failed",
                ));
            }
            let top = match &state.top {
                Some(top) => Arc::clone(top),
                None => {
                    return Err(Error::with_message(
                        ErrorCode::ReadOnly,
                        "no top journal in a read-only session",
                    ))
                }
            };
            if flush_journals || top.size() > TOP_JOURNAL_ROTATE_SIZE {
                top.set_checkpoint()?;
                self.queue.rotate_locked(&mut state)?;
            }
            state
                .top
                .as_ref()
                .expect("top journal after rotation")
                .set_checkpoint()?;
            !state.archives.is_empty()
        };

        if something_to_persist {
            self.persist_archives(TARGET_BACKLOG)?;
        }
        Ok(())
    }

    /// Wake the persister and block until the archived backlog has
    /// drained to at most `target` journals.
    pub fn persist_archives(&self, target: usize) -> Result<()> {
        let has_persister = self.persister.lock().unwrap().is_some();
        let mut state = self.queue.state.lock().unwrap();
        self.queue.cond.notify_all();
        while state.archives.len() > target {
            if state.persister_failed {
                return Err(Error::with_message(
                    ErrorCode::IoErr,
                    "background journal persist has failed",
                ));
            }
            if !has_persister {
                return Err(Error::with_message(
                    ErrorCode::Misuse,
                    "journal persister is not running",
                ));
            }
            state = self.queue.cond.wait(state).unwrap();
        }
        Ok(())
    }

    /// Health hook: true once the persister has fail-stopped.
    pub fn persister_failed(&self) -> bool {
        self.queue.state.lock().unwrap().persister_failed
    }

    /// Drain the persister, stop it, close the top journal and run a
    /// final recovery pass that rolls every checkpointed record into
    /// the backing files. After a clean stop no journal files remain.
    pub fn stop(&self) -> Result<()> {
        if self.persister.lock().unwrap().is_some() {
            if let Err(err) = self.persist_archives(0) {
                warn!("journal drain at shutdown failed: {}", err);
            }
            {
                let mut state = self.queue.state.lock().unwrap();
                state.stop = true;
                self.queue.cond.notify_all();
            }
            if let Some(handle) = self.persister.lock().unwrap().take() {
                let _ = handle.join();
            }
        }

        // Release pinned journal entries so the journal files close
        {
            let map = self.resources.map.lock().unwrap();
            for resource in map.values() {
                resource.discard_pending();
            }
        }
        let (top, archives) = {
            let mut state = self.queue.state.lock().unwrap();
            (state.top.take(), std::mem::take(&mut state.archives))
        };
        if let Some(top) = top {
            top.remove_reference()?;
        }
        for journal in archives {
            // Whatever the persister did not finish is still on disk
            // with its checkpoints; the re-scan below replays it.
            let _ = journal.remove_reference();
        }

        if !self.queue.read_only() {
            self.roll_forward_recover()?;
        }
        Ok(())
    }
}

fn journal_files_present(dir: &Path) -> bool {
    (10..=73u32).any(|n| dir.join(format!("jnl{}", n)).exists())
}

// ============================================================================
// Persister thread
// ============================================================================

fn persister_main(queue: Arc<JournalQueue>, resources: SystemResources) {
    loop {
        let batch: Vec<Arc<JournalFile>> = {
            let mut state = queue.state.lock().unwrap();
            loop {
                if !state.archives.is_empty() {
                    break state.archives.clone();
                }
                if state.stop {
                    return;
                }
                state = queue.cond.wait(state).unwrap();
            }
        };

        for journal in batch {
            let end = journal.size();
            match journal.persist(JOURNAL_HEADER_SIZE, end, &resources) {
                Ok(()) => {
                    if let Err(err) = journal.remove_reference() {
                        warn!("journal release after persist failed: {}", err);
                    }
                    let mut state = queue.state.lock().unwrap();
                    state.archives.retain(|a| !Arc::ptr_eq(a, &journal));
                    queue.cond.notify_all();
                }
                Err(err) => {
                    error!(
                        "persist of journal {} failed; stopping the background persister: {}",
                        journal.journal_number(),
                        err
                    );
                    let mut state = queue.state.lock().unwrap();
                    state.persister_failed = true;
                    queue.cond.notify_all();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_system(dir: &Path) -> JournaledSystem {
        let system = JournaledSystem::new(dir.to_path_buf(), 128, 1 << 30, false);
        system.start().unwrap();
        system
    }

    #[test]
    fn test_checkpointed_write_survives_stop() {
        let dir = tempdir().unwrap();
        {
            let system = open_system(dir.path());
            let resource = system.resource("t.bst");
            resource.open(false).unwrap();
            resource.set_size(256).unwrap();
            resource.write_page(0, 0, &[0x5A; 128]).unwrap();
            system.set_checkpoint(true).unwrap();
            system.stop().unwrap();
        }

        // A clean stop leaves no journals behind
        assert!(!journal_files_present(dir.path()));
        let bytes = std::fs::read(dir.path().join("t.bst")).unwrap();
        assert!(bytes[..128].iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_unreferenced_journals_removed_on_recovery() {
        let dir = tempdir().unwrap();
        {
            let system = open_system(dir.path());
            let resource = system.resource("t.bst");
            resource.open(false).unwrap();
            resource.write_page(0, 0, &[1; 16]).unwrap();
            // No checkpoint, no stop: simulate a crash by dropping
        }
        assert!(journal_files_present(dir.path()));

        let system = open_system(dir.path());
        // The uncheckpointed journal was discarded during recovery,
        // and a fresh top journal now exists
        let resource = system.resource("t.bst");
        resource.open(false).unwrap();
        let mut page = vec![0xFFu8; 128];
        resource.read_page(0, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 0));
        system.stop().unwrap();
    }

    #[test]
    fn test_crash_after_checkpoint_is_replayed() {
        let dir = tempdir().unwrap();
        {
            let system = open_system(dir.path());
            let resource = system.resource("t.bst");
            resource.open(false).unwrap();
            resource.set_size(128).unwrap();
            resource.write_page(0, 4, &[0xEE; 8]).unwrap();
            system.set_checkpoint(false).unwrap();
            // Crash: no stop
        }

        let system = open_system(dir.path());
        let bytes = std::fs::read(dir.path().join("t.bst")).unwrap();
        assert!(bytes[4..12].iter().all(|&b| b == 0xEE));
        system.stop().unwrap();
    }
}
