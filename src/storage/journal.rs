//! Append-only journal files
//!
//! A journal is a sequence of tagged records after an 8-byte journal
//! number. Page modifications, resource size changes and deletes are
//! appended as they happen; a CHECKPOINT record is the durability
//! barrier up to which the journal may be replayed after a crash.
//! Journal files rotate through 64 names (`jnl10`..`jnl73`) and are
//! deleted once their content has been persisted into the backing
//! resources and no cached page still references them.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::error::{Error, ErrorCode, Result};
use crate::os;
use crate::storage::resource::JournaledResource;
use crate::types::PageNumber;

// ============================================================================
// Record tags
// ============================================================================

/// Page modification record: `{id, page, offset, length, bytes}`
pub const TAG_PAGE_MODIFICATION: u64 = 1;

/// Resource tag record binding a journal-local id to a resource name
pub const TAG_RESOURCE_NAME: u64 = 2;

/// Resource size change record: `{id, new_size}`
pub const TAG_RESOURCE_SIZE_CHANGE: u64 = 3;

/// Resource delete record: `{id}`
pub const TAG_RESOURCE_DELETE: u64 = 6;

/// Checkpoint record (empty payload); the recovery barrier
pub const TAG_CHECKPOINT: u64 = 100;

/// Bytes before the first record: the 8-byte journal number
pub const JOURNAL_HEADER_SIZE: u64 = 8;

/// Framing bytes per record: u64 kind plus u32 payload size
const RECORD_FRAMING: u64 = 12;

/// Fixed part of a page-modification record including framing:
/// kind(8) + size(4) + id(8) + page(8) + offset(4) + length(4)
const PAGE_MOD_HEADER: usize = 36;

/// On-disk file name for a journal number. The names rotate through
/// `jnl10`..`jnl73`.
pub fn journal_file_name(journal_number: u64) -> String {
    format!("jnl{}", (journal_number % 64) + 10)
}

// ============================================================================
// Recovery summary
// ============================================================================

/// What a recovery scan learned about a journal file.
#[derive(Debug, Clone)]
pub struct JournalSummary {
    /// The journal number read from the header
    pub journal_number: u64,
    /// True when at least one checkpoint record was parsed
    pub can_be_recovered: bool,
    /// End offset of the last checkpoint record; replay covers
    /// `[JOURNAL_HEADER_SIZE, last_checkpoint)`
    pub last_checkpoint: u64,
    /// Names of every resource tagged in the scanned prefix
    pub resource_names: Vec<String>,
}

// ============================================================================
// Resource resolution seam
// ============================================================================

/// Maps resource names to live resources during replay.
pub trait ResourceResolver {
    /// Find or create the resource for `name`
    fn resolve(&self, name: &str) -> Result<Arc<JournaledResource>>;
}

// ============================================================================
// JournalFile
// ============================================================================

struct JournalInner {
    path: PathBuf,
    journal_number: u64,
    file: Option<File>,
    size: u64,
    /// Journal-local resource ids, assigned on first touch
    resource_ids: HashMap<String, u64>,
    next_resource_id: u64,
    /// Owner plus one per live JournalEntry
    reference_count: u32,
    /// True once the content has been replayed into the backing files
    persisted: bool,
}

/// One append-only journal file.
pub struct JournalFile {
    inner: Mutex<JournalInner>,
}

impl JournalFile {
    /// Create a fresh journal. Fails if the rotating file name is
    /// still occupied by an undeleted predecessor.
    pub fn create(dir: &Path, journal_number: u64) -> Result<JournalFile> {
        let path = dir.join(journal_file_name(journal_number));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(Error::from)?;
        os::write_at(&file, &journal_number.to_be_bytes(), 0)?;
        Ok(JournalFile {
            inner: Mutex::new(JournalInner {
                path,
                journal_number,
                file: Some(file),
                size: JOURNAL_HEADER_SIZE,
                resource_ids: HashMap::new(),
                next_resource_id: 0,
                reference_count: 1,
                persisted: false,
            }),
        })
    }

    /// Open an existing journal left on disk by a previous session and
    /// scan it for recoverability.
    pub fn open_for_recovery(path: &Path) -> Result<(JournalFile, JournalSummary)> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(Error::from)?;
        let file_size = file.metadata().map_err(Error::from)?.len();
        if file_size < JOURNAL_HEADER_SIZE {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("journal {} is shorter than its header", path.display()),
            ));
        }
        let mut number_buf = [0u8; 8];
        read_exact_at(&file, &mut number_buf, 0)?;
        let journal_number = u64::from_be_bytes(number_buf);

        let summary = scan_records(&file, journal_number, file_size)?;

        Ok((
            JournalFile {
                inner: Mutex::new(JournalInner {
                    path: path.to_path_buf(),
                    journal_number,
                    file: Some(file),
                    size: file_size,
                    resource_ids: HashMap::new(),
                    next_resource_id: 0,
                    reference_count: 1,
                    persisted: false,
                }),
            },
            summary,
        ))
    }

    /// The journal number from the header.
    pub fn journal_number(&self) -> u64 {
        self.inner.lock().unwrap().journal_number
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    /// On-disk path.
    pub fn path(&self) -> PathBuf {
        self.inner.lock().unwrap().path.clone()
    }

    /// True once the journal's content has been replayed into the
    /// backing resources; live entries referencing it are then stale.
    pub fn is_persisted(&self) -> bool {
        self.inner.lock().unwrap().persisted
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    /// Release one reference. References are taken at creation (the
    /// owner) and inside `log_page_modification` (one per entry).
    /// When the count reaches zero the file handle is closed, and the
    /// file itself is deleted if it has been persisted.
    pub(crate) fn remove_reference(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reference_count == 0 {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "journal reference removed more times than added",
            ));
        }
        inner.reference_count -= 1;
        if inner.reference_count == 0 {
            inner.file = None;
            if inner.persisted {
                match std::fs::remove_file(&inner.path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }

    /// Close the handle and remove the file regardless of state. Used
    /// for journals that failed the recovery scan.
    pub fn close_and_delete(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file = None;
        match std::fs::remove_file(&inner.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ------------------------------------------------------------------
    // Appends
    // ------------------------------------------------------------------

    /// Look up the journal-local id for `name`, emitting a resource
    /// tag record on first touch.
    fn resource_id(inner: &mut JournalInner, name: &str) -> Result<u64> {
        if let Some(&id) = inner.resource_ids.get(name) {
            return Ok(id);
        }
        let id = inner.next_resource_id;
        inner.next_resource_id += 1;

        let units: Vec<u16> = name.encode_utf16().collect();
        let mut payload = Vec::with_capacity(12 + units.len() * 2);
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&(units.len() as u32).to_be_bytes());
        for unit in &units {
            payload.extend_from_slice(&unit.to_be_bytes());
        }
        append_record(inner, TAG_RESOURCE_NAME, &payload)?;
        inner.resource_ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Append a page modification and return the pinned entry that
    /// lets cached pages rebuild from it.
    pub fn log_page_modification(
        self: &Arc<Self>,
        resource_name: &str,
        page_number: PageNumber,
        offset: u32,
        data: &[u8],
    ) -> Result<JournalEntry> {
        let position = {
            let mut inner = self.inner.lock().unwrap();
            let id = Self::resource_id(&mut inner, resource_name)?;
            let mut payload = Vec::with_capacity(24 + data.len());
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&page_number.to_be_bytes());
            payload.extend_from_slice(&offset.to_be_bytes());
            payload.extend_from_slice(&(data.len() as u32).to_be_bytes());
            payload.extend_from_slice(data);
            let position = append_record(&mut inner, TAG_PAGE_MODIFICATION, &payload)?;
            inner.reference_count += 1;
            position
        };
        Ok(JournalEntry {
            resource_name: resource_name.to_string(),
            journal: Arc::clone(self),
            position,
            page_number,
        })
    }

    /// Append a size-change record for `resource_name`.
    pub fn log_resource_size_change(&self, resource_name: &str, new_size: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::resource_id(&mut inner, resource_name)?;
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&new_size.to_be_bytes());
        append_record(&mut inner, TAG_RESOURCE_SIZE_CHANGE, &payload)?;
        Ok(())
    }

    /// Append a delete record for `resource_name`.
    pub fn log_resource_delete(&self, resource_name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::resource_id(&mut inner, resource_name)?;
        append_record(&mut inner, TAG_RESOURCE_DELETE, &id.to_be_bytes())?;
        Ok(())
    }

    /// Append a checkpoint record and sync the file. Everything before
    /// this point becomes replayable after a crash.
    pub fn set_checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        append_record(&mut inner, TAG_CHECKPOINT, &[])?;
        let file = inner
            .file
            .as_ref()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "journal already closed"))?;
        os::sync_data(file)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Overlay the payload of the page-modification record at
    /// `position` onto `buf` (one whole page).
    pub fn build_page(
        &self,
        page_number: PageNumber,
        position: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let file = inner
            .file
            .as_ref()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "journal already closed"))?;

        let mut header = [0u8; PAGE_MOD_HEADER];
        read_exact_at(file, &mut header, position)?;
        let kind = u64::from_be_bytes(header[0..8].try_into().unwrap());
        let page = u64::from_be_bytes(header[12..20].try_into().unwrap());
        let offset = u32::from_be_bytes(header[28..32].try_into().unwrap()) as usize;
        let length = u32::from_be_bytes(header[32..36].try_into().unwrap()) as usize;

        if kind != TAG_PAGE_MODIFICATION || page != page_number {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!(
                    "journal entry at {} does not describe page {}",
                    position, page_number
                ),
            ));
        }
        if offset + length > buf.len() {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "journal entry exceeds the page bounds",
            ));
        }
        read_exact_at(
            file,
            &mut buf[offset..offset + length],
            position + PAGE_MOD_HEADER as u64,
        )?;
        Ok(())
    }

    /// Replay records in `[start, end)` against the live resources and
    /// sync every resource touched. On success the journal is marked
    /// persisted.
    pub fn persist(&self, start: u64, end: u64, resources: &dyn ResourceResolver) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .file
            .as_ref()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "journal already closed"))?;

        let mut id_map: HashMap<u64, Arc<JournaledResource>> = HashMap::new();
        let mut touched: Vec<Arc<JournaledResource>> = Vec::new();
        let mut pos = start;
        while pos < end {
            let mut framing = [0u8; 12];
            read_exact_at(file, &mut framing, pos)?;
            let kind = u64::from_be_bytes(framing[0..8].try_into().unwrap());
            let payload_len = u32::from_be_bytes(framing[8..12].try_into().unwrap()) as u64;
            let payload_pos = pos + RECORD_FRAMING;

            match kind {
                TAG_RESOURCE_NAME => {
                    let mut head = [0u8; 12];
                    read_exact_at(file, &mut head, payload_pos)?;
                    let id = u64::from_be_bytes(head[0..8].try_into().unwrap());
                    let name_len = u32::from_be_bytes(head[8..12].try_into().unwrap()) as usize;
                    let mut chars = vec![0u8; name_len * 2];
                    read_exact_at(file, &mut chars, payload_pos + 12)?;
                    let units: Vec<u16> = chars
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                    let name = String::from_utf16(&units).map_err(|_| {
                        Error::with_message(ErrorCode::Corrupt, "malformed resource name record")
                    })?;
                    let resource = resources.resolve(&name)?;
                    if !touched.iter().any(|r| r.name() == resource.name()) {
                        touched.push(Arc::clone(&resource));
                    }
                    id_map.insert(id, resource);
                }
                TAG_PAGE_MODIFICATION => {
                    let mut head = [0u8; 24];
                    read_exact_at(file, &mut head, payload_pos)?;
                    let id = u64::from_be_bytes(head[0..8].try_into().unwrap());
                    let page = u64::from_be_bytes(head[8..16].try_into().unwrap());
                    let offset = u32::from_be_bytes(head[16..20].try_into().unwrap()) as u64;
                    let length = u32::from_be_bytes(head[20..24].try_into().unwrap()) as usize;
                    let mut data = vec![0u8; length];
                    read_exact_at(file, &mut data, payload_pos + 24)?;
                    let resource = lookup(&id_map, id)?;
                    let position = page * resource.page_size() as u64 + offset;
                    resource.persist_write(position, &data)?;
                }
                TAG_RESOURCE_SIZE_CHANGE => {
                    let mut head = [0u8; 16];
                    read_exact_at(file, &mut head, payload_pos)?;
                    let id = u64::from_be_bytes(head[0..8].try_into().unwrap());
                    let new_size = u64::from_be_bytes(head[8..16].try_into().unwrap());
                    lookup(&id_map, id)?.persist_set_size(new_size)?;
                }
                TAG_RESOURCE_DELETE => {
                    let mut head = [0u8; 8];
                    read_exact_at(file, &mut head, payload_pos)?;
                    let id = u64::from_be_bytes(head);
                    lookup(&id_map, id)?.persist_delete()?;
                }
                TAG_CHECKPOINT => {}
                other => {
                    return Err(Error::with_message(
                        ErrorCode::Corrupt,
                        format!("unknown journal record kind {} during replay", other),
                    ));
                }
            }
            pos = payload_pos + payload_len;
        }

        for resource in &touched {
            resource.persist_sync();
        }
        inner.persisted = true;
        Ok(())
    }
}

fn lookup(
    id_map: &HashMap<u64, Arc<JournaledResource>>,
    id: u64,
) -> Result<&Arc<JournaledResource>> {
    id_map.get(&id).ok_or_else(|| {
        Error::with_message(
            ErrorCode::Corrupt,
            format!("journal record references untagged resource id {}", id),
        )
    })
}

/// Append one framed record; returns the record's file position.
fn append_record(inner: &mut JournalInner, kind: u64, payload: &[u8]) -> Result<u64> {
    let file = inner
        .file
        .as_ref()
        .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "journal already closed"))?;
    let position = inner.size;
    let mut record = Vec::with_capacity(12 + payload.len());
    record.extend_from_slice(&kind.to_be_bytes());
    record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    record.extend_from_slice(payload);
    os::write_at(file, &record, position)?;
    inner.size += record.len() as u64;
    Ok(position)
}

fn read_exact_at(file: &File, buf: &mut [u8], position: u64) -> Result<()> {
    let n = os::read_at(file, buf, position)?;
    if n != buf.len() {
        return Err(Error::with_message(
            ErrorCode::Corrupt,
            "journal record truncated",
        ));
    }
    Ok(())
}

/// Walk the record stream tracking the last checkpoint and the tagged
/// resource names. An unknown tag or a truncated tail ends the scan
/// quietly; everything after it is unreachable by replay anyway.
fn scan_records(file: &File, journal_number: u64, file_size: u64) -> Result<JournalSummary> {
    let mut pos = JOURNAL_HEADER_SIZE;
    let mut last_checkpoint = None;
    let mut resource_names = Vec::new();

    loop {
        if pos + RECORD_FRAMING > file_size {
            break;
        }
        let mut framing = [0u8; 12];
        read_exact_at(file, &mut framing, pos)?;
        let kind = u64::from_be_bytes(framing[0..8].try_into().unwrap());
        let payload_len = u32::from_be_bytes(framing[8..12].try_into().unwrap()) as u64;
        if pos + RECORD_FRAMING + payload_len > file_size {
            break;
        }
        match kind {
            TAG_CHECKPOINT => {
                last_checkpoint = Some(pos + RECORD_FRAMING + payload_len);
            }
            TAG_RESOURCE_NAME => {
                let mut head = [0u8; 12];
                read_exact_at(file, &mut head, pos + RECORD_FRAMING)?;
                let name_len = u32::from_be_bytes(head[8..12].try_into().unwrap()) as u64;
                if 12 + name_len * 2 > payload_len {
                    break;
                }
                let mut chars = vec![0u8; name_len as usize * 2];
                read_exact_at(file, &mut chars, pos + RECORD_FRAMING + 12)?;
                let units: Vec<u16> = chars
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                match String::from_utf16(&units) {
                    Ok(name) => resource_names.push(name),
                    Err(_) => break,
                }
            }
            TAG_PAGE_MODIFICATION | TAG_RESOURCE_SIZE_CHANGE | TAG_RESOURCE_DELETE => {}
            _ => break,
        }
        pos += RECORD_FRAMING + payload_len;
    }

    Ok(JournalSummary {
        journal_number,
        can_be_recovered: last_checkpoint.is_some(),
        last_checkpoint: last_checkpoint.unwrap_or(JOURNAL_HEADER_SIZE),
        resource_names,
    })
}

// ============================================================================
// JournalEntry
// ============================================================================

/// A pinned reference to one page-modification record. While an entry
/// is alive its journal file cannot be closed or deleted.
pub struct JournalEntry {
    resource_name: String,
    journal: Arc<JournalFile>,
    position: u64,
    page_number: PageNumber,
}

impl JournalEntry {
    /// Name of the resource the record belongs to
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// The journal holding the record
    pub fn journal(&self) -> &Arc<JournalFile> {
        &self.journal
    }

    /// File position of the record's kind field
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Page the record modifies
    pub fn page_number(&self) -> PageNumber {
        self.page_number
    }
}

impl Drop for JournalEntry {
    fn drop(&mut self) {
        if let Err(err) = self.journal.remove_reference() {
            warn!("journal reference release failed: {}", err);
        }
    }
}
