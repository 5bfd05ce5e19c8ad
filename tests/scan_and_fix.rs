//! Structural repair of damaged boundary tags.

use std::fs::OpenOptions;

use binstore::{AllocatingStore, SliceStoreData, UserTerminal};
use tempfile::tempdir;

/// Terminal that records everything and approves every repair.
#[derive(Default)]
struct RecordingTerminal {
    lines: Vec<String>,
    questions: Vec<String>,
}

impl UserTerminal for RecordingTerminal {
    fn print(&mut self, message: &str) {
        self.lines.push(message.to_string());
    }

    fn println(&mut self, message: &str) {
        self.lines.push(message.to_string());
    }

    fn ask(&mut self, question: &str) -> bool {
        self.questions.push(question.to_string());
        true
    }
}

fn write_u64(path: &std::path::Path, offset: u64, value: u64) {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&value.to_be_bytes()).unwrap();
}

#[test]
fn test_repair_of_damaged_free_area() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.bst");

    // Four areas; freeing the middle two coalesces them into one free
    // area wedged between live neighbours
    let (a1, a2, a4, file_size) = {
        let store = AllocatingStore::new(SliceStoreData::new(&path, 1 << 30));
        store.open(false).unwrap();
        let a1 = store.create_area(64).unwrap().finish().unwrap();
        let a2 = store.create_area(64).unwrap().finish().unwrap();
        let a3 = store.create_area(64).unwrap().finish().unwrap();
        let a4 = store.create_area(64).unwrap().finish().unwrap();
        store.delete_area(a2).unwrap();
        store.delete_area(a3).unwrap();
        assert_eq!(store.get_all_areas().unwrap(), vec![a1, a4]);
        store.close().unwrap();
        let size = std::fs::metadata(&path).unwrap().len();
        (a1, a2, a4, size)
    };

    // Smash the free area's header; its footer stays intact
    write_u64(&path, a2 as u64, 0xDEAD_BEEF);

    // A normal walk now fails
    {
        let store = AllocatingStore::new(SliceStoreData::new(&path, 1 << 30));
        store.open(false).unwrap();
        assert!(store.get_all_areas().is_err());
        store.close().unwrap();
    }

    // Repair reconstructs the damaged region as one free area
    let store = AllocatingStore::new(SliceStoreData::new(&path, 1 << 30));
    let mut terminal = RecordingTerminal::default();
    store.open_scan_and_fix(&mut terminal).unwrap();
    assert!(!terminal.questions.is_empty(), "repair should confirm");

    assert_eq!(store.get_all_areas().unwrap(), vec![a1, a4]);

    // The repaired free slot is immediately allocatable without
    // growing the store
    let replacement = store.create_area(120).unwrap().finish().unwrap();
    assert_eq!(replacement, a2);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), file_size);
    store.close().unwrap();
}

#[test]
fn test_repair_of_clean_store_proposes_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.bst");

    let ids = {
        let store = AllocatingStore::new(SliceStoreData::new(&path, 1 << 30));
        store.open(false).unwrap();
        let ids: Vec<_> = (0..5)
            .map(|_| store.create_area(80).unwrap().finish().unwrap())
            .collect();
        store.close().unwrap();
        ids
    };

    let store = AllocatingStore::new(SliceStoreData::new(&path, 1 << 30));
    let mut terminal = RecordingTerminal::default();
    store.open_scan_and_fix(&mut terminal).unwrap();
    assert!(terminal.questions.is_empty());
    assert_eq!(store.get_all_areas().unwrap(), ids);
    store.close().unwrap();
}

#[test]
fn test_repair_trusts_a_mismatched_header_when_the_tiling_works() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("store.bst");

    let (a1, a2) = {
        let store = AllocatingStore::new(SliceStoreData::new(&path, 1 << 30));
        store.open(false).unwrap();
        let a1 = store.create_area(64).unwrap().finish().unwrap();
        let a2 = store.create_area(64).unwrap().finish().unwrap();
        store.close().unwrap();
        (a1, a2)
    };

    // Corrupt the first area's footer only: header and the rest of
    // the tiling stay consistent, so the head hypothesis wins
    write_u64(&path, a2 as u64 - 8, 0x9999_9998);

    let store = AllocatingStore::new(SliceStoreData::new(&path, 1 << 30));
    let mut terminal = RecordingTerminal::default();
    store.open_scan_and_fix(&mut terminal).unwrap();
    assert_eq!(store.get_all_areas().unwrap(), vec![a1, a2]);
    store.close().unwrap();
}
