//! Crash and recovery behaviour of the journalled store.
//!
//! A crash is simulated by dropping the whole session without closing
//! the store or stopping the buffer manager, then opening a fresh
//! session over the same directory.

use std::sync::Arc;

use binstore::{AllocatingStore, BufferManager, JournaledStoreData, StoreConfig};
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> StoreConfig {
    StoreConfig::new(dir).with_page_size(1024).with_max_pages(16)
}

fn open_session(
    dir: &std::path::Path,
) -> (Arc<BufferManager>, AllocatingStore<JournaledStoreData>) {
    let buffers = Arc::new(BufferManager::new(&config(dir)));
    buffers.start().unwrap();
    let store = AllocatingStore::new(JournaledStoreData::new(Arc::clone(&buffers), "data.bst"));
    store.open(false).unwrap();
    (buffers, store)
}

#[test]
fn test_crash_before_checkpoint_discards_the_area() {
    let dir = tempdir().unwrap();

    {
        let (buffers, store) = open_session(dir.path());
        // Make the initialised store and its open status durable
        buffers.set_checkpoint(false).unwrap();

        let mut writer = store.create_area(100).unwrap();
        writer.put_i32(0x0BAD_F00D).unwrap();
        let _id = writer.finish().unwrap();
        // Crash: neither checkpoint nor close
    }

    let (buffers, store) = open_session(dir.path());
    assert!(!store.last_close_clean());
    assert!(store.get_all_areas().unwrap().is_empty());
    store.close().unwrap();
    buffers.stop().unwrap();
}

#[test]
fn test_crash_after_checkpoint_preserves_the_area() {
    let dir = tempdir().unwrap();

    let id = {
        let (buffers, store) = open_session(dir.path());
        let mut writer = store.create_area(100).unwrap();
        writer.put_i32(0xCAFE_D00Du32 as i32).unwrap();
        let id = writer.finish().unwrap();
        buffers.set_checkpoint(false).unwrap();
        // Crash after the barrier
        id
    };

    let (buffers, store) = open_session(dir.path());
    assert!(!store.last_close_clean());
    assert_eq!(store.get_all_areas().unwrap(), vec![id]);
    let mut area = store.get_area(id).unwrap();
    assert_eq!(area.get_i32().unwrap() as u32, 0xCAFE_D00D);
    store.close().unwrap();
    buffers.stop().unwrap();
}

#[test]
fn test_flush_checkpoint_is_durable_through_rotation() {
    let dir = tempdir().unwrap();

    let id = {
        let (buffers, store) = open_session(dir.path());
        let mut writer = store.create_area(4096).unwrap();
        writer.put_slice(&[0xABu8; 4096]).unwrap();
        let id = writer.finish().unwrap();
        // flush_journals forces a rotation; the sealed journal must
        // still recover even if the persister never ran
        buffers.set_checkpoint(true).unwrap();
        id
    };

    let (buffers, store) = open_session(dir.path());
    let mut area = store.get_area(id).unwrap();
    let mut body = vec![0u8; 4096];
    area.get_slice(&mut body).unwrap();
    assert!(body.iter().all(|&b| b == 0xAB));
    store.close().unwrap();
    buffers.stop().unwrap();
}

#[test]
fn test_journal_replay_is_idempotent() {
    let dir = tempdir().unwrap();

    {
        let (buffers, store) = open_session(dir.path());
        let mut writer = store.create_area(500).unwrap();
        writer.put_slice(&[0x77u8; 500]).unwrap();
        writer.finish().unwrap();
        buffers.set_checkpoint(false).unwrap();
        // Crash, leaving the checkpointed journal on disk
    }

    // Keep a copy of the journal before recovery consumes it
    let journal_name = (10..=73u32)
        .map(|n| format!("jnl{}", n))
        .find(|name| dir.path().join(name).exists())
        .expect("a journal file from the crashed session");
    let journal_copy = std::fs::read(dir.path().join(&journal_name)).unwrap();

    // First replay
    {
        let (buffers, store) = open_session(dir.path());
        store.close().unwrap();
        buffers.stop().unwrap();
    }
    let after_first = std::fs::read(dir.path().join("data.bst")).unwrap();

    // Put the same journal back and replay it again over the already
    // recovered backing file
    std::fs::write(dir.path().join(&journal_name), &journal_copy).unwrap();
    {
        let (buffers, store) = open_session(dir.path());
        store.close().unwrap();
        buffers.stop().unwrap();
    }
    let after_second = std::fs::read(dir.path().join("data.bst")).unwrap();

    assert_eq!(after_first, after_second);
}

#[test]
fn test_clean_stop_leaves_no_journals() {
    let dir = tempdir().unwrap();

    {
        let (buffers, store) = open_session(dir.path());
        store.create_area(64).unwrap().finish().unwrap();
        store.close().unwrap();
        buffers.stop().unwrap();
    }

    let leftover: Vec<String> = (10..=73u32)
        .map(|n| format!("jnl{}", n))
        .filter(|name| dir.path().join(name).exists())
        .collect();
    assert!(leftover.is_empty(), "journals left behind: {:?}", leftover);
}
