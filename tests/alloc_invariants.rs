//! Randomised allocator churn against an in-memory model.

use std::collections::HashMap;
use std::sync::Arc;

use binstore::{AllocatingStore, BufferManager, JournaledStoreData, StoreConfig};
use tempfile::tempdir;

/// Minimal deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 16
    }
}

fn fill_pattern(seed: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize + i * 31) as u8).collect()
}

#[test]
fn test_churn_preserves_every_live_area() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::new(dir.path())
        .with_page_size(1024)
        .with_max_pages(8);
    let buffers = Arc::new(BufferManager::new(&config));
    buffers.start().unwrap();
    let store = AllocatingStore::new(JournaledStoreData::new(Arc::clone(&buffers), "data.bst"));
    store.open(false).unwrap();

    let mut rng = Lcg(0xB1A5_ED5E_ED00_0001);
    let mut model: HashMap<i64, Vec<u8>> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();

    for round in 0..300 {
        let roll = rng.next();
        if order.len() > 6 && roll % 3 == 0 {
            let victim = order.remove((rng.next() as usize) % order.len());
            model.remove(&victim);
            store.delete_area(victim).unwrap();
        } else {
            let len = 16 + (rng.next() as usize) % 1200;
            let body = fill_pattern(rng.next(), len);
            let mut writer = store.create_area(len as u64).unwrap();
            writer.put_slice(&body).unwrap();
            let id = writer.finish().unwrap();
            model.insert(id, body);
            order.push(id);
        }

        if round % 25 == 0 {
            // The live set must tile the data area exactly
            let walked = store.get_all_areas().unwrap();
            assert_eq!(walked.len(), model.len(), "round {}", round);
            for id in model.keys() {
                assert!(walked.contains(id), "round {}: {} missing", round, id);
            }
        }
    }

    // Every surviving area still holds its exact bytes
    for (id, body) in &model {
        let mut area = store.get_area(*id).unwrap();
        let mut out = vec![0u8; body.len()];
        area.get_slice(&mut out).unwrap();
        assert_eq!(&out, body, "area {}", id);
    }

    store.close().unwrap();
    buffers.stop().unwrap();

    // And the whole state survives a reopen
    let buffers = Arc::new(BufferManager::new(&config));
    buffers.start().unwrap();
    let store = AllocatingStore::new(JournaledStoreData::new(Arc::clone(&buffers), "data.bst"));
    store.open(false).unwrap();
    assert!(store.last_close_clean());
    for (id, body) in &model {
        let mut area = store.get_area(*id).unwrap();
        let mut out = vec![0u8; body.len()];
        area.get_slice(&mut out).unwrap();
        assert_eq!(&out, body, "area {} after reopen", id);
    }
    store.close().unwrap();
    buffers.stop().unwrap();
}

#[test]
fn test_checkpoints_between_churn_rounds() {
    let dir = tempdir().unwrap();
    let config = StoreConfig::new(dir.path())
        .with_page_size(1024)
        .with_max_pages(8);
    let buffers = Arc::new(BufferManager::new(&config));
    buffers.start().unwrap();
    let store = AllocatingStore::new(JournaledStoreData::new(Arc::clone(&buffers), "data.bst"));
    store.open(false).unwrap();

    let mut rng = Lcg(0x00FA_CADE);
    let mut ids = Vec::new();
    for round in 0..40 {
        let len = 100 + (rng.next() as usize) % 3000;
        let mut writer = store.create_area(len as u64).unwrap();
        writer.put_slice(&fill_pattern(round, len)).unwrap();
        ids.push((writer.finish().unwrap(), round, len));
        if round % 5 == 4 {
            buffers.set_checkpoint(round % 10 == 9).unwrap();
        }
    }
    assert!(!buffers.persister_failed());

    for (id, round, len) in &ids {
        let mut area = store.get_area(*id).unwrap();
        let mut out = vec![0u8; *len];
        area.get_slice(&mut out).unwrap();
        assert_eq!(out, fill_pattern(*round, *len));
    }

    store.close().unwrap();
    buffers.stop().unwrap();
}
