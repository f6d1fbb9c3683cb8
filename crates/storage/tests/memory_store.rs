use stakeidx_storage::memory::MemoryStore;
use stakeidx_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn prefix_scan_is_ordered_and_column_scoped() {
    let store = MemoryStore::new();
    store.put(Column::EventHeight, b"\x00\x02b", b"").expect("put");
    store.put(Column::EventHeight, b"\x00\x01a", b"").expect("put");
    store.put(Column::EventHeight, b"\x01\x00c", b"").expect("put");
    store.put(Column::StakeBlock, b"\x00\x01z", b"").expect("put");

    let keys: Vec<Vec<u8>> = store
        .scan_prefix(Column::EventHeight, b"\x00")
        .expect("scan")
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(keys, vec![b"\x00\x01a".to_vec(), b"\x00\x02b".to_vec()]);
}

#[test]
fn visitor_can_stop_early() {
    let store = MemoryStore::new();
    for idx in 0u8..10 {
        store.put(Column::Coverage, &[idx], &[idx]).expect("put");
    }
    let mut seen = Vec::new();
    store
        .for_each_prefix(Column::Coverage, &[], &mut |key, _| {
            seen.push(key[0]);
            Ok(seen.len() < 3)
        })
        .expect("visit");
    assert_eq!(seen, vec![0, 1, 2]);
}

#[test]
fn batch_applies_puts_and_deletes() {
    let store = MemoryStore::new();
    store.put(Column::Meta, b"stale", b"1").expect("put");
    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"fresh", b"2".to_vec());
    batch.delete(Column::Meta, b"stale");
    store.write_batch(&batch).expect("commit");

    assert!(store.get(Column::Meta, b"stale").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"fresh").expect("get"),
        Some(b"2".to_vec())
    );
    assert_eq!(store.len(Column::Meta), 1);
}
