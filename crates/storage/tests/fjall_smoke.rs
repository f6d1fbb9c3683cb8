#![cfg(feature = "fjall")]

use std::time::{SystemTime, UNIX_EPOCH};

use stakeidx_storage::fjall::FjallStore;
use stakeidx_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_batch_survives_reopen() {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    dir.push(format!("stakeidx_fjall_smoke_{nanos}"));

    {
        let store = FjallStore::open(&dir).expect("open fjall");
        let mut batch = WriteBatch::new();
        batch.put(Column::Checkpoint, b"forward", b"cp".to_vec());
        batch.put(Column::StakeEvent, b"event:1", b"a".to_vec());
        batch.put(Column::StakeEvent, b"event:2", b"b".to_vec());
        store.write_batch(&batch).expect("commit");
    }

    let store = FjallStore::open(&dir).expect("reopen fjall");
    assert_eq!(
        store.get(Column::Checkpoint, b"forward").expect("get"),
        Some(b"cp".to_vec())
    );
    let events = store.scan_prefix(Column::StakeEvent, b"event:").expect("scan");
    assert_eq!(events.len(), 2);

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}
