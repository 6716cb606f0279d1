#![cfg(feature = "fjall")]

use bitnode_storage::fjall::{FjallOptions, FjallStore};
use bitnode_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_roundtrip_and_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let options = FjallOptions {
            sync_commits: true,
            ..FjallOptions::default()
        };
        let store = FjallStore::open_with_options(dir.path(), options).expect("open fjall");
        store.put(Column::Meta, b"key", b"value").expect("put");
        store.put(Column::SegmentHeight, b"seg:1", b"a").expect("put");
        store.put(Column::SegmentHeight, b"seg:2", b"b").expect("put");

        let hits = store.scan_prefix(Column::SegmentHeight, b"seg:").expect("scan");
        assert_eq!(hits.len(), 2);

        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"batch", b"ok");
        batch.delete(Column::Meta, b"key");
        store.write_batch(&batch).expect("commit");
    }

    let store = FjallStore::open(dir.path()).expect("reopen");
    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
}
