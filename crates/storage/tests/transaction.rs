use bitnode_storage::memory::MemoryStore;
use bitnode_storage::{transaction, Column, KeyValueStore, StoreError};

#[derive(Debug)]
enum TestError {
    Rejected,
    Store(StoreError),
}

impl From<StoreError> for TestError {
    fn from(err: StoreError) -> Self {
        TestError::Store(err)
    }
}

#[test]
fn committed_body_is_visible() {
    let store = MemoryStore::new();
    let value = transaction(&store, |batch| {
        batch.put(Column::Meta, b"a", b"1");
        batch.put(Column::Utxo, b"b", b"2");
        Ok::<_, TestError>(7)
    })
    .expect("commit");
    assert_eq!(value, 7);
    assert_eq!(store.get(Column::Meta, b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.get(Column::Utxo, b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn failing_body_writes_nothing() {
    let store = MemoryStore::new();
    let result: Result<(), TestError> = transaction(&store, |batch| {
        batch.put(Column::Meta, b"a", b"1");
        Err(TestError::Rejected)
    });
    assert!(matches!(result, Err(TestError::Rejected)));
    assert_eq!(store.get(Column::Meta, b"a").unwrap(), None);
}

#[test]
fn failing_commit_surfaces_store_error() {
    let store = MemoryStore::new();
    store.set_fail_writes(true);
    let result = transaction(&store, |batch| {
        batch.put(Column::Meta, b"a", b"1");
        Ok::<_, TestError>(())
    });
    assert!(matches!(result, Err(TestError::Store(StoreError::Backend(_)))));
    store.set_fail_writes(false);
    assert_eq!(store.get(Column::Meta, b"a").unwrap(), None);
}
