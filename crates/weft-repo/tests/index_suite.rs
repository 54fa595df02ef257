//! Collection index end-to-end scenarios

use std::sync::Arc;

use cid::Cid;
use weft_repo::CollectionIndex;
use weft_repo::storage::{MemoryBlockStore, compute_cid};

fn test_cid(n: u64) -> Cid {
    compute_cid(&n.to_be_bytes()).unwrap()
}

fn index() -> CollectionIndex<MemoryBlockStore> {
    CollectionIndex::new(Arc::new(MemoryBlockStore::new()))
}

#[tokio::test]
async fn users_listing_and_witnesses() {
    let idx = index();
    idx.create_collection("users").await.unwrap();
    idx.put("users", "/users/alice", test_cid(1)).await.unwrap();
    idx.put("users", "/users/bob", test_cid(2)).await.unwrap();
    idx.put("users", "/users/charlie", test_cid(3)).await.unwrap();

    let entries = idx.list_collection("users").await.unwrap();
    assert_eq!(
        entries.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(),
        vec!["/users/alice", "/users/bob", "/users/charlie"]
    );

    let (path, found) = idx.inclusion_path("users", "/users/bob").await.unwrap();
    assert!(found);
    assert!(!path.is_empty());

    let (_, found) = idx.inclusion_path("users", "/users/zzz").await.unwrap();
    assert!(!found);
}

#[tokio::test]
async fn root_hash_depends_only_on_contents() {
    let a = index();
    a.create_collection("c").await.unwrap();
    a.put("c", "/1", test_cid(1)).await.unwrap();
    a.put("c", "/2", test_cid(2)).await.unwrap();
    a.put("c", "/3", test_cid(3)).await.unwrap();

    let b = index();
    b.create_collection("c").await.unwrap();
    b.put("c", "/3", test_cid(3)).await.unwrap();
    b.put("c", "/1", test_cid(1)).await.unwrap();
    b.put("c", "/2", test_cid(2)).await.unwrap();

    assert_eq!(
        a.collection_root_hash("c").await.unwrap(),
        b.collection_root_hash("c").await.unwrap()
    );
    assert_eq!(a.global_root(), b.global_root());
}

#[tokio::test]
async fn independent_collections_do_not_interfere() {
    let idx = index();
    idx.create_collection("posts").await.unwrap();
    idx.create_collection("users").await.unwrap();

    idx.put("posts", "/posts/1", test_cid(10)).await.unwrap();
    let users_hash = idx.collection_root_hash("users").await.unwrap();
    assert!(users_hash.is_empty());

    idx.put("users", "/users/alice", test_cid(1)).await.unwrap();
    assert_eq!(idx.list_collection("posts").await.unwrap().len(), 1);
    assert_eq!(idx.list_collection("users").await.unwrap().len(), 1);
}

#[tokio::test]
async fn reload_from_global_root_preserves_everything() {
    let storage = Arc::new(MemoryBlockStore::new());
    let idx = CollectionIndex::new(storage.clone());
    idx.create_collection("users").await.unwrap();
    idx.create_collection("empty").await.unwrap();
    let root = idx.put("users", "/users/alice", test_cid(1)).await.unwrap();

    let reloaded = CollectionIndex::load(storage, Some(root)).await.unwrap();
    let names: Vec<_> = reloaded
        .collections()
        .into_iter()
        .map(|(n, _)| n.to_string())
        .collect();
    assert_eq!(names, vec!["empty", "users"]);
    assert!(reloaded.collection_root_hash("empty").await.unwrap().is_empty());
    assert_eq!(
        reloaded.get("users", "/users/alice").await.unwrap(),
        Some(test_cid(1))
    );
}
