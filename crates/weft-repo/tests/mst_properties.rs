//! Property-style tests for the Merkle Search Tree
//!
//! Exercises the tree the way the platform does: randomized interleavings of
//! put/delete, order-independence of roots, and witness generation.

use std::sync::Arc;

use cid::Cid;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use weft_repo::storage::{MemoryBlockStore, compute_cid};
use weft_repo::Mst;

fn test_cid(n: u64) -> Cid {
    compute_cid(&n.to_be_bytes()).unwrap()
}

fn tree() -> Mst<MemoryBlockStore> {
    Mst::new(Arc::new(MemoryBlockStore::new()))
}

#[tokio::test]
async fn random_interleaving_keeps_invariants() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mst = tree();
    let mut live = Vec::new();

    for step in 0..500u64 {
        if live.is_empty() || rng.gen_bool(0.7) {
            let key = format!("/keys/{:05}", rng.gen_range(0..2000));
            mst.put(&key, test_cid(step)).await.unwrap();
            if !live.contains(&key) {
                live.push(key);
            }
        } else {
            let idx = rng.gen_range(0..live.len());
            let key = live.swap_remove(idx);
            let (_, removed) = mst.delete(&key).await.unwrap();
            assert!(removed, "live key {} should be present", key);
        }
    }

    let count = mst.verify().await.unwrap();
    assert_eq!(count as usize, live.len());
}

#[tokio::test]
async fn replayed_multiset_shares_final_root() {
    // Insert 10 000 keys recording the root after each batch of 1 000, then
    // replay the same multiset in a different order into a fresh tree.
    let mut rng = StdRng::seed_from_u64(42);
    let mut keys: Vec<(String, Cid)> = (0..10_000u64)
        .map(|i| (format!("/bulk/{:08x}", rng.r#gen::<u32>() ^ (i as u32)), test_cid(i)))
        .collect();
    keys.sort_by(|a, b| a.0.cmp(&b.0));
    keys.dedup_by(|a, b| a.0 == b.0);

    let first = tree();
    let mut batch_roots = Vec::new();
    for (i, (key, value)) in keys.iter().enumerate() {
        first.put(key, *value).await.unwrap();
        if (i + 1) % 1000 == 0 {
            batch_roots.push(first.root().unwrap());
        }
    }
    // Roots advance monotonically through the batches.
    let mut deduped = batch_roots.clone();
    deduped.dedup();
    assert_eq!(deduped.len(), batch_roots.len());

    let mut shuffled = keys.clone();
    shuffled.shuffle(&mut rng);
    let second = tree();
    for (key, value) in &shuffled {
        second.put(key, *value).await.unwrap();
    }

    assert_eq!(first.root(), second.root());
}

#[tokio::test]
async fn get_after_put_and_delete() {
    let mst = tree();
    for i in 0..200u64 {
        let key = format!("/kv/{:03}", i);
        mst.put(&key, test_cid(i)).await.unwrap();
        assert_eq!(mst.get(&key).await.unwrap(), Some(test_cid(i)));
    }
    for i in 0..200u64 {
        let key = format!("/kv/{:03}", i);
        let (_, removed) = mst.delete(&key).await.unwrap();
        assert!(removed);
        assert_eq!(mst.get(&key).await.unwrap(), None);
    }
    assert!(mst.root().is_none());
}

#[tokio::test]
async fn witness_flips_after_delete() {
    let mst = tree();
    for i in 0..64u64 {
        mst.put(&format!("/w/{:02}", i), test_cid(i)).await.unwrap();
    }

    let (path, found) = mst.inclusion_path("/w/31").await.unwrap();
    assert!(found);
    assert!(!path.is_empty());

    mst.delete("/w/31").await.unwrap();
    let (path, found) = mst.inclusion_path("/w/31").await.unwrap();
    assert!(!found);
    assert!(!path.is_empty());
    mst.verify().await.unwrap();
}

#[tokio::test]
async fn root_hash_ignores_insertion_order() {
    let a = tree();
    let b = tree();
    let keys = ["/c", "/a", "/e", "/b", "/d"];
    for k in keys {
        a.put(k, test_cid(7)).await.unwrap();
    }
    for k in keys.iter().rev() {
        b.put(k, test_cid(7)).await.unwrap();
    }
    assert_eq!(a.root_hash().await.unwrap(), b.root_hash().await.unwrap());
}
