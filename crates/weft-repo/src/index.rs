//! Collection index: a named catalog of tree roots
//!
//! The catalog is materialized as a single sorted map block; its CID is the
//! platform's global root and changes on any mutation to any collection.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid as IpldCid;
use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::error::{Result, StoreError};
use crate::mst::{Entry, Mst};
use crate::storage::BlockStore;

/// Catalog block contents: collection name to tree root
///
/// `None` encodes as an explicit `null`: a created-but-empty collection,
/// distinct from absence. `BTreeMap` iteration order gives the lexicographic
/// key order the encoding requires, so two indexes with identical logical
/// state share a CID.
type Catalog = BTreeMap<SmolStr, Option<IpldCid>>;

#[derive(Debug, Default)]
struct IndexState {
    root: Option<IpldCid>,
    collections: Catalog,
}

/// Named catalog of Merkle Search Tree roots
///
/// Owns a reference to the block store only; datastore state lives
/// elsewhere. Operations snapshot the catalog, run against storage, then
/// commit the re-materialized block; concurrent writers race at the commit
/// (last write wins), which matches the single-writer posture of the rest of
/// the platform.
#[derive(Debug)]
pub struct CollectionIndex<S: BlockStore> {
    storage: Arc<S>,
    state: RwLock<IndexState>,
}

impl<S: BlockStore + Sync + 'static> CollectionIndex<S> {
    /// Create an empty index with no materialized catalog block
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Load an index from a previously materialized catalog block
    pub async fn load(storage: Arc<S>, root: Option<IpldCid>) -> Result<Self> {
        let collections = match root {
            Some(cid) => {
                let bytes = storage
                    .get(&cid)
                    .await?
                    .ok_or_else(|| StoreError::not_found("catalog block", cid))?;
                serde_ipld_dagcbor::from_slice::<Catalog>(&bytes).map_err(|e| {
                    StoreError::corrupted(format!("undecodable catalog block: {}", e))
                })?
            }
            None => Catalog::new(),
        };

        Ok(Self {
            storage,
            state: RwLock::new(IndexState { root, collections }),
        })
    }

    /// CID of the current catalog block (`None` before the first mutation)
    pub fn global_root(&self) -> Option<IpldCid> {
        self.state.read().root
    }

    /// Collection names with their tree roots, in name order
    pub fn collections(&self) -> Vec<(SmolStr, Option<IpldCid>)> {
        self.state
            .read()
            .collections
            .iter()
            .map(|(name, root)| (name.clone(), *root))
            .collect()
    }

    /// Create a named collection with an empty tree
    ///
    /// Returns the new global root. Fails with `AlreadyExists` if the name
    /// is taken.
    pub async fn create_collection(&self, name: &str) -> Result<IpldCid> {
        validate_name(name)?;
        let mut catalog = {
            let state = self.state.read();
            if state.collections.contains_key(name) {
                return Err(StoreError::already_exists("collection", name));
            }
            state.collections.clone()
        };
        catalog.insert(SmolStr::new(name), None);
        self.commit(catalog).await
    }

    /// Drop a collection from the catalog
    ///
    /// The collection's tree blocks stay in storage, reachable from prior
    /// roots, until the host garbage collects them.
    pub async fn delete_collection(&self, name: &str) -> Result<IpldCid> {
        validate_name(name)?;
        let mut catalog = {
            let state = self.state.read();
            if !state.collections.contains_key(name) {
                return Err(StoreError::not_found("collection", name));
            }
            state.collections.clone()
        };
        catalog.remove(name);
        self.commit(catalog).await
    }

    /// Insert or replace `rkey` in the named collection
    ///
    /// Returns the new global root.
    pub async fn put(&self, name: &str, rkey: &str, value: IpldCid) -> Result<IpldCid> {
        let tree = self.collection_tree(name)?;
        let new_tree_root = tree.put(rkey, value).await?;

        let mut catalog = self.state.read().collections.clone();
        catalog.insert(SmolStr::new(name), Some(new_tree_root));
        self.commit(catalog).await
    }

    /// Remove `rkey` from the named collection
    ///
    /// Returns the (possibly unchanged) global root and whether the key was
    /// present.
    pub async fn delete(&self, name: &str, rkey: &str) -> Result<(IpldCid, bool)> {
        let tree = self.collection_tree(name)?;
        let (new_tree_root, removed) = tree.delete(rkey).await?;
        if !removed {
            let current = self
                .global_root()
                .ok_or_else(|| StoreError::not_found("catalog block", "unmaterialized"))?;
            return Ok((current, false));
        }

        let mut catalog = self.state.read().collections.clone();
        catalog.insert(SmolStr::new(name), new_tree_root);
        let root = self.commit(catalog).await?;
        Ok((root, true))
    }

    /// Look up `rkey` in the named collection
    pub async fn get(&self, name: &str, rkey: &str) -> Result<Option<IpldCid>> {
        self.collection_tree(name)?.get(rkey).await
    }

    /// All entries of the named collection in key order
    pub async fn list_collection(&self, name: &str) -> Result<Vec<Entry>> {
        self.collection_tree(name)?.range("", "").await
    }

    /// Node CIDs on the descent from the collection root toward `rkey`
    ///
    /// A verifiable witness that the key is (or is not) in the tree.
    pub async fn inclusion_path(&self, name: &str, rkey: &str) -> Result<(Vec<IpldCid>, bool)> {
        self.collection_tree(name)?.inclusion_path(rkey).await
    }

    /// Digest of the collection's root node (empty for an empty collection)
    ///
    /// Depends only on the collection's logical contents.
    pub async fn collection_root_hash(&self, name: &str) -> Result<Bytes> {
        self.collection_tree(name)?.root_hash().await
    }

    fn collection_tree(&self, name: &str) -> Result<Mst<S>> {
        validate_name(name)?;
        let state = self.state.read();
        let root = state
            .collections
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::not_found("collection", name))?;
        Ok(Mst::with_root(self.storage.clone(), root))
    }

    /// Materialize the catalog block and advance the global root
    async fn commit(&self, catalog: Catalog) -> Result<IpldCid> {
        let cbor = serde_ipld_dagcbor::to_vec(&catalog)
            .map_err(|e| StoreError::serialization(e))?;
        let root = self.storage.put(&cbor).await?;

        let mut state = self.state.write();
        state.root = Some(root);
        state.collections = catalog;
        Ok(root)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::invalid_input("collection name must be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBlockStore, compute_cid};

    fn test_cid(n: u32) -> IpldCid {
        compute_cid(&n.to_be_bytes()).unwrap()
    }

    fn index() -> CollectionIndex<MemoryBlockStore> {
        CollectionIndex::new(Arc::new(MemoryBlockStore::new()))
    }

    #[tokio::test]
    async fn test_create_conflicts_and_delete_missing() {
        let idx = index();
        idx.create_collection("users").await.unwrap();

        let err = idx.create_collection("users").await.unwrap_err();
        assert_eq!(*err.kind(), crate::error::StoreErrorKind::AlreadyExists);

        let err = idx.delete_collection("ghosts").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_empty_collection_is_distinct_from_absent() {
        let idx = index();
        idx.create_collection("users").await.unwrap();

        assert_eq!(idx.collection_root_hash("users").await.unwrap(), Bytes::new());
        assert!(idx.collection_root_hash("ghosts").await.unwrap_err().is_not_found());
        assert!(idx.list_collection("users").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_advances_global_root() {
        let idx = index();
        let r0 = idx.create_collection("users").await.unwrap();
        let r1 = idx.put("users", "/users/alice", test_cid(1)).await.unwrap();
        assert_ne!(r0, r1);
        assert_eq!(idx.global_root(), Some(r1));
        assert_eq!(
            idx.get("users", "/users/alice").await.unwrap(),
            Some(test_cid(1))
        );
    }

    #[tokio::test]
    async fn test_put_into_unknown_collection() {
        let idx = index();
        let err = idx.put("users", "/users/alice", test_cid(1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_reports_absence() {
        let idx = index();
        idx.create_collection("users").await.unwrap();
        let root = idx.put("users", "/users/alice", test_cid(1)).await.unwrap();

        let (unchanged, removed) = idx.delete("users", "/users/zzz").await.unwrap();
        assert!(!removed);
        assert_eq!(unchanged, root);

        let (changed, removed) = idx.delete("users", "/users/alice").await.unwrap();
        assert!(removed);
        assert_ne!(changed, root);
    }

    #[tokio::test]
    async fn test_catalog_determinism() {
        // Same logical state reached in different orders shares a CID.
        let a = index();
        a.create_collection("alpha").await.unwrap();
        a.create_collection("beta").await.unwrap();
        a.put("alpha", "/k", test_cid(1)).await.unwrap();

        let b = index();
        b.create_collection("beta").await.unwrap();
        b.create_collection("alpha").await.unwrap();
        b.put("alpha", "/k", test_cid(1)).await.unwrap();

        assert_eq!(a.global_root(), b.global_root());
    }

    #[tokio::test]
    async fn test_load_round_trip() {
        let storage = Arc::new(MemoryBlockStore::new());
        let idx = CollectionIndex::new(storage.clone());
        idx.create_collection("users").await.unwrap();
        let root = idx.put("users", "/users/alice", test_cid(1)).await.unwrap();

        let reloaded = CollectionIndex::load(storage, Some(root)).await.unwrap();
        assert_eq!(reloaded.global_root(), Some(root));
        assert_eq!(
            reloaded.get("users", "/users/alice").await.unwrap(),
            Some(test_cid(1))
        );
        assert_eq!(reloaded.collections().len(), 1);
    }
}
