//! Persistent balanced search-tree operations
//!
//! Every mutation materializes the touched nodes as new blocks and returns a
//! new root CID. Prior roots stay valid and reachable until the host garbage
//! collects them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid as IpldCid;
use parking_lot::RwLock;
use smol_str::SmolStr;

use super::node::{self, Node};
use crate::error::{Result, StoreError};
use crate::storage::{BlockStore, compute_cid};

/// A key/value-CID pair produced by range traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Full key
    pub key: SmolStr,
    /// CID of the payload
    pub value: IpldCid,
}

/// Per-operation node cache
///
/// Memoizes blocks read during a single call and buffers freshly-minted
/// nodes so one `put_many` flushes them at operation end. Local to the call,
/// never shared; dropped when the operation returns. A failed or abandoned
/// operation therefore persists nothing.
#[derive(Debug, Default)]
struct NodeCache {
    nodes: HashMap<IpldCid, Arc<Node>>,
    minted: Vec<(IpldCid, Bytes)>,
}

impl NodeCache {
    fn new() -> Self {
        Self::default()
    }

    fn take_minted(&mut self) -> Vec<(IpldCid, Bytes)> {
        std::mem::take(&mut self.minted)
    }
}

/// Persistent, AVL-balanced, content-addressed ordered map
///
/// The tree holds its current root CID under a read/write lock; operations
/// work against a snapshot of that root and advance it only after every new
/// block has been persisted. `None` is the empty tree.
///
/// # Architecture
///
/// Nodes are value types decoded out of immutable blocks and owned
/// transiently by a per-operation [`NodeCache`]; children are referenced by
/// CID, never by owning pointer. Mutations rebuild the path from the touched
/// leaf to the root, rebalancing on the unwind, then flush all minted blocks
/// in one batch.
#[derive(Debug, Clone)]
pub struct Mst<S: BlockStore> {
    /// Block storage for loading/saving nodes (shared via Arc)
    storage: Arc<S>,

    /// Current root CID; `None` for the empty tree
    root: Arc<RwLock<Option<IpldCid>>>,
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Create an empty tree
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            root: Arc::new(RwLock::new(None)),
        }
    }

    /// Adopt `root` after checking that it resolves
    ///
    /// Does not traverse the tree; only the root block's presence is
    /// verified. Use [`Mst::verify`] for a full invariant sweep.
    pub async fn load(storage: Arc<S>, root: Option<IpldCid>) -> Result<Self> {
        if let Some(cid) = root {
            if !storage.has(&cid).await? {
                return Err(StoreError::not_found("tree root", cid));
            }
        }
        Ok(Self::with_root(storage, root))
    }

    /// Adopt `root` without touching storage
    ///
    /// For roots already trusted by the caller, e.g. read back out of a
    /// catalog block this process wrote.
    pub fn with_root(storage: Arc<S>, root: Option<IpldCid>) -> Self {
        Self {
            storage,
            root: Arc::new(RwLock::new(root)),
        }
    }

    /// Current root CID (`None` when empty)
    pub fn root(&self) -> Option<IpldCid> {
        *self.root.read()
    }

    /// Shared reference to the block storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Digest of the root node, or empty bytes for an empty tree
    ///
    /// Depends only on logical contents, not insertion order.
    pub async fn root_hash(&self) -> Result<Bytes> {
        let root = self.root();
        match root {
            Some(cid) => {
                let mut cache = NodeCache::new();
                let node = self.load_node(&mut cache, &cid).await?;
                Ok(node.hash.clone())
            }
            None => Ok(Bytes::new()),
        }
    }

    /// Insert or replace a key
    ///
    /// Returns the new root CID. Replacing a key with a new value changes the
    /// root CID even though the shape is unchanged, because the digest chain
    /// re-hashes up the path.
    pub async fn put(&self, key: &str, value: IpldCid) -> Result<IpldCid> {
        node::validate_key(key)?;
        node::validate_value(&value)?;

        let root = self.root();
        let mut cache = NodeCache::new();
        let new_root = self.insert_rec(&mut cache, root, key, value).await?;
        self.storage.put_many(cache.take_minted()).await?;
        *self.root.write() = Some(new_root);
        Ok(new_root)
    }

    /// Remove a key
    ///
    /// Returns the new root and whether anything was removed. An absent key
    /// leaves the root unchanged and reports `removed = false`.
    pub async fn delete(&self, key: &str) -> Result<(Option<IpldCid>, bool)> {
        node::validate_key(key)?;

        let root = self.root();
        let mut cache = NodeCache::new();
        let (new_root, removed) = self.delete_rec(&mut cache, root, key).await?;
        if !removed {
            return Ok((root, false));
        }
        self.storage.put_many(cache.take_minted()).await?;
        *self.root.write() = new_root;
        Ok((new_root, true))
    }

    /// Look up a key by iterative descent
    pub async fn get(&self, key: &str) -> Result<Option<IpldCid>> {
        node::validate_key(key)?;

        let mut cache = NodeCache::new();
        let mut cursor = self.root();
        while let Some(cid) = cursor {
            let n = self.load_node(&mut cache, &cid).await?;
            cursor = match key.cmp(n.key.as_str()) {
                std::cmp::Ordering::Equal => return Ok(Some(n.value)),
                std::cmp::Ordering::Less => n.left,
                std::cmp::Ordering::Greater => n.right,
            };
        }
        Ok(None)
    }

    /// In-order entries with `start <= key <= end`
    ///
    /// An empty bound is unbounded on that side; `start > end` yields no
    /// entries. Subtrees wholly outside the bounds are pruned, not visited.
    pub async fn range(&self, start: &str, end: &str) -> Result<Vec<Entry>> {
        if !start.is_empty() && !end.is_empty() && start > end {
            return Ok(Vec::new());
        }

        let root = self.root();
        let mut cache = NodeCache::new();
        let mut out = Vec::new();
        self.range_rec(&mut cache, root, start, end, &mut out)
            .await?;
        Ok(out)
    }

    /// Number of entries (walks the whole tree)
    pub async fn len(&self) -> Result<usize> {
        Ok(self.range("", "").await?.len())
    }

    /// Whether the tree holds no entries
    pub fn is_empty(&self) -> bool {
        self.root().is_none()
    }

    /// CIDs of the nodes visited descending from the root toward `key`
    ///
    /// With `found = true` the last CID is the node holding `key`, and the
    /// list is a verifiable inclusion witness. With `found = false` the list
    /// is the explored frontier, witnessing non-inclusion.
    pub async fn inclusion_path(&self, key: &str) -> Result<(Vec<IpldCid>, bool)> {
        node::validate_key(key)?;

        let mut cache = NodeCache::new();
        let mut path = Vec::new();
        let mut cursor = self.root();
        while let Some(cid) = cursor {
            path.push(cid);
            let n = self.load_node(&mut cache, &cid).await?;
            cursor = match key.cmp(n.key.as_str()) {
                std::cmp::Ordering::Equal => return Ok((path, true)),
                std::cmp::Ordering::Less => n.left,
                std::cmp::Ordering::Greater => n.right,
            };
        }
        Ok((path, false))
    }

    /// Re-check every invariant of the current tree
    ///
    /// Recomputes digests bottom-up, checks stored heights, AVL balance and
    /// BST order for every reachable node. Returns the entry count.
    pub async fn verify(&self) -> Result<u64> {
        let root = self.root();
        let mut cache = NodeCache::new();
        match root {
            Some(cid) => {
                let (_, _, count) = self.verify_rec(&mut cache, cid, None, None).await?;
                Ok(count)
            }
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // Internals: all take the per-operation cache.
    // ------------------------------------------------------------------

    /// Load a node through the cache
    async fn load_node(&self, cache: &mut NodeCache, cid: &IpldCid) -> Result<Arc<Node>> {
        if let Some(n) = cache.nodes.get(cid) {
            return Ok(n.clone());
        }
        let bytes = self
            .storage
            .get(cid)
            .await?
            .ok_or_else(|| StoreError::not_found("tree node", cid))?;
        let node = Arc::new(Node::from_cbor(&bytes)?);
        cache.nodes.insert(*cid, node.clone());
        Ok(node)
    }

    /// Build a node from parts, recomputing height and digest from children
    ///
    /// The block is buffered in the cache; nothing hits storage until the
    /// operation flushes.
    async fn mint(
        &self,
        cache: &mut NodeCache,
        key: SmolStr,
        value: IpldCid,
        left: Option<IpldCid>,
        right: Option<IpldCid>,
    ) -> Result<IpldCid> {
        let left_node = match left {
            Some(cid) => Some(self.load_node(cache, &cid).await?),
            None => None,
        };
        let right_node = match right {
            Some(cid) => Some(self.load_node(cache, &cid).await?),
            None => None,
        };

        let height = 1 + left_node
            .as_ref()
            .map(|n| n.height)
            .unwrap_or(0)
            .max(right_node.as_ref().map(|n| n.height).unwrap_or(0));
        let hash = node::compute_digest(
            key.as_str(),
            &value,
            left_node.as_ref().map(|n| n.hash.as_ref()),
            right_node.as_ref().map(|n| n.hash.as_ref()),
        );

        let node = Node {
            hash,
            height,
            key,
            left,
            right,
            value,
        };
        let cbor = node.to_cbor()?;
        let cid = compute_cid(&cbor)?;
        cache.nodes.insert(cid, Arc::new(node));
        cache.minted.push((cid, Bytes::from(cbor)));
        Ok(cid)
    }

    /// Height of an optional subtree
    async fn subtree_height(
        &self,
        cache: &mut NodeCache,
        cid: Option<IpldCid>,
    ) -> Result<u64> {
        match cid {
            Some(cid) => Ok(self.load_node(cache, &cid).await?.height),
            None => Ok(0),
        }
    }

    /// Rotate left around `x`: requires a defined right child
    async fn rotate_left(&self, cache: &mut NodeCache, x_cid: IpldCid) -> Result<IpldCid> {
        let x = self.load_node(cache, &x_cid).await?;
        let y_cid = x
            .right
            .ok_or_else(|| StoreError::corrupted("rotate-left requires a right child"))?;
        let y = self.load_node(cache, &y_cid).await?;

        let new_x = self
            .mint(cache, x.key.clone(), x.value, x.left, y.left)
            .await?;
        self.mint(cache, y.key.clone(), y.value, Some(new_x), y.right)
            .await
    }

    /// Rotate right around `x`: requires a defined left child
    async fn rotate_right(&self, cache: &mut NodeCache, x_cid: IpldCid) -> Result<IpldCid> {
        let x = self.load_node(cache, &x_cid).await?;
        let y_cid = x
            .left
            .ok_or_else(|| StoreError::corrupted("rotate-right requires a left child"))?;
        let y = self.load_node(cache, &y_cid).await?;

        let new_x = self
            .mint(cache, x.key.clone(), x.value, y.right, x.right)
            .await?;
        self.mint(cache, y.key.clone(), y.value, y.left, Some(new_x))
            .await
    }

    /// Persist a node-to-be after a child update, rebalancing if needed
    ///
    /// `key`/`value` plus updated child pointers describe the node before any
    /// rotation; the balance factor decides whether it persists as-is or the
    /// subtree pivots around a child.
    async fn balance(
        &self,
        cache: &mut NodeCache,
        key: SmolStr,
        value: IpldCid,
        left: Option<IpldCid>,
        right: Option<IpldCid>,
    ) -> Result<IpldCid> {
        let lh = self.subtree_height(cache, left).await? as i64;
        let rh = self.subtree_height(cache, right).await? as i64;
        let bf = lh - rh;

        if bf > 1 {
            let Some(l_cid) = left else {
                return Err(StoreError::corrupted("positive balance without left child"));
            };
            let l = self.load_node(cache, &l_cid).await?;
            let l_bf = self.subtree_height(cache, l.left).await? as i64
                - self.subtree_height(cache, l.right).await? as i64;
            // LR case: left child leans right, rotate it left first.
            let l_cid = if l_bf < 0 {
                self.rotate_left(cache, l_cid).await?
            } else {
                l_cid
            };
            // Rotate right: the (unpersisted) self descends to the right.
            let l = self.load_node(cache, &l_cid).await?;
            let new_self = self.mint(cache, key, value, l.right, right).await?;
            self.mint(cache, l.key.clone(), l.value, l.left, Some(new_self))
                .await
        } else if bf < -1 {
            let Some(r_cid) = right else {
                return Err(StoreError::corrupted("negative balance without right child"));
            };
            let r = self.load_node(cache, &r_cid).await?;
            let r_bf = self.subtree_height(cache, r.left).await? as i64
                - self.subtree_height(cache, r.right).await? as i64;
            // RL case: right child leans left, rotate it right first.
            let r_cid = if r_bf > 0 {
                self.rotate_right(cache, r_cid).await?
            } else {
                r_cid
            };
            let r = self.load_node(cache, &r_cid).await?;
            let new_self = self.mint(cache, key, value, left, r.left).await?;
            self.mint(cache, r.key.clone(), r.value, Some(new_self), r.right)
                .await
        } else {
            self.mint(cache, key, value, left, right).await
        }
    }

    /// Recursive insert, rebalancing on the unwind
    fn insert_rec<'a>(
        &'a self,
        cache: &'a mut NodeCache,
        node: Option<IpldCid>,
        key: &'a str,
        value: IpldCid,
    ) -> Pin<Box<dyn Future<Output = Result<IpldCid>> + Send + 'a>> {
        Box::pin(async move {
            let Some(cid) = node else {
                return self
                    .mint(cache, SmolStr::new(key), value, None, None)
                    .await;
            };

            let n = self.load_node(cache, &cid).await?;
            match key.cmp(n.key.as_str()) {
                std::cmp::Ordering::Equal => {
                    // Replace value in place; shape is untouched.
                    self.mint(cache, n.key.clone(), value, n.left, n.right)
                        .await
                }
                std::cmp::Ordering::Less => {
                    let new_left = self.insert_rec(&mut *cache, n.left, key, value).await?;
                    self.balance(cache, n.key.clone(), n.value, Some(new_left), n.right)
                        .await
                }
                std::cmp::Ordering::Greater => {
                    let new_right = self.insert_rec(&mut *cache, n.right, key, value).await?;
                    self.balance(cache, n.key.clone(), n.value, n.left, Some(new_right))
                        .await
                }
            }
        })
    }

    /// Smallest key in the subtree rooted at `cid`
    async fn min_node(&self, cache: &mut NodeCache, cid: IpldCid) -> Result<Arc<Node>> {
        let mut cur = self.load_node(cache, &cid).await?;
        while let Some(left) = cur.left {
            cur = self.load_node(cache, &left).await?;
        }
        Ok(cur)
    }

    /// Recursive delete, rebalancing on the unwind
    ///
    /// Returns the replacement subtree root plus whether the key was found;
    /// a miss returns the original subtree untouched so no blocks are minted
    /// along unchanged paths.
    fn delete_rec<'a>(
        &'a self,
        cache: &'a mut NodeCache,
        node: Option<IpldCid>,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(Option<IpldCid>, bool)>> + Send + 'a>> {
        Box::pin(async move {
            let Some(cid) = node else {
                return Ok((None, false));
            };

            let n = self.load_node(cache, &cid).await?;
            match key.cmp(n.key.as_str()) {
                std::cmp::Ordering::Less => {
                    let (new_left, removed) = self.delete_rec(&mut *cache, n.left, key).await?;
                    if !removed {
                        return Ok((Some(cid), false));
                    }
                    let new_cid = self
                        .balance(cache, n.key.clone(), n.value, new_left, n.right)
                        .await?;
                    Ok((Some(new_cid), true))
                }
                std::cmp::Ordering::Greater => {
                    let (new_right, removed) =
                        self.delete_rec(&mut *cache, n.right, key).await?;
                    if !removed {
                        return Ok((Some(cid), false));
                    }
                    let new_cid = self
                        .balance(cache, n.key.clone(), n.value, n.left, new_right)
                        .await?;
                    Ok((Some(new_cid), true))
                }
                std::cmp::Ordering::Equal => match (n.left, n.right) {
                    (None, None) => Ok((None, true)),
                    (Some(only), None) | (None, Some(only)) => Ok((Some(only), true)),
                    (Some(left), Some(right)) => {
                        // Two children: splice in the in-order successor.
                        let succ = self.min_node(cache, right).await?;
                        let succ_key = succ.key.clone();
                        let succ_value = succ.value;
                        let (new_right, _) = self
                            .delete_rec(&mut *cache, Some(right), succ_key.as_str())
                            .await?;
                        let new_cid = self
                            .balance(cache, succ_key, succ_value, Some(left), new_right)
                            .await?;
                        Ok((Some(new_cid), true))
                    }
                },
            }
        })
    }

    /// In-order traversal with bound pruning
    fn range_rec<'a>(
        &'a self,
        cache: &'a mut NodeCache,
        node: Option<IpldCid>,
        start: &'a str,
        end: &'a str,
        out: &'a mut Vec<Entry>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(cid) = node else {
                return Ok(());
            };
            let n = self.load_node(cache, &cid).await?;
            let key = n.key.as_str();
            let after_start = start.is_empty() || key >= start;
            let before_end = end.is_empty() || key <= end;

            if after_start {
                self.range_rec(&mut *cache, n.left, start, end, &mut *out)
                    .await?;
            }
            if after_start && before_end {
                out.push(Entry {
                    key: n.key.clone(),
                    value: n.value,
                });
            }
            if before_end {
                self.range_rec(&mut *cache, n.right, start, end, &mut *out)
                    .await?;
            }
            Ok(())
        })
    }

    /// Recursive invariant check; returns (height, digest, entry count)
    fn verify_rec<'a>(
        &'a self,
        cache: &'a mut NodeCache,
        cid: IpldCid,
        lower: Option<&'a str>,
        upper: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<(u64, Bytes, u64)>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.load_node(cache, &cid).await?;
            let key = n.key.as_str();

            if lower.is_some_and(|b| key <= b) || upper.is_some_and(|b| key >= b) {
                return Err(StoreError::corrupted(format!(
                    "search order violated at key {:?}",
                    key
                )));
            }

            let (lh, lhash, lcount) = match n.left {
                Some(left) => {
                    let (h, hash, c) = self
                        .verify_rec(&mut *cache, left, lower, Some(key))
                        .await?;
                    (h, Some(hash), c)
                }
                None => (0, None, 0),
            };
            let (rh, rhash, rcount) = match n.right {
                Some(right) => {
                    let (h, hash, c) = self
                        .verify_rec(&mut *cache, right, Some(key), upper)
                        .await?;
                    (h, Some(hash), c)
                }
                None => (0, None, 0),
            };

            if (lh as i64 - rh as i64).abs() > 1 {
                return Err(StoreError::corrupted(format!(
                    "balance violated at key {:?}: |{} - {}| > 1",
                    key, lh, rh
                )));
            }
            let height = 1 + lh.max(rh);
            if n.height != height {
                return Err(StoreError::corrupted(format!(
                    "stored height {} at key {:?}, recomputed {}",
                    n.height, key, height
                )));
            }
            let digest = node::compute_digest(
                key,
                &n.value,
                lhash.as_deref(),
                rhash.as_deref(),
            );
            if digest != n.hash {
                return Err(StoreError::corrupted(format!(
                    "digest mismatch at key {:?}",
                    key
                )));
            }

            Ok((height, digest, lcount + rcount + 1))
        })
    }
}
