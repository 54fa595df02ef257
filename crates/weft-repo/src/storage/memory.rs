//! In-memory block storage implementation

use crate::error::Result;
use crate::storage::BlockStore;
use bytes::Bytes;
use cid::Cid as IpldCid;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Block storage held entirely in memory
///
/// The backing map is shared across clones, so a tree and the index built
/// over it see the same blocks. Nothing survives the last clone: use the
/// datastore crate's engine-backed store when roots must outlive the
/// process. Suited to tests and to scratch trees built up purely to compute
/// a root.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<BTreeMap<IpldCid, Bytes>>>,
}

impl MemoryBlockStore {
    /// Create new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blocks held
    ///
    /// Content addressing dedupes: re-putting the same bytes never grows
    /// this count.
    pub fn len(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    /// Whether no blocks are held
    pub fn is_empty(&self) -> bool {
        self.blocks.read().unwrap().is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().unwrap().get(cid).cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = crate::storage::compute_cid(data)?;
        // Same bytes, same CID: only copy on first sight.
        self.blocks
            .write()
            .unwrap()
            .entry(cid)
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.blocks.read().unwrap().contains_key(cid))
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        self.blocks.write().unwrap().extend(blocks);
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let map = self.blocks.read().unwrap();
        Ok(cids.iter().map(|cid| map.get(cid).cloned()).collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
