//! Block storage abstraction for tree nodes and catalog blocks

use crate::error::Result;
use bytes::Bytes;
use cid::Cid as IpldCid;

/// Async block storage trait
///
/// Provides CID-keyed block storage for tree nodes, catalog blocks, and
/// record payloads. Implementations might use:
/// - In-memory BTreeMap ([`MemoryBlockStore`])
/// - An embedded ordered KV engine (the datastore crate provides one)
/// - Remote storage (user-provided)
///
/// Clone is required so the tree can share storage references across
/// operations.
#[trait_variant::make(Send)]
pub trait BlockStore: Clone {
    /// Get a block by CID
    ///
    /// Returns `None` if the block is not found.
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>>;

    /// Put a block, return its CID
    ///
    /// The CID is calculated from the data using SHA-256 hash and DAG-CBOR
    /// codec. Idempotent: the same data always produces the same CID.
    async fn put(&self, data: &[u8]) -> Result<IpldCid>;

    /// Check if a block exists without retrieving it
    async fn has(&self, cid: &IpldCid) -> Result<bool>;

    /// Put many blocks at once (optimization for batch writes)
    ///
    /// Implementations should optimize this for batch operations where
    /// possible. A simple implementation can just call `put()` individually.
    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()>;

    /// Get multiple blocks at once (optimization for batch reads)
    ///
    /// Returns a vec of the same length as the input, with `None` for
    /// missing blocks.
    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>>;

    /// Release resources held by the store
    ///
    /// Stored blocks stay readable through other clones of the store where
    /// the backing medium allows it; in-memory stores drop nothing.
    async fn close(&self) -> Result<()>;
}

pub mod memory;

pub use memory::MemoryBlockStore;

/// DAG-CBOR codec identifier for CIDs (0x71)
pub const DAG_CBOR_CID_CODEC: u64 = 0x71;

/// SHA2-256 multihash code (0x12)
pub const SHA2_256: u64 = 0x12;

/// Compute a CID from raw bytes
///
/// Uses SHA-256 hash and DAG-CBOR codec. Assumes data is already DAG-CBOR
/// encoded.
pub fn compute_cid(data: &[u8]) -> Result<IpldCid> {
    use sha2::{Digest, Sha256};

    let mut sha = Sha256::new();
    sha.update(data);
    let hash = sha.finalize().to_vec();
    let mh = multihash::Multihash::<64>::wrap(SHA2_256, hash.as_slice())
        .map_err(|e| crate::error::StoreError::corrupted(e.to_string()))?;

    Ok(IpldCid::new_v1(DAG_CBOR_CID_CODEC, mh))
}
