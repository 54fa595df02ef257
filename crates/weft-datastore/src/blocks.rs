//! Engine-backed block storage
//!
//! Blocks share the engine's sorted keyspace with the KV data under a
//! distinct prefix, so a single durable file holds the whole platform.

use bytes::Bytes;
use cid::Cid as IpldCid;
use weft_repo::BlockStore;
use weft_repo::error::{Result as StoreResult, StoreError};

use crate::engine::Engine;

/// Durable [`BlockStore`] over the engine's block space
///
/// Cloning shares the underlying engine handle.
#[derive(Debug, Clone)]
pub struct EngineBlockStore {
    engine: Engine,
}

impl EngineBlockStore {
    /// Wrap an engine handle
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

impl BlockStore for EngineBlockStore {
    async fn get(&self, cid: &IpldCid) -> StoreResult<Option<Bytes>> {
        self.engine.block_get(cid).map_err(StoreError::backend)
    }

    async fn put(&self, data: &[u8]) -> StoreResult<IpldCid> {
        self.engine.block_put(data).map_err(StoreError::backend)
    }

    async fn has(&self, cid: &IpldCid) -> StoreResult<bool> {
        self.engine.block_has(cid).map_err(StoreError::backend)
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> StoreResult<()> {
        self.engine
            .block_put_many(blocks)
            .map_err(StoreError::backend)
    }

    async fn get_many(&self, cids: &[IpldCid]) -> StoreResult<Vec<Option<Bytes>>> {
        let mut results = Vec::with_capacity(cids.len());
        for cid in cids {
            results.push(self.engine.block_get(cid).map_err(StoreError::backend)?);
        }
        Ok(results)
    }

    async fn close(&self) -> StoreResult<()> {
        self.engine.flush().map_err(StoreError::backend)
    }
}
