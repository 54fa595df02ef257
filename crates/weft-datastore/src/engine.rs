//! Embedded ordered KV engine
//!
//! A thin wrapper over sled that carves the sorted keyspace into logical
//! spaces by a one-byte physical prefix (user+system data vs CID blocks) and
//! frames every data value with its expiration instant so the engine itself
//! can answer TTL queries and hide expired entries on read.

use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use cid::Cid as IpldCid;
use smol_str::SmolStr;

use crate::error::{DatastoreError, Result};

/// Physical prefix for the user+system data space
const DATA_PREFIX: u8 = b'd';

/// Physical prefix for the CID block space
const BLOCK_PREFIX: u8 = b'b';

/// Width of the expiry header on framed data values
const FRAME_HEADER_LEN: usize = 8;

/// Maximum accepted value size in bytes
pub const MAX_VALUE_SIZE: usize = 512 << 20;

/// Expiration state of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationStatus {
    /// The key is not physically present
    Missing,
    /// The key is present and carries no TTL
    Unset,
    /// The key is present and expires (or expired) at this instant
    At(DateTime<Utc>),
}

/// One entry produced by a data-space scan
#[derive(Debug, Clone)]
pub struct ScanEntry {
    /// Logical key
    pub key: SmolStr,
    /// Stored value with the frame stripped
    pub value: Bytes,
    /// Expiration instant, if the entry carries one
    pub expires_at: Option<DateTime<Utc>>,
}

/// Durable ordered keyspace shared by the datastore and the blockstore
#[derive(Debug, Clone)]
pub struct Engine {
    db: sled::Db,
}

impl Engine {
    /// Open (or create) an engine at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Open an engine backed by temporary storage, reclaimed on drop
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Flush dirty buffers to durable storage
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data space
    // ------------------------------------------------------------------

    /// Read a key, hiding entries whose expiration has passed
    pub fn data_get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.db.get(data_key(key))? {
            Some(raw) => {
                let (value, expires_at) = decode_frame(&raw)?;
                if is_expired(expires_at, Utc::now()) {
                    return Ok(None);
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Read a key even if its expiration has passed (TTL finalization needs
    /// the last value best-effort)
    pub fn data_get_ignoring_expiry(&self, key: &str) -> Result<Option<Bytes>> {
        match self.db.get(data_key(key))? {
            Some(raw) => {
                let (value, _) = decode_frame(&raw)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Write a key with an optional expiration instant
    pub fn data_insert(
        &self,
        key: &str,
        value: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        check_value_size(value.len())?;
        self.db.insert(data_key(key), encode_frame(value, expires_at))?;
        Ok(())
    }

    /// Remove a key; reports whether it was physically present
    pub fn data_remove(&self, key: &str) -> Result<bool> {
        Ok(self.db.remove(data_key(key))?.is_some())
    }

    /// Whether a key is present and unexpired
    pub fn data_contains(&self, key: &str) -> Result<bool> {
        Ok(self.data_get(key)?.is_some())
    }

    /// Native expiration state of a key
    pub fn expiration(&self, key: &str) -> Result<ExpirationStatus> {
        match self.db.get(data_key(key))? {
            Some(raw) => {
                let (_, expires_at) = decode_frame(&raw)?;
                Ok(match expires_at {
                    Some(at) => ExpirationStatus::At(at),
                    None => ExpirationStatus::Unset,
                })
            }
            None => Ok(ExpirationStatus::Missing),
        }
    }

    /// Ordered scan of the data space under a logical key prefix
    ///
    /// Expired entries are skipped, matching `data_get` visibility.
    pub fn scan_data(&self, prefix: &str) -> DataScan {
        DataScan {
            inner: self.db.scan_prefix(data_key(prefix)),
        }
    }

    /// Apply a batch of data-space ops atomically
    pub fn apply_data_batch(&self, batch: DataBatch) -> Result<()> {
        self.db.apply_batch(batch.inner)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Block space
    // ------------------------------------------------------------------

    /// Read a block by CID
    pub fn block_get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self
            .db
            .get(block_key(cid))?
            .map(|raw| Bytes::copy_from_slice(&raw)))
    }

    /// Store a block, computing its CID
    pub fn block_put(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = weft_repo::compute_cid(data)?;
        self.db.insert(block_key(&cid), data)?;
        Ok(cid)
    }

    /// Whether a block is present
    pub fn block_has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.db.contains_key(block_key(cid))?)
    }

    /// Store many blocks in one atomic batch
    pub fn block_put_many(&self, blocks: impl IntoIterator<Item = (IpldCid, Bytes)>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (cid, data) in blocks {
            batch.insert(block_key(&cid), data.as_ref());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }
}

/// Accumulates data-space writes for one atomic apply
#[derive(Debug, Default)]
pub struct DataBatch {
    inner: sled::Batch,
}

impl DataBatch {
    /// New empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write
    pub fn insert(
        &mut self,
        key: &str,
        value: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        check_value_size(value.len())?;
        self.inner.insert(data_key(key), encode_frame(value, expires_at));
        Ok(())
    }

    /// Queue a removal
    pub fn remove(&mut self, key: &str) {
        self.inner.remove(data_key(key));
    }
}

/// Ordered iterator over unexpired data-space entries
pub struct DataScan {
    inner: sled::Iter,
}

impl Iterator for DataScan {
    type Item = Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (raw_key, raw_value) = match self.inner.next()? {
                Ok(kv) => kv,
                Err(e) => return Some(Err(e.into())),
            };
            let key = match logical_key(&raw_key) {
                Ok(k) => k,
                Err(e) => return Some(Err(e)),
            };
            let (value, expires_at) = match decode_frame(&raw_value) {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };
            if is_expired(expires_at, Utc::now()) {
                continue;
            }
            return Some(Ok(ScanEntry {
                key,
                value,
                expires_at,
            }));
        }
    }
}

// ------------------------------------------------------------------
// Key and frame encoding
// ------------------------------------------------------------------

fn data_key(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(DATA_PREFIX);
    out.extend_from_slice(key.as_bytes());
    out
}

fn block_key(cid: &IpldCid) -> Vec<u8> {
    let bytes = cid.to_bytes();
    let mut out = Vec::with_capacity(1 + bytes.len());
    out.push(BLOCK_PREFIX);
    out.extend_from_slice(&bytes);
    out
}

fn logical_key(raw: &[u8]) -> Result<SmolStr> {
    let body = raw
        .strip_prefix(&[DATA_PREFIX])
        .ok_or_else(|| DatastoreError::corrupted("data key outside the data space"))?;
    std::str::from_utf8(body)
        .map(SmolStr::new)
        .map_err(|e| DatastoreError::corrupted(format!("non-UTF-8 data key: {}", e)))
}

/// Frame layout: 8-byte big-endian expiry millis (0 = no expiry) ++ payload
fn encode_frame(value: &[u8], expires_at: Option<DateTime<Utc>>) -> Vec<u8> {
    let millis = expires_at.map(|at| at.timestamp_millis()).unwrap_or(0);
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + value.len());
    out.extend_from_slice(&millis.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_frame(raw: &[u8]) -> Result<(Bytes, Option<DateTime<Utc>>)> {
    if raw.len() < FRAME_HEADER_LEN {
        return Err(DatastoreError::corrupted(format!(
            "value frame is {} bytes, below header width",
            raw.len()
        )));
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&raw[..FRAME_HEADER_LEN]);
    let millis = i64::from_be_bytes(header);
    let expires_at = if millis == 0 {
        None
    } else {
        Some(
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| DatastoreError::corrupted("expiry millis out of range"))?,
        )
    };
    Ok((Bytes::copy_from_slice(&raw[FRAME_HEADER_LEN..]), expires_at))
}

fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|at| now >= at)
}

fn check_value_size(len: usize) -> Result<()> {
    if len > MAX_VALUE_SIZE {
        return Err(DatastoreError::invalid_input(format!(
            "value is {} bytes, max {}",
            len, MAX_VALUE_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> Engine {
        Engine::open_temporary().unwrap()
    }

    #[test]
    fn test_frame_round_trip() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        let encoded = encode_frame(b"payload", Some(at));
        let (value, expires_at) = decode_frame(&encoded).unwrap();
        assert_eq!(value.as_ref(), b"payload");
        assert_eq!(expires_at, Some(at));

        let encoded = encode_frame(b"", None);
        let (value, expires_at) = decode_frame(&encoded).unwrap();
        assert!(value.is_empty());
        assert_eq!(expires_at, None);
    }

    #[test]
    fn test_expired_entries_are_hidden() {
        let e = engine();
        let past = Utc::now() - Duration::seconds(5);
        e.data_insert("/k", b"v", Some(past)).unwrap();

        assert_eq!(e.data_get("/k").unwrap(), None);
        assert!(!e.data_contains("/k").unwrap());
        // The physical record is still there for finalization.
        assert_eq!(
            e.data_get_ignoring_expiry("/k").unwrap(),
            Some(Bytes::from_static(b"v"))
        );
        // The frame stores millisecond precision.
        assert!(matches!(
            e.expiration("/k").unwrap(),
            ExpirationStatus::At(at) if at.timestamp_millis() == past.timestamp_millis()
        ));
    }

    #[test]
    fn test_expiration_states() {
        let e = engine();
        assert_eq!(e.expiration("/nope").unwrap(), ExpirationStatus::Missing);

        e.data_insert("/plain", b"v", None).unwrap();
        assert_eq!(e.expiration("/plain").unwrap(), ExpirationStatus::Unset);
    }

    #[test]
    fn test_scan_orders_and_filters() {
        let e = engine();
        e.data_insert("/a/1", b"1", None).unwrap();
        e.data_insert("/a/2", b"2", Some(Utc::now() - Duration::seconds(1)))
            .unwrap();
        e.data_insert("/a/3", b"3", None).unwrap();
        e.data_insert("/b/1", b"x", None).unwrap();

        let keys: Vec<_> = e
            .scan_data("/a/")
            .map(|r| r.unwrap().key.to_string())
            .collect();
        assert_eq!(keys, vec!["/a/1", "/a/3"]);
    }

    #[test]
    fn test_spaces_do_not_collide() {
        let e = engine();
        e.data_insert("/k", b"data side", None).unwrap();
        let cid = e.block_put(b"block side").unwrap();

        assert_eq!(e.data_get("/k").unwrap(), Some(Bytes::from_static(b"data side")));
        assert_eq!(
            e.block_get(&cid).unwrap(),
            Some(Bytes::from_static(b"block side"))
        );
        // Scanning the whole data space never surfaces blocks.
        assert_eq!(e.scan_data("").count(), 1);
    }

    #[test]
    fn test_batch_apply() {
        let e = engine();
        e.data_insert("/gone", b"x", None).unwrap();

        let mut batch = DataBatch::new();
        batch.insert("/a", b"1", None).unwrap();
        batch.insert("/b", b"2", None).unwrap();
        batch.remove("/gone");
        e.apply_data_batch(batch).unwrap();

        assert!(e.data_contains("/a").unwrap());
        assert!(e.data_contains("/b").unwrap());
        assert!(!e.data_contains("/gone").unwrap());
    }

    #[test]
    fn test_oversized_value_rejected() {
        let e = engine();
        // Constructing 512 MiB in a unit test is wasteful; check the guard.
        assert!(check_value_size(MAX_VALUE_SIZE).is_ok());
        assert!(check_value_size(MAX_VALUE_SIZE + 1).is_err());
        drop(e);
    }
}
