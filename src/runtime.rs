//! Launcher key-value store.
//!
//! Out-of-band exchange used only during bring-up: each PE publishes its
//! endpoint name and memory-region metadata, barriers, then reads every
//! other PE's entries. Values are fixed-width byte strings; a length
//! mismatch on `get` is an error and fatal at the init call sites.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvsError {
    #[error("key '{0}' not published by pe {1}")]
    Missing(String, usize),
    #[error("key '{key}' from pe {pe}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        key: String,
        pe: usize,
        expected: usize,
        actual: usize,
    },
    #[error("runtime failure: {0}")]
    Runtime(String),
}

pub trait RuntimeKvs: Send + Sync {
    /// This PE's rank in `[0, size)`.
    fn rank(&self) -> usize;

    /// World size, fixed for the run.
    fn size(&self) -> usize;

    /// Number of PEs co-located on this node.
    fn local_size(&self) -> usize;

    /// Publish `value` under `key` for this PE.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), KvsError>;

    /// Make all published entries visible and synchronize all PEs.
    fn barrier(&self) -> Result<(), KvsError>;

    /// Fetch `pe`'s value for `key`; must be exactly `len` bytes.
    fn get(&self, pe: usize, key: &str, len: usize) -> Result<Vec<u8>, KvsError>;
}

/// Decode a little-endian u64 value fetched from the store.
pub fn kvs_u64(bytes: &[u8], key: &str, pe: usize) -> Result<u64, KvsError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| KvsError::LengthMismatch {
        key: key.into(),
        pe,
        expected: 8,
        actual: bytes.len(),
    })?;
    Ok(u64::from_le_bytes(arr))
}
