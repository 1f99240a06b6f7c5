//! Stock serializers
//!
//! - `RawSerializer`: byte vectors, copied verbatim
//! - `Utf8Serializer`: strings as UTF-8
//! - `BincodeSerializer<T>`: any serde type, bincode-encoded

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::BufMut;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{EpochError, Result};

use super::{BufferPool, PooledAtom, Serializer};

/// Pass-through serializer for `Vec<u8>` items
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSerializer;

impl Serializer for RawSerializer {
    type Item = Vec<u8>;
    type Source = Vec<u8>;

    fn serialize(&self, item: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(item.clone())
    }

    fn deserialize(&self, atom: &[u8]) -> Result<Vec<u8>> {
        Ok(atom.to_vec())
    }
}

/// UTF-8 string serializer writing into pooled buffers
#[derive(Clone)]
pub struct Utf8Serializer {
    pool: Arc<BufferPool>,
}

impl Utf8Serializer {
    pub fn new() -> Self {
        Self::with_pool(Arc::new(BufferPool::default()))
    }

    /// Share a buffer pool with other serializers
    pub fn with_pool(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl Default for Utf8Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for Utf8Serializer {
    type Item = String;
    type Source = PooledAtom;

    fn serialize(&self, item: &String) -> Result<PooledAtom> {
        let mut atom = self.pool.acquire();
        atom.buffer_mut().extend_from_slice(item.as_bytes());
        Ok(atom)
    }

    fn deserialize(&self, atom: &[u8]) -> Result<String> {
        String::from_utf8(atom.to_vec())
            .map_err(|e| EpochError::Serialization(format!("Invalid UTF-8 atom: {}", e)))
    }
}

/// Bincode serializer for any serde type
pub struct BincodeSerializer<T> {
    pool: Arc<BufferPool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeSerializer<T> {
    pub fn new() -> Self {
        Self::with_pool(Arc::new(BufferPool::default()))
    }

    /// Share a buffer pool with other serializers
    pub fn with_pool(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeSerializer<T> {
    fn clone(&self) -> Self {
        Self::with_pool(Arc::clone(&self.pool))
    }
}

impl<T> Serializer for BincodeSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Item = T;
    type Source = PooledAtom;

    fn serialize(&self, item: &T) -> Result<PooledAtom> {
        let mut atom = self.pool.acquire();
        bincode::serialize_into(atom.buffer_mut().writer(), item)?;
        Ok(atom)
    }

    fn deserialize(&self, atom: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(atom)?)
    }
}
