//! Serializer Module
//!
//! Converts domain keys and values to and from the engine's atom
//! representation (plain byte slices).
//!
//! ## Responsibilities
//! - Produce a disposable atom source scoped to one engine call
//! - Rebuild domain values from atoms handed back by the engine
//! - Recycle atom buffers through a bounded pool
//!
//! ## Lifetime of an atom source
//! ```text
//!   serialize(&key) ──► PooledAtom ──► engine.read(atom) ──► drop ──► buffer back to pool
//! ```

mod codecs;
mod pool;

pub use codecs::{BincodeSerializer, RawSerializer, Utf8Serializer};
pub use pool::{BufferPool, PooledAtom};

use crate::error::Result;

/// Engine-facing bytes of a serialized key or value.
///
/// Any resources behind the atom are released when the source is dropped.
pub trait AtomSource {
    /// The serialized bytes
    fn atom(&self) -> &[u8];
}

impl AtomSource for Vec<u8> {
    fn atom(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Converts one domain type to and from atoms
pub trait Serializer: Send + Sync + 'static {
    /// Domain type handled by this serializer
    type Item: Send + 'static;

    /// Atom source produced by `serialize`
    type Source: AtomSource;

    /// Serialize an item into a scoped atom source
    fn serialize(&self, item: &Self::Item) -> Result<Self::Source>;

    /// Rebuild an item from its atom
    fn deserialize(&self, atom: &[u8]) -> Result<Self::Item>;
}
