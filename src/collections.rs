//! Hash collections used by the in-memory indices
//!
//! With the `gxhash` feature the store indices hash keys with gxhash;
//! without it they fall back to the std SipHash tables so the crate builds
//! on targets lacking AES-NI. Callers construct maps through [`HashMapExt`]
//! and sets through `Default`, which works for both.

#[cfg(feature = "gxhash")]
pub use gxhash::{HashMap, HashMapExt, HashSet};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::{HashMap, HashSet};

/// `new`/`with_capacity` for the std map, mirroring gxhash's extension trait
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    fn new() -> Self;
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for HashMap<K, V> {
    fn new() -> Self {
        HashMap::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity_and_hasher(capacity, Default::default())
    }
}
