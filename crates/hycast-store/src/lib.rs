//! hycast-store — the concurrent cache of in-flight and recently completed
//! products: chunk merging, completion detection, residency eviction,
//! missing-chunk iteration, and the optional between-sessions snapshot.

mod bitmap;
pub mod store;

pub use store::{ChunkInfoIterator, ProductStore, StoreOptions};
