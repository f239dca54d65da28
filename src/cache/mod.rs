//! PostgreSQL metadata cache and its synchronization machinery.

pub mod store;
pub mod sync;
pub mod tables;

pub use store::{CachedFile, MetadataCache, SearchQuery, SearchResult};
pub use sync::{CacheSynchronizer, ConsistencyReport, RebuildReport};
pub use tables::TableNames;
