//! Storage Element internals: backend drivers, naming, sidecars, WAL,
//! capacity accounting, the mode controller, and the file engine.

pub mod backend;
pub mod capacity;
pub mod engine;
pub mod local;
pub mod mode;
pub mod naming;
pub mod s3;
pub mod sidecar;
pub mod wal;

pub use backend::{ByteRange, ObjectStat, StorageBackend};
pub use capacity::{CapacitySnapshot, CapacityStatus, Thresholds};
pub use engine::{FileEngine, MetadataPatch, Principal, UploadMetadata, UploadReceipt};
pub use mode::SeMode;
pub use sidecar::FileAttributes;
