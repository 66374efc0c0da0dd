//! Backing object-store abstraction and its implementations.

pub mod filesystem;
pub mod retry;
pub mod s3;
pub mod traits;

pub use filesystem::FilesystemStore;
pub use s3::S3Store;
pub use traits::{CompletedPart, MultipartUploadId, ObjectStat, ObjectStore, StoreError};
