//! Blob storage for in-flight and completed uploads
//!
//! Each upload owns one pre-allocated blob. Chunks are written straight into
//! it at their byte offset, so there is no reassembly step: finalize only
//! relocates the blob from the incoming area to the completed area.

mod blob_store;

pub use blob_store::{BlobArea, BlobStore, LocalBlobStore, StorageError};
