//! ChunkVault
//!
//! Resumable chunked transfer of very large files. The server side
//! (`upload`, `db`, `storage`, `routes`) keeps sessions and blobs; the
//! client side (`client`) fingerprints files and drives uploads with a
//! bounded worker pool.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod fault;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;
