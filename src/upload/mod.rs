//! Resumable Chunked Upload Module
//!
//! Transfers very large files as fixed-size chunks that may arrive in any
//! order, in parallel, and more than once. Uploads resume after
//! interruption without re-sending admitted chunks.
//!
//! Protocol Flow:
//! 1. Client sends init with a content fingerprint, name, size and chunk count
//! 2. Server creates (or finds) the session and reports admitted chunks
//! 3. Client uploads the missing chunks; each lands at its byte offset
//! 4. Client finalizes; the server verifies and promotes the file
//!
//! Incomplete sessions expire after 24 hours.

pub mod session;
pub mod sweeper;
pub mod types;
pub mod verifier;

pub use session::{ManagerStats, PurgeReport, SessionManager};
pub use sweeper::ExpirationSweeper;
pub use types::*;
pub use verifier::{compute_hash, Verification, VerifyError};
