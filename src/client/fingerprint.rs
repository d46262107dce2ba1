//! File fingerprints
//!
//! A fingerprint is the SHA-256 of the first and last MiB of a file,
//! suffixed with its size: `<hex>-<size>`. It is a resumption key, not an
//! integrity check. Files that differ only in the middle share one.

use std::io::SeekFrom;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes sampled from each end of the file
pub const SAMPLE_SIZE: u64 = 1024 * 1024;

/// Fingerprint of an in-memory buffer
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let size = data.len() as u64;
    let (head, tail) = sample_ranges(size);

    let mut hasher = Sha256::new();
    hasher.update(&data[head.0 as usize..head.1 as usize]);
    hasher.update(&data[tail.0 as usize..tail.1 as usize]);
    format!("{}-{}", hex::encode(hasher.finalize()), size)
}

/// Fingerprint of a file on disk; reads at most two samples
pub async fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let (head, tail) = sample_ranges(size);

    let mut hasher = Sha256::new();
    for (start, end) in [head, tail] {
        let mut buf = vec![0u8; (end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf).await?;
        hasher.update(&buf);
    }

    Ok(format!("{}-{}", hex::encode(hasher.finalize()), size))
}

/// Head and tail byte ranges; on small files both cover the whole file
fn sample_ranges(size: u64) -> ((u64, u64), (u64, u64)) {
    let head = (0, size.min(SAMPLE_SIZE));
    let tail = (size.saturating_sub(SAMPLE_SIZE), size);
    (head, tail)
}
