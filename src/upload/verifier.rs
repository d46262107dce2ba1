//! Integrity Verifier
//!
//! Whole-content SHA-256 digest of a completed blob and, for container
//! formats, a listing of the entries inside it.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::ManifestEntry;
use crate::storage::{BlobStore, StorageError};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unreadable archive: {0}")]
    Archive(String),

    #[error("Verification task failed: {0}")]
    Task(String),
}

/// Result of verifying a completed blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Lowercase hex SHA-256 of the whole file
    pub digest: String,
    /// Present only for container formats
    pub manifest: Option<Vec<ManifestEntry>>,
}

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stream a reader through SHA-256 without buffering it whole
pub async fn digest_reader<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Whether a file name denotes a container format we can list
pub fn is_container(file_name: &str) -> bool {
    file_name.to_ascii_lowercase().ends_with(".zip")
}

/// List the entries of a ZIP archive
pub async fn read_manifest(file: tokio::fs::File) -> Result<Vec<ManifestEntry>, VerifyError> {
    let file = file.into_std().await;

    tokio::task::spawn_blocking(move || {
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| VerifyError::Archive(e.to_string()))?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            // Raw access: listing must not require decrypting entries
            let entry = archive
                .by_index_raw(i)
                .map_err(|e| VerifyError::Archive(e.to_string()))?;
            entries.push(ManifestEntry {
                entry_name: entry.name().to_string(),
                size: entry.size(),
                is_directory: entry.is_dir(),
            });
        }

        Ok(entries)
    })
    .await
    .map_err(|e| VerifyError::Task(e.to_string()))?
}

/// Digest a completed blob and extract its manifest if it is a container
pub async fn verify_blob(
    store: &dyn BlobStore,
    key: &str,
    original_name: &str,
) -> Result<Verification, VerifyError> {
    let digest = digest_reader(store.open_for_read(key).await?).await?;

    let manifest = if is_container(original_name) {
        Some(read_manifest(store.open_for_read(key).await?).await?)
    } else {
        None
    };

    Ok(Verification { digest, manifest })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn build_zip() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);

        writer.add_directory("docs/", options).unwrap();
        writer.start_file("docs/readme.txt", options).unwrap();
        writer.write_all(b"hello archive").unwrap();
        writer.start_file("data.bin", options).unwrap();
        writer.write_all(&[7u8; 100]).unwrap();

        writer.finish().unwrap().into_inner()
    }

    async fn store_completed(store: &LocalBlobStore, key: &str, data: &[u8]) {
        store.create_blob(key, data.len() as u64).await.unwrap();
        store.write_range(key, 0, data).await.unwrap();
        store.promote(key).await.unwrap();
    }

    #[test]
    fn test_compute_hash() {
        assert_eq!(
            compute_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_streamed_digest_matches_in_memory() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = digest_reader(Cursor::new(data.clone())).await.unwrap();
        assert_eq!(streamed, compute_hash(&data));
    }

    #[test]
    fn test_is_container() {
        assert!(is_container("backup.zip"));
        assert!(is_container("BACKUP.ZIP"));
        assert!(!is_container("zip.tar"));
        assert!(!is_container("movie.mkv"));
    }

    #[tokio::test]
    async fn test_verify_zip_blob() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path());
        let archive = build_zip();
        store_completed(&store, "s1_bundle.zip", &archive).await;

        let result = verify_blob(&store, "s1_bundle.zip", "bundle.zip").await.unwrap();
        assert_eq!(result.digest, compute_hash(&archive));

        let manifest = result.manifest.unwrap();
        assert_eq!(manifest.len(), 3);
        assert!(manifest.iter().any(|e| e.entry_name == "docs/" && e.is_directory));
        let readme = manifest.iter().find(|e| e.entry_name == "docs/readme.txt").unwrap();
        assert_eq!(readme.size, 13);
        assert!(!readme.is_directory);
    }

    #[tokio::test]
    async fn test_plain_blob_has_no_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path());
        store_completed(&store, "s2_notes.txt", b"just text").await;

        let result = verify_blob(&store, "s2_notes.txt", "notes.txt").await.unwrap();
        assert!(result.manifest.is_none());
        assert_eq!(result.digest, compute_hash(b"just text"));
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(temp_dir.path());
        store_completed(&store, "s3_fake.zip", b"definitely not a zip").await;

        let result = verify_blob(&store, "s3_fake.zip", "fake.zip").await;
        assert!(matches!(result, Err(VerifyError::Archive(_))));
    }
}
