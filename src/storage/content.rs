//! Content file store
//!
//! One message per `.eml` file under a single directory. Writes go to a
//! temporary name in the same directory and are renamed into place, so a
//! crash-consistent reader sees either the whole file or nothing.

use crate::error::{MailError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Longest filename stem derived from a message-id.
const MAX_STEM_LEN: usize = 100;

#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the storage directory if it does not exist.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| MailError::Storage(format!("cannot create {:?}: {}", self.dir, e)))?;
        Ok(())
    }

    /// Canonical path for a message-id.
    pub fn path_for(&self, message_id: &str) -> PathBuf {
        self.dir.join(format!("{}.eml", safe_stem(message_id)))
    }

    /// Write message bytes atomically; returns the final path.
    pub async fn put(&self, message_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.init().await?;

        let final_path = self.path_for(message_id);
        let tmp_name = format!(
            ".{}.{}.tmp",
            safe_stem(message_id),
            std::process::id()
        );
        let tmp_path = self.dir.join(tmp_name);

        fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| MailError::Storage(format!("write {:?}: {}", tmp_path, e)))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| MailError::Storage(format!("rename into {:?}: {}", final_path, e)))?;

        debug!("stored {} bytes at {:?}", bytes.len(), final_path);
        Ok(final_path)
    }

    /// Read message bytes back.
    ///
    /// Tries the metadata-recorded path first, then the canonical name,
    /// then scans the directory for a file containing the sanitized id.
    /// The scan tolerates files written under older naming schemes.
    pub async fn get(&self, message_id: &str, hint: Option<&Path>) -> Result<Vec<u8>> {
        if let Some(path) = hint {
            if let Ok(bytes) = fs::read(path).await {
                return Ok(bytes);
            }
            warn!("content hint {:?} missing for {}", path, message_id);
        }

        let canonical = self.path_for(message_id);
        if let Ok(bytes) = fs::read(&canonical).await {
            return Ok(bytes);
        }

        if let Some(found) = self.scan_for(message_id).await? {
            return fs::read(&found)
                .await
                .map_err(|e| MailError::Storage(format!("read {:?}: {}", found, e)));
        }

        Err(MailError::NotFound(message_id.to_string()))
    }

    /// Remove a message's file. Succeeds when the file is already gone.
    pub async fn delete(&self, message_id: &str) -> Result<()> {
        let path = self.path_for(message_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MailError::Storage(format!("remove {:?}: {}", path, e))),
        }
    }

    async fn scan_for(&self, message_id: &str) -> Result<Option<PathBuf>> {
        let needle = safe_stem(message_id);
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MailError::Storage(e.to_string()))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".eml") && name.contains(needle.as_str()) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

/// Turn a message-id into a filesystem-safe stem.
///
/// Strips the angle brackets, maps `@` to `_at_`, replaces reserved and
/// control characters with `_`, and truncates long ids to [`MAX_STEM_LEN`]
/// with a short content hash appended so distinct ids stay distinct.
pub fn safe_stem(message_id: &str) -> String {
    let trimmed = message_id.trim().trim_matches(['<', '>']);
    let replaced = trimmed.replace('@', "_at_");
    let mut stem: String = replaced
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | ' ')
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    if stem.len() > MAX_STEM_LEN {
        let digest = Sha256::digest(message_id.as_bytes());
        let tag: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
        stem.truncate(MAX_STEM_LEN - tag.len() - 1);
        stem.push('-');
        stem.push_str(&tag);
    }

    if stem.is_empty() {
        "message".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_safe_stem_basic() {
        assert_eq!(safe_stem("<123.abc@example.com>"), "123.abc_at_example.com");
        assert_eq!(safe_stem("a/b\\c:d?e"), "a_b_c_d_e");
    }

    #[test]
    fn test_safe_stem_truncates_uniquely() {
        let long_a = format!("<{}@x>", "a".repeat(200));
        let long_b = format!("<{}b@x>", "a".repeat(200));
        let stem_a = safe_stem(&long_a);
        let stem_b = safe_stem(&long_b);
        assert!(stem_a.len() <= MAX_STEM_LEN);
        assert!(stem_b.len() <= MAX_STEM_LEN);
        assert_ne!(stem_a, stem_b);
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());

        let body = b"From: a@x\r\n\r\nhello\r\n";
        let path = store.put("<1@x>", body).await.unwrap();
        assert!(path.exists());

        let read = store.get("<1@x>", None).await.unwrap();
        assert_eq!(read, body);
    }

    #[tokio::test]
    async fn test_get_with_stale_hint_falls_back() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());

        store.put("<1@x>", b"data").await.unwrap();
        let stale = dir.path().join("moved-away.eml");
        let read = store.get("<1@x>", Some(&stale)).await.unwrap();
        assert_eq!(read, b"data");
    }

    #[tokio::test]
    async fn test_get_via_directory_scan() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        store.init().await.unwrap();

        // Historical naming scheme: extra prefix around the id
        let legacy = dir.path().join("legacy-1_at_x-copy.eml");
        tokio::fs::write(&legacy, b"old bytes").await.unwrap();

        let read = store.get("<1@x>", None).await.unwrap();
        assert_eq!(read, b"old bytes");
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());

        store.put("<1@x>", b"data").await.unwrap();
        store.delete("<1@x>").await.unwrap();
        assert!(store.get("<1@x>", None).await.is_err());
        // Second delete is a no-op
        store.delete("<1@x>").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        store.init().await.unwrap();

        let err = store.get("<none@x>", None).await.unwrap_err();
        assert!(matches!(err, MailError::NotFound(_)));
    }
}
