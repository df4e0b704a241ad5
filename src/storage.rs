//! Storage Module
//!
//! The object-storage seam used by the pipeline stages: an async [`ObjectStore`] trait,
//! a filesystem-backed implementation, and the object references delivered by storage
//! notifications (with their URL-encoded keys decoded).
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use serde::Deserialize;

use crate::error::{DmarcError, Result};

/// Fallible, independently retryable object access.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Writes `content` under `key`, replacing any existing object.
    async fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<()>;
}

/// A bucket + key pair identifying one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Builds a reference from a notification key, where `+` stands for a space and
    /// everything else is percent-encoded.
    pub fn decoded(bucket: impl Into<String>, raw_key: &str) -> Result<Self> {
        Ok(Self::new(bucket, decode_object_key(raw_key)?))
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

pub fn decode_object_key(raw_key: &str) -> Result<String> {
    let spaced = raw_key.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|e| DmarcError::InvalidObjectKey(format!("{}: {}", raw_key, e)))
}

#[derive(Debug, Deserialize)]
struct StorageNotification {
    #[serde(rename = "Records", default)]
    records: Vec<NotificationRecord>,
}

#[derive(Debug, Deserialize)]
struct NotificationRecord {
    s3: NotificationEntity,
}

#[derive(Debug, Deserialize)]
struct NotificationEntity {
    bucket: NotificationBucket,
    object: NotificationObject,
}

#[derive(Debug, Deserialize)]
struct NotificationBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NotificationObject {
    key: String,
}

/// Reads an S3-style object-created notification and returns the referenced objects.
pub fn parse_storage_notification(json: &[u8]) -> Result<Vec<ObjectRef>> {
    let notification: StorageNotification = serde_json::from_slice(json)
        .map_err(|e| DmarcError::Storage(format!("Invalid storage notification: {}", e)))?;
    notification
        .records
        .into_iter()
        .map(|record| ObjectRef::decoded(record.s3.bucket.name, &record.s3.object.key))
        .collect()
}

/// LocalObjectStore keeps each bucket as a directory under a root path.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for (label, part) in [("bucket", bucket), ("key", key)] {
            let relative = Path::new(part);
            let safe = !part.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !safe {
                return Err(DmarcError::InvalidObjectKey(format!(
                    "unsafe {} for local storage: {:?}",
                    label, part
                )));
            }
            path.push(relative);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| DmarcError::Storage(format!("Failed to read {}: {}", path.display(), e)))
    }

    async fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| DmarcError::Storage(format!("Failed to write {}: {}", path.display(), e)))?;
        log::debug!("Stored {} bytes at {}", content.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_decode_object_key() {
        assert_eq!(
            decode_object_key("reports/google.com%21example.com%211706572800.xml").unwrap(),
            "reports/google.com!example.com!1706572800.xml"
        );
        assert_eq!(decode_object_key("weekly+report%2B1.zip").unwrap(), "weekly report+1.zip");
        assert!(matches!(
            decode_object_key("bad%ff%fe"),
            Err(DmarcError::InvalidObjectKey(_))
        ));
    }

    #[test]
    fn test_parse_storage_notification() {
        let json = br#"{
            "Records": [
                {
                    "eventName": "ObjectCreated:Put",
                    "s3": {
                        "bucket": { "name": "incoming-emails", "arn": "arn:aws:s3:::incoming-emails" },
                        "object": { "key": "inbox/abc+def%3A1", "size": 1024 }
                    }
                }
            ]
        }"#;
        let refs = parse_storage_notification(json).unwrap();
        assert_eq!(refs, vec![ObjectRef::new("incoming-emails", "inbox/abc def:1")]);
        assert!(parse_storage_notification(b"{}").unwrap().is_empty());
        assert!(parse_storage_notification(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_local_store_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let store = LocalObjectStore::new(dir.path());
        store.put("attachments", "nested/report.xml", b"<feedback/>").await?;
        // Puts are idempotent by key.
        store.put("attachments", "nested/report.xml", b"<feedback/>").await?;
        assert_eq!(store.get("attachments", "nested/report.xml").await?, b"<feedback/>");
        assert!(dir.path().join("attachments/nested/report.xml").exists());
        assert!(matches!(
            store.get("attachments", "missing.xml").await,
            Err(DmarcError::Storage(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        for key in ["../outside.xml", "/etc/passwd", "a/../../b", ""] {
            let result = store.put("attachments", key, b"x").await;
            assert!(matches!(result, Err(DmarcError::InvalidObjectKey(_))), "{:?}", key);
        }
        let result = store.get("..", "report.xml").await;
        assert!(matches!(result, Err(DmarcError::InvalidObjectKey(_))));
    }
}
