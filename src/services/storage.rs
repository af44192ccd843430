use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::path::{Component, Path, PathBuf};

use crate::config::{AppConfig, StorageBackend};
use crate::services::encryption::{EncryptionError, ImageCipher};

/// Where uploaded scans live until their job reaches a terminal state.
enum Backend {
    Local { root: PathBuf },
    R2 { bucket: Box<Bucket> },
}

/// Object store for scan images, optionally sealing them at rest.
pub struct ImageStore {
    backend: Backend,
    cipher: Option<ImageCipher>,
}

impl ImageStore {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Local { root: root.into() },
            cipher: None,
        }
    }

    pub fn r2(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            backend: Backend::R2 { bucket },
            cipher: None,
        })
    }

    pub fn with_cipher(mut self, cipher: ImageCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, StorageError> {
        let store = match config.storage_backend {
            StorageBackend::Local => Self::local(&config.upload_dir),
            StorageBackend::R2 => {
                let required = |value: &Option<String>, name: &str| {
                    value
                        .clone()
                        .ok_or_else(|| StorageError::Config(format!("{name} is required for R2 storage")))
                };
                Self::r2(
                    &required(&config.r2_bucket, "R2_BUCKET")?,
                    &required(&config.r2_endpoint, "R2_ENDPOINT")?,
                    &required(&config.r2_access_key, "R2_ACCESS_KEY")?,
                    &required(&config.r2_secret_key, "R2_SECRET_KEY")?,
                )?
            }
        };

        match &config.encryption_key {
            Some(key) => Ok(store.with_cipher(ImageCipher::from_base64(key)?)),
            None => Ok(store),
        }
    }

    pub async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let payload = match &self.cipher {
            Some(cipher) => cipher.seal(data)?,
            None => data.to_vec(),
        };

        match &self.backend {
            Backend::Local { root } => {
                let path = local_path(root, key)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &payload).await?;
            }
            Backend::R2 { bucket } => {
                let content_type = if self.cipher.is_some() {
                    "application/octet-stream"
                } else {
                    content_type
                };
                bucket
                    .put_object_with_content_type(key, &payload, content_type)
                    .await?;
            }
        }
        Ok(())
    }

    /// Read an object back in the clear. A missing object is `NotFound`.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let stored = match &self.backend {
            Backend::Local { root } => {
                let path = local_path(root, key)?;
                match tokio::fs::read(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(StorageError::NotFound(key.to_string()))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Backend::R2 { bucket } => {
                let response = match bucket.get_object(key).await {
                    Ok(response) => response,
                    Err(s3::error::S3Error::HttpFailWithBody(404, _)) => {
                        return Err(StorageError::NotFound(key.to_string()))
                    }
                    Err(e) => return Err(e.into()),
                };
                if response.status_code() == 404 {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                response.to_vec()
            }
        };

        match &self.cipher {
            Some(cipher) if !stored.is_empty() => Ok(cipher.open(&stored)?),
            _ => Ok(stored),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Local { root } => {
                let path = local_path(root, key)?;
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Backend::R2 { bucket } => {
                bucket.delete_object(key).await?;
                Ok(())
            }
        }
    }
}

/// Resolve `key` under `root`, refusing anything that would escape it.
fn local_path(root: &Path, key: &str) -> Result<PathBuf, StorageError> {
    let relative = Path::new(key);
    let safe = !key.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(root.join(relative))
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Encryption(#[from] EncryptionError),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[tokio::test]
    async fn test_local_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::local(dir.path());

        store.put("scans/a.png", b"png bytes", "image/png").await.unwrap();
        assert_eq!(store.get("scans/a.png").await.unwrap(), b"png bytes");

        store.delete("scans/a.png").await.unwrap();
        assert!(matches!(
            store.get("scans/a.png").await,
            Err(StorageError::NotFound(_))
        ));
        // deleting twice is fine
        store.delete("scans/a.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let key = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        let store = ImageStore::local(dir.path()).with_cipher(ImageCipher::from_base64(&key).unwrap());

        store.put("scans/b.dcm", b"DICM payload", "application/dicom").await.unwrap();

        let on_disk = std::fs::read(dir.path().join("scans/b.dcm")).unwrap();
        assert_ne!(on_disk, b"DICM payload");
        assert_eq!(store.get("scans/b.dcm").await.unwrap(), b"DICM payload");
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::local(dir.path());
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.put("/abs.png", b"x", "image/png").await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
