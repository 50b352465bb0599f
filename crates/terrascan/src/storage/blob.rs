use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::StorageError;

/// Key/value store for binary blobs addressed by `/`-separated keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous value. Returns the
    /// storage URI to record in the catalog.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Well-known key layout. Scene keys use the catalog id rather than the
/// provider scene id, which is only unique per provider.
pub mod keys {
    use crate::raster::Band;

    pub fn raw_band(id: &str, band: Band) -> String {
        format!("raw/{}/{}.tif", id, band)
    }

    pub fn corrected(id: &str) -> String {
        format!("corrected/{}.tif", id)
    }

    pub fn scene(id: &str) -> String {
        format!("scenes/{}.tif", id)
    }

    pub fn job_result(job_id: &str) -> String {
        format!("results/{}.tif", job_id)
    }
}

/// Checks that a key is a relative path that cannot escape the store root.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(invalid("key contains a forbidden character"));
    }
    if key.ends_with('/') {
        return Err(invalid("key names a directory"));
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            Component::ParentDir => return Err(invalid("key contains '..'")),
            Component::CurDir => return Err(invalid("key contains '.'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("key must be relative"))
            }
        }
    }
    Ok(())
}

/// Blob store rooted at a local directory. Writes go to a temporary file
/// in the target directory and are renamed into place, so readers never
/// observe a partial blob.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| StorageError::CreateDirectory {
                path: parent.clone(),
                source: e,
            })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::WriteFile {
                path: temp,
                source: e,
            });
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::WriteFile { path, source: e });
        }

        log::debug!("Stored blob {} ({} bytes)", key, bytes.len());
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::ReadFile { path, source: e }),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::ReadFile { path, source: e })
    }
}
