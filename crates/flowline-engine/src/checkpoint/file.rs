//! One file per checkpoint key

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flowline_common::Result;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use super::{CheckpointStore, CheckpointStoreType};

/// Longest sanitized key kept verbatim in a file name
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    directory: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self { directory })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File-system-safe name for `key`.
    ///
    /// Unsafe characters become `_`; a short hash of the raw key keeps
    /// distinct keys that sanitize identically apart.
    pub fn file_name(key: &str) -> String {
        let mut safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        safe = safe.trim_start_matches('.').to_string();
        safe.truncate(MAX_NAME_LEN);

        let digest = Sha256::digest(key.as_bytes());
        format!("{}-{}.checkpoint", safe, &hex::encode(digest)[..12])
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(Self::file_name(key))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn store_type(&self) -> CheckpointStoreType {
        CheckpointStoreType::File
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        // Write-then-rename so readers never observe a torn value; each
        // writer gets its own temporary file
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(key, path = %path.display(), "Checkpoint written");
        Ok(())
    }
}
