//! Durable token cache file
//!
//! The serialized credential cache is treated as one opaque blob: read whole,
//! written whole. Writes go to a sibling temp file that is renamed over the
//! target, so a crash mid-write never leaves a truncated cache behind.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::{AppError, AppResult};

/// Single-file token cache persistence
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Create a store backed by `path` (file need not exist yet)
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Location of the cache file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole blob
    ///
    /// Returns `Ok(None)` when the file does not exist.
    pub async fn load(&self) -> AppResult<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                tracing::debug!(path = %self.path.display(), "loaded token cache");
                Ok(Some(content))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(format!(
                "failed to read token cache '{}': {e}",
                self.path.display()
            ))),
        }
    }

    /// Replace the whole blob
    ///
    /// Creates parent directories as needed and restricts the file to the
    /// owner on unix.
    pub async fn save(&self, blob: &str) -> AppResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Io(format!(
                    "failed to create token cache directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }

        let tmp = self.temp_path();
        let write = async {
            fs::write(&tmp, blob).await?;
            restrict_permissions(&tmp).await?;
            fs::rename(&tmp, &self.path).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp).await;
            return Err(AppError::Io(format!(
                "failed to write token cache '{}': {e}",
                self.path.display()
            )));
        }

        tracing::debug!(path = %self.path.display(), bytes = blob.len(), "saved token cache");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
