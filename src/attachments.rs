//! Attachment persistence
//!
//! Writes downloaded attachment bytes into one destination directory.
//! Sender-supplied file names are reduced to a bare final component so they
//! can never escape the directory, and existing files are never overwritten:
//! a collision takes the next free `name_N.ext`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::errors::{AppError, AppResult};

/// Name used when the suggested one sanitizes to nothing
const FALLBACK_NAME: &str = "attachment";
/// Upper bound on collision suffixes tried before giving up
const MAX_SUFFIX: u32 = 10_000;

/// Result of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    /// Absolute path of the written file
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Destination directory for attachment files
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    dir: PathBuf,
}

impl AttachmentStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Write `bytes` under a sanitized, collision-free name
    ///
    /// # Errors
    ///
    /// Returns `Io` when the directory cannot be created or the file cannot
    /// be written. A partially written file is removed before returning.
    pub async fn save(&self, suggested_name: &str, bytes: &[u8]) -> AppResult<StoredAttachment> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            AppError::Io(format!(
                "failed to create attachment directory '{}': {e}",
                self.dir.display()
            ))
        })?;
        let dir = fs::canonicalize(&self.dir).await.map_err(|e| {
            AppError::Io(format!(
                "failed to resolve attachment directory '{}': {e}",
                self.dir.display()
            ))
        })?;

        let name = sanitize_filename(suggested_name);
        let (stem, ext) = split_extension(&name);
        for n in 0..=MAX_SUFFIX {
            let candidate = if n == 0 {
                name.clone()
            } else {
                format!("{stem}_{n}{ext}")
            };
            let path = dir.join(&candidate);
            let file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(AppError::Io(format!(
                        "failed to create '{}': {e}",
                        path.display()
                    )));
                }
            };
            write_fully(file, &path, bytes).await?;
            tracing::info!(path = %path.display(), size = bytes.len(), "saved attachment");
            return Ok(StoredAttachment {
                path,
                size_bytes: bytes.len() as u64,
            });
        }
        Err(AppError::Io(format!(
            "no free file name for '{name}' in '{}'",
            dir.display()
        )))
    }
}

async fn write_fully(mut file: fs::File, path: &Path, bytes: &[u8]) -> AppResult<()> {
    let result = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = result {
        drop(file);
        let _ = fs::remove_file(path).await;
        return Err(AppError::Io(format!(
            "failed to write '{}': {e}",
            path.display()
        )));
    }
    Ok(())
}

/// Reduce a sender-supplied name to a safe final path component
pub fn sanitize_filename(raw: &str) -> String {
    let last = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        FALLBACK_NAME.to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// Split `report.pdf` into (`report`, `.pdf`); dotfiles have no extension
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}
