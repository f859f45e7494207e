//! Scratch files for audio transcoding.
//!
//! Layout: `<upload_root>/<fromUser>/<toUser>/<stem><suffix>.<ext>`, or
//! `<upload_root>/translate/...` when the envelope names no conversation.
//! Every file is held by a [`StagedFile`] which removes it on drop unless it
//! was persisted, so an aborted pipeline leaves nothing behind.

use crate::config::StagingConfig;
use crate::envelope::ChatEnvelope;
use crate::error::RelayError;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const ANONYMOUS_DIR: &str = "translate";

#[derive(Debug, Clone)]
pub struct StagingArea {
    upload_root: PathBuf,
    download_prefix: String,
}

impl StagingArea {
    pub fn new(config: &StagingConfig) -> Self {
        Self {
            upload_root: config.upload_root.clone(),
            download_prefix: config.download_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Creates (if absent) the directory for this envelope's conversation and
    /// reserves a file stem no other in-flight message can share.
    pub async fn open(&self, envelope: &ChatEnvelope) -> Result<Workspace, RelayError> {
        let relative = match (&envelope.from_user, &envelope.to_user) {
            (Some(from), Some(to)) => format!("{}/{}", from, to),
            _ => ANONYMOUS_DIR.to_string(),
        };
        let dir = self.upload_root.join(&relative);
        // create_dir_all 对已存在的目录直接返回 Ok
        tokio::fs::create_dir_all(&dir).await?;

        Ok(Workspace {
            dir,
            download_dir: format!("{}/{}", self.download_prefix, relative),
            stem: unique_stem(),
        })
    }
}

fn unique_stem() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let id = Uuid::new_v4().simple().to_string();
    format!("{}_{}", now, &id[..8])
}

/// One message's share of the staging area.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    download_dir: String,
    stem: String,
}

impl Workspace {
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// `suffix` is appended to the stem, e.g. `("_result", "amr")`.
    pub fn stage(&self, suffix: &str, ext: &str) -> StagedFile {
        StagedFile::new(self.dir.join(format!("{}{}.{}", self.stem, suffix, ext)))
    }

    /// The path clients download `file` from once it has been persisted.
    pub fn download_url(&self, file: &StagedFile) -> String {
        let name = file
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{}", self.download_dir, name)
    }
}

/// A file that is deleted when the guard goes out of scope.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    keep: bool,
}

impl StagedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            keep: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persist(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed staged file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove staged file {}: {}", self.path.display(), e),
        }
    }
}
