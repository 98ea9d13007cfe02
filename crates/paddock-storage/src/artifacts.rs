use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

/// Where a raw payload was archived.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already archived for this date and source.
    pub deduplicated: bool,
}

/// Content-addressed archive of raw source payloads, one directory per
/// payload date and source. Files are never rewritten once present.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<payload date>/<source id>/<sha256>.<ext>`
    pub fn payload_path(payload_date: NaiveDate, source_id: &str, digest: &str, extension: &str) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let mut path = PathBuf::from(payload_date.format("%Y-%m-%d").to_string());
        path.push(source_id);
        path.push(format!("{digest}.{ext}"));
        path
    }

    pub async fn store_bytes(
        &self,
        payload_date: NaiveDate,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = payload_digest(bytes);
        let relative_path = Self::payload_path(payload_date, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let already_archived = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking {}", absolute_path.display()))?;
        let deduplicated = already_archived || !write_once(&absolute_path, bytes).await?;

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Stages `bytes` beside `target` and links it into place. Linking never
/// replaces an existing file, so this returns false when another writer
/// published `target` first.
async fn write_once(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let dir = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let staging = dir.join(format!(".staging-{}", Uuid::new_v4()));
    fs::write(&staging, bytes)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;

    let linked = fs::hard_link(&staging, target).await;
    let _ = fs::remove_file(&staging).await;
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("publishing payload to {}", target.display())),
    }
}
