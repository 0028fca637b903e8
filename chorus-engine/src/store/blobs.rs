//! Blob layout and atomic write/read primitives.
//!
//! Paths encode `{source_id}/{master|stems/{stem}|archive}.{ext}`. Writes
//! land in a `.tmp-<kind>-<random>` sibling and are renamed into place, the
//! same write-temp-then-rename pattern the teacher uses for its downloaded
//! artwork cache, generalized here to every blob kind the engine produces.

use crate::models::StemName;
use chorus_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// What a blob holds. Never exposes the filesystem root to callers outside
/// this module — callers only ever see the opaque [`BlobRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    MasterAudio,
    Stem(StemName),
    Archive,
}

impl BlobKind {
    fn relative_path(self, source_id: &str, ext: &str) -> PathBuf {
        match self {
            BlobKind::MasterAudio => PathBuf::from(source_id).join(format!("master.{}", ext)),
            BlobKind::Stem(stem) => PathBuf::from(source_id)
                .join("stems")
                .join(format!("{}.{}", stem.as_str(), ext)),
            BlobKind::Archive => PathBuf::from(source_id).join(format!("archive.{}", ext)),
        }
    }
}

/// Opaque reference to a blob: a relative path plus its kind tag. Never
/// carries the store root, so moving the root never invalidates a ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub kind: BlobKind,
    relative_path: PathBuf,
}

impl BlobRef {
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }
}

pub(super) async fn put_blob(
    root: &Path,
    source_id: &str,
    kind: BlobKind,
    ext: &str,
    bytes: &[u8],
) -> Result<BlobRef> {
    let relative_path = kind.relative_path(source_id, ext);
    let absolute_path = root.join(&relative_path);
    if let Some(parent) = absolute_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_name = format!(
        ".tmp-{}-{}",
        source_id.replace('/', "_"),
        uuid::Uuid::new_v4()
    );
    let tmp_path = absolute_path
        .parent()
        .unwrap_or(root)
        .join(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    // POSIX rename is atomic; Windows cannot rename onto an existing file,
    // so remove-then-rename is used there instead. Core logic otherwise
    // identical across platforms.
    #[cfg(windows)]
    {
        let _ = tokio::fs::remove_file(&absolute_path).await;
    }
    tokio::fs::rename(&tmp_path, &absolute_path).await?;

    Ok(BlobRef {
        kind,
        relative_path,
    })
}

pub(super) async fn open_blob(root: &Path, blob_ref: &BlobRef) -> Result<Vec<u8>> {
    let absolute_path = root.join(&blob_ref.relative_path);
    tokio::fs::read(&absolute_path)
        .await
        .map_err(|_| Error::MissingBlob(blob_ref.relative_path.display().to_string()))
}

pub(super) async fn delete_source_tree(root: &Path, source_id: &str) -> Result<()> {
    let dir = root.join(source_id);
    if dir.exists() {
        tokio::fs::remove_dir_all(&dir).await?;
    }
    Ok(())
}
