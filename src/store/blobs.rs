//! Local staging of binary files awaiting upload.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Files live under `<root>/<kind>/<name>`. Writes go through a temporary
/// file and a rename, so a crash never leaves a truncated blob behind.
#[derive(Debug, Clone)]
pub struct BlobStaging {
  root: PathBuf,
}

impl BlobStaging {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn path_for(&self, kind: &str, name: &str) -> PathBuf {
    self.root.join(kind).join(sanitize(name))
  }

  pub async fn stage(&self, kind: &str, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = self.path_for(kind, name);
    let dir = self.root.join(kind);
    tokio::fs::create_dir_all(&dir)
      .await
      .map_err(|e| eyre!("Failed to create staging directory {}: {}", dir.display(), e))?;

    let tmp = path.with_extension(format!("{}.partial", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes)
      .await
      .map_err(|e| eyre!("Failed to write staged blob {}: {}", tmp.display(), e))?;
    tokio::fs::rename(&tmp, &path)
      .await
      .map_err(|e| eyre!("Failed to finalize staged blob {}: {}", path.display(), e))?;

    debug!(path = %path.display(), bytes = bytes.len(), "Staged blob");
    Ok(path)
  }

  pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
      .await
      .map_err(|e| eyre!("Failed to read staged blob {}: {}", path.display(), e))
  }

  /// Remove a staged file. A file that is already gone is not an error.
  pub async fn remove(&self, path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(eyre!("Failed to remove staged blob {}: {}", path.display(), e)),
    }
  }

  pub async fn exists(&self, path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
  }
}

/// Keep staged names inside their directory.
fn sanitize(name: &str) -> String {
  let cleaned: String = name
    .chars()
    .map(|c| match c {
      '/' | '\\' | ':' => '_',
      c => c,
    })
    .collect();
  match cleaned.trim_matches('.') {
    "" => "blob".to_string(),
    _ => cleaned,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_stage_read_remove() {
    let dir = tempfile::tempdir().unwrap();
    let staging = BlobStaging::new(dir.path());

    let path = staging.stage("resume", "cv.pdf", b"%PDF-1.4").await.unwrap();
    assert_eq!(path, dir.path().join("resume").join("cv.pdf"));
    assert!(staging.exists(&path).await);
    assert_eq!(staging.read(&path).await.unwrap(), b"%PDF-1.4");

    staging.remove(&path).await.unwrap();
    assert!(!staging.exists(&path).await);
    staging.remove(&path).await.unwrap();
  }

  #[tokio::test]
  async fn test_restage_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let staging = BlobStaging::new(dir.path());
    staging.stage("avatar", "u1.jpg", b"old").await.unwrap();
    let path = staging.stage("avatar", "u1.jpg", b"new").await.unwrap();
    assert_eq!(staging.read(&path).await.unwrap(), b"new");
  }

  #[test]
  fn test_names_cannot_escape_kind_dir() {
    let staging = BlobStaging::new("/data/blobs");
    assert_eq!(
      staging.path_for("resume", "../../etc/passwd"),
      PathBuf::from("/data/blobs/resume/.._.._etc_passwd")
    );
    assert_eq!(staging.path_for("resume", ".."), PathBuf::from("/data/blobs/resume/blob"));
  }
}
