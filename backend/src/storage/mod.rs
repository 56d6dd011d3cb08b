//! Managed download directory
//!
//! All reads, writes and deletes of stored files go through [`StorageDir`],
//! which applies [`validate_name`] before touching the filesystem.

mod names;

pub use names::{derive_name, is_partial, validate_name, PARTIAL_SUFFIX};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A completed file in the storage directory, read live from the filesystem
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

impl StoredFile {
    fn from_metadata(name: String, metadata: &std::fs::Metadata) -> Self {
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Self {
            name,
            size_bytes: metadata.len(),
            modified_at,
        }
    }
}

/// Handle to the flat directory holding fetched files
#[derive(Debug, Clone)]
pub struct StorageDir {
    root: PathBuf,
}

impl StorageDir {
    /// Open the storage directory, creating it if it does not exist
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let root = dir.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derive a safe target name from a requested URL
    pub fn resolve_safe_name(&self, url: &str) -> Result<String> {
        derive_name(url)
    }

    /// Absolute path of `name` inside the directory
    pub fn absolute_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Path a transfer writes to before the file is published under `name`
    pub fn partial_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(format!("{}{}", name, PARTIAL_SUFFIX)))
    }

    /// Check that `path` names a file directly inside the directory
    pub fn confine(&self, path: &Path) -> Result<()> {
        if path.parent() != Some(self.root.as_path()) {
            return Err(Error::invalid(format!(
                "{} is outside the storage directory",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::invalid("destination has no usable file name"))?;
        validate_name(name)
    }

    /// Whether a completed file is present under `name`
    pub fn exists(&self, name: &str) -> bool {
        match self.absolute_path(name) {
            Ok(path) => std::fs::symlink_metadata(path).is_ok(),
            Err(_) => false,
        }
    }

    /// List completed files, sorted by name.
    ///
    /// Partial transfers, directories and symlinks are skipped.
    pub async fn list(&self) -> Result<Vec<StoredFile>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                debug!("Skipping non UTF-8 file name in {}", self.root.display());
                continue;
            };
            if is_partial(&name) {
                continue;
            }

            // Entries can vanish between read_dir and stat
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }

            files.push(StoredFile::from_metadata(name, &metadata));
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Look up one completed file
    pub async fn stat(&self, name: &str) -> Result<StoredFile> {
        let path = self.absolute_path(name)?;
        if is_partial(name) {
            return Err(Error::NotFound(name.to_string()));
        }

        match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {
                Ok(StoredFile::from_metadata(name.to_string(), &metadata))
            }
            Ok(_) => Err(Error::NotFound(name.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a completed file
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.stat(name).await?;
        let path = self.absolute_path(name)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the partial file for `name`, if any
    pub async fn discard_partial(&self, name: &str) -> Result<bool> {
        let path = self.partial_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove partial files left behind by an earlier process
    pub async fn sweep_partials(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_partial(name) {
                continue;
            }
            match entry.file_type().await {
                Ok(ft) if ft.is_file() => {}
                _ => continue,
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    warn!("Removed stale partial file {}", name);
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (StorageDir, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageDir::open(dir.path().join("downloads")).unwrap();
        (storage, dir)
    }

    fn names(files: &[StoredFile]) -> Vec<&str> {
        files.iter().map(|f| f.name.as_str()).collect()
    }

    #[tokio::test]
    async fn open_creates_directory() {
        let (storage, _dir) = storage();
        assert!(storage.root().is_dir());
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_hides_partials_and_directories() {
        let (storage, _dir) = storage();
        std::fs::write(storage.root().join("b.txt"), b"bb").unwrap();
        std::fs::write(storage.root().join("a.txt"), b"a").unwrap();
        std::fs::write(storage.root().join("c.bin.part"), b"partial").unwrap();
        std::fs::create_dir(storage.root().join("nested")).unwrap();

        let files = storage.list().await.unwrap();
        assert_eq!(names(&files), vec!["a.txt", "b.txt"]);
        assert_eq!(files[1].size_bytes, 2);

        // Listing is restartable
        assert_eq!(storage.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_listed_file() {
        let (storage, _dir) = storage();
        std::fs::write(storage.root().join("data.zip"), b"zip").unwrap();

        storage.delete("data.zip").await.unwrap();
        assert!(storage.list().await.unwrap().is_empty());

        assert!(matches!(
            storage.delete("data.zip").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_rejects_traversal_before_touching_disk() {
        let (storage, dir) = storage();
        let outside = dir.path().join("secret.txt");
        std::fs::write(&outside, b"keep").unwrap();

        for name in ["../secret.txt", "..", "/etc/passwd", "a/b", "..\\secret.txt"] {
            assert!(
                matches!(storage.delete(name).await, Err(Error::InvalidTarget(_))),
                "{}",
                name
            );
        }
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn partial_files_are_not_deletable_or_visible() {
        let (storage, _dir) = storage();
        std::fs::write(storage.root().join("movie.mkv.part"), b"x").unwrap();

        assert!(!storage.exists("movie.mkv"));
        assert!(matches!(
            storage.delete("movie.mkv.part").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            storage.stat("movie.mkv.part").await,
            Err(Error::NotFound(_))
        ));

        assert!(storage.discard_partial("movie.mkv").await.unwrap());
        assert!(!storage.discard_partial("movie.mkv").await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_only_partials() {
        let (storage, _dir) = storage();
        std::fs::write(storage.root().join("keep.iso"), b"iso").unwrap();
        std::fs::write(storage.root().join("a.iso.part"), b"1").unwrap();
        std::fs::write(storage.root().join("b.iso.part"), b"2").unwrap();

        assert_eq!(storage.sweep_partials().await.unwrap(), 2);
        assert_eq!(names(&storage.list().await.unwrap()), vec!["keep.iso"]);
    }

    #[test]
    fn paths_stay_inside_root() {
        let (storage, _dir) = storage();
        let path = storage.absolute_path("data.zip").unwrap();
        assert_eq!(path.parent(), Some(storage.root()));
        storage.confine(&path).unwrap();

        assert!(storage.absolute_path("../data.zip").is_err());
        assert!(storage.confine(&storage.root().join("sub").join("x")).is_err());
        assert!(storage.confine(Path::new("/tmp/data.zip")).is_err());
        assert!(storage.confine(storage.root()).is_err());

        let partial = storage.partial_path("data.zip").unwrap();
        assert!(partial.ends_with("data.zip.part"));
    }
}
