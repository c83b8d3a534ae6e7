use crate::error::BackendError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-execution scratch directory holding the source file and, for
/// compiled languages, the produced binary.
///
/// The directory name embeds the execution id so concurrent runs never
/// share paths. Removal is guaranteed on every exit path: explicitly via
/// [`ArtifactGuard::cleanup`], or by `Drop` on early return, timeout or
/// panic. Removal failures are logged and otherwise ignored.
pub struct ArtifactGuard {
    dir: Option<TempDir>,
    source_path: PathBuf,
    binary_path: PathBuf,
}

impl ArtifactGuard {
    pub fn create(scratch_dir: &Path, execution_id: Uuid, extension: &str) -> Result<Self, BackendError> {
        std::fs::create_dir_all(scratch_dir)
            .map_err(|e| BackendError::io("creating scratch directory", e))?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("polyglot-{}-", execution_id))
            .tempdir_in(scratch_dir)
            .map_err(|e| BackendError::io("creating artifact directory", e))?;

        let source_path = dir.path().join(format!("main.{}", extension));
        let binary_path = dir.path().join("main");
        debug!(execution_id = %execution_id, dir = %dir.path().display(), "Artifact directory created");

        Ok(Self {
            dir: Some(dir),
            source_path,
            binary_path,
        })
    }

    pub async fn write_source(&self, code: &str) -> Result<(), BackendError> {
        tokio::fs::write(&self.source_path, code)
            .await
            .map_err(|e| BackendError::io("writing source file", e))
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    /// Remove the directory now, logging instead of failing
    pub fn cleanup(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(dir = %path.display(), error = %e, "Failed to remove execution artifacts");
            }
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_removes_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let guard = ArtifactGuard::create(scratch.path(), id, "c").unwrap();
        guard.write_source("int main(void) { return 0; }").await.unwrap();

        let dir = guard.dir().unwrap().to_path_buf();
        assert!(guard.source_path().exists());
        assert!(dir.file_name().unwrap().to_string_lossy().contains(&id.to_string()));
        assert_eq!(guard.source_path().extension().unwrap(), "c");

        guard.cleanup();
        assert!(!dir.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let dir = {
            let guard = ArtifactGuard::create(scratch.path(), Uuid::new_v4(), "rs").unwrap();
            std::fs::write(guard.binary_path(), b"\x7fELF").unwrap();
            guard.dir().unwrap().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn test_concurrent_guards_use_distinct_paths() {
        let scratch = tempfile::tempdir().unwrap();
        let a = ArtifactGuard::create(scratch.path(), Uuid::new_v4(), "c").unwrap();
        let b = ArtifactGuard::create(scratch.path(), Uuid::new_v4(), "c").unwrap();
        assert_ne!(a.source_path(), b.source_path());
        assert_ne!(a.binary_path(), b.binary_path());
    }

    #[test]
    fn test_creates_missing_scratch_root() {
        let scratch = tempfile::tempdir().unwrap();
        let nested = scratch.path().join("a/b");
        let guard = ArtifactGuard::create(&nested, Uuid::new_v4(), "py").unwrap();
        assert!(nested.exists());
        guard.cleanup();
    }
}
