use std::fs;
use std::path::PathBuf;
use tracing::warn;

use super::QueuedArtifact;

/// Local JSON copies of queue artifacts, one file per id.
///
/// The mirror is a last resort for reads when the shared store is down. It
/// is never authoritative: writes are best effort and failures only warn.
pub struct DiskMirror {
    dir: PathBuf,
}

impl DiskMirror {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Option<PathBuf> {
        if valid_id(id) {
            Some(self.dir.join(format!("{id}.json")))
        } else {
            warn!("refusing mirror path for malformed artifact id {id:?}");
            None
        }
    }

    pub fn write(&self, artifact: &QueuedArtifact) {
        let Some(path) = self.path_for(&artifact.id) else {
            return;
        };
        if let Err(err) = self.try_write(&path, artifact) {
            warn!("mirror write for {} failed: {err}", artifact.id);
        }
    }

    fn try_write(&self, path: &PathBuf, artifact: &QueuedArtifact) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(artifact)?;
        fs::write(path, json)?;
        Ok(())
    }

    #[must_use]
    pub fn read(&self, id: &str) -> Option<QueuedArtifact> {
        let path = self.path_for(id)?;
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(artifact) => Some(artifact),
            Err(err) => {
                warn!("mirror file {} is corrupt: {err}", path.display());
                None
            }
        }
    }

    /// Every readable artifact in the mirror. Corrupt files are skipped with
    /// a warning rather than failing the whole read.
    #[must_use]
    pub fn list(&self) -> Vec<QueuedArtifact> {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut artifacts = Vec::new();
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Ok(contents) = fs::read_to_string(&path) else {
                warn!("mirror file {} is unreadable", path.display());
                continue;
            };
            match serde_json::from_str(&contents) {
                Ok(artifact) => artifacts.push(artifact),
                Err(err) => warn!("mirror file {} is corrupt: {err}", path.display()),
            }
        }
        artifacts
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
