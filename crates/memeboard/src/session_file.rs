//! Persisted sign-in session.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use memeboard_feed::Session;
use miette::Result;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// JSON file holding the signed-in session.
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/memeboard/session.json`.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("memeboard").join("session.json"))
            .ok_or_else(|| miette::miette!("could not determine config directory"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored session, if any.
    pub async fn load(&self) -> Result<Option<Session>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(miette::miette!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                ));
            }
        };

        let session = serde_json::from_slice(&bytes).map_err(|e| {
            miette::miette!("corrupt session file {}: {}", self.path.display(), e)
        })?;
        Ok(Some(session))
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| miette::miette!("failed to create {}: {}", parent.display(), e))?;
        }

        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| miette::miette!("failed to encode session: {}", e))?;
        let mut file = private_options()
            .open(&self.path)
            .await
            .map_err(|e| miette::miette!("failed to open {}: {}", self.path.display(), e))?;
        // The mode only applies on creation; tighten files left by older runs.
        restrict_permissions(&self.path).await?;
        file.write_all(&json)
            .await
            .map_err(|e| miette::miette!("failed to write {}: {}", self.path.display(), e))?;
        file.flush()
            .await
            .map_err(|e| miette::miette!("failed to write {}: {}", self.path.display(), e))?;

        debug!(path = %self.path.display(), "session saved");
        Ok(())
    }

    /// Remove the stored session. Returns whether one existed.
    pub async fn clear(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(miette::miette!(
                "failed to remove {}: {}",
                self.path.display(),
                e
            )),
        }
    }
}

fn private_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| miette::miette!("failed to restrict {}: {}", path.display(), e))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
