// # File State Store
//
// Shared-directory implementation of StateStore.
//
// ## Purpose
//
// The initializer, the watch loop and the relay's liveness check share a
// directory. The initializer writes the first document, the watcher keeps
// it current, and the liveness check reacts to the restart marker.
//
// ## Files
//
// - `dns-state.json`: the state document
// - `current-ip`: bare incoming address, for readers predating the document
// - `kill-pod`: zero-byte restart marker
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Automatic backup: Keeps .backup of the previous document
// - Recovery: Falls back to the backup, then to `current-ip`

use async_trait::async_trait;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::Error;
use crate::traits::state_store::{DetectedState, StateDocument, StateStore};

/// Name of the state document
pub const STATE_FILE: &str = "dns-state.json";

/// Name of the single-address file
pub const LEGACY_IP_FILE: &str = "current-ip";

/// Name of the restart marker
pub const RESTART_MARKER: &str = "kill-pod";

/// File-based state store in a shared directory
///
/// # Example
///
/// ```rust,no_run
/// use maildns_core::state::FileStateStore;
/// use maildns_core::traits::{DetectedState, StateStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileStateStore::new("/shared");
///
///     let state = DetectedState::new("1.2.3.4".parse()?, None, Vec::new());
///     store.save(&state).await?;
///
///     assert_eq!(store.load().await?, Some(state));
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Store rooted at `dir`; nothing is touched until the first call
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// The shared directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the state document
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// Path of the restart marker
    pub fn restart_marker_path(&self) -> PathBuf {
        self.dir.join(RESTART_MARKER)
    }

    fn legacy_path(&self) -> PathBuf {
        self.dir.join(LEGACY_IP_FILE)
    }

    /// Load the document with recovery
    ///
    /// Recovery strategy:
    /// 1. Try the main document
    /// 2. If unreadable or corrupt, try the backup
    /// 3. Otherwise fall back to the single-address file
    async fn load_with_recovery(&self) -> Result<Option<DetectedState>, Error> {
        let path = self.state_path();

        match Self::load_document(&path).await {
            Ok(Some(state)) => return Ok(Some(state)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    "State document appears corrupted: {}. Attempting recovery from backup.",
                    e
                );

                let backup_path = backup_path(&path);
                match Self::load_document(&backup_path).await {
                    Ok(Some(state)) => {
                        tracing::info!("Recovered state from backup");
                        return Ok(Some(state));
                    }
                    Ok(None) => tracing::warn!("No usable backup found"),
                    Err(backup_err) => tracing::error!("Backup also corrupted: {}", backup_err),
                }
            }
        }

        self.load_legacy().await
    }

    async fn load_document(path: &Path) -> Result<Option<DetectedState>, Error> {
        if !fs::try_exists(path).await? {
            tracing::debug!("State document does not exist: {}", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::state_store(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let document: StateDocument = serde_json::from_str(&content).map_err(|e| {
            Error::state_store(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        Ok(document.into_state())
    }

    async fn load_legacy(&self) -> Result<Option<DetectedState>, Error> {
        let path = self.legacy_path();
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        match content.trim().parse::<IpAddr>() {
            Ok(ip) => {
                tracing::debug!("Loaded incoming IP {} from {}", ip, path.display());
                Ok(Some(DetectedState::new(ip, None, Vec::new())))
            }
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}", path.display());
                Ok(None)
            }
        }
    }

    /// Write `content` to `path` through a temporary file
    ///
    /// With `keep_backup`, the previous file is copied to `.backup` first.
    async fn write_atomic(path: &Path, content: &[u8], keep_backup: bool) -> Result<(), Error> {
        let temp = temp_path(path);
        {
            let mut file = fs::File::create(&temp).await.map_err(|e| {
                Error::state_store(format!(
                    "Failed to create temp file {}: {}",
                    temp.display(),
                    e
                ))
            })?;
            file.write_all(content).await.map_err(|e| {
                Error::state_store(format!("Failed to write {}: {}", temp.display(), e))
            })?;
            file.flush().await.map_err(|e| {
                Error::state_store(format!("Failed to flush {}: {}", temp.display(), e))
            })?;
        }

        if keep_backup && fs::try_exists(path).await.unwrap_or(false) {
            if let Err(e) = fs::copy(path, backup_path(path)).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp, path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to rename {} to {}: {}",
                temp.display(),
                path.display(),
                e
            ))
        })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<DetectedState>, Error> {
        self.load_with_recovery().await
    }

    async fn save(&self, state: &DetectedState) -> Result<(), Error> {
        let document = StateDocument::from_state(state);
        let json = serde_json::to_string_pretty(&document)?;

        Self::write_atomic(&self.state_path(), json.as_bytes(), true).await?;
        Self::write_atomic(
            &self.legacy_path(),
            state.incoming_ip.to_string().as_bytes(),
            false,
        )
        .await?;

        tracing::debug!("State written to {}", self.dir.display());
        Ok(())
    }

    async fn request_restart(&self) -> Result<(), Error> {
        let path = self.restart_marker_path();
        fs::File::create(&path).await.map_err(|e| {
            Error::state_store(format!(
                "Failed to create restart marker {}: {}",
                path.display(),
                e
            ))
        })?;
        tracing::info!("Restart marker written to {}", path.display());
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".backup");
    PathBuf::from(backup)
}
