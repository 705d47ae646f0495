//! Session store
//!
//! Each client owns one directory, `<root>/session-<clientId>`, holding the
//! credentials the transport persists after pairing. The store only creates,
//! clears, and inspects these directories; their contents are opaque.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::Result;

/// Lock artifacts a transport may leave behind; they are not credentials.
const IGNORED_ENTRIES: &[&str] = &["SingletonLock", "SingletonCookie", "SingletonSocket"];

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_path(&self, client_id: &str) -> PathBuf {
        self.root.join(format!("session-{}", client_id))
    }

    /// Create the session directory if needed and return its path
    pub async fn ensure(&self, client_id: &str) -> Result<PathBuf> {
        let path = self.session_path(client_id);
        tokio::fs::create_dir_all(&path).await?;
        debug!(client_id, path = %path.display(), "Session directory ready");
        Ok(path)
    }

    /// Remove persisted credentials. Returns `false` if there was nothing to remove.
    pub async fn clear(&self, client_id: &str) -> Result<bool> {
        let path = self.session_path(client_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(client_id, path = %path.display(), "Cleared persisted session");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// True if the session directory holds anything besides lock artifacts.
    ///
    /// An unreadable directory counts as empty and is logged.
    pub async fn has_persisted_session(&self, client_id: &str) -> bool {
        let path = self.session_path(client_id);
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return false,
            Err(e) => {
                warn!(client_id, path = %path.display(), "Cannot read session directory: {}", e);
                return false;
            }
        };
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if !IGNORED_ENTRIES.contains(&name.as_ref()) {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(e) => {
                    warn!(client_id, path = %path.display(), "Cannot list session directory: {}", e);
                    return false;
                }
            }
        }
    }
}
