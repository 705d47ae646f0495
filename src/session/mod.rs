//! Per-client session identity and on-disk credential storage

pub mod store;

use std::path::PathBuf;

pub use store::SessionStore;

/// Identity of one gateway client and where its credentials live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub client_id: String,
    pub session_path: PathBuf,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, store: &SessionStore) -> Self {
        let client_id = client_id.into();
        let session_path = store.session_path(&client_id);
        Self {
            client_id,
            session_path,
        }
    }

    pub fn session_path_display(&self) -> String {
        self.session_path.display().to_string()
    }
}
