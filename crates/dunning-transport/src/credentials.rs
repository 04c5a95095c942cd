/// Session credential persistence.
///
/// The transport hands out an opaque blob after pairing. The store keeps
/// it across restarts so the next `connect` resumes without a new QR.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::TransportError;

/// Name of the blob file inside a [`FileCredentialStore`] directory.
const CREDS_FILE: &str = "creds.bin";

/// Opaque session blob. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credentials({} bytes)", self.0.len())
    }
}

/// Load/save/clear over the session blob.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// `None` when nothing has been saved (or it was cleared).
    async fn load(&self) -> Result<Option<Credentials>, TransportError>;

    async fn save(&self, credentials: &Credentials) -> Result<(), TransportError>;

    async fn clear(&self) -> Result<(), TransportError>;
}

// ── Directory-backed store ────────────────────────────────────────────

/// Keeps the blob in `<dir>/creds.bin`, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CREDS_FILE)
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, TransportError> {
        match tokio::fs::read(self.path()).await {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(Credentials(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), TransportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!("{CREDS_FILE}.tmp"));
        tokio::fs::write(&tmp, credentials.as_bytes()).await?;
        tokio::fs::rename(&tmp, self.path()).await?;
        tracing::debug!(dir = %self.dir.display(), "credentials saved");
        Ok(())
    }

    async fn clear(&self) -> Result<(), TransportError> {
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => {
                tracing::info!(dir = %self.dir.display(), "credentials cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── In-memory store ───────────────────────────────────────────────────

/// Process-local store, for tests and throwaway sessions.
///
/// Clones share the same slot.
#[derive(Debug, Default, Clone)]
pub struct MemoryCredentialStore {
    slot: Arc<Mutex<Option<Credentials>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(credentials))),
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, TransportError> {
        Ok(self.slot.lock().map(|s| s.clone()).unwrap_or(None))
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), TransportError> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(credentials.clone());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), TransportError> {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
        Ok(())
    }
}
