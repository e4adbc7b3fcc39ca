//! Secret storage for the credential shadow
//!
//! `SecretStore` is opaque key → bytes persistence. Two implementations:
//!
//! - `FileSecretStore`: a JSON file mapping keys to base64 secrets. All writes
//!   use atomic temp-file + rename to prevent corruption on crash, and a tokio
//!   Mutex serializes concurrent writers. The in-memory map only changes once
//!   the file write has succeeded.
//! - `MemorySecretStore`: process-local, for tests and ephemeral sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::BoxFuture;
use crate::error::{AuthError, Result};

/// Key-value secret persistence.
pub trait SecretStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;
    fn set<'a>(&'a self, key: &'a str, secret: Vec<u8>) -> BoxFuture<'a, Result<()>>;
    /// Deleting an absent key succeeds.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// In-memory secret store.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl SecretStore for MemorySecretStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, secret: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.lock().await.insert(key.to_owned(), secret);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}

/// File-backed secret store.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to clone
/// a value out of the in-memory map.
pub struct FileSecretStore {
    path: PathBuf,
    state: Mutex<HashMap<String, String>>,
}

impl FileSecretStore {
    /// Open the store at `path`.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with no
    /// stored credential).
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| AuthError::Storage(format!("reading secret file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| AuthError::Storage(format!("parsing secret file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "opened secret store");
            entries
        } else {
            info!(path = %path.display(), "secret file not found, starting with empty store");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for FileSecretStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let encoded = self.state.lock().await.get(key).cloned();
            encoded
                .map(|value| {
                    STANDARD
                        .decode(value.as_bytes())
                        .map_err(|e| AuthError::Storage(format!("decoding secret {key}: {e}")))
                })
                .transpose()
        })
    }

    fn set<'a>(&'a self, key: &'a str, secret: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut next = state.clone();
            next.insert(key.to_owned(), STANDARD.encode(&secret));
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(key, "stored secret");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.contains_key(key) {
                return Ok(());
            }
            let mut next = state.clone();
            next.remove(key);
            write_atomic(&self.path, &next).await?;
            *state = next;
            debug!(key, "deleted secret");
            Ok(())
        })
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write the store to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| AuthError::Storage(format!("serializing secret file: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| AuthError::Storage(format!("creating secret directory: {e}")))?;

    let tmp_path = dir.join(format!(
        ".secrets.tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| AuthError::Storage(format!("writing temp secret file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| AuthError::Storage(format!("setting secret file permissions: {e}")))?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(AuthError::Storage(format!("renaming temp secret file: {e}")));
    }

    debug!(path = %path.display(), "persisted secrets");
    Ok(())
}
