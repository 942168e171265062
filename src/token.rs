//! Credential persistence
//!
//! Stores the access/refresh token pair between runs. The store only ever
//! answers "what is stored" - token validity is the server's call, surfaced
//! through the request path (see `api`).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Durable home for the token pair.
///
/// `save` is a partial update: a `None` or empty value leaves whatever is
/// already stored for that slot untouched. `clear` removes both.
pub trait TokenStore: Send + Sync {
    fn save(&self, access: Option<&str>, refresh: Option<&str>) -> Result<()>;
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
    fn clear(&self) -> Result<()>;

    /// Presence of a stored access token. Says nothing about validity and
    /// ignores the refresh token entirely.
    fn has_access_token(&self) -> bool {
        self.access_token().is_some()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

/// JSON-file-backed token store
///
/// The file holds `{"accessToken": ..., "refreshToken": ...}` with both
/// fields optional. Writes go through a temp file + rename so readers never
/// see a torn file.
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> StoredTokens {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!(path = %self.path.display(), "token file unreadable, treating as empty: {}", e);
                    StoredTokens::default()
                }
            },
            Err(_) => StoredTokens::default(),
        }
    }

    fn persist(&self, tokens: &StoredTokens) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(tokens)?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl TokenStore for FileTokenStore {
    fn save(&self, access: Option<&str>, refresh: Option<&str>) -> Result<()> {
        let guard = self.write_lock.lock();
        let _guard = match guard {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut tokens = self.load();
        if let Some(access) = access {
            if !access.is_empty() {
                tokens.access_token = Some(access.to_string());
            }
        }
        if let Some(refresh) = refresh {
            if !refresh.is_empty() {
                tokens.refresh_token = Some(refresh.to_string());
            }
        }
        self.persist(&tokens)?;
        debug!(path = %self.path.display(), "tokens saved");
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        non_empty(self.load().access_token)
    }

    fn refresh_token(&self) -> Option<String> {
        non_empty(self.load().refresh_token)
    }

    fn clear(&self) -> Result<()> {
        let guard = self.write_lock.lock();
        let _guard = match guard {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "tokens cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory token store for tests and embedders with their own persistence
#[derive(Default)]
pub struct MemoryTokenStore {
    inner: Mutex<(Option<String>, Option<String>)>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start out already holding a token pair
    pub fn with_tokens(access: &str, refresh: &str) -> Self {
        let store = Self::new();
        let mut inner = store.inner.lock().unwrap_or_else(|p| p.into_inner());
        *inner = (Some(access.to_string()), Some(refresh.to_string()));
        drop(inner);
        store
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, access: Option<&str>, refresh: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(access) = access {
            if !access.is_empty() {
                inner.0 = Some(access.to_string());
            }
        }
        if let Some(refresh) = refresh {
            if !refresh.is_empty() {
                inner.1 = Some(refresh.to_string());
            }
        }
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        non_empty(self.inner.lock().unwrap_or_else(|p| p.into_inner()).0.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        non_empty(self.inner.lock().unwrap_or_else(|p| p.into_inner()).1.clone())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *inner = (None, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store() -> (tempfile::TempDir, FileTokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("tokens.json"));
        (dir, store)
    }

    #[test]
    fn test_missing_file_reads_as_absent() {
        let (_dir, store) = file_store();
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
        assert!(!store.has_access_token());
    }

    #[test]
    fn test_save_and_read_back() {
        let (_dir, store) = file_store();
        store.save(Some("a1"), Some("r1")).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a1"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
    }

    #[test]
    fn test_partial_save_preserves_counterpart() {
        let (_dir, store) = file_store();
        store.save(Some("a1"), Some("r1")).unwrap();

        // Only the access token rotates; refresh must survive
        store.save(Some("a2"), None).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));

        // And the other way around
        store.save(None, Some("r2")).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r2"));
    }

    #[test]
    fn test_empty_values_are_ignored_on_save() {
        let (_dir, store) = file_store();
        store.save(Some("a1"), Some("r1")).unwrap();
        store.save(Some(""), Some("")).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a1"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
    }

    #[test]
    fn test_has_access_token_ignores_refresh() {
        let (_dir, store) = file_store();
        store.save(Some("a1"), None).unwrap();
        assert!(store.has_access_token());
        assert!(store.refresh_token().is_none());
    }

    #[test]
    fn test_clear_removes_both_and_is_idempotent() {
        let (_dir, store) = file_store();
        store.save(Some("a1"), Some("r1")).unwrap();
        store.clear().unwrap();
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());

        // Clearing again must not error
        store.clear().unwrap();
    }

    #[test]
    fn test_memory_store_behaves_like_file_store() {
        let store = MemoryTokenStore::with_tokens("a1", "r1");
        store.save(Some("a2"), None).unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
        store.clear().unwrap();
        assert!(!store.has_access_token());
    }
}
