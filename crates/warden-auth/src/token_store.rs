//! Persistence for the refresh credential between runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::AuthError;

const DEFAULT_KEYRING_SERVICE: &str = "warden-cli";
const KEYRING_USER: &str = "refresh-token";
const CREDENTIALS_FILE_NAME: &str = "credentials";

/// Environment override consulted on load.
pub const REFRESH_TOKEN_ENV: &str = "WARDEN_AUTH__REFRESH_TOKEN";

/// Where a loaded credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Keyring,
    Env,
    File,
    Memory,
}

impl CredentialSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Keyring => "keyring",
            Self::Env => "env",
            Self::File => "file",
            Self::Memory => "memory",
        }
    }
}

/// Stores the session's refresh credential.
pub trait CredentialStore: Send + Sync {
    /// The stored credential and where it came from, if any.
    fn load(&self) -> Option<(String, CredentialSource)>;

    /// Persist `credential`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::TokenStoreError` if nothing could be written.
    fn store(&self, credential: &str) -> Result<(), AuthError>;

    /// Remove the stored credential. Removing nothing is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::TokenStoreError` if a stored copy could not be removed.
    fn delete(&self) -> Result<(), AuthError>;
}

/// OS keychain with a `~/.warden/credentials` file fallback.
///
/// Load priority: keyring → `WARDEN_AUTH__REFRESH_TOKEN` → file.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: Option<String>,
    credentials_path: PathBuf,
}

impl KeyringStore {
    /// Keyring service `warden-cli` (override with `WARDEN_KEYRING_SERVICE`)
    /// and the file under the home directory.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::TokenStoreError` if the home directory is unknown.
    pub fn new() -> Result<Self, AuthError> {
        let service = std::env::var("WARDEN_KEYRING_SERVICE")
            .unwrap_or_else(|_| DEFAULT_KEYRING_SERVICE.to_string());
        Ok(Self {
            service: Some(service),
            credentials_path: default_credentials_path()?,
        })
    }

    /// Skip the keychain and use only `path`.
    #[must_use]
    pub fn file_only(path: impl Into<PathBuf>) -> Self {
        Self {
            service: None,
            credentials_path: path.into(),
        }
    }

    #[must_use]
    pub fn credentials_path(&self) -> &Path {
        &self.credentials_path
    }

    fn entry(&self) -> Option<keyring::Entry> {
        let service = self.service.as_deref()?;
        match keyring::Entry::new(service, KEYRING_USER) {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::debug!(%error, "keyring unavailable");
                None
            }
        }
    }

    fn store_file(&self, credential: &str) -> Result<(), AuthError> {
        let path = &self.credentials_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AuthError::TokenStoreError(format!("mkdir {}: {e}", parent.display()))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(parent, fs::Permissions::from_mode(0o700)) {
                    tracing::warn!("failed to chmod 0700 {}: {e}", parent.display());
                }
            }
        }
        fs::write(path, credential)
            .map_err(|e| AuthError::TokenStoreError(format!("write {}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(|e| AuthError::TokenStoreError(format!("chmod {}: {e}", path.display())))?;
        }

        Ok(())
    }

    fn load_file(&self) -> Option<String> {
        fs::read_to_string(&self.credentials_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl CredentialStore for KeyringStore {
    fn load(&self) -> Option<(String, CredentialSource)> {
        if let Some(entry) = self.entry()
            && let Ok(token) = entry.get_password()
            && !token.is_empty()
        {
            return Some((token, CredentialSource::Keyring));
        }

        if let Ok(token) = std::env::var(REFRESH_TOKEN_ENV)
            && !token.is_empty()
        {
            return Some((token, CredentialSource::Env));
        }

        self.load_file().map(|token| (token, CredentialSource::File))
    }

    fn store(&self, credential: &str) -> Result<(), AuthError> {
        if let Some(entry) = self.entry() {
            match entry.set_password(credential) {
                Ok(()) => return Ok(()),
                Err(error) => tracing::warn!(%error, "keyring store failed; falling back to file"),
            }
        }
        self.store_file(credential)
    }

    fn delete(&self) -> Result<(), AuthError> {
        if let Some(entry) = self.entry() {
            // Absent entries are fine.
            let _ = entry.delete_credential();
        }

        let path = &self.credentials_path;
        if path.exists() {
            fs::remove_file(path).map_err(|e| {
                AuthError::TokenStoreError(format!("failed to delete {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }
}

/// Process-local store, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    credential: Mutex<Option<String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_credential(credential: impl Into<String>) -> Self {
        Self {
            credential: Mutex::new(Some(credential.into())),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> Option<(String, CredentialSource)> {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map(|c| (c, CredentialSource::Memory))
    }

    fn store(&self, credential: &str) -> Result<(), AuthError> {
        *self.credential.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential.into());
        Ok(())
    }

    fn delete(&self) -> Result<(), AuthError> {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

fn default_credentials_path() -> Result<PathBuf, AuthError> {
    dirs::home_dir()
        .map(|h| h.join(".warden").join(CREDENTIALS_FILE_NAME))
        .ok_or_else(|| {
            AuthError::TokenStoreError("home directory not found — cannot store credentials".into())
        })
}
