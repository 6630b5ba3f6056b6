//! Secure credential storage.
//!
//! The keypair and certificate are stored under a fixed identifier and
//! only ever touched by the authenticator. Writes are overwrite-if-different:
//! storing the same value twice is a no-op, and a changed value replaces the
//! old one atomically.

use super::error::StoreError;
use super::types::{Certificate, VpnKeys};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Keys file name inside the store directory.
pub const KEYS_FILE: &str = "keys.json";

/// Certificate file name inside the store directory.
pub const CERTIFICATE_FILE: &str = "certificate.json";

/// Storage for the keypair and certificate.
pub trait CredentialStore: Send + Sync {
    /// Stored keys, if any.
    fn load_keys(&self) -> Result<Option<VpnKeys>, StoreError>;

    /// Store keys.
    fn store_keys(&self, keys: &VpnKeys) -> Result<(), StoreError>;

    /// Stored certificate, if any.
    fn load_certificate(&self) -> Result<Option<Certificate>, StoreError>;

    /// Store a certificate.
    fn store_certificate(&self, certificate: &Certificate) -> Result<(), StoreError>;

    /// Remove the certificate only.
    fn clear_certificate(&self) -> Result<(), StoreError>;

    /// Remove keys and certificate.
    fn clear(&self) -> Result<(), StoreError>;
}

/// File-backed store: `keys.json` and `certificate.json` in one directory.
///
/// The directory is created 0700 and files are written 0600 through a
/// temporary file and a rename.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default location under the user's data directory.
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("vpnctl")
            .join("credentials")
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    fn store<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.dir.join(name);
        let contents = serde_json::to_vec_pretty(value)?;

        if let Ok(existing) = fs::read(&path)
            && existing == contents
        {
            debug!("{:?} unchanged, skipping write", path);
            return Ok(());
        }

        self.ensure_dir()?;
        let tmp = self.dir.join(format!(".{name}.tmp"));
        write_restricted_file(&tmp, &contents)?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: e,
        })?;
        debug!("Wrote {:?}", path);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        let io_err = |e: std::io::Error| StoreError::Io {
            path: self.dir.clone(),
            source: e,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700)).map_err(io_err)
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_keys(&self) -> Result<Option<VpnKeys>, StoreError> {
        self.load(KEYS_FILE)
    }

    fn store_keys(&self, keys: &VpnKeys) -> Result<(), StoreError> {
        self.store(KEYS_FILE, keys)
    }

    fn load_certificate(&self) -> Result<Option<Certificate>, StoreError> {
        self.load(CERTIFICATE_FILE)
    }

    fn store_certificate(&self, certificate: &Certificate) -> Result<(), StoreError> {
        self.store(CERTIFICATE_FILE, certificate)
    }

    fn clear_certificate(&self) -> Result<(), StoreError> {
        self.remove(CERTIFICATE_FILE)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.remove(CERTIFICATE_FILE)?;
        self.remove(KEYS_FILE)
    }
}

/// Write a file with restricted permissions (0600).
fn write_restricted_file(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let io_err = |e: std::io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<(Option<VpnKeys>, Option<Certificate>)>,
}

impl MemoryCredentialStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with credentials.
    pub fn with_credentials(keys: Option<VpnKeys>, certificate: Option<Certificate>) -> Self {
        Self {
            inner: Mutex::new((keys, certificate)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_keys(&self) -> Result<Option<VpnKeys>, StoreError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).0.clone())
    }

    fn store_keys(&self, keys: &VpnKeys) -> Result<(), StoreError> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0 = Some(keys.clone());
        Ok(())
    }

    fn load_certificate(&self) -> Result<Option<Certificate>, StoreError> {
        Ok(self.inner.lock().unwrap_or_else(PoisonError::into_inner).1.clone())
    }

    fn store_certificate(&self, certificate: &Certificate) -> Result<(), StoreError> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1 = Some(certificate.clone());
        Ok(())
    }

    fn clear_certificate(&self) -> Result<(), StoreError> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1 = None;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = (None, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn certificate() -> Certificate {
        Certificate {
            raw: "-----BEGIN CERTIFICATE-----".into(),
            valid_until: Utc::now(),
            refresh_time: Utc::now(),
        }
    }

    #[test]
    fn test_missing_files_load_as_none() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("creds"));

        assert!(store.load_keys().unwrap().is_none());
        assert!(store.load_certificate().unwrap().is_none());
    }

    #[test]
    fn test_files_are_private() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("creds"));
        let keys = VpnKeys::from_pem("priv".into(), "pub".into());

        store.store_keys(&keys).unwrap();

        let file_mode = fs::metadata(store.dir().join(KEYS_FILE)).unwrap().permissions().mode();
        let dir_mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(store.load_keys().unwrap(), Some(keys));
    }

    #[test]
    fn test_identical_write_is_skipped() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        let cert = certificate();

        store.store_certificate(&cert).unwrap();
        let path = dir.path().join(CERTIFICATE_FILE);
        let first: SystemTime = fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.store_certificate(&cert).unwrap();
        let second = fs::metadata(&path).unwrap().modified().unwrap();

        assert_eq!(first, second);
        assert!(!dir.path().join(format!(".{CERTIFICATE_FILE}.tmp")).exists());
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path());
        store
            .store_keys(&VpnKeys::from_pem("priv".into(), "pub".into()))
            .unwrap();
        store.store_certificate(&certificate()).unwrap();

        store.clear_certificate().unwrap();
        assert!(store.load_certificate().unwrap().is_none());
        assert!(store.load_keys().unwrap().is_some());

        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load_keys().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_serialization_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(KEYS_FILE), b"not json").unwrap();
        let store = FileCredentialStore::new(dir.path());

        assert!(matches!(store.load_keys(), Err(StoreError::Serialization(_))));
    }
}
