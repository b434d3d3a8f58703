use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fs2::FileExt;
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::VaultError;

const KEYCHAIN_SERVICE: &str = "moat";
const KEYCHAIN_ACCOUNT: &str = "encryption-key";
const KEY_FILE: &str = "encryption.key";
const LOCK_FILE: &str = "key.lock";
const KEY_LEN: usize = 32;

/// The per-machine 256-bit key every credential is sealed with.
///
/// Zeroed on drop; never printed.
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    fn decode(encoded: &str) -> Result<Self, VaultError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| VaultError::Malformed)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| VaultError::Malformed)?;
        Ok(Self(key))
    }

    fn encode(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Load the machine key, creating it on first use.
///
/// The system keychain (service `moat`, account `encryption-key`) is
/// preferred; headless machines fall back to a 0600 file under `base_dir`.
/// An existing key always wins over creating a new one.
pub fn get_or_create(base_dir: &Path) -> Result<EncryptionKey, VaultError> {
    match from_keychain() {
        Ok(key) => Ok(key),
        Err(err) => {
            debug!(error = %err, "keychain unavailable, using file-backed key");
            from_file(base_dir)
        }
    }
}

fn from_keychain() -> Result<EncryptionKey, VaultError> {
    let entry = ::keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT)
        .map_err(|err| VaultError::Keychain(err.to_string()))?;
    match entry.get_password() {
        Ok(encoded) => EncryptionKey::decode(&encoded),
        Err(::keyring::Error::NoEntry) => {
            let key = EncryptionKey::generate();
            entry
                .set_password(&key.encode())
                .map_err(|err| VaultError::Keychain(err.to_string()))?;
            Ok(key)
        }
        Err(err) => Err(VaultError::Keychain(err.to_string())),
    }
}

/// File-backed key under `base_dir/encryption.key`.
///
/// First creation is serialized across processes by an exclusive lock on
/// `base_dir/key.lock`; after the lock is held the file is re-checked, so
/// concurrent callers all observe the same key.
pub fn from_file(base_dir: &Path) -> Result<EncryptionKey, VaultError> {
    fs::create_dir_all(base_dir)?;
    let key_path = base_dir.join(KEY_FILE);

    if key_path.exists() {
        return read_key_file(&key_path);
    }

    // Open without truncating so a concurrent creator's key survives.
    let lock = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(base_dir.join(LOCK_FILE))?;
    lock.lock_exclusive()?;

    let result = if key_path.exists() {
        read_key_file(&key_path)
    } else {
        let key = EncryptionKey::generate();
        write_key_file(&key_path, &key)?;
        Ok(key)
    };

    if let Err(err) = fs2::FileExt::unlock(&lock) {
        warn!(error = %err, "failed to release key lock");
    }
    result
}

fn read_key_file(path: &Path) -> Result<EncryptionKey, VaultError> {
    check_permissions(path)?;
    let encoded = fs::read_to_string(path)?;
    EncryptionKey::decode(&encoded)
}

fn write_key_file(path: &Path, key: &EncryptionKey) -> Result<(), VaultError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key.encode().as_bytes())?;
    Ok(())
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(VaultError::InsecurePermissions {
            path: path.to_path_buf(),
            mode,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), VaultError> {
    Ok(())
}

/// Path of the file-backed key, for remediation messages and tests.
pub fn key_file_path(base_dir: &Path) -> PathBuf {
    base_dir.join(KEY_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_key_is_created_once_and_reread() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = from_file(dir.path())?;
        let second = from_file(dir.path())?;
        assert_eq!(first.bytes(), second.bytes());
        Ok(())
    }

    #[test]
    fn concurrent_creation_yields_one_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().to_path_buf();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || from_file(&path).map(|k| *k.bytes()))
            })
            .collect();
        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.join().expect("thread panicked")?);
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn loose_permissions_are_refused() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let key = from_file(dir.path())?;
        drop(key);

        let path = key_file_path(dir.path());
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;

        let err = from_file(dir.path()).unwrap_err();
        assert!(matches!(err, VaultError::InsecurePermissions { .. }));
        assert!(err.to_string().contains("chmod 600"));
        Ok(())
    }

    #[test]
    fn key_survives_reencode() -> anyhow::Result<()> {
        let key = EncryptionKey::generate();
        let decoded = EncryptionKey::decode(&key.encode())?;
        assert_eq!(key.bytes(), decoded.bytes());
        Ok(())
    }
}
