//! Encrypted at-rest credential store.
//!
//! One sealed file per provider under `<base>/credentials`, AES-256-GCM
//! with a per-machine key (keychain, file fallback). The agent process
//! never reads this store; the intercepting proxy binds credentials from
//! it at run creation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use moat_common::{Error, ErrorKind, Provider, Secret};

mod cipher;
pub mod keyring;

pub use keyring::EncryptionKey;

const STORE_DIR: &str = "credentials";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("credential encryption failed")]
    Crypto,
    #[error(
        "insecure permissions {mode:o} on {path}: expected 0600; run `chmod 600 {path}`",
        path = path.display()
    )]
    InsecurePermissions { path: PathBuf, mode: u32 },
    #[error("malformed credential store entry")]
    Malformed,
    #[error("keychain error: {0}")]
    Keychain(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<VaultError> for Error {
    fn from(err: VaultError) -> Self {
        match &err {
            VaultError::InsecurePermissions { .. } => {
                Error::source(ErrorKind::InsecurePermissions, err)
            }
            _ => Error::source(ErrorKind::Internal, err),
        }
    }
}

/// A stored credential. At most one per provider; a new grant supersedes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: Provider,
    pub token: Secret<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(provider: Provider, token: String, scopes: Vec<String>) -> Self {
        Self {
            provider,
            token: Secret::new(token),
            scopes,
            expires_at: None,
            created_at: Utc::now(),
        }
    }
}

/// SSH keys approved for a host, stored under the `ssh` provider slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SshMappings {
    /// host → approved key fingerprints (`SHA256:…`).
    hosts: BTreeMap<String, BTreeSet<String>>,
}

pub struct Vault {
    dir: PathBuf,
    key: EncryptionKey,
    // Serializes read-modify-write sequences within this process. New
    // grants happen through the user-facing grant command, so no
    // cross-process coordination is needed on this path.
    io: Mutex<()>,
}

impl Vault {
    /// Open the store under `base_dir` (normally `~/.moat`), loading or
    /// creating the machine key.
    pub fn open(base_dir: &Path) -> Result<Self, VaultError> {
        let key = keyring::get_or_create(base_dir)?;
        Self::with_key(base_dir, key)
    }

    /// Open with an explicit key. Used by tests and by processes that have
    /// already resolved the key.
    pub fn with_key(base_dir: &Path, key: EncryptionKey) -> Result<Self, VaultError> {
        let dir = base_dir.join(STORE_DIR);
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir,
            key,
            io: Mutex::new(()),
        })
    }

    pub fn save(&self, credential: &Credential) -> Result<(), VaultError> {
        let _guard = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let plaintext = serde_json::to_vec(credential).map_err(|_| VaultError::Malformed)?;
        self.write_sealed(&credential.provider.name(), &plaintext)
    }

    pub fn get(&self, provider: &Provider) -> Result<Option<Credential>, VaultError> {
        let _guard = self.io.lock().unwrap_or_else(|e| e.into_inner());
        match self.read_sealed(&provider.name())? {
            Some(plaintext) => {
                let credential =
                    serde_json::from_slice(&plaintext).map_err(|_| VaultError::Malformed)?;
                Ok(Some(credential))
            }
            None => Ok(None),
        }
    }

    /// Remove the ciphertext for `provider`. Missing entries are fine.
    pub fn delete(&self, provider: &Provider) -> Result<(), VaultError> {
        let _guard = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.entry_path(&provider.name());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn list(&self) -> Result<Vec<Credential>, VaultError> {
        let _guard = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let mut credentials = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == "ssh" || !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(plaintext) = self.read_sealed(name)? {
                if let Ok(credential) = serde_json::from_slice::<Credential>(&plaintext) {
                    credentials.push(credential);
                } else {
                    debug!(entry = name, "skipping malformed credential entry");
                }
            }
        }
        credentials.sort_by_key(|c| c.provider.name());
        Ok(credentials)
    }

    /// Approve `fingerprints` for `host`, replacing any previous set.
    pub fn save_ssh_mapping(
        &self,
        host: &str,
        fingerprints: BTreeSet<String>,
    ) -> Result<(), VaultError> {
        let _guard = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let mut mappings = self.read_ssh_mappings()?;
        mappings.hosts.insert(host.to_string(), fingerprints);
        let plaintext = serde_json::to_vec(&mappings).map_err(|_| VaultError::Malformed)?;
        self.write_sealed("ssh", &plaintext)
    }

    /// The allow-list for an SSH-agent proxy serving `hosts`:
    /// fingerprint → hosts it may sign for. Hosts with no stored mapping
    /// are absent from the result.
    pub fn ssh_mappings_for_hosts(
        &self,
        hosts: &[String],
    ) -> Result<BTreeMap<String, BTreeSet<String>>, VaultError> {
        let _guard = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let mappings = self.read_ssh_mappings()?;
        let mut allowed: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for host in hosts {
            if let Some(fingerprints) = mappings.hosts.get(host) {
                for fingerprint in fingerprints {
                    allowed
                        .entry(fingerprint.clone())
                        .or_default()
                        .insert(host.clone());
                }
            }
        }
        Ok(allowed)
    }

    fn read_ssh_mappings(&self) -> Result<SshMappings, VaultError> {
        match self.read_sealed("ssh")? {
            Some(plaintext) => {
                serde_json::from_slice(&plaintext).map_err(|_| VaultError::Malformed)
            }
            None => Ok(SshMappings::default()),
        }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_sealed(&self, name: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        let sealed = cipher::seal(self.key.bytes(), plaintext)?;
        let path = self.entry_path(name);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(&sealed)?;
        Ok(())
    }

    fn read_sealed(&self, name: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let path = self.entry_path(name);
        let sealed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        cipher::open(self.key.bytes(), &sealed).map(Some)
    }
}
