use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

pub mod enumerate;
pub mod header;

/// Length in bytes of the identifier stored in the device header.
pub const ID_LEN: usize = 16;

/// Length in bytes of a freshly generated volume key (`aes-xts-plain64`, 512 bit).
pub const KEY_LEN: usize = 64;

#[derive(Error, Debug, PartialEq)]
pub enum DeviceError {
    #[error("device `{0}` has no identity, refusing to attach a key")]
    KeyWithoutIdentity(PathBuf),
    #[error("device `{path}` already carries identity {existing}")]
    IdentityAlreadySet { path: PathBuf, existing: DeviceId },
    #[error("invalid device id length {0}, expected {ID_LEN}")]
    InvalidIdLength(usize),
    #[error("empty key material")]
    EmptyKey,
}

pub type Result<T, E = DeviceError> = core::result::Result<T, E>;

/// Opaque identifier embedded in the device header and used as the custody lookup key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; ID_LEN]);

impl DeviceId {
    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<&[u8]> for DeviceId {
    type Error = DeviceError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| DeviceError::InvalidIdLength(bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.to_hex())
    }
}

/// Secret volume key. Zeroed on drop, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Key(Zeroizing<Vec<u8>>);

impl Key {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(DeviceError::EmptyKey);
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short SHA-256 prefix, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_slice());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(sha256:{}..)", self.fingerprint())
    }
}

/// One physical block device discovered on this node.
///
/// Identity and key start out empty and are filled in by the resolve pass.
/// Nothing here is persisted: the header on the device and the custody
/// service hold the durable state.
#[derive(Debug, Clone)]
pub struct StorageDevice {
    by_path: PathBuf,
    real_path: PathBuf,
    id: Option<DeviceId>,
    key: Option<Key>,
}

impl StorageDevice {
    pub fn new(by_path: impl Into<PathBuf>, real_path: impl Into<PathBuf>) -> Self {
        Self {
            by_path: by_path.into(),
            real_path: real_path.into(),
            id: None,
            key: None,
        }
    }

    pub fn by_path(&self) -> &Path {
        &self.by_path
    }

    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    pub fn id(&self) -> Option<&DeviceId> {
        self.id.as_ref()
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Records the identity read from or written to the header. Identities never change.
    pub fn set_id(&mut self, id: DeviceId) -> Result<()> {
        match self.id {
            Some(existing) if existing != id => Err(DeviceError::IdentityAlreadySet {
                path: self.real_path.clone(),
                existing,
            }),
            _ => {
                self.id = Some(id);
                Ok(())
            }
        }
    }

    pub fn set_key(&mut self, key: Key) -> Result<()> {
        if self.id.is_none() {
            return Err(DeviceError::KeyWithoutIdentity(self.real_path.clone()));
        }
        self.key = Some(key);
        Ok(())
    }

    /// Name of the decrypted mapping, derived from the identity so it is stable across boots.
    pub fn mapping_name(&self, prefix: &str) -> Option<String> {
        self.id.map(|id| format!("{prefix}{}", id.to_hex()))
    }
}
