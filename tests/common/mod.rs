#![allow(dead_code)]

use async_trait::async_trait;
use eyre::Result;
use node_crypt::crypt::{Crypt, CryptError, Mapped};
use node_crypt::custody::{CustodyError, KeyCustody};
use node_crypt::device::header::{self, RESERVED_BYTES};
use node_crypt::device::{DeviceId, Key};
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

/// Size of every fake disk: the reserved header region plus one payload MiB.
pub const DISK_SIZE: u64 = 2 * RESERVED_BYTES;

/// A throwaway `/dev/disk/by-id` look-alike: `by-id/<alias>` symlinks
/// pointing at sparse files under `targets/`.
pub struct Namespace {
    _dir: TempDir,
    pub root: PathBuf,
    targets: PathBuf,
}

impl Namespace {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let root = dir.path().join("by-id");
        let targets = dir.path().join("targets");
        fs::create_dir(&root)?;
        fs::create_dir(&targets)?;
        Ok(Self {
            _dir: dir,
            root,
            targets,
        })
    }

    /// Creates a disk and a single alias for it, returns the backing file.
    pub fn disk(&self, alias: &str) -> Result<PathBuf> {
        let target = self.targets.join(format!("dev-{alias}"));
        let file = fs::File::create(&target)?;
        file.set_len(DISK_SIZE)?;
        self.alias(alias, &target)?;
        Ok(target.canonicalize()?)
    }

    pub fn alias(&self, alias: &str, target: &Path) -> Result<()> {
        symlink(target, self.root.join(alias))?;
        Ok(())
    }

    pub fn dangling(&self, alias: &str) -> Result<()> {
        symlink(self.targets.join("gone"), self.root.join(alias))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCustody {
    keys: Mutex<HashMap<DeviceId, Key>>,
    unreachable: Mutex<HashSet<DeviceId>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    pub fetches: AtomicUsize,
    pub registrations: AtomicUsize,
}

impl MemoryCustody {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn insert(&self, id: DeviceId, key: Key) {
        self.keys.lock().unwrap().insert(id, key);
    }

    pub fn get(&self, id: &DeviceId) -> Option<Key> {
        self.keys.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn make_unreachable(&self, id: DeviceId) {
        self.unreachable.lock().unwrap().insert(id);
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyCustody for MemoryCustody {
    async fn fetch(&self, id: &DeviceId) -> Result<Key, CustodyError> {
        self.enter().await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let result = if self.unreachable.lock().unwrap().contains(id) {
            Err(CustodyError::Unavailable("connection refused".into()))
        } else {
            self.get(id).ok_or(CustodyError::NotFound(*id))
        };
        self.leave();
        result
    }

    async fn register(&self, id: &DeviceId, key: &Key) -> Result<(), CustodyError> {
        self.enter().await;
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.insert(*id, key.clone());
        self.leave();
        Ok(())
    }
}

/// Stands in for dm-crypt. Formatting stamps the first payload bytes with
/// the key so tests can tell whether a device was (re)formatted. `unlocks`
/// holds the mappings that are currently open.
#[derive(Default)]
pub struct RecordingCrypt {
    pub formats: Mutex<Vec<(PathBuf, String)>>,
    pub unlocks: Mutex<Vec<(PathBuf, String, Key)>>,
    pub locks: Mutex<Vec<String>>,
    fail_format: Mutex<Option<PathBuf>>,
    fail_unlock: Mutex<Option<PathBuf>>,
    unlock_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingCrypt {
    pub fn with_unlock_delay(delay: Duration) -> Self {
        Self {
            unlock_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn peak_unlocks_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> Vec<String> {
        self.locks.lock().unwrap().clone()
    }

    pub fn fail_format_of(&self, device: &Path) {
        *self.fail_format.lock().unwrap() = Some(device.to_owned());
    }

    pub fn fail_unlock_of(&self, device: &Path) {
        *self.fail_unlock.lock().unwrap() = Some(device.to_owned());
    }

    pub fn format_count(&self) -> usize {
        self.formats.lock().unwrap().len()
    }

    pub fn unlocked(&self) -> Vec<(PathBuf, String, Key)> {
        self.unlocks.lock().unwrap().clone()
    }

    fn refuse(device: &Path, action: &'static str) -> CryptError {
        CryptError::Command {
            action,
            target: device.display().to_string(),
            status: 1,
            diagnostic: "simulated failure".into(),
        }
    }
}

impl Crypt for RecordingCrypt {
    fn format(&self, device: &Path, name: &str, key: &Key) -> Result<(), CryptError> {
        if self.fail_format.lock().unwrap().as_deref() == Some(device) {
            return Err(Self::refuse(device, "format"));
        }
        let stamp = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).open(device)?;
            file.seek(SeekFrom::Start(RESERVED_BYTES))?;
            file.write_all(&key.as_bytes()[..16])?;
            file.sync_all()
        };
        stamp().map_err(|source| CryptError::Scrub {
            path: device.to_owned(),
            source,
        })?;
        self.formats
            .lock()
            .unwrap()
            .push((device.to_owned(), name.to_owned()));
        Ok(())
    }

    fn unlock(&self, device: &Path, name: &str, key: &Key) -> Result<Mapped, CryptError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.unlock_delay {
            std::thread::sleep(delay);
        }
        let result = self.open(device, name, key);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn lock(&self, name: &str) -> Result<(), CryptError> {
        self.unlocks.lock().unwrap().retain(|(_, mapping, _)| mapping != name);
        self.locks.lock().unwrap().push(name.to_owned());
        Ok(())
    }
}

impl RecordingCrypt {
    fn open(&self, device: &Path, name: &str, key: &Key) -> Result<Mapped, CryptError> {
        if self.fail_unlock.lock().unwrap().as_deref() == Some(device) {
            return Err(Self::refuse(device, "open"));
        }
        let mut unlocks = self.unlocks.lock().unwrap();
        if unlocks.iter().any(|(_, mapping, _)| mapping == name) {
            return Ok(Mapped::AlreadyActive);
        }
        unlocks.push((device.to_owned(), name.to_owned(), key.clone()));
        Ok(Mapped::Opened)
    }
}

/// Puts `device` into the state a previous successful run would have left it in.
pub fn pre_enroll(device: &Path, custody: &MemoryCustody) -> Result<(DeviceId, Key)> {
    let id = DeviceId::generate();
    let key = Key::generate();
    header::write_identity_at(device, &id)?;
    custody.insert(id, key.clone());
    Ok((id, key))
}
