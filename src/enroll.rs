//! Fetch-or-create-then-unlock for a set of devices.
//!
//! Every device first goes through the resolve pass:
//!
//! ```text
//! Discovered -> IdentityResolved -> KeyResolved [-> Registered] ; or Failed
//! ```
//!
//! Only when every resolve unit has finished, and none of them failed, is
//! anything unlocked. A failure anywhere leaves every device locked, and a
//! failed unlock closes whatever the same pass had opened.

use crate::crypt::{Crypt, CryptError, Mapped};
use crate::custody::{CustodyError, KeyCustody};
use crate::device::header::{self, HeaderError};
use crate::device::{DeviceError, DeviceId, Key, StorageDevice};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAPPING_PREFIX: &str = "crypt-";
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("{path}: identity header: {source}")]
    Header { path: PathBuf, source: HeaderError },
    #[error(
        "{path}: header carries device id {id} but custody has no key for it, refusing to re-encrypt"
    )]
    UnknownToCustody { path: PathBuf, id: DeviceId },
    #[error("{path}: fetching key for {id}: {source}")]
    Fetch {
        path: PathBuf,
        id: DeviceId,
        source: CustodyError,
    },
    #[error("{path}: registering key for {id}: {source}")]
    Register {
        path: PathBuf,
        id: DeviceId,
        source: CustodyError,
    },
    #[error("{path}: format: {source}")]
    Format { path: PathBuf, source: CryptError },
    #[error("{path}: unlock: {source}")]
    Unlock { path: PathBuf, source: CryptError },
    #[error("{path}: no resolved key to unlock with")]
    Unresolved { path: PathBuf },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("{0}: cancelled")]
    Cancelled(PathBuf),
    #[error("{path}: worker failed: {reason}")]
    Worker { path: PathBuf, reason: String },
}

pub type Result<T, E = EnrollError> = core::result::Result<T, E>;

/// Per-device result of the resolve pass. The key itself travels on the device.
#[derive(Debug)]
pub enum Outcome {
    AlreadyEnrolled,
    NewlyEnrolled,
    Failed(EnrollError),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

#[derive(Debug)]
pub struct Resolution {
    pub device: StorageDevice,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub struct UnlockedDevice {
    pub device: StorageDevice,
    pub outcome: Outcome,
    pub mapping: String,
    pub mapped: Mapped,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub devices: Vec<UnlockedDevice>,
}

impl RunReport {
    pub fn newly_enrolled(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| matches!(d.outcome, Outcome::NewlyEnrolled))
            .count()
    }

    pub fn already_enrolled(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| matches!(d.outcome, Outcome::AlreadyEnrolled))
            .count()
    }
}

#[derive(Clone)]
pub struct Enroller {
    custody: Arc<dyn KeyCustody>,
    crypt: Arc<dyn Crypt>,
    mapping_prefix: String,
    max_concurrency: usize,
    shutdown: CancellationToken,
}

impl Enroller {
    pub fn new(custody: Arc<dyn KeyCustody>, crypt: Arc<dyn Crypt>) -> Self {
        Self {
            custody,
            crypt,
            mapping_prefix: DEFAULT_MAPPING_PREFIX.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_mapping_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.mapping_prefix = prefix.into();
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// Once `token` fires no new custody or format operation is started.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Resolve pass followed by the unlock pass.
    pub async fn run(&self, devices: Vec<StorageDevice>) -> Result<RunReport> {
        let resolutions = self.resolve_all(devices).await;
        self.unlock_all(resolutions).await
    }

    /// Resolves every device concurrently and waits for all of them.
    /// Results come back in input order.
    pub async fn resolve_all(&self, devices: Vec<StorageDevice>) -> Vec<Resolution> {
        let permits = self.permits();
        let mut slots: Vec<Option<Resolution>> = devices.iter().map(|_| None).collect();
        let originals = devices.clone();
        let mut workers = JoinSet::new();

        for (index, device) in devices.into_iter().enumerate() {
            let this = self.clone();
            let permits = permits.clone();
            workers.spawn(async move {
                let acquired = tokio::select! {
                    biased;
                    _ = this.shutdown.cancelled() => None,
                    permit = permits.acquire_owned() => Some(permit),
                };
                let resolution = match acquired {
                    None => {
                        let path = device.real_path().to_owned();
                        Resolution {
                            device,
                            outcome: Outcome::Failed(EnrollError::Cancelled(path)),
                        }
                    }
                    Some(Ok(_permit)) => this.resolve(device).await,
                    Some(Err(e)) => {
                        let path = device.real_path().to_owned();
                        Resolution {
                            device,
                            outcome: Outcome::Failed(EnrollError::Worker {
                                path,
                                reason: e.to_string(),
                            }),
                        }
                    }
                };
                (index, resolution)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, resolution)) => slots[index] = Some(resolution),
                Err(e) => log::error!("resolve worker died: {e}"),
            }
        }

        slots
            .into_iter()
            .zip(originals)
            .map(|(slot, original)| {
                slot.unwrap_or_else(|| {
                    let path = original.real_path().to_owned();
                    Resolution {
                        device: original,
                        outcome: Outcome::Failed(EnrollError::Worker {
                            path,
                            reason: "worker did not report back".to_string(),
                        }),
                    }
                })
            })
            .collect()
    }

    /// Unlocks every resolved device, or none at all if any resolution failed.
    /// A failed unlock closes the mappings this call opened before returning.
    ///
    /// Returns the first failure in input order.
    pub async fn unlock_all(&self, resolutions: Vec<Resolution>) -> Result<RunReport> {
        let mut resolved = Vec::with_capacity(resolutions.len());
        let mut first_failure = None;
        for Resolution { device, outcome } in resolutions {
            match outcome {
                Outcome::Failed(e) => {
                    log::error!("{}: {e}", device.by_path().display());
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
                outcome => resolved.push((device, outcome)),
            }
        }
        if let Some(e) = first_failure {
            log::error!(
                "not unlocking {} resolved device(s) because the resolve pass failed",
                resolved.len()
            );
            return Err(e);
        }

        let paths: Vec<PathBuf> = resolved
            .iter()
            .map(|(device, _)| device.real_path().to_owned())
            .collect();
        let mut slots: Vec<Option<Result<UnlockedDevice>>> = paths.iter().map(|_| None).collect();
        let permits = self.permits();
        let mut workers = JoinSet::new();
        for (index, (device, outcome)) in resolved.into_iter().enumerate() {
            let this = self.clone();
            let permits = permits.clone();
            workers.spawn(async move {
                let path = device.real_path().to_owned();
                let unlocked = match permits.acquire_owned().await {
                    Ok(_permit) => this.unlock(device, outcome).await,
                    Err(e) => Err(EnrollError::Worker {
                        path,
                        reason: e.to_string(),
                    }),
                };
                (index, unlocked)
            });
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, unlocked)) => slots[index] = Some(unlocked),
                Err(e) => log::error!("unlock worker died: {e}"),
            }
        }

        let mut report = RunReport::default();
        let mut first_failure = None;
        for (slot, path) in slots.into_iter().zip(paths) {
            let unlocked = slot.unwrap_or_else(|| {
                Err(EnrollError::Worker {
                    path,
                    reason: "unlock worker did not report back".to_string(),
                })
            });
            match unlocked {
                Ok(unlocked) => report.devices.push(unlocked),
                Err(e) => {
                    log::error!("{e}");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }
        match first_failure {
            Some(e) => {
                self.relock(report).await;
                Err(e)
            }
            None => Ok(report),
        }
    }

    async fn unlock(&self, device: StorageDevice, outcome: Outcome) -> Result<UnlockedDevice> {
        let path = device.real_path().to_owned();
        let mapping = device.mapping_name(&self.mapping_prefix);
        let crypt = self.crypt.clone();
        let target = path.clone();
        self.blocking(&path, move || {
            let (mapping, key) = match (mapping, device.key()) {
                (Some(mapping), Some(key)) => (mapping, key),
                _ => return Err(EnrollError::Unresolved { path: target }),
            };
            match crypt.unlock(&target, &mapping, key) {
                Ok(mapped) => Ok(UnlockedDevice {
                    device,
                    outcome,
                    mapping,
                    mapped,
                }),
                Err(source) => Err(EnrollError::Unlock {
                    path: target,
                    source,
                }),
            }
        })
        .await
    }

    /// Closes the mappings a failed unlock pass opened. Mappings that were
    /// active before the run stay up.
    async fn relock(&self, report: RunReport) {
        let opened: Vec<String> = report
            .devices
            .into_iter()
            .filter(|d| d.mapped == Mapped::Opened)
            .map(|d| d.mapping)
            .collect();
        if opened.is_empty() {
            return;
        }
        log::warn!("closing {} mapping(s) opened by the failed run", opened.len());
        let crypt = self.crypt.clone();
        let closed = tokio::task::spawn_blocking(move || {
            for mapping in &opened {
                if let Err(e) = crypt.lock(mapping) {
                    log::error!("{mapping} left open: {e}");
                }
            }
        })
        .await;
        if let Err(e) = closed {
            log::error!("relock worker died: {e}");
        }
    }

    async fn resolve(&self, mut device: StorageDevice) -> Resolution {
        let outcome = match self.resolve_device(&mut device).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e),
        };
        Resolution { device, outcome }
    }

    async fn resolve_device(&self, device: &mut StorageDevice) -> Result<Outcome> {
        let path = device.real_path().to_owned();

        let existing = {
            let target = path.clone();
            self.blocking(&path, move || {
                header::read_identity_at(&target)
                    .map_err(|source| EnrollError::Header { path: target, source })
            })
            .await?
        };

        if let Some(id) = existing {
            device.set_id(id)?;
            self.ensure_running(&path)?;
            let key = match self.custody.fetch(&id).await {
                Ok(key) => key,
                Err(e) if e.is_not_found() => {
                    return Err(EnrollError::UnknownToCustody { path, id });
                }
                Err(source) => return Err(EnrollError::Fetch { path, id, source }),
            };
            log::info!(
                "{}: enrolled as {id}, fetched key sha256:{}",
                device.by_path().display(),
                key.fingerprint()
            );
            device.set_key(key)?;
            return Ok(Outcome::AlreadyEnrolled);
        }

        // Nothing irreversible has happened yet, last chance to back out.
        self.ensure_running(&path)?;
        let id = DeviceId::generate();
        let key = Key::generate();
        log::info!(
            "{}: no identity header, enrolling as {id}",
            device.by_path().display()
        );

        {
            let target = path.clone();
            self.blocking(&path, move || {
                header::write_identity_at(&target, &id)
                    .map_err(|source| EnrollError::Header { path: target, source })
            })
            .await?;
        }
        device.set_id(id)?;

        let scratch = device
            .mapping_name(&self.mapping_prefix)
            .ok_or_else(|| EnrollError::Unresolved { path: path.clone() })?;
        {
            let crypt = self.crypt.clone();
            let key = key.clone();
            let target = path.clone();
            self.blocking(&path, move || {
                crypt
                    .format(&target, &scratch, &key)
                    .map_err(|source| EnrollError::Format { path: target, source })
            })
            .await?;
        }

        self.custody
            .register(&id, &key)
            .await
            .map_err(|source| EnrollError::Register {
                path: path.clone(),
                id,
                source,
            })?;
        log::info!(
            "{}: registered {id} with key sha256:{}",
            device.by_path().display(),
            key.fingerprint()
        );
        device.set_key(key)?;
        Ok(Outcome::NewlyEnrolled)
    }

    /// Worker slots shared by every unit of one pass.
    fn permits(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.max_concurrency))
    }

    fn ensure_running(&self, path: &Path) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(EnrollError::Cancelled(path.to_owned()));
        }
        Ok(())
    }

    async fn blocking<T, F>(&self, path: &Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| EnrollError::Worker {
                path: path.to_owned(),
                reason: e.to_string(),
            })?
    }
}
