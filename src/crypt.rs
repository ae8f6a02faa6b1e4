//! dm-crypt mappings driven through the `cryptsetup` binary.
//!
//! Devices are mapped in plain mode with the payload starting after the
//! identity header region, so nothing cryptsetup does touches the header.

use crate::device::header::{payload_offset_sectors, SECTOR_SIZE};
use crate::device::{Key, KEY_LEN};
use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

pub const DEFAULT_CIPHER: &str = "aes-xts-plain64";
pub const DEFAULT_MAPPER_DIR: &str = "/dev/mapper";

/// Bytes of the fresh mapping overwritten on format, enough to bury stale
/// filesystem signatures.
const SCRUB_BYTES: u64 = 1 << 20;

#[derive(Error, Debug)]
pub enum CryptError {
    #[error("failed to run {binary}: {source}")]
    Spawn { binary: PathBuf, source: io::Error },
    #[error("cryptsetup {action} `{target}` failed (exit code {status}): {diagnostic}")]
    Command {
        action: &'static str,
        target: String,
        status: i32,
        diagnostic: String,
    },
    #[error("mapping `{0}` is already active, refusing to format underneath it")]
    MappingBusy(String),
    #[error("failed to scrub `{path}`: {source}")]
    Scrub { path: PathBuf, source: io::Error },
}

pub type Result<T, E = CryptError> = core::result::Result<T, E>;

/// What `unlock` found or did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapped {
    Opened,
    AlreadyActive,
}

/// Block-layer transparent encryption.
pub trait Crypt: Send + Sync {
    /// Establishes fresh ciphertext over `device` for `key`.
    fn format(&self, device: &Path, name: &str, key: &Key) -> Result<()>;

    /// Maps `device` to its decrypted form under `name`. Already active
    /// mappings are left alone.
    fn unlock(&self, device: &Path, name: &str, key: &Key) -> Result<Mapped>;

    /// Tears down the mapping `name`. Missing mappings are not an error.
    fn lock(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Cryptsetup {
    binary: PathBuf,
    cipher: String,
    mapper_dir: PathBuf,
}

#[derive(Debug)]
struct Output {
    stdout: String,
    stderr: String,
    status: i32,
}

impl Output {
    fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        match (stderr.is_empty(), stdout.is_empty()) {
            (false, _) => stderr.to_string(),
            (true, false) => stdout.to_string(),
            (true, true) => "no additional output".to_string(),
        }
    }
}

impl Cryptsetup {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cipher: DEFAULT_CIPHER.to_string(),
            mapper_dir: PathBuf::from(DEFAULT_MAPPER_DIR),
        }
    }

    pub fn with_cipher(mut self, cipher: impl Into<String>) -> Self {
        self.cipher = cipher.into();
        self
    }

    pub fn with_mapper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mapper_dir = dir.into();
        self
    }

    fn mapping_path(&self, name: &str) -> PathBuf {
        self.mapper_dir.join(name)
    }

    fn is_active(&self, name: &str) -> bool {
        self.mapping_path(name).exists()
    }

    fn open(&self, device: &Path, name: &str, key: &Key) -> Result<Mapped> {
        let offset = payload_offset_sectors().to_string();
        let key_bits = (key.as_bytes().len() * 8).to_string();
        let source = device.to_string_lossy();
        let args = [
            "open",
            "--type",
            "plain",
            "--batch-mode",
            "--cipher",
            self.cipher.as_str(),
            "--key-size",
            key_bits.as_str(),
            "--offset",
            offset.as_str(),
            "--key-file",
            "-",
            source.as_ref(),
            name,
        ];
        let out = self.run(&args, Some(key.as_bytes()))?;
        if out.status == 0 {
            return Ok(Mapped::Opened);
        }
        // lost a race with another opener
        if self.is_active(name) {
            return Ok(Mapped::AlreadyActive);
        }
        Err(CryptError::Command {
            action: "open",
            target: format!("{} as {name}", device.display()),
            status: out.status,
            diagnostic: out.diagnostic(),
        })
    }

    fn close(&self, name: &str) -> Result<()> {
        let out = self.run(&["close", name], None)?;
        if out.status == 0 {
            return Ok(());
        }
        let diagnostic = out.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("does not exist") || lower.contains("not active") {
            return Ok(());
        }
        Err(CryptError::Command {
            action: "close",
            target: name.to_string(),
            status: out.status,
            diagnostic,
        })
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Output> {
        let spawn_err = |source| CryptError::Spawn {
            binary: self.binary.clone(),
            source,
        };
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command.spawn().map_err(spawn_err)?;
        // stdin is dropped at the end of the match so the child sees EOF
        let fed = match (input, child.stdin.take()) {
            (Some(payload), Some(mut stdin)) => stdin.write_all(payload),
            _ => Ok(()),
        };
        // reap the child even when feeding it failed
        let output = child.wait_with_output().map_err(spawn_err)?;
        fed.map_err(spawn_err)?;

        Ok(Output {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}

impl Default for Cryptsetup {
    fn default() -> Self {
        Self::new("cryptsetup")
    }
}

impl Crypt for Cryptsetup {
    fn format(&self, device: &Path, name: &str, key: &Key) -> Result<()> {
        if self.is_active(name) {
            return Err(CryptError::MappingBusy(name.to_string()));
        }
        if key.as_bytes().len() != KEY_LEN {
            log::warn!(
                "formatting {} with a {} byte key",
                device.display(),
                key.as_bytes().len()
            );
        }

        let scratch = format!("{name}-format");
        self.open(device, &scratch, key)?;
        let scrubbed = scrub(&self.mapping_path(&scratch), SCRUB_BYTES);
        self.close(&scratch)?;
        scrubbed?;

        log::info!("formatted {} ({})", device.display(), self.cipher);
        Ok(())
    }

    fn unlock(&self, device: &Path, name: &str, key: &Key) -> Result<Mapped> {
        if self.is_active(name) {
            log::info!("{name} already active");
            return Ok(Mapped::AlreadyActive);
        }
        let mapped = self.open(device, name, key)?;
        log::info!(
            "unlocked {} at {}",
            device.display(),
            self.mapping_path(name).display()
        );
        Ok(mapped)
    }

    fn lock(&self, name: &str) -> Result<()> {
        self.close(name)?;
        log::info!("closed {}", self.mapping_path(name).display());
        Ok(())
    }
}

/// Zero the first `len` bytes of a mapping (or all of it, if shorter).
fn scrub(path: &Path, len: u64) -> Result<()> {
    let scrub_err = |source| CryptError::Scrub {
        path: path.to_owned(),
        source,
    };
    let mut target = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(scrub_err)?;
    let size = target.seek(SeekFrom::End(0)).map_err(scrub_err)?;
    target.seek(SeekFrom::Start(0)).map_err(scrub_err)?;

    let zeros = vec![0u8; (64 * SECTOR_SIZE) as usize];
    let mut remaining = len.min(size);
    while remaining > 0 {
        let chunk = remaining.min(zeros.len() as u64) as usize;
        target.write_all(&zeros[..chunk]).map_err(scrub_err)?;
        remaining -= chunk as u64;
    }
    target.sync_all().map_err(scrub_err)?;
    Ok(())
}
