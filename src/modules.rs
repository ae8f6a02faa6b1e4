use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

pub const DEFAULT_AES_MODULES: [&str; 2] = ["aesni_intel", "aes_generic"];

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("no AES module candidates configured")]
    NoCandidates,
    #[error("failed to load any of {tried:?}: {last}")]
    Exhausted { tried: Vec<String>, last: String },
}

pub type Result<T, E = ModuleError> = core::result::Result<T, E>;

/// Loads the first module of `candidates` that `modprobe` accepts and returns its name.
pub fn load_first(modprobe: &Path, candidates: &[String]) -> Result<String> {
    let mut last = None;
    for name in candidates {
        match modprobe_one(modprobe, name) {
            Ok(()) => {
                log::info!("loaded kernel module {name}");
                return Ok(name.clone());
            }
            Err(reason) => {
                log::warn!("could not load {name}: {reason}");
                last = Some(reason);
            }
        }
    }

    match last {
        None => Err(ModuleError::NoCandidates),
        Some(last) => Err(ModuleError::Exhausted {
            tried: candidates.to_vec(),
            last,
        }),
    }
}

fn modprobe_one(modprobe: &Path, name: &str) -> Result<(), String> {
    let output = Command::new(modprobe)
        .arg(name)
        .output()
        .map_err(|e: io::Error| format!("{}: {e}", modprobe.display()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(match output.status.code() {
        Some(code) => format!("exit code {code}: {stderr}"),
        None => format!("terminated by signal: {stderr}"),
    })
}

pub fn default_modprobe() -> PathBuf {
    PathBuf::from("modprobe")
}
