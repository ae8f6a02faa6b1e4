use crate::enroll::DEFAULT_MAPPING_PREFIX;
use crate::modules::DEFAULT_AES_MODULES;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/node-crypt/config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub custody: CustodyConfig,
    pub devices: DeviceConfig,
    pub crypt: CryptConfig,
    pub modules: ModuleConfig,
    pub max_concurrency: Concurrency,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CustodyConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: 10,
        }
    }
}

impl CustodyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub root: PathBuf,
    pub patterns: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/dev/disk/by-id"),
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CryptConfig {
    pub cryptsetup: PathBuf,
    pub cipher: String,
    pub mapper_dir: PathBuf,
    pub mapping_prefix: String,
}

impl Default for CryptConfig {
    fn default() -> Self {
        Self {
            cryptsetup: PathBuf::from("cryptsetup"),
            cipher: crate::crypt::DEFAULT_CIPHER.to_string(),
            mapper_dir: PathBuf::from(crate::crypt::DEFAULT_MAPPER_DIR),
            mapping_prefix: DEFAULT_MAPPING_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleConfig {
    pub modprobe: PathBuf,
    pub candidates: Vec<String>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            modprobe: crate::modules::default_modprobe(),
            candidates: DEFAULT_AES_MODULES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Concurrency(pub usize);

impl Default for Concurrency {
    fn default() -> Self {
        Self(4)
    }
}

impl Config {
    pub fn from_yaml(path: &Path, contents: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`. A missing file is only tolerated when `required` is false.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml(path, &contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !required => {
                log::debug!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_owned(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency.0 == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}
