use crate::config::{Concurrency, Config, DEFAULT_CONFIG_PATH};
use crate::crypt::Cryptsetup;
use crate::custody::HttpCustody;
use crate::device::enumerate::enumerate;
use crate::device::header;
use crate::device::StorageDevice;
use crate::enroll::{Enroller, Outcome};
use crate::modules;
use clap::{Parser, Subcommand};
use eyre::{bail, eyre, Result, WrapErr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file [default: /etc/node-crypt/config.yaml if present]
    #[arg(short, long, value_name = "FILE", env = "NODE_CRYPT_CONFIG")]
    config: Option<PathBuf>,

    /// Base URL of the key custody service
    #[arg(long, value_name = "URL", env = "NODE_CRYPT_CUSTODY_URL")]
    custody_url: Option<String>,

    /// Bearer token presented to the key custody service
    #[arg(
        long,
        value_name = "TOKEN",
        env = "NODE_CRYPT_CUSTODY_TOKEN",
        hide_env_values = true
    )]
    custody_token: Option<String>,

    /// Directory the device patterns are matched in, e.g. `/dev/disk/by-id`
    #[arg(long, value_name = "DIR")]
    dev_root: Option<PathBuf>,

    /// Upper bound on devices resolved at the same time
    #[arg(short = 'j', long, value_name = "N")]
    max_concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enroll new devices or fetch keys for enrolled ones, then unlock all of them
    Run {
        /// Glob patterns under the device root, e.g. `nvme-*`
        #[arg(value_name = "PATTERN")]
        patterns: Vec<String>,
    },
    /// Show the identity header of every matching device
    Inspect {
        #[arg(value_name = "PATTERN")]
        patterns: Vec<String>,
    },
    /// Erase the identity header so the device is enrolled afresh on the next run
    WipeIdentity {
        /// Raw block device
        #[arg(value_name = "DEVICE")]
        device: PathBuf,
        /// Confirm that the data on the device will become unrecoverable
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub async fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self.command);
        let config = self.config()?;
        match &self.command {
            Commands::Run { patterns } => self.enroll_and_unlock(&config, patterns).await?,
            Commands::Inspect { patterns } => self.inspect(&config, patterns)?,
            Commands::WipeIdentity { device, yes } => wipe_identity(device, *yes)?,
        };
        Ok(self)
    }

    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path, true)?,
            None => Config::load(Path::new(DEFAULT_CONFIG_PATH), false)?,
        };
        if let Some(url) = &self.custody_url {
            config.custody.url = Some(url.clone());
        }
        if let Some(token) = &self.custody_token {
            config.custody.token = Some(token.clone());
        }
        if let Some(root) = &self.dev_root {
            config.devices.root = root.clone();
        }
        if let Some(limit) = self.max_concurrency {
            config.max_concurrency = Concurrency(limit);
        }
        config.validate()?;
        Ok(config)
    }

    fn devices(&self, config: &Config, patterns: &[String]) -> Result<Vec<StorageDevice>> {
        let patterns = if patterns.is_empty() {
            config.devices.patterns.as_slice()
        } else {
            patterns
        };
        if patterns.is_empty() {
            bail!("no device patterns given on the command line or in the config");
        }
        let devices = enumerate(&config.devices.root, patterns)?;
        log::info!(
            "{} device(s) under {} match {:?}",
            devices.len(),
            config.devices.root.display(),
            patterns
        );
        Ok(devices)
    }

    async fn enroll_and_unlock(&self, config: &Config, patterns: &[String]) -> Result<()> {
        let url = config
            .custody
            .url
            .as_deref()
            .ok_or_else(|| eyre!("no custody url configured"))?;

        modules::load_first(&config.modules.modprobe, &config.modules.candidates)
            .wrap_err("AES support unavailable, not touching any device")?;

        let devices = self.devices(config, patterns)?;
        if devices.is_empty() {
            log::warn!("nothing to do");
            return Ok(());
        }

        let custody = HttpCustody::new(url, config.custody.token.clone(), config.custody.timeout())?;
        let crypt = Cryptsetup::new(&config.crypt.cryptsetup)
            .with_cipher(&config.crypt.cipher)
            .with_mapper_dir(&config.crypt.mapper_dir);

        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupted, finishing in-flight devices");
                on_signal.cancel();
            }
        });

        let report = Enroller::new(Arc::new(custody), Arc::new(crypt))
            .with_mapping_prefix(&config.crypt.mapping_prefix)
            .with_max_concurrency(config.max_concurrency.0)
            .with_shutdown(shutdown)
            .run(devices)
            .await?;

        for unlocked in &report.devices {
            let how = match unlocked.outcome {
                Outcome::NewlyEnrolled => "newly enrolled",
                _ => "enrolled",
            };
            log::info!(
                "{} ({how}) -> {}",
                unlocked.device.by_path().display(),
                unlocked.mapping
            );
        }
        log::info!(
            "unlocked {} device(s), {} newly enrolled",
            report.devices.len(),
            report.newly_enrolled()
        );
        Ok(())
    }

    fn inspect(&self, config: &Config, patterns: &[String]) -> Result<()> {
        for device in self.devices(config, patterns)? {
            let state = match header::read_identity_at(device.real_path())? {
                Some(id) => format!("enrolled as {id}"),
                None => "unenrolled".to_string(),
            };
            println!(
                "{} -> {}: {}",
                device.by_path().display(),
                device.real_path().display(),
                state
            );
        }
        Ok(())
    }
}

fn wipe_identity(device: &Path, confirmed: bool) -> Result<()> {
    let id = header::read_identity_at(device)?;
    let Some(id) = id else {
        println!("{} carries no identity header", device.display());
        return Ok(());
    };
    if !confirmed {
        bail!(
            "{} is enrolled as {id}; pass --yes to erase its identity (its data will be lost on the next run)",
            device.display()
        );
    }
    header::clear_identity_at(device)?;
    log::warn!("erased identity {id} from {}", device.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("node-crypt").chain(args.iter().copied()))
    }

    #[test]
    fn overrides_apply_on_top_of_config() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "devices:\n  patterns: [\"ata-*\"]\nmax_concurrency: 8\n")?;

        let cli = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--custody-url",
            "https://custody.test",
            "--dev-root",
            "/tmp/devs",
            "-j",
            "2",
            "inspect",
        ]);
        let config = cli.config()?;
        assert_eq!(config.custody.url.as_deref(), Some("https://custody.test"));
        assert_eq!(config.devices.root, PathBuf::from("/tmp/devs"));
        assert_eq!(config.devices.patterns, vec!["ata-*"]);
        assert_eq!(config.max_concurrency, Concurrency(2));
        Ok(())
    }

    #[test]
    fn explicit_config_must_exist() {
        let cli = parse(&["--config", "/nonexistent/node-crypt.yaml", "inspect"]);
        assert!(cli.config().is_err());
    }

    #[test]
    fn wipe_requires_confirmation() -> Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        file.as_file().set_len(header::RESERVED_BYTES)?;
        let id = DeviceId::generate();
        header::write_identity_at(file.path(), &id)?;

        assert!(wipe_identity(file.path(), false).is_err());
        assert_eq!(header::read_identity_at(file.path())?, Some(id));

        wipe_identity(file.path(), true)?;
        assert_eq!(header::read_identity_at(file.path())?, None);

        // nothing left to wipe
        wipe_identity(file.path(), false)?;
        Ok(())
    }
}
