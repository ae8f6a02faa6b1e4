//! Resolve glob patterns under a device namespace (e.g. `/dev/disk/by-id`)
//! into distinct whole-disk devices.

use super::StorageDevice;
use glob::{glob_with, MatchOptions, Pattern};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnumerateError {
    #[error("invalid device pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("failed to read matches of `{pattern}`: {source}")]
    Glob {
        pattern: String,
        source: glob::GlobError,
    },
    #[error("failed to resolve `{path}`: {source}")]
    Canonicalize { path: PathBuf, source: io::Error },
}

pub type Result<T, E = EnumerateError> = core::result::Result<T, E>;

/// True for `<base>-part<digits>` names, the by-id convention for partitions.
pub fn is_partition(name: &str) -> bool {
    match name.rsplit_once("-part") {
        Some((base, index)) => {
            !base.is_empty() && !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Expands every pattern against direct entries of `root`.
///
/// Devices are deduplicated on their canonical path, the first alias seen
/// is the one kept. Any error aborts the whole enumeration.
pub fn enumerate<S: AsRef<str>>(root: &Path, patterns: &[S]) -> Result<Vec<StorageDevice>> {
    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    for pattern in patterns {
        let pattern = pattern.as_ref();
        for by_path in expand(root, pattern)? {
            let excluded = by_path
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, is_partition);
            if excluded {
                log::debug!("skipping partition {}", by_path.display());
                continue;
            }

            let real_path =
                by_path
                    .canonicalize()
                    .map_err(|source| EnumerateError::Canonicalize {
                        path: by_path.clone(),
                        source,
                    })?;
            if !seen.insert(real_path.clone()) {
                log::debug!(
                    "{} is an alias of an already selected device {}",
                    by_path.display(),
                    real_path.display()
                );
                continue;
            }

            log::debug!("selected {} -> {}", by_path.display(), real_path.display());
            devices.push(StorageDevice::new(by_path, real_path));
        }
    }

    Ok(devices)
}

fn expand(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let invalid = |reason: &str| EnumerateError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason: reason.to_owned(),
    };
    if pattern.is_empty() {
        return Err(invalid("empty pattern"));
    }
    if pattern.contains('/') {
        return Err(invalid("patterns match entries directly under the device root"));
    }
    Pattern::new(pattern).map_err(|e| invalid(e.msg))?;

    let full = format!(
        "{}/{}",
        Pattern::escape(&root.to_string_lossy()).trim_end_matches('/'),
        pattern
    );
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let paths = glob_with(&full, options).map_err(|e| invalid(e.msg))?;

    paths
        .map(|entry| {
            entry.map_err(|source| EnumerateError::Glob {
                pattern: pattern.to_owned(),
                source,
            })
        })
        .collect()
}
