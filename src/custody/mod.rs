use crate::device::{DeviceId, Key};
use async_trait::async_trait;
use thiserror::Error;

pub mod http;

pub use http::HttpCustody;

#[derive(Error, Debug)]
pub enum CustodyError {
    /// The service answered but holds no key for this id.
    #[error("custody has no key for device {0}")]
    NotFound(DeviceId),
    #[error("custody request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("custody returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("custody returned an unusable key: {0}")]
    InvalidKey(String),
    #[error("invalid custody url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("custody unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T, E = CustodyError> = core::result::Result<T, E>;

impl CustodyError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CustodyError::NotFound(_))
    }
}

/// Remote store mapping device ids to volume keys.
///
/// Shared by every resolve worker, so implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait KeyCustody: Send + Sync {
    async fn fetch(&self, id: &DeviceId) -> Result<Key>;

    async fn register(&self, id: &DeviceId, key: &Key) -> Result<()>;
}
