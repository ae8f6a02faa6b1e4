//! HTTP custody client.
//!
//! `GET  {base}/v1/keys/{id}` returns `{"key": "<hex>"}` or 404.
//! `PUT  {base}/v1/keys/{id}` stores `{"key": "<hex>"}`.

use super::{CustodyError, KeyCustody, Result};
use crate::device::{DeviceId, Key, KEY_LEN};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize)]
struct KeyBody {
    key: String,
}

#[derive(Clone)]
pub struct HttpCustody {
    base: Url,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpCustody {
    pub fn new(base: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Self::with_client(base, token, client)
    }

    /// Uses a preconfigured `client` (proxy, TLS roots) instead of the default one.
    pub fn with_client(base: &str, token: Option<String>, client: reqwest::Client) -> Result<Self> {
        let invalid = |reason: String| CustodyError::InvalidUrl {
            url: base.to_string(),
            reason,
        };
        let parsed = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(invalid("cannot be a base".to_string()));
        }
        Ok(Self {
            base: parsed,
            token,
            client,
        })
    }

    pub fn key_url(&self, id: &DeviceId) -> Result<Url> {
        let hex = id.to_hex();
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CustodyError::InvalidUrl {
                url: self.base.to_string(),
                reason: "cannot be a base".to_string(),
            })?
            .pop_if_empty()
            .extend(["v1", "keys", hex.as_str()]);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl KeyCustody for HttpCustody {
    async fn fetch(&self, id: &DeviceId) -> Result<Key> {
        let url = self.key_url(id)?;
        log::debug!("fetching key for {id} from {url}");
        let response = self.authorize(self.client.get(url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(CustodyError::NotFound(*id)),
            status if status.is_success() => {
                let body: KeyBody = response.json().await?;
                decode_key(&body.key)
            }
            status => Err(CustodyError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn register(&self, id: &DeviceId, key: &Key) -> Result<()> {
        let url = self.key_url(id)?;
        log::debug!("registering key for {id} at {url}");
        let body = KeyBody {
            key: hex::encode(key.as_bytes()),
        };
        let response = self
            .authorize(self.client.put(url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CustodyError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

fn decode_key(encoded: &str) -> Result<Key> {
    let bytes =
        hex::decode(encoded.trim()).map_err(|e| CustodyError::InvalidKey(e.to_string()))?;
    if bytes.len() != KEY_LEN {
        return Err(CustodyError::InvalidKey(format!(
            "expected {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Key::from_bytes(bytes).map_err(|e| CustodyError::InvalidKey(e.to_string()))
}
