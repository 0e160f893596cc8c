use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use types::{
    CollaboratorError, DeviceDescriptor, DeviceSource, RawTelemetry, TelemetrySource,
};

type HmacSha256 = Hmac<Sha256>;

const DEVICE_LIST_PATH: &str = "/device/list";
const LATEST_DATA_PATH: &str = "/device/data/latest";

/// Connection settings for the Renogy open API.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL, e.g. `https://openapi.renogy.com`.
    pub host: String,
    pub access_key: String,
    pub secret_key: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "https://openapi.renogy.com".to_string(),
            access_key: String::new(),
            secret_key: String::new(),
            timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid host {0}")]
    InvalidHost(String),
    #[error("request signing failed: {0}")]
    Signing(String),
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request to {path} timed out after {timeout_ms}ms")]
    Timeout { path: String, timeout_ms: u64 },
    #[error("unexpected status {status} from {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
    #[error("malformed response from {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Computes the `Signature` header: base64 HMAC-SHA256 over
/// `"{timestamp}.{path}.{query}"`.
pub fn sign(
    timestamp_ms: u64,
    path: &str,
    query: &str,
    secret: &str,
) -> Result<String, ClientError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| ClientError::Signing(err.to_string()))?;
    mac.update(format!("{timestamp_ms}.{path}.{query}").as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

#[derive(Debug, Clone)]
pub struct RenogyClient {
    config: ClientConfig,
    base: String,
    http: reqwest::Client,
}

impl RenogyClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let base = config.host.trim_end_matches('/').to_string();
        Url::parse(&base).map_err(|_| ClientError::InvalidHost(config.host.clone()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { config, base, http })
    }

    /// Lists the sub-devices of every hub on the account.
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ClientError> {
        let body = self.get_json(DEVICE_LIST_PATH).await?;
        let hubs = match body {
            Value::Array(hubs) => hubs,
            Value::Object(mut object) => match object.remove("data") {
                Some(Value::Array(hubs)) => hubs,
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(ClientError::Malformed {
                        path: DEVICE_LIST_PATH.to_string(),
                        reason: format!("data is not a list: {other}"),
                    })
                }
            },
            other => {
                return Err(ClientError::Malformed {
                    path: DEVICE_LIST_PATH.to_string(),
                    reason: format!("unexpected body {other}"),
                })
            }
        };

        Ok(extract_devices(&hubs))
    }

    /// Returns the `data` object of the latest reading for one device.
    pub async fn fetch_latest(&self, device_id: &str) -> Result<RawTelemetry, ClientError> {
        let path = format!("{LATEST_DATA_PATH}/{device_id}");
        let body = self.get_json(&path).await?;
        match body {
            Value::Object(mut object) => match object.remove("data") {
                Some(Value::Object(data)) => Ok(data.into_iter().collect()),
                Some(other) => Err(ClientError::Malformed {
                    path,
                    reason: format!("data is not an object: {other}"),
                }),
                None => Err(ClientError::Malformed {
                    path,
                    reason: "missing data".to_string(),
                }),
            },
            other => Err(ClientError::Malformed {
                path,
                reason: format!("unexpected body {other}"),
            }),
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        let timestamp = unix_ms();
        let query = "";
        let signature = sign(timestamp, path, query, &self.config.secret_key)?;
        let url = format!("{}{}", self.base, path);

        let response = self
            .http
            .get(url)
            .header("Access-Key", &self.config.access_key)
            .header("Signature", signature)
            .header("Timestamp", timestamp.to_string())
            .send()
            .await
            .map_err(|err| self.transport_error(path, err))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_error(path, err))?;

        if status != StatusCode::OK {
            warn!(path, status = status.as_u16(), "renogy api request rejected");
            return Err(ClientError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        debug!(path, bytes = body.len(), "renogy api request ok");
        serde_json::from_str(&body).map_err(|err| ClientError::Malformed {
            path: path.to_string(),
            reason: err.to_string(),
        })
    }

    fn transport_error(&self, path: &str, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                path: path.to_string(),
                timeout_ms: self.config.timeout_ms,
            }
        } else {
            ClientError::Http(err)
        }
    }
}

/// Flattens hub `sublist` entries into descriptors. Entries without an id or
/// category are skipped.
pub fn extract_devices(hubs: &[Value]) -> Vec<DeviceDescriptor> {
    let mut devices = Vec::new();
    for hub in hubs {
        let Some(sublist) = hub.get("sublist").and_then(Value::as_array) else {
            continue;
        };
        for entry in sublist {
            let device_id = entry.get("deviceId").and_then(scalar_string);
            let category = entry.get("category").and_then(scalar_string);
            match (device_id, category) {
                (Some(device_id), Some(category)) => devices.push(DeviceDescriptor {
                    device_id,
                    category,
                    display_name: entry.get("name").and_then(scalar_string).unwrap_or_default(),
                    sku: entry.get("sku").and_then(scalar_string).unwrap_or_default(),
                }),
                _ => warn!(entry = %entry, "skipping sub-device without id or category"),
            }
        }
    }
    devices
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[async_trait]
impl DeviceSource for RenogyClient {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, CollaboratorError> {
        RenogyClient::list_devices(self)
            .await
            .map_err(CollaboratorError::enumeration)
    }
}

#[async_trait]
impl TelemetrySource for RenogyClient {
    async fn fetch(&self, device_id: &str) -> Result<RawTelemetry, CollaboratorError> {
        self.fetch_latest(device_id)
            .await
            .map_err(|err| CollaboratorError::fetch(device_id, err))
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
