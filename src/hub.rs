//! HTTP client for device → hub communication.
//!
//! Owns the message shapes and endpoints; the hub itself is an external
//! collaborator. Telemetry messages and sync batches are zstd-compressed
//! JSON. The downlink endpoint long-polls for twin updates and direct
//! method invocations.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Categorized, ErrorKind};
use crate::types::hub::HubEnvelope;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("malformed hub connection string: {0}")]
    BadConnectionString(&'static str),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("hub rejected credentials (status {0})")]
    Auth(u16),
    #[error("hub returned status {0}")]
    Status(u16),
    #[error("hub rejected batch rows")]
    Validation(Vec<RowError>),
    #[error("compression error: {0}")]
    Compression(String),
}

impl Categorized for HubError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::BadConnectionString(_) => ErrorKind::Config,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Validation(_) => ErrorKind::Parse,
            _ => ErrorKind::Network,
        }
    }
}

/// Per-row rejection in a sync batch.
#[derive(Debug, Clone, Deserialize)]
pub struct RowError {
    pub index: usize,
    pub reason: String,
}

/// Twin desired-properties document.
#[derive(Debug, Clone, Deserialize)]
pub struct TwinDesired {
    pub version: u64,
    pub properties: serde_json::Value,
}

/// One downlink item from the hub.
#[derive(Debug, Clone)]
pub enum Downlink {
    TwinUpdate(TwinDesired),
    Method(MethodCall),
}

/// A direct method invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct DownlinkBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    properties: Option<serde_json::Value>,
    #[serde(default)]
    method: Option<MethodCall>,
}

/// HTTP client bound to one device identity.
#[derive(Clone, Debug)]
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    device_id: String,
    access_key: String,
}

impl HubClient {
    /// Parse `HostName=…;DeviceId=…;SharedAccessKey=…` and build the client.
    pub fn from_connection_string(conn: &str) -> Result<Self, HubError> {
        let mut host = None;
        let mut device_id = None;
        let mut access_key = None;

        for part in conn.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "HostName" => host = Some(value.trim().to_string()),
                "DeviceId" => device_id = Some(value.trim().to_string()),
                // The shared access key itself may contain '=' padding;
                // split_once keeps the remainder intact.
                "SharedAccessKey" => access_key = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let host = host.ok_or(HubError::BadConnectionString("missing HostName"))?;
        let device_id = device_id.ok_or(HubError::BadConnectionString("missing DeviceId"))?;
        let access_key = access_key.ok_or(HubError::BadConnectionString("missing SharedAccessKey"))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(45))
            .build()?;

        Ok(Self {
            http,
            base_url: format!("https://{host}"),
            device_id,
            access_key,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/api/devices/{}/{suffix}", self.base_url, self.device_id)
    }

    fn check_status(status: reqwest::StatusCode) -> Result<(), HubError> {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(HubError::Auth(status.as_u16()));
        }
        if !status.is_success() {
            return Err(HubError::Status(status.as_u16()));
        }
        Ok(())
    }

    /// Send one telemetry envelope (pumpReading / alert / systemHealth).
    pub async fn send_message(&self, envelope: &HubEnvelope) -> Result<(), HubError> {
        let json = serde_json::to_vec(envelope)
            .map_err(|e| HubError::Compression(e.to_string()))?;
        let compressed = zstd::encode_all(json.as_slice(), 3)
            .map_err(|e| HubError::Compression(e.to_string()))?;

        let resp = self
            .http
            .post(self.url("messages"))
            .header("Authorization", format!("Bearer {}", self.access_key))
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "zstd")
            .body(compressed)
            .send()
            .await?;

        Self::check_status(resp.status())
    }

    /// Upload one sync batch. `kind` is the row family (`readings`,
    /// `relayActions`, …); rows are the JSON payloads in key order.
    ///
    /// A 422 response carries per-row rejections, surfaced as
    /// [`HubError::Validation`] so the sync worker can quarantine them.
    pub async fn upload_batch(
        &self,
        kind: &str,
        rows: &[serde_json::Value],
    ) -> Result<(), HubError> {
        let body = serde_json::json!({ "kind": kind, "rows": rows });
        let json = serde_json::to_vec(&body)
            .map_err(|e| HubError::Compression(e.to_string()))?;
        let compressed = zstd::encode_all(json.as_slice(), 3)
            .map_err(|e| HubError::Compression(e.to_string()))?;

        let resp = self
            .http
            .post(self.url("sync"))
            .header("Authorization", format!("Bearer {}", self.access_key))
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "zstd")
            .body(compressed)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            #[derive(Deserialize)]
            struct ValidationBody {
                #[serde(default)]
                errors: Vec<RowError>,
            }
            let parsed: ValidationBody = resp.json().await.unwrap_or(ValidationBody {
                errors: Vec::new(),
            });
            return Err(HubError::Validation(parsed.errors));
        }

        Self::check_status(resp.status())?;
        debug!(component = "hub", kind, rows = rows.len(), "batch uploaded");
        Ok(())
    }

    /// Fetch the full desired-properties document.
    pub async fn fetch_desired(&self) -> Result<TwinDesired, HubError> {
        let resp = self
            .http
            .get(self.url("twin/desired"))
            .header("Authorization", format!("Bearer {}", self.access_key))
            .send()
            .await?;

        Self::check_status(resp.status())?;
        Ok(resp.json().await?)
    }

    /// Long-poll for the next downlink item (twin update or direct method).
    /// Returns `None` when the poll window elapsed with nothing to deliver.
    pub async fn poll_downlink(&self, since_version: u64) -> Result<Option<Downlink>, HubError> {
        let resp = self
            .http
            .get(self.url("downlink"))
            .query(&[("since", since_version.to_string()), ("wait", "30".to_string())])
            .header("Authorization", format!("Bearer {}", self.access_key))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::check_status(resp.status())?;

        let body: DownlinkBody = resp.json().await?;
        match body.kind.as_str() {
            "twinUpdate" => {
                let (Some(version), Some(properties)) = (body.version, body.properties) else {
                    return Ok(None);
                };
                Ok(Some(Downlink::TwinUpdate(TwinDesired { version, properties })))
            }
            "method" => Ok(body.method.map(Downlink::Method)),
            _ => Ok(None),
        }
    }

    /// Respond to a direct method invocation.
    pub async fn respond_method(
        &self,
        call_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), HubError> {
        let resp = self
            .http
            .post(self.url(&format!("methods/{call_id}/response")))
            .header("Authorization", format!("Bearer {}", self.access_key))
            .json(payload)
            .send()
            .await?;
        Self::check_status(resp.status())
    }

    /// Replace the reported-properties subset we own.
    pub async fn report_properties(&self, properties: &serde_json::Value) -> Result<(), HubError> {
        let resp = self
            .http
            .put(self.url("twin/reported"))
            .header("Authorization", format!("Bearer {}", self.access_key))
            .json(properties)
            .send()
            .await?;
        Self::check_status(resp.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_parsed() {
        let client = HubClient::from_connection_string(
            "HostName=hub.example.net;DeviceId=well-01;SharedAccessKey=c2VjcmV0a2V5PT0=",
        )
        .unwrap();
        assert_eq!(client.device_id(), "well-01");
        assert_eq!(client.base_url, "https://hub.example.net");
        assert_eq!(client.access_key, "c2VjcmV0a2V5PT0=");
    }

    #[test]
    fn test_connection_string_missing_parts() {
        let err = HubClient::from_connection_string("HostName=hub.example.net").unwrap_err();
        assert!(matches!(err, HubError::BadConnectionString(_)));

        let err = HubClient::from_connection_string("DeviceId=d;SharedAccessKey=k").unwrap_err();
        assert!(matches!(err, HubError::BadConnectionString("missing HostName")));
    }

    #[test]
    fn test_auth_statuses_map_to_auth_error() {
        assert!(matches!(
            HubClient::check_status(reqwest::StatusCode::UNAUTHORIZED),
            Err(HubError::Auth(401))
        ));
        assert!(matches!(
            HubClient::check_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            Err(HubError::Status(500))
        ));
        assert!(HubClient::check_status(reqwest::StatusCode::OK).is_ok());
    }
}
