use base64::{engine::general_purpose, Engine as _};
use pulse_core::config::{CONNECT_TIMEOUT, READ_TIMEOUT};
use pulse_core::{PulseConfig, PulseError, PulseResult};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Certificate, Client, Response};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::requests::PendingRequest;

const INGEST_PATH: &str = "/i";
const UPLOAD_PART: &str = "binaryFile";

/// Why a single delivery attempt did not count as delivered.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("collector returned status {0}")]
    Status(u16),

    #[error("collector rejected request: {0}")]
    Rejected(String),

    #[error("malformed collector response: {0}")]
    Malformed(String),

    #[error("upload file error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DeliveryError> for PulseError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Transport(_) | DeliveryError::Io(_) => Self::Transport(err.to_string()),
            DeliveryError::Status(_) | DeliveryError::Rejected(_) | DeliveryError::Malformed(_) => {
                Self::Protocol(err.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct IngestReply {
    result: Option<serde_json::Value>,
}

/// HTTP(S) framing of pending requests.
#[derive(Debug, Clone)]
pub struct Transport {
    client: Client,
    ingest_url: String,
}

impl Transport {
    pub fn new(config: &PulseConfig) -> PulseResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT);

        if !config.pinned_public_keys.is_empty() {
            builder = builder.tls_built_in_root_certs(false);
            for encoded in &config.pinned_public_keys {
                let der = general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| PulseError::config(format!("pinned key is not base64: {e}")))?;
                let certificate = Certificate::from_der(&der)
                    .map_err(|e| PulseError::config(format!("pinned key is not a certificate: {e}")))?;
                builder = builder.add_root_certificate(certificate);
            }
        }

        let client = builder
            .build()
            .map_err(|e| PulseError::config(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            ingest_url: format!("{}{}", config.server_url.trim_end_matches('/'), INGEST_PATH),
        })
    }

    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// Sends one request with `device_id` appended. `Ok` means the collector
    /// confirmed it.
    pub async fn send(&self, request: &PendingRequest, device_id: &str) -> Result<(), DeliveryError> {
        let mut payload = request.as_str().to_string();
        payload.push_str("&device_id=");
        payload.extend(url::form_urlencoded::byte_serialize(device_id.as_bytes()));

        let response = if request.is_crash_report() {
            debug!(url = %self.ingest_url, "sending crash report");
            self.client
                .post(&self.ingest_url)
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(payload)
                .send()
                .await?
        } else if let Some(path) = request.picture_path() {
            debug!(url = %self.ingest_url, path = %path, "sending request with upload");
            self.client
                .post(format!("{}?{payload}", self.ingest_url))
                .multipart(upload_form(Path::new(&path)).await?)
                .send()
                .await?
        } else {
            self.client
                .get(format!("{}?{payload}", self.ingest_url))
                .send()
                .await?
        };

        check_reply(response).await
    }
}

async fn upload_form(path: &Path) -> Result<Form, DeliveryError> {
    let file = tokio::fs::File::open(path).await?;
    let length = file.metadata().await?.len();
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let part = Part::stream_with_length(Body::from(file), length).file_name(file_name);
    Ok(Form::new().part(UPLOAD_PART, part))
}

async fn check_reply(response: Response) -> Result<(), DeliveryError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(DeliveryError::Status(status.as_u16()));
    }
    let reply: IngestReply =
        serde_json::from_str(&body).map_err(|e| DeliveryError::Malformed(e.to_string()))?;
    match reply.result {
        Some(serde_json::Value::String(result)) if result.eq_ignore_ascii_case("success") => Ok(()),
        Some(other) => Err(DeliveryError::Rejected(other.to_string())),
        None => Err(DeliveryError::Malformed("missing result field".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_url() {
        let transport = Transport::new(&PulseConfig::new("https://collector.example/", "K")).unwrap();
        assert_eq!(transport.ingest_url(), "https://collector.example/i");
    }

    #[test]
    fn test_delivery_errors_map_to_pulse_errors() {
        assert!(matches!(
            PulseError::from(DeliveryError::Status(500)),
            PulseError::Protocol(_)
        ));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing picture");
        assert!(matches!(
            PulseError::from(DeliveryError::Io(io)),
            PulseError::Transport(_)
        ));
    }

    #[test]
    fn test_undecodable_pinned_key_is_config_error() {
        let mut config = PulseConfig::new("https://collector.example", "K");
        config.pinned_public_keys = vec!["%%% not base64".to_string()];
        assert!(matches!(Transport::new(&config), Err(PulseError::Config(_))));
    }
}
