//! Widevine key acquisition.
//!
//! The gateway owns everything around the license exchange: device-file
//! discovery, session lifecycle, request framing, the license POST, response
//! unwrapping and key extraction. The cryptographic protocol itself lives
//! behind [`CdmEngine`]; the engine shipped here speaks the pywidevine-serve
//! HTTP API, and a library consumer can inject a local implementation.

mod device;
mod remote;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::CdmSection;

pub use device::{DeviceType, WidevineDevice};
pub use remote::RemoteEngine;

const DEFAULT_SERVE_API: &str = "http://127.0.0.1:8786";

#[derive(Debug, Error)]
pub enum CdmError {
    #[error("no usable widevine device under {dir}: {detail}")]
    Unavailable { dir: PathBuf, detail: String },
    #[error("invalid widevine device file: {0}")]
    InvalidDevice(String),
    #[error("license server rejected the request ({status}): {body}")]
    LicenseRejected { status: u16, body: String },
    #[error("cdm session error: {0}")]
    Session(String),
    #[error("network error during license exchange: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed license response: {0}")]
    BadResponse(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type CdmResult<T> = std::result::Result<T, CdmError>;

/// One content key in `KID:KEY` hex form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentKey {
    pub kid: String,
    pub key: String,
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kid, self.key)
    }
}

/// How an adapter wants the raw CDM challenge wrapped for its license
/// server, and how the license is unwrapped from the response.
#[derive(Debug, Clone, PartialEq)]
pub enum LicenseFraming {
    /// Challenge bytes as the POST body, license bytes as the response.
    Raw,
    /// JSON envelope with a base64 challenge; the `license` response field
    /// carries the base64 license.
    JsonMessage {
        token: String,
        request_id: String,
        manifest_url: String,
    },
    /// Raw challenge with an `x-dt-auth-token` header.
    AuthTokenHeader { token: String },
    /// `getWidevineLicense` envelope with `token`/`account` query
    /// parameters; the license is under
    /// `getWidevineLicenseResponse.license`, base64-encoded.
    GetWidevineLicense {
        release_pid: String,
        token: String,
        account: String,
    },
    /// Raw challenge with a `customdata` header obtained out of band.
    CustomData { value: String },
}

/// One open CDM session. Sessions are single-use: opened and closed around
/// each license call, never shared across titles.
#[async_trait]
pub trait CdmSession: Send {
    async fn challenge(&mut self, pssh_b64: &str) -> CdmResult<Vec<u8>>;
    async fn keys(&mut self, license: &[u8]) -> CdmResult<Vec<ContentKey>>;
}

/// The opaque Widevine protocol capability.
#[async_trait]
pub trait CdmEngine: Send + Sync {
    async fn open_session(&self) -> CdmResult<Box<dyn CdmSession>>;
}

pub struct CdmGateway {
    engine: Arc<dyn CdmEngine>,
    http: reqwest::Client,
}

impl CdmGateway {
    pub fn new(engine: Arc<dyn CdmEngine>, http: reqwest::Client) -> Self {
        Self { engine, http }
    }

    /// Builds a gateway from configuration. A configured `cdm.api` wins;
    /// otherwise a local device under `<base>/utils/wvd/` is required (and
    /// synthesized from a `.pem`/`.bin` pair when only those exist), with a
    /// serve instance assumed on localhost exposing it. Absence of both is
    /// *cdm-unavailable* and aborts the run.
    pub fn from_config(
        section: &CdmSection,
        base_dir: &Path,
        http: reqwest::Client,
    ) -> CdmResult<Self> {
        let (api, device_name) = match &section.api {
            Some(api) => (
                api.clone(),
                section.device.clone().unwrap_or_else(|| "default".to_string()),
            ),
            None => {
                let wvd_dir = base_dir.join("utils").join("wvd");
                let (_, path) = WidevineDevice::load_or_synthesize(&wvd_dir)?;
                let stem = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_else(|| "device".to_string());
                (
                    DEFAULT_SERVE_API.to_string(),
                    section.device.clone().unwrap_or(stem),
                )
            }
        };
        let engine = RemoteEngine::new(http.clone(), api, device_name, section.secret.clone());
        Ok(Self::new(Arc::new(engine), http))
    }

    /// Single entry point: one fresh session per call.
    pub async fn get_keys(
        &self,
        pssh: &str,
        license_url: &str,
        framing: &LicenseFraming,
    ) -> CdmResult<Vec<ContentKey>> {
        let mut session = self.engine.open_session().await?;
        let challenge = session.challenge(pssh).await?;
        debug!(license_url, challenge_len = challenge.len(), "license exchange");
        let license = self.exchange(license_url, &challenge, framing).await?;
        let keys = session.keys(&license).await?;
        if keys.is_empty() {
            return Err(CdmError::LicenseRejected {
                status: 200,
                body: "license response produced no content keys".to_string(),
            });
        }
        Ok(keys)
    }

    async fn exchange(
        &self,
        license_url: &str,
        challenge: &[u8],
        framing: &LicenseFraming,
    ) -> CdmResult<Vec<u8>> {
        let response = match framing {
            LicenseFraming::Raw => {
                self.http
                    .post(license_url)
                    .header("content-type", "application/octet-stream")
                    .body(challenge.to_vec())
                    .send()
                    .await?
            }
            LicenseFraming::JsonMessage {
                token,
                request_id,
                manifest_url,
            } => {
                self.http
                    .post(license_url)
                    .json(&json!({
                        "message": BASE64.encode(challenge),
                        "token": token,
                        "request_id": request_id,
                        "video": {"type": "ondemand", "url": manifest_url},
                    }))
                    .send()
                    .await?
            }
            LicenseFraming::AuthTokenHeader { token } => {
                self.http
                    .post(license_url)
                    .header("x-dt-auth-token", token)
                    .header("content-type", "application/octet-stream")
                    .body(challenge.to_vec())
                    .send()
                    .await?
            }
            LicenseFraming::GetWidevineLicense {
                release_pid,
                token,
                account,
            } => {
                self.http
                    .post(license_url)
                    .query(&[("token", token.as_str()), ("account", account.as_str())])
                    .json(&json!({
                        "getWidevineLicense": {
                            "releasePid": release_pid,
                            "widevineChallenge": BASE64.encode(challenge),
                        }
                    }))
                    .send()
                    .await?
            }
            LicenseFraming::CustomData { value } => {
                self.http
                    .post(license_url)
                    .header("customdata", value)
                    .header("content-type", "application/octet-stream")
                    .body(challenge.to_vec())
                    .send()
                    .await?
            }
        };

        let status = response.status();
        if !status.is_success() {
            // The body is frequently the only diagnostic the server gives.
            let body = response.text().await.unwrap_or_default();
            return Err(CdmError::LicenseRejected {
                status: status.as_u16(),
                body,
            });
        }

        match framing {
            LicenseFraming::JsonMessage { .. } => {
                let payload: serde_json::Value = response.json().await?;
                let encoded = payload
                    .get("license")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        CdmError::BadResponse("missing `license` field".to_string())
                    })?;
                BASE64
                    .decode(encoded)
                    .map_err(|err| CdmError::BadResponse(err.to_string()))
            }
            LicenseFraming::GetWidevineLicense { .. } => {
                let payload: serde_json::Value = response.json().await?;
                let encoded = payload
                    .pointer("/getWidevineLicenseResponse/license")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        CdmError::BadResponse(
                            "missing `getWidevineLicenseResponse.license` field".to_string(),
                        )
                    })?;
                BASE64
                    .decode(encoded)
                    .map_err(|err| CdmError::BadResponse(err.to_string()))
            }
            _ => Ok(response.bytes().await?.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSession {
        keys: Vec<ContentKey>,
    }

    #[async_trait]
    impl CdmSession for FakeSession {
        async fn challenge(&mut self, pssh_b64: &str) -> CdmResult<Vec<u8>> {
            Ok(pssh_b64.as_bytes().to_vec())
        }

        async fn keys(&mut self, _license: &[u8]) -> CdmResult<Vec<ContentKey>> {
            Ok(self.keys.clone())
        }
    }

    struct FakeEngine {
        keys: Vec<ContentKey>,
    }

    #[async_trait]
    impl CdmEngine for FakeEngine {
        async fn open_session(&self) -> CdmResult<Box<dyn CdmSession>> {
            Ok(Box::new(FakeSession {
                keys: self.keys.clone(),
            }))
        }
    }

    #[test]
    fn content_key_renders_kid_key() {
        let key = ContentKey {
            kid: "00112233445566778899aabbccddeeff".into(),
            key: "ffeeddccbbaa99887766554433221100".into(),
        };
        assert_eq!(
            key.to_string(),
            "00112233445566778899aabbccddeeff:ffeeddccbbaa99887766554433221100"
        );
    }

    #[tokio::test]
    async fn unreachable_license_server_surfaces_before_key_extraction() {
        let gateway = CdmGateway::new(
            Arc::new(FakeEngine { keys: Vec::new() }),
            reqwest::Client::new(),
        );
        let err = gateway
            .get_keys("cHNzaA==", "http://127.0.0.1:1/license", &LicenseFraming::Raw)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CdmError::Network(_) | CdmError::LicenseRejected { .. }
        ));
    }
}
