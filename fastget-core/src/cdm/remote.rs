//! Remote CDM engine speaking the pywidevine-serve HTTP API.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use super::{CdmEngine, CdmError, CdmResult, CdmSession, ContentKey};

pub struct RemoteEngine {
    http: reqwest::Client,
    api: String,
    device: String,
    secret: Option<String>,
}

impl RemoteEngine {
    pub fn new(
        http: reqwest::Client,
        api: String,
        device: String,
        secret: Option<String>,
    ) -> Self {
        Self {
            http,
            api: api.trim_end_matches('/').to_string(),
            device,
            secret,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.api, path));
        if let Some(secret) = &self.secret {
            builder = builder.header("x-secret-key", secret);
        }
        builder
    }
}

#[derive(Debug, Deserialize)]
struct ServeEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct OpenData {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeData {
    challenge_b64: String,
}

#[derive(Debug, Deserialize)]
struct KeysData {
    keys: Vec<ServeKey>,
}

#[derive(Debug, Deserialize)]
struct ServeKey {
    key_id: String,
    key: String,
    #[serde(rename = "type")]
    key_type: String,
}

#[async_trait]
impl CdmEngine for RemoteEngine {
    async fn open_session(&self) -> CdmResult<Box<dyn CdmSession>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/{}/open", self.device))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CdmError::Session(format!(
                "serve open failed with status {}",
                response.status()
            )));
        }
        let envelope: ServeEnvelope<OpenData> = response
            .json()
            .await
            .map_err(|err| CdmError::BadResponse(err.to_string()))?;
        Ok(Box::new(RemoteSession {
            http: self.http.clone(),
            api: self.api.clone(),
            device: self.device.clone(),
            secret: self.secret.clone(),
            session_id: envelope.data.session_id,
        }))
    }
}

struct RemoteSession {
    http: reqwest::Client,
    api: String,
    device: String,
    secret: Option<String>,
    session_id: String,
}

impl RemoteSession {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{}", self.api, path));
        if let Some(secret) = &self.secret {
            builder = builder.header("x-secret-key", secret);
        }
        builder
    }

    async fn close(&self) {
        let path = format!("/{}/close/{}", self.device, self.session_id);
        let _ = self.request(reqwest::Method::GET, &path).send().await;
    }
}

#[async_trait]
impl CdmSession for RemoteSession {
    async fn challenge(&mut self, pssh_b64: &str) -> CdmResult<Vec<u8>> {
        let path = format!("/{}/get_license_challenge/STREAMING", self.device);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&json!({
                "session_id": self.session_id,
                "init_data": pssh_b64,
                "privacy_mode": false,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CdmError::Session(format!(
                "challenge request failed with status {}",
                response.status()
            )));
        }
        let envelope: ServeEnvelope<ChallengeData> = response
            .json()
            .await
            .map_err(|err| CdmError::BadResponse(err.to_string()))?;
        BASE64
            .decode(envelope.data.challenge_b64)
            .map_err(|err| CdmError::BadResponse(err.to_string()))
    }

    async fn keys(&mut self, license: &[u8]) -> CdmResult<Vec<ContentKey>> {
        let parse_path = format!("/{}/parse_license", self.device);
        let response = self
            .request(reqwest::Method::POST, &parse_path)
            .json(&json!({
                "session_id": self.session_id,
                "license_message": BASE64.encode(license),
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CdmError::Session(format!(
                "parse_license failed with status {}",
                response.status()
            )));
        }

        let keys_path = format!("/{}/get_keys/CONTENT", self.device);
        let response = self
            .request(reqwest::Method::POST, &keys_path)
            .json(&json!({"session_id": self.session_id}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(CdmError::Session(format!(
                "get_keys failed with status {}",
                response.status()
            )));
        }
        let envelope: ServeEnvelope<KeysData> = response
            .json()
            .await
            .map_err(|err| CdmError::BadResponse(err.to_string()))?;

        self.close().await;

        Ok(envelope
            .data
            .keys
            .into_iter()
            .filter(|key| key.key_type.eq_ignore_ascii_case("content"))
            .map(|key| ContentKey {
                kid: key.key_id,
                key: key.key,
            })
            .collect())
    }
}
