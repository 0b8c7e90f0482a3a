//! Collaborators the pairing sessions call out to: the registration HTTP
//! endpoints, the credential codec and the platform credential ceremony.

pub mod ceremony;
pub mod codec;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, PairingConfig};

pub use ceremony::CredentialCeremony;
pub use codec::{Base64UrlCodec, CreationOptions, CredentialCodec, RegisteredCredential};

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("credential encoding failed: {0}")]
    Codec(String),
    #[error("credential ceremony failed: {0}")]
    Ceremony(String),
    #[error("credential ceremony is not supported on this platform")]
    Unsupported,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Server's answer to a registration start request.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationStart {
    pub registration_id: String,
    pub creation_options: Value,
}

#[async_trait]
pub trait EnrollmentApi: Send + Sync {
    /// Exchanges a one-time add token for credential creation options.
    async fn start_registration(&self, add_token: &str)
        -> Result<RegistrationStart, EnrollmentError>;

    async fn finish_registration(
        &self,
        registration_id: &str,
        credential: Value,
    ) -> Result<Value, EnrollmentError>;

    /// Issues a one-time add token for the authenticated account.
    async fn fetch_add_token(&self) -> Result<String, EnrollmentError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    registration_add_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    registration_id: Option<String>,
    public_key_credential_creation_options: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishRequest<'a> {
    registration_id: &'a str,
    credential: Value,
    user_agent: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddTokenResponse {
    registration_add_token: Option<String>,
}

/// [`EnrollmentApi`] backed by the account server's JSON endpoints.
pub struct HttpEnrollmentApi {
    client: reqwest::Client,
    start_url: Url,
    finish_url: Url,
    add_token_url: Url,
    bearer_token: Option<String>,
    user_agent: String,
}

impl HttpEnrollmentApi {
    pub fn new(config: &PairingConfig) -> Result<Self, EnrollmentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            start_url: config.start_url()?,
            finish_url: config.finish_url()?,
            add_token_url: config.add_token_url()?,
            bearer_token: config.bearer_token().map(str::to_string),
            user_agent: config.user_agent().to_string(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T>(response: reqwest::Response) -> Result<T, EnrollmentError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(target = "enrollment", %status, url = %response.url(), "request rejected");
            return Err(EnrollmentError::HttpStatus(status));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl EnrollmentApi for HttpEnrollmentApi {
    async fn start_registration(
        &self,
        add_token: &str,
    ) -> Result<RegistrationStart, EnrollmentError> {
        let request = self
            .client
            .post(self.start_url.clone())
            .json(&StartRequest {
                registration_add_token: add_token,
            });
        let response = self.authorize(request).send().await?;
        let payload: StartResponse = Self::read_json(response).await?;
        let registration_id = payload
            .registration_id
            .ok_or_else(|| EnrollmentError::InvalidResponse("missing registrationId".into()))?;
        let creation_options = payload.public_key_credential_creation_options.ok_or_else(|| {
            EnrollmentError::InvalidResponse("missing publicKeyCredentialCreationOptions".into())
        })?;
        tracing::debug!(target = "enrollment", %registration_id, "registration started");
        Ok(RegistrationStart {
            registration_id,
            creation_options,
        })
    }

    async fn finish_registration(
        &self,
        registration_id: &str,
        credential: Value,
    ) -> Result<Value, EnrollmentError> {
        let request = self.client.post(self.finish_url.clone()).json(&FinishRequest {
            registration_id,
            credential,
            user_agent: &self.user_agent,
        });
        let response = self.authorize(request).send().await?;
        let payload: Value = Self::read_json(response).await?;
        tracing::debug!(target = "enrollment", %registration_id, "registration finished");
        Ok(payload)
    }

    async fn fetch_add_token(&self) -> Result<String, EnrollmentError> {
        let request = self.client.get(self.add_token_url.clone());
        let response = self.authorize(request).send().await?;
        let payload: AddTokenResponse = Self::read_json(response).await?;
        payload
            .registration_add_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| EnrollmentError::InvalidResponse("missing registrationAddToken".into()))
    }
}
