//! The telephony provider the worker issues credentials against.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{config::WorkerConfig, error::ProviderError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CredentialRequest {
    pub connection_name: String,
    pub user_name: String,
    pub password: String,
    pub ttl: u64,
}

/// What the provider sent back. Any field may be missing; the worker fills
/// in defaults.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ProviderCredential {
    #[serde(default, alias = "sip_username")]
    pub user_name: Option<String>,
    #[serde(default, alias = "sip_password")]
    pub password: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub sip_uri: Option<String>,
    #[serde(default)]
    pub ice_servers: Option<Vec<IceServer>>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            IceUrls::One(url) => vec![url.clone()],
            IceUrls::Many(urls) => urls.clone(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Wrapped { data: ProviderCredential },
    Bare(ProviderCredential),
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn create_credential(
        &self,
        request: &CredentialRequest,
    ) -> Result<ProviderCredential, ProviderError>;
}

pub struct TelnyxProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl TelnyxProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        TelnyxProvider {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            config.api_key.clone().unwrap_or_default(),
            config.api_base_url.clone(),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/credential_connections", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CredentialProvider for TelnyxProvider {
    async fn create_credential(
        &self,
        request: &CredentialRequest,
    ) -> Result<ProviderCredential, ProviderError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(ProviderCredential::default());
        }

        Ok(match serde_json::from_str(&body)? {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(credential) => credential,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    /// Serves exactly one HTTP response and hands back the raw request.
    async fn respond_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v2", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];

            loop {
                let read = stream.read(&mut buf).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);

                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);

                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "{}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();

            String::from_utf8_lossy(&request).into_owned()
        });

        (base_url, server)
    }

    fn request() -> CredentialRequest {
        CredentialRequest {
            connection_name: "webrtc-johndoe1700000000000".to_owned(),
            user_name: "johndoe1700000000000".to_owned(),
            password: "s3cret".to_owned(),
            ttl: 86_400,
        }
    }

    #[tokio::test]
    async fn posts_bearer_authenticated_json() {
        let (base_url, server) = respond_once(
            "HTTP/1.1 201 Created",
            r#"{"data":{"user_name":"johndoe1700000000000","realm":"sip.example.com"}}"#,
        )
        .await;

        let provider = TelnyxProvider::new("KEY123", base_url);
        let credential = provider.create_credential(&request()).await.unwrap();
        let raw_request = server.await.unwrap();

        assert!(raw_request.starts_with("POST /v2/credential_connections "));
        assert!(raw_request
            .to_ascii_lowercase()
            .contains("authorization: bearer key123"));
        assert!(raw_request.contains(r#""connection_name":"webrtc-johndoe1700000000000""#));
        assert!(raw_request.contains(r#""ttl":86400"#));

        assert_eq!(credential.user_name.as_deref(), Some("johndoe1700000000000"));
        assert_eq!(credential.realm.as_deref(), Some("sip.example.com"));
        assert!(credential.ice_servers.is_none());
    }

    #[tokio::test]
    async fn non_success_status_carries_status_and_body() {
        let (base_url, server) = respond_once(
            "HTTP/1.1 422 Unprocessable Entity",
            r#"{"errors":[{"detail":"name taken"}]}"#,
        )
        .await;

        let provider = TelnyxProvider::new("KEY123", base_url);
        let error = provider.create_credential(&request()).await.unwrap_err();
        server.await.unwrap();

        match &error {
            ProviderError::Http { status, body } => {
                assert_eq!(*status, 422);
                assert!(body.contains("name taken"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(error.to_string().starts_with("Telnyx API error: 422"));
    }

    #[test]
    fn bare_response_with_string_and_list_urls() {
        let envelope: Envelope = serde_json::from_str(
            r#"{
                "sip_username": "alice",
                "ice_servers": [
                    {"urls": "stun:stun.example.com:3478"},
                    {"urls": ["turn:turn.example.com:3478"], "username": "alice", "credential": "pw"}
                ]
            }"#,
        )
        .unwrap();

        let Envelope::Bare(credential) = envelope else {
            panic!("expected a bare credential");
        };
        let servers = credential.ice_servers.unwrap();

        assert_eq!(credential.user_name.as_deref(), Some("alice"));
        assert_eq!(servers[0].urls.to_vec(), vec!["stun:stun.example.com:3478"]);
        assert_eq!(servers[1].credential.as_deref(), Some("pw"));
    }
}
