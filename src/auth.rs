use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "id")]
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(None)` means the service answered and rejected the token.
    async fn verify(&self, token: &str) -> Result<Option<Identity>>;
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

/// Resolves tokens against a GoTrue-style `GET <base>/user` endpoint.
pub struct RemoteAuthenticator {
    client: Client,
    user_endpoint: String,
}

impl RemoteAuthenticator {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!base_url.trim().is_empty(), "missing auth service URL");
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
            headers.insert("apikey", HeaderValue::from_str(key).context("invalid auth API key")?);
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build auth HTTP client")?;
        Ok(Self {
            client,
            user_endpoint: format!("{}/user", base_url.trim().trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Authenticator for RemoteAuthenticator {
    async fn verify(&self, token: &str) -> Result<Option<Identity>> {
        let resp = self
            .client
            .get(&self.user_endpoint)
            .bearer_auth(token)
            .send()
            .await
            .context("failed to reach auth service")?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            status if status.is_success() => {
                let identity: Identity = resp.json().await.context("failed to parse auth user")?;
                Ok(Some(identity).filter(|i| !i.user_id.is_empty()))
            }
            status => {
                let body = resp
                    .text()
                    .await
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                bail!("auth service returned {}: {}", status, body)
            }
        }
    }
}

/// Trusts the presented token as the user id. Used by the local CLI, where the
/// operator already owns the database.
pub struct LocalAuthenticator;

#[async_trait]
impl Authenticator for LocalAuthenticator {
    async fn verify(&self, token: &str) -> Result<Option<Identity>> {
        let user_id = token.trim();
        if user_id.is_empty() {
            return Ok(None);
        }
        Ok(Some(Identity {
            user_id: user_id.to_string(),
            email: None,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    /// Fixed token → user table.
    pub(crate) struct StaticTokens(pub HashMap<String, String>);

    impl StaticTokens {
        pub(crate) fn single(token: &str, user_id: &str) -> Self {
            Self(HashMap::from([(token.to_string(), user_id.to_string())]))
        }
    }

    #[async_trait]
    impl Authenticator for StaticTokens {
        async fn verify(&self, token: &str) -> Result<Option<Identity>> {
            Ok(self.0.get(token).map(|user_id| Identity {
                user_id: user_id.clone(),
                email: None,
            }))
        }
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("bearer  abc ")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(Some("abc")), None);
        assert_eq!(bearer_token(None), None);
    }

    #[test]
    fn identity_reads_gotrue_user() {
        let identity: Identity =
            serde_json::from_str(r#"{"id":"u-1","email":"a@b.c","role":"authenticated"}"#).unwrap();
        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.email.as_deref(), Some("a@b.c"));
    }

    #[tokio::test]
    async fn local_authenticator_trusts_token() {
        let identity = LocalAuthenticator.verify("alice").await.unwrap().unwrap();
        assert_eq!(identity.user_id, "alice");
        assert!(LocalAuthenticator.verify(" ").await.unwrap().is_none());
    }
}
