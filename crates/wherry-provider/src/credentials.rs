use crate::ProviderError;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{ClientId, RefreshToken, TokenResponse, TokenUrl};
use std::collections::HashMap;
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;
use wherry_core::Credential;

/// Supplies and refreshes access credentials. The sync engine borrows
/// credentials from here and never persists them itself.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get(&self, account_id: Uuid) -> Result<Credential, ProviderError>;

    /// Exchange the refresh token for a fresh access token. Errors on
    /// a revoked or missing refresh token; callers treat that as
    /// requiring external re-consent.
    async fn refresh(
        &self,
        account_id: Uuid,
        credential: &Credential,
    ) -> Result<Credential, ProviderError>;
}

/// Token-endpoint client plus an in-process credential cache. Consent
/// happens elsewhere; completed grants are handed in via [`put`].
///
/// [`put`]: OAuthCredentialProvider::put
pub struct OAuthCredentialProvider {
    client_id: String,
    token_url: Url,
    http: reqwest::Client,
    credentials: RwLock<HashMap<Uuid, Credential>>,
}

impl OAuthCredentialProvider {
    pub fn new(client_id: impl Into<String>, token_url: &str) -> Result<Self, ProviderError> {
        let token_url = Url::parse(token_url)
            .map_err(|err| ProviderError::Endpoint(format!("token url: {err}")))?;
        if token_url.scheme() != "https" {
            return Err(ProviderError::Endpoint(
                "token URL must use HTTPS".to_string(),
            ));
        }

        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client_id: client_id.into(),
            token_url,
            http,
            credentials: RwLock::new(HashMap::new()),
        })
    }

    /// Install or replace the stored credential for an account.
    pub async fn put(&self, account_id: Uuid, credential: Credential) {
        self.credentials.write().await.insert(account_id, credential);
    }

    pub async fn remove(&self, account_id: Uuid) {
        self.credentials.write().await.remove(&account_id);
    }
}

#[async_trait]
impl CredentialProvider for OAuthCredentialProvider {
    async fn get(&self, account_id: Uuid) -> Result<Credential, ProviderError> {
        self.credentials
            .read()
            .await
            .get(&account_id)
            .cloned()
            .ok_or(ProviderError::MissingCredential(account_id))
    }

    async fn refresh(
        &self,
        account_id: Uuid,
        credential: &Credential,
    ) -> Result<Credential, ProviderError> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or_else(|| ProviderError::Refresh("no refresh token on credential".to_string()))?;

        let client = BasicClient::new(ClientId::new(self.client_id.clone())).set_token_uri(
            TokenUrl::from_url(self.token_url.clone()),
        );

        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|err| ProviderError::Refresh(err.to_string()))?;

        let refreshed = Credential {
            access_token: token.access_token().secret().to_string(),
            // Providers may rotate the refresh token; keep the old one
            // when the response omits it.
            refresh_token: token
                .refresh_token()
                .map(|value| value.secret().to_string())
                .or_else(|| credential.refresh_token.clone()),
            expires_at: token
                .expires_in()
                .map(|ttl| Utc::now() + Duration::seconds(ttl.as_secs() as i64)),
            scopes: credential.scopes.clone(),
        };

        self.credentials
            .write()
            .await
            .insert(account_id, refreshed.clone());

        Ok(refreshed)
    }
}
