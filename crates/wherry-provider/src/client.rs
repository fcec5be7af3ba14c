use crate::types::{MessagePage, RawAttachment, RawMessage};
use crate::{ProviderError, Throttle};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use wherry_core::{Account, Credential};

const MAX_RATE_LIMIT_RETRIES: usize = 4;
const BACKOFF_BASE_MS: u64 = 500;

/// The remote mail API, reduced to the three calls sync needs. The
/// wire protocol stays behind this trait.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Newest-first page of message ids, with a token for the next page.
    async fn list_messages(
        &self,
        account: &Account,
        credential: &Credential,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError>;

    async fn get_message(
        &self,
        account: &Account,
        credential: &Credential,
        message_id: &str,
    ) -> Result<RawMessage, ProviderError>;

    async fn get_attachment(
        &self,
        account: &Account,
        credential: &Credential,
        message_id: &str,
        attachment_ref: &str,
    ) -> Result<Vec<u8>, ProviderError>;
}

#[derive(Debug, Clone, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Option<Vec<MessageRef>>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// REST client for the provider's JSON API. All requests go through
/// the shared throttle and a bounded retry loop for 429/5xx.
pub struct RestMailProvider {
    http: reqwest::Client,
    base_url: String,
    throttle: Arc<Throttle>,
}

impl RestMailProvider {
    pub fn new(base_url: impl Into<String>, throttle: Arc<Throttle>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            throttle,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        url: &str,
    ) -> Result<T, ProviderError> {
        let mut attempt = 0_usize;

        loop {
            self.throttle.acquire().await;

            let response = self
                .http
                .get(url)
                .bearer_auth(&credential.access_token)
                .send()
                .await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                attempt += 1;
                if attempt > MAX_RATE_LIMIT_RETRIES {
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(ProviderError::RateLimited(attempt));
                    }
                    return Err(ProviderError::Status {
                        status,
                        message: response.text().await.unwrap_or_default(),
                    });
                }

                let delay = Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1));
                warn!(%status, attempt, ?delay, "provider request throttled, backing off");
                tokio::time::sleep(delay).await;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ProviderError::Auth(format!(
                    "provider rejected token with {status}"
                )));
            }

            if !status.is_success() {
                return Err(ProviderError::Status {
                    status,
                    message: response.text().await.unwrap_or_default(),
                });
            }

            return Ok(response.json::<T>().await?);
        }
    }
}

#[async_trait]
impl MailProvider for RestMailProvider {
    async fn list_messages(
        &self,
        account: &Account,
        credential: &Credential,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError> {
        let mut url = format!(
            "{}/users/{}/messages?maxResults={}",
            self.base_url, account.email_address, page_size
        );
        if let Some(token) = page_token {
            url.push_str("&pageToken=");
            url.push_str(token);
        }

        let response: MessageListResponse = self.get_json(credential, &url).await?;
        Ok(MessagePage {
            ids: response
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(|reference| reference.id)
                .collect(),
            next_page_token: response.next_page_token,
        })
    }

    async fn get_message(
        &self,
        account: &Account,
        credential: &Credential,
        message_id: &str,
    ) -> Result<RawMessage, ProviderError> {
        let url = format!(
            "{}/users/{}/messages/{}?format=full",
            self.base_url, account.email_address, message_id
        );
        self.get_json(credential, &url).await
    }

    async fn get_attachment(
        &self,
        account: &Account,
        credential: &Credential,
        message_id: &str,
        attachment_ref: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = format!(
            "{}/users/{}/messages/{}/attachments/{}",
            self.base_url, account.email_address, message_id, attachment_ref
        );
        let attachment: RawAttachment = self.get_json(credential, &url).await?;

        let data = attachment.data.unwrap_or_default();
        crate::types::decode_base64url(&data).ok_or_else(|| ProviderError::Status {
            status: StatusCode::OK,
            message: "attachment body was not valid base64url".to_string(),
        })
    }
}
