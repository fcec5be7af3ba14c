//! Scripted collaborators for engine and scheduler tests.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;
use wherry_core::{Account, Credential};
use wherry_provider::{
    CredentialProvider, MailProvider, MessagePage, ProviderError, RawBody, RawHeader, RawMessage,
    RawPart,
};

pub fn account() -> Account {
    let now = Utc::now();
    Account {
        id: Uuid::new_v4(),
        email_address: "pat@example.com".into(),
        display_name: "Pat".into(),
        active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn fresh_credential() -> Credential {
    Credential {
        access_token: "token".into(),
        refresh_token: Some("refresh".into()),
        expires_at: Some(Utc::now() + Duration::hours(1)),
        scopes: vec![],
    }
}

pub fn expired_credential(with_refresh_token: bool) -> Credential {
    Credential {
        access_token: "stale".into(),
        refresh_token: with_refresh_token.then(|| "refresh".to_string()),
        expires_at: Some(Utc::now() - Duration::hours(1)),
        scopes: vec![],
    }
}

pub fn stored_message(account_id: Uuid, provider_id: &str) -> wherry_core::MailMessage {
    let now = Utc::now();
    wherry_core::MailMessage {
        id: Uuid::new_v4(),
        account_id,
        provider_message_id: provider_id.to_string(),
        thread_id: format!("thread-{provider_id}"),
        subject: format!("Subject {provider_id}"),
        sender: None,
        to: vec![],
        cc: vec![],
        bcc: vec![],
        date_sent: Some(now),
        body_text: Some(format!("body of {provider_id}")),
        body_html: None,
        processed_html: None,
        snippet: String::new(),
        flags: wherry_core::MessageFlags::default(),
        attachments: vec![],
        labels: vec![],
        raw_metadata: serde_json::json!({}),
        created_at: now,
        updated_at: now,
    }
}

/// In-memory provider over a fixed newest-first id list. Page tokens
/// are offsets into the list; every full fetch is recorded.
pub struct ScriptedProvider {
    ids: Vec<String>,
    pub list_calls: AtomicUsize,
    pub fetched: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            ids,
            list_calls: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fetched_ids(&self) -> Vec<String> {
        self.fetched.lock().expect("fetched lock").clone()
    }
}

#[async_trait]
impl MailProvider for ScriptedProvider {
    async fn list_messages(
        &self,
        _account: &Account,
        _credential: &Credential,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let start = page_token
            .map(|token| token.parse::<usize>().expect("numeric page token"))
            .unwrap_or(0);
        let end = (start + page_size).min(self.ids.len());

        Ok(MessagePage {
            ids: self.ids[start..end].to_vec(),
            next_page_token: (end < self.ids.len()).then(|| end.to_string()),
        })
    }

    async fn get_message(
        &self,
        _account: &Account,
        _credential: &Credential,
        message_id: &str,
    ) -> Result<RawMessage, ProviderError> {
        self.fetched
            .lock()
            .expect("fetched lock")
            .push(message_id.to_string());

        Ok(RawMessage {
            id: message_id.to_string(),
            thread_id: Some(format!("thread-{message_id}")),
            label_ids: Some(vec!["INBOX".into(), "UNREAD".into()]),
            snippet: Some(format!("snippet of {message_id}")),
            internal_date: Some("1722470400000".into()),
            payload: Some(RawPart {
                mime_type: Some("multipart/alternative".into()),
                headers: Some(vec![
                    RawHeader {
                        name: "Subject".into(),
                        value: format!("Subject {message_id}"),
                    },
                    RawHeader {
                        name: "From".into(),
                        value: "Sam <sam@example.com>".into(),
                    },
                ]),
                parts: Some(vec![RawPart {
                    mime_type: Some("text/plain".into()),
                    body: Some(RawBody {
                        size: None,
                        data: Some(URL_SAFE_NO_PAD.encode(format!("body of {message_id}"))),
                        attachment_id: None,
                    }),
                    ..RawPart::default()
                }]),
                ..RawPart::default()
            }),
        })
    }

    async fn get_attachment(
        &self,
        _account: &Account,
        _credential: &Credential,
        _message_id: &str,
        _attachment_ref: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
    }
}

pub struct FakeCredentials {
    credential: Mutex<Credential>,
    pub refresh_calls: AtomicUsize,
    pub fail_refresh: bool,
}

impl FakeCredentials {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(credential),
            refresh_calls: AtomicUsize::new(0),
            fail_refresh: false,
        }
    }

    pub fn failing_refresh(credential: Credential) -> Self {
        Self {
            fail_refresh: true,
            ..Self::new(credential)
        }
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn get(&self, _account_id: Uuid) -> Result<Credential, ProviderError> {
        Ok(self.credential.lock().expect("credential lock").clone())
    }

    async fn refresh(
        &self,
        _account_id: Uuid,
        _credential: &Credential,
    ) -> Result<Credential, ProviderError> {
        if self.fail_refresh {
            return Err(ProviderError::Refresh("invalid_grant".into()));
        }

        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let refreshed = fresh_credential();
        *self.credential.lock().expect("credential lock") = refreshed.clone();
        Ok(refreshed)
    }
}
