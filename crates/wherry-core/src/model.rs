use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub email_address: String,
    pub display_name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MessageFlags {
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub is_draft: bool,
    pub has_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAttachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    /// Provider-side handle used to fetch the attachment bytes on demand.
    pub attachment_ref: String,
    pub is_inline: bool,
}

/// One normalized mail item. Immutable once stored except for `flags`,
/// which may move independently of body content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: Uuid,
    pub account_id: Uuid,
    pub provider_message_id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: Option<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub date_sent: Option<DateTime<Utc>>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// `body_html` with `cid:` references resolved to embedded data URIs.
    pub processed_html: Option<String>,
    pub snippet: String,
    pub flags: MessageFlags,
    pub attachments: Vec<MailAttachment>,
    pub labels: Vec<String>,
    /// Opaque provider fields kept for forward compatibility.
    pub raw_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One queued unit of sync work for an account. At most one task per
/// account may be in a non-terminal status at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: Uuid,
    pub account_id: Uuid,
    pub priority: i32,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Borrowed access credential for one account. The engine never
/// persists it; the credential provider owns storage and refresh.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl Credential {
    /// Expired, or close enough that an in-flight run would outlive it.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now() + Duration::seconds(60),
            None => false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Bounds for a single engine run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncLimits {
    pub max_new: usize,
    pub batch_size: usize,
    pub max_batches: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_new: 500,
            batch_size: 50,
            max_batches: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Overlap,
    MaxNewReached,
    NoMorePages,
    MaxBatchesReached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub saved_count: u64,
    pub stop: StopReason,
}

/// Failure classification recorded on a failed task. Only the kind and
/// a short message cross the task-status boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Timeouts, 5xx, rate limiting. Re-enqueued by the next sweep.
    Transient,
    /// Refresh failed or no refresh token; requires external re-consent.
    AuthExpired,
    /// Cooperative shutdown hit between batches. Re-enqueueable.
    Cancelled,
}

impl SyncErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::AuthExpired => "auth_expired",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_expiry_includes_skew() {
        let cred = Credential {
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::seconds(30)),
            scopes: vec![],
        };
        assert!(cred.is_expired());

        let fresh = Credential {
            expires_at: Some(Utc::now() + Duration::hours(1)),
            ..cred.clone()
        };
        assert!(!fresh.is_expired());

        let no_expiry = Credential {
            expires_at: None,
            ..cred
        };
        assert!(!no_expiry.is_expired());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn credential_debug_redacts_secrets() {
        let cred = Credential {
            access_token: "super-secret".into(),
            refresh_token: Some("also-secret".into()),
            expires_at: None,
            scopes: vec!["mail.read".into()],
        };
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("also-secret"));
    }
}
