use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Consent attempt awaiting its callback, correlated by state token.
#[derive(Debug, Clone)]
pub struct PendingAuthSession {
    pub email_address: String,
    pub pkce_verifier: String,
    pub created_at: DateTime<Utc>,
}

/// TTL-scoped lookup for pending consent callbacks, keyed by the state
/// token carried through the redirect. Entries expire instead of
/// accumulating process-wide.
pub struct AuthSessions {
    ttl: Duration,
    inner: Mutex<HashMap<String, PendingAuthSession>>,
}

impl AuthSessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn begin(&self, state_token: String, session: PendingAuthSession) {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - self.ttl;
        inner.retain(|_, pending| pending.created_at > cutoff);
        inner.insert(state_token, session);
    }

    /// Claim the session for a returning callback. Expired or unknown
    /// state tokens return `None`; each token is redeemable once.
    pub async fn complete(&self, state_token: &str) -> Option<PendingAuthSession> {
        let mut inner = self.inner.lock().await;
        let session = inner.remove(state_token)?;
        (session.created_at > Utc::now() - self.ttl).then_some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(created_at: DateTime<Utc>) -> PendingAuthSession {
        PendingAuthSession {
            email_address: "pat@example.com".into(),
            pkce_verifier: "verifier".into(),
            created_at,
        }
    }

    #[tokio::test]
    async fn completes_once_within_ttl() {
        let sessions = AuthSessions::new(Duration::minutes(10));
        sessions.begin("state-1".into(), session(Utc::now())).await;

        assert!(sessions.complete("state-1").await.is_some());
        assert!(sessions.complete("state-1").await.is_none());
    }

    #[tokio::test]
    async fn expired_sessions_are_not_redeemable() {
        let sessions = AuthSessions::new(Duration::minutes(10));
        sessions
            .begin("state-1".into(), session(Utc::now() - Duration::minutes(11)))
            .await;

        assert!(sessions.complete("state-1").await.is_none());
    }
}
