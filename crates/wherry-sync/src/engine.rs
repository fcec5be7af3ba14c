use crate::{parser, SyncError};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;
use wherry_core::{Account, Credential, StopReason, SyncLimits, SyncReport};
use wherry_provider::{CredentialProvider, MailProvider};
use wherry_storage::Store;

/// Per-account sync coordinator: pages the provider newest-first,
/// stops at the first already-stored id, and persists each page as one
/// durable batch.
///
/// Because the feed is newest-first and append-only for incoming mail,
/// one known id means everything after it is known too, so steady-state
/// cost is proportional to new messages. A cold account degrades to a
/// bounded pull of `max_batches * batch_size`.
pub struct SyncEngine {
    store: Store,
    provider: Arc<dyn MailProvider>,
    credentials: Arc<dyn CredentialProvider>,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        provider: Arc<dyn MailProvider>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            store,
            provider,
            credentials,
        }
    }

    pub async fn run(
        &self,
        account: &Account,
        limits: SyncLimits,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SyncReport, SyncError> {
        let credential = self.obtain_credential(account.id).await?;

        let mut saved_count = 0_u64;
        let mut fetched_new = 0_usize;
        let mut page_token: Option<String> = None;

        for page_index in 0..limits.max_batches {
            // Cancellation is sampled only between batches, so a batch
            // is always fully persisted or not started.
            if *shutdown.borrow() {
                return Err(SyncError::Cancelled);
            }

            let page = self
                .provider
                .list_messages(
                    account,
                    &credential,
                    page_token.as_deref(),
                    limits.batch_size,
                )
                .await?;

            let mut batch = Vec::with_capacity(page.ids.len());
            let mut overlap = false;

            for message_id in &page.ids {
                if fetched_new >= limits.max_new {
                    break;
                }
                if self.store.message_exists(account.id, message_id).await? {
                    // Everything the provider returns after a known id
                    // is already stored; keep what this page collected.
                    overlap = true;
                    break;
                }

                let raw = self
                    .provider
                    .get_message(account, &credential, message_id)
                    .await?;
                let mut parsed = parser::parse(account.id, &raw);
                parser::embed_inline_images(
                    self.provider.as_ref(),
                    account,
                    &credential,
                    &mut parsed,
                )
                .await;
                batch.push(parsed.message);
                fetched_new += 1;
            }

            saved_count += self.store.upsert_messages(&batch).await?;
            debug!(
                account = %account.email_address,
                page = page_index,
                batch = batch.len(),
                "sync batch persisted"
            );

            let stop = if overlap {
                Some(StopReason::Overlap)
            } else if fetched_new >= limits.max_new {
                Some(StopReason::MaxNewReached)
            } else if page.next_page_token.is_none() {
                Some(StopReason::NoMorePages)
            } else {
                None
            };

            if let Some(stop) = stop {
                info!(
                    account = %account.email_address,
                    saved = saved_count,
                    ?stop,
                    "sync run finished"
                );
                return Ok(SyncReport { saved_count, stop });
            }

            page_token = page.next_page_token;
        }

        info!(
            account = %account.email_address,
            saved = saved_count,
            stop = ?StopReason::MaxBatchesReached,
            "sync run finished"
        );
        Ok(SyncReport {
            saved_count,
            stop: StopReason::MaxBatchesReached,
        })
    }

    /// Borrow the account credential, refreshing it at most once when
    /// expired. Refresh failure (or a missing refresh token) is fatal
    /// for the run and not retried: it needs external re-consent.
    async fn obtain_credential(&self, account_id: Uuid) -> Result<Credential, SyncError> {
        let credential = self
            .credentials
            .get(account_id)
            .await
            .map_err(|err| SyncError::AuthExpired(err.to_string()))?;

        if !credential.is_expired() {
            return Ok(credential);
        }

        if credential.refresh_token.is_none() {
            return Err(SyncError::AuthExpired(
                "credential expired with no refresh token".to_string(),
            ));
        }

        self.credentials
            .refresh(account_id, &credential)
            .await
            .map_err(|err| SyncError::AuthExpired(err.to_string()))
    }
}
