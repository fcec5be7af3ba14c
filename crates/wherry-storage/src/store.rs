use crate::StorageError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;
use wherry_core::{Account, MailMessage, SyncTask, TaskStatus};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database, one connection so every query sees
    /// the same data. Used by tests across the workspace.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- accounts --------------------------------------------------------

    pub async fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
              id, email_address, display_name, active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
              email_address = excluded.email_address,
              display_name = excluded.display_name,
              active = excluded.active,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(account.id.to_string())
        .bind(&account.email_address)
        .bind(&account.display_name)
        .bind(account.active)
        .bind(account.created_at.to_rfc3339())
        .bind(account.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?1")
            .bind(account_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_account).transpose()
    }

    pub async fn list_active_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM accounts
            WHERE active = 1
            ORDER BY email_address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_account).collect()
    }

    // ---- messages --------------------------------------------------------

    pub async fn message_exists(
        &self,
        account_id: Uuid,
        provider_message_id: &str,
    ) -> Result<bool, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM mail_messages
            WHERE account_id = ?1 AND provider_message_id = ?2
            "#,
        )
        .bind(account_id.to_string())
        .bind(provider_message_id)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("total")?;
        Ok(count > 0)
    }

    /// Upsert one batch inside a single transaction. Content columns
    /// always take the incoming row; the flags column keeps the stored
    /// value when the stored row is newer, so user-visible flag changes
    /// are not clobbered by a stale provider payload.
    pub async fn upsert_messages(&self, messages: &[MailMessage]) -> Result<u64, StorageError> {
        if messages.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut saved = 0_u64;

        for message in messages {
            let result = sqlx::query(
                r#"
                INSERT INTO mail_messages (
                  id, account_id, provider_message_id, thread_id, subject,
                  sender_json, to_json, cc_json, bcc_json,
                  date_sent, body_text, body_html, processed_html, snippet,
                  flags_json, attachments_json, labels_json, raw_metadata_json,
                  created_at, updated_at
                ) VALUES (
                  ?1, ?2, ?3, ?4, ?5,
                  ?6, ?7, ?8, ?9,
                  ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18,
                  ?19, ?20
                )
                ON CONFLICT(account_id, provider_message_id) DO UPDATE SET
                  thread_id = excluded.thread_id,
                  subject = excluded.subject,
                  sender_json = excluded.sender_json,
                  to_json = excluded.to_json,
                  cc_json = excluded.cc_json,
                  bcc_json = excluded.bcc_json,
                  date_sent = excluded.date_sent,
                  body_text = excluded.body_text,
                  body_html = excluded.body_html,
                  processed_html = excluded.processed_html,
                  snippet = excluded.snippet,
                  flags_json = CASE
                    WHEN datetime(excluded.updated_at) >= datetime(mail_messages.updated_at)
                      THEN excluded.flags_json
                    ELSE mail_messages.flags_json
                  END,
                  attachments_json = excluded.attachments_json,
                  labels_json = excluded.labels_json,
                  raw_metadata_json = excluded.raw_metadata_json,
                  updated_at = MAX(mail_messages.updated_at, excluded.updated_at)
                "#,
            )
            .bind(message.id.to_string())
            .bind(message.account_id.to_string())
            .bind(&message.provider_message_id)
            .bind(&message.thread_id)
            .bind(&message.subject)
            .bind(
                message
                    .sender
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(serde_json::to_string(&message.to)?)
            .bind(serde_json::to_string(&message.cc)?)
            .bind(serde_json::to_string(&message.bcc)?)
            .bind(message.date_sent.map(|value| value.to_rfc3339()))
            .bind(&message.body_text)
            .bind(&message.body_html)
            .bind(&message.processed_html)
            .bind(&message.snippet)
            .bind(serde_json::to_string(&message.flags)?)
            .bind(serde_json::to_string(&message.attachments)?)
            .bind(serde_json::to_string(&message.labels)?)
            .bind(serde_json::to_string(&message.raw_metadata)?)
            .bind(message.created_at.to_rfc3339())
            .bind(message.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            saved += result.rows_affected();
        }

        tx.commit().await?;
        Ok(saved)
    }

    pub async fn get_message(
        &self,
        account_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<MailMessage>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM mail_messages
            WHERE account_id = ?1 AND provider_message_id = ?2
            "#,
        )
        .bind(account_id.to_string())
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_message).transpose()
    }

    pub async fn list_messages(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MailMessage>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM mail_messages
            WHERE account_id = ?1
            ORDER BY date_sent DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(account_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    pub async fn count_messages(&self, account_id: Uuid) -> Result<u64, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM mail_messages
            WHERE account_id = ?1
            "#,
        )
        .bind(account_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("total")?;
        Ok(count.max(0) as u64)
    }

    // ---- sync tasks ------------------------------------------------------

    pub async fn insert_task(&self, task: &SyncTask) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_tasks (
              id, account_id, priority, status, error,
              created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.account_id.to_string())
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(&task.error)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.completed_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The account's pending or processing task, if one exists.
    pub async fn find_live_task(
        &self,
        account_id: Uuid,
    ) -> Result<Option<SyncTask>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sync_tasks
            WHERE account_id = ?1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(account_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_task).transpose()
    }

    pub async fn raise_task_priority(
        &self,
        task_id: Uuid,
        priority: i32,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE sync_tasks
            SET priority = MAX(priority, ?2), updated_at = ?3
            WHERE id = ?1
            "#,
        )
        .bind(task_id.to_string())
        .bind(priority)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn due_tasks(&self, limit: i64) -> Result<Vec<SyncTask>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sync_tasks
            WHERE status = 'pending'
            ORDER BY priority DESC, created_at ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_task).collect()
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<SyncTask>, StorageError> {
        let row = sqlx::query("SELECT * FROM sync_tasks WHERE id = ?1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_task).transpose()
    }

    /// Guarded status transition. The `WHERE status` clause makes each
    /// edge atomic; touching a task that already left the expected
    /// status is an `InvalidTransition`.
    pub async fn transition_task(
        &self,
        task_id: Uuid,
        from: &[TaskStatus],
        to: TaskStatus,
        error: Option<String>,
    ) -> Result<(), StorageError> {
        let from_clause = from
            .iter()
            .map(|status| format!("'{}'", status.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let now = Utc::now();
        let completed_at = to.is_terminal().then(|| now.to_rfc3339());

        let result = sqlx::query(&format!(
            r#"
            UPDATE sync_tasks
            SET status = ?2, error = ?3, updated_at = ?4,
                completed_at = COALESCE(?5, completed_at)
            WHERE id = ?1 AND status IN ({from_clause})
            "#
        ))
        .bind(task_id.to_string())
        .bind(to.as_str())
        .bind(error)
        .bind(now.to_rfc3339())
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::InvalidTransition(format!(
                "task {task_id} is not in {from_clause}"
            )));
        }

        Ok(())
    }

    // ---- row mapping -----------------------------------------------------

    fn row_to_account(row: sqlx::sqlite::SqliteRow) -> Result<Account, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(Account {
            id: parse_uuid(&id_raw, "accounts.id")?,
            email_address: row.try_get("email_address")?,
            display_name: row.try_get("display_name")?,
            active: row.try_get("active")?,
            created_at: parse_datetime(&created_raw, "accounts.created_at")?,
            updated_at: parse_datetime(&updated_raw, "accounts.updated_at")?,
        })
    }

    fn row_to_message(row: sqlx::sqlite::SqliteRow) -> Result<MailMessage, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let account_id_raw: String = row.try_get("account_id")?;
        let sender_raw: Option<String> = row.try_get("sender_json")?;
        let to_raw: String = row.try_get("to_json")?;
        let cc_raw: String = row.try_get("cc_json")?;
        let bcc_raw: String = row.try_get("bcc_json")?;
        let date_sent_raw: Option<String> = row.try_get("date_sent")?;
        let flags_raw: String = row.try_get("flags_json")?;
        let attachments_raw: String = row.try_get("attachments_json")?;
        let labels_raw: String = row.try_get("labels_json")?;
        let metadata_raw: String = row.try_get("raw_metadata_json")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(MailMessage {
            id: parse_uuid(&id_raw, "mail_messages.id")?,
            account_id: parse_uuid(&account_id_raw, "mail_messages.account_id")?,
            provider_message_id: row.try_get("provider_message_id")?,
            thread_id: row.try_get("thread_id")?,
            subject: row.try_get("subject")?,
            sender: sender_raw
                .as_deref()
                .map(|raw| parse_json(raw, "mail_messages.sender_json"))
                .transpose()?,
            to: parse_json(&to_raw, "mail_messages.to_json")?,
            cc: parse_json(&cc_raw, "mail_messages.cc_json")?,
            bcc: parse_json(&bcc_raw, "mail_messages.bcc_json")?,
            date_sent: date_sent_raw
                .as_deref()
                .map(|raw| parse_datetime(raw, "mail_messages.date_sent"))
                .transpose()?,
            body_text: row.try_get("body_text")?,
            body_html: row.try_get("body_html")?,
            processed_html: row.try_get("processed_html")?,
            snippet: row.try_get("snippet")?,
            flags: parse_json(&flags_raw, "mail_messages.flags_json")?,
            attachments: parse_json(&attachments_raw, "mail_messages.attachments_json")?,
            labels: parse_json(&labels_raw, "mail_messages.labels_json")?,
            raw_metadata: parse_json(&metadata_raw, "mail_messages.raw_metadata_json")?,
            created_at: parse_datetime(&created_raw, "mail_messages.created_at")?,
            updated_at: parse_datetime(&updated_raw, "mail_messages.updated_at")?,
        })
    }

    fn row_to_task(row: sqlx::sqlite::SqliteRow) -> Result<SyncTask, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let account_id_raw: String = row.try_get("account_id")?;
        let status_raw: String = row.try_get("status")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;
        let completed_raw: Option<String> = row.try_get("completed_at")?;

        Ok(SyncTask {
            id: parse_uuid(&id_raw, "sync_tasks.id")?,
            account_id: parse_uuid(&account_id_raw, "sync_tasks.account_id")?,
            priority: row.try_get("priority")?,
            status: parse_status(&status_raw)?,
            error: row.try_get("error")?,
            created_at: parse_datetime(&created_raw, "sync_tasks.created_at")?,
            updated_at: parse_datetime(&updated_raw, "sync_tasks.updated_at")?,
            completed_at: completed_raw
                .as_deref()
                .map(|raw| parse_datetime(raw, "sync_tasks.completed_at"))
                .transpose()?,
        })
    }
}

fn parse_uuid(raw: &str, column: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|err| StorageError::Data(format!("{column}: {err}")))
}

fn parse_datetime(raw: &str, column: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("{column}: {err}")))
}

fn parse_json<T: DeserializeOwned>(raw: &str, column: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|err| StorageError::Data(format!("{column}: {err}")))
}

fn parse_status(raw: &str) -> Result<TaskStatus, StorageError> {
    match raw {
        "pending" => Ok(TaskStatus::Pending),
        "processing" => Ok(TaskStatus::Processing),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        other => Err(StorageError::Data(format!(
            "sync_tasks.status: unknown value '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wherry_core::{MailAddress, MessageFlags};

    fn account() -> Account {
        let now = Utc::now();
        let id = Uuid::new_v4();
        Account {
            id,
            email_address: format!("pat-{id}@example.com"),
            display_name: "Pat".into(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn message(account_id: Uuid, provider_id: &str) -> MailMessage {
        let now = Utc::now();
        MailMessage {
            id: Uuid::new_v4(),
            account_id,
            provider_message_id: provider_id.into(),
            thread_id: "t1".into(),
            subject: "hello".into(),
            sender: Some(MailAddress {
                name: Some("Sam".into()),
                address: "sam@example.com".into(),
            }),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            date_sent: Some(now),
            body_text: Some("hi".into()),
            body_html: None,
            processed_html: None,
            snippet: "hi".into(),
            flags: MessageFlags::default(),
            attachments: vec![],
            labels: vec!["INBOX".into()],
            raw_metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_messages_is_idempotent_per_key() {
        let store = Store::open_in_memory().await.expect("open store");
        let account = account();
        store.upsert_account(&account).await.expect("account");

        let first = message(account.id, "m1");
        store.upsert_messages(&[first.clone()]).await.expect("insert");

        // Same provider id again, different surrogate id: still one row.
        let again = message(account.id, "m1");
        store.upsert_messages(&[again]).await.expect("upsert");

        assert_eq!(store.count_messages(account.id).await.expect("count"), 1);
        assert!(store
            .message_exists(account.id, "m1")
            .await
            .expect("exists"));
        assert!(!store
            .message_exists(account.id, "m2")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn stale_provider_flags_do_not_clobber_newer_local_flags() {
        let store = Store::open_in_memory().await.expect("open store");
        let account = account();
        store.upsert_account(&account).await.expect("account");

        let mut current = message(account.id, "m1");
        current.flags.is_read = true;
        store.upsert_messages(&[current.clone()]).await.expect("insert");

        let mut stale = message(account.id, "m1");
        stale.flags.is_read = false;
        stale.updated_at = current.updated_at - Duration::hours(1);
        store.upsert_messages(&[stale]).await.expect("upsert");

        let stored = store
            .get_message(account.id, "m1")
            .await
            .expect("get")
            .expect("present");
        assert!(stored.flags.is_read);

        let mut newer = message(account.id, "m1");
        newer.flags.is_read = false;
        newer.updated_at = current.updated_at + Duration::hours(1);
        store.upsert_messages(&[newer]).await.expect("upsert");

        let stored = store
            .get_message(account.id, "m1")
            .await
            .expect("get")
            .expect("present");
        assert!(!stored.flags.is_read);
    }

    #[tokio::test]
    async fn due_tasks_order_by_priority_then_age() {
        let store = Store::open_in_memory().await.expect("open store");
        let now = Utc::now();

        let mut tasks = Vec::new();
        for (offset, priority) in [(3, 1), (2, 5), (1, 5)] {
            let acct = account();
            store.upsert_account(&acct).await.expect("account");
            let task = SyncTask {
                id: Uuid::new_v4(),
                account_id: acct.id,
                priority,
                status: TaskStatus::Pending,
                error: None,
                created_at: now - Duration::minutes(offset),
                updated_at: now,
                completed_at: None,
            };
            store.insert_task(&task).await.expect("task");
            tasks.push(task);
        }

        let due = store.due_tasks(10).await.expect("due");
        assert_eq!(due.len(), 3);
        // Highest priority first; the older of the two 5s wins the tie.
        assert_eq!(due[0].id, tasks[1].id);
        assert_eq!(due[1].id, tasks[2].id);
        assert_eq!(due[2].id, tasks[0].id);
    }

    #[tokio::test]
    async fn guarded_transitions_reject_illegal_edges() {
        let store = Store::open_in_memory().await.expect("open store");
        let acct = account();
        store.upsert_account(&acct).await.expect("account");

        let now = Utc::now();
        let task = SyncTask {
            id: Uuid::new_v4(),
            account_id: acct.id,
            priority: 0,
            status: TaskStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        store.insert_task(&task).await.expect("task");

        store
            .transition_task(task.id, &[TaskStatus::Pending], TaskStatus::Processing, None)
            .await
            .expect("pending -> processing");
        store
            .transition_task(
                task.id,
                &[TaskStatus::Processing],
                TaskStatus::Completed,
                None,
            )
            .await
            .expect("processing -> completed");

        // No edge leaves a terminal status.
        let err = store
            .transition_task(task.id, &[TaskStatus::Processing], TaskStatus::Failed, None)
            .await;
        assert!(matches!(err, Err(StorageError::InvalidTransition(_))));

        let stored = store.get_task(task.id).await.expect("get").expect("present");
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.is_some());
    }
}
