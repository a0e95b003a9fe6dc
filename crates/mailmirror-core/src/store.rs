use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::{Address, EnvelopeRole, MessageStore, StoreError, StoredMessage, parse_message};

pub(crate) type MessageRow = (String, String, i64, Vec<u8>, Option<String>, i64);

pub(crate) const MESSAGE_COLUMNS: &str = "message_id, subject, date_ts, raw, in_reply_to, size";

pub(crate) fn message_from_row(row: MessageRow) -> StoredMessage {
    StoredMessage {
        message_id: row.0,
        subject: row.1,
        date_ts: row.2,
        raw: row.3,
        in_reply_to: row.4,
        size: row.5,
    }
}

#[derive(Clone)]
pub struct SqliteMailStore {
    pub(crate) pool: SqlitePool,
}

impl SqliteMailStore {
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(path = %path, "opened mail store");
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Returns the surrogate id of `addr`, inserting it first if needed.
    pub async fn add_address(&self, addr: &Address) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_address(&mut *conn, addr).await
    }

    pub async fn mailbox_id(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT id FROM mailboxes WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn list_mailboxes(&self) -> Result<Vec<(i64, String)>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM mailboxes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Current membership snapshot of `mailbox`, sorted by message-id.
    pub async fn membership(&self, mailbox: &str) -> Result<Vec<String>, StoreError> {
        let mailbox_id = self.require_mailbox(mailbox).await?;
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT message_id FROM mailbox_membership WHERE mailbox_id = ? ORDER BY message_id",
        )
        .bind(mailbox_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    pub async fn message_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<StoredMessage>, StoreError> {
        let query = format!(
            "SELECT {} FROM messages WHERE message_id = ?",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(message_from_row))
    }

    /// Addresses linked to `message_id` under `role`, in insertion order.
    pub async fn addresses(
        &self,
        message_id: &str,
        role: EnvelopeRole,
    ) -> Result<Vec<Address>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String)>(
            "SELECT a.personal, a.mailbox, a.host
             FROM envelope_links l JOIN addresses a ON a.id = l.address_id
             WHERE l.message_id = ? AND l.role = ?
             ORDER BY l.rowid",
        )
        .bind(message_id)
        .bind(role.as_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(personal, mailbox, host)| Address {
                personal,
                mailbox,
                host,
            })
            .collect())
    }

    pub(crate) async fn require_mailbox(&self, name: &str) -> Result<i64, StoreError> {
        self.mailbox_id(name)
            .await?
            .ok_or_else(|| StoreError::UnknownMailbox(name.to_string()))
    }
}

async fn insert_address(conn: &mut SqliteConnection, addr: &Address) -> Result<i64, StoreError> {
    // Always re-select: the conflict path gives no row id.
    sqlx::query(
        "INSERT INTO addresses (personal, mailbox, host) VALUES (?, ?, ?)
         ON CONFLICT(personal, mailbox, host) DO NOTHING",
    )
    .bind(&addr.personal)
    .bind(&addr.mailbox)
    .bind(&addr.host)
    .execute(&mut *conn)
    .await?;
    let row = sqlx::query_as::<_, (i64,)>(
        "SELECT id FROM addresses WHERE personal = ? AND mailbox = ? AND host = ?",
    )
    .bind(&addr.personal)
    .bind(&addr.mailbox)
    .bind(&addr.host)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[async_trait]
impl MessageStore for SqliteMailStore {
    async fn add_message(&self, raw: &[u8]) -> Result<String, StoreError> {
        let parsed = parse_message(raw)?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO messages (message_id, subject, date_ts, raw, in_reply_to, size)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&parsed.message_id)
        .bind(&parsed.subject)
        .bind(parsed.date_ts)
        .bind(raw)
        .bind(parsed.in_reply_to.as_deref())
        .bind(raw.len() as i64)
        .execute(&mut *tx)
        .await;
        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(StoreError::AlreadyPresent(parsed.message_id));
            }
            return Err(err.into());
        }

        for (role, addrs) in &parsed.envelope {
            for addr in addrs {
                let address_id = insert_address(&mut *tx, addr).await?;
                sqlx::query(
                    "INSERT INTO envelope_links (message_id, address_id, role) VALUES (?, ?, ?)",
                )
                .bind(&parsed.message_id)
                .bind(address_id)
                .bind(role.as_i64())
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        debug!(message_id = %parsed.message_id, size = raw.len(), "stored message");
        Ok(parsed.message_id)
    }

    async fn is_present(&self, message_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT 1 FROM messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn replace_membership(
        &self,
        mailbox: &str,
        message_ids: &[String],
    ) -> Result<(), StoreError> {
        // Looked up before the transaction so that its first statement is a
        // write and takes the write lock up front.
        let mailbox_id = self.require_mailbox(mailbox).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mailbox_membership WHERE mailbox_id = ?")
            .bind(mailbox_id)
            .execute(&mut *tx)
            .await?;
        let mut duplicates = 0usize;
        for message_id in message_ids {
            let result = sqlx::query(
                "INSERT INTO mailbox_membership (mailbox_id, message_id) VALUES (?, ?)
                 ON CONFLICT(mailbox_id, message_id) DO NOTHING",
            )
            .bind(mailbox_id)
            .bind(message_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                duplicates += 1;
            }
        }
        tx.commit().await?;
        info!(
            mailbox = %mailbox,
            count = message_ids.len() - duplicates,
            duplicates,
            "replaced mailbox membership"
        );
        Ok(())
    }

    async fn create_mailbox(&self, name: &str) -> Result<i64, StoreError> {
        sqlx::query("INSERT INTO mailboxes (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.require_mailbox(name).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::SqliteMailStore;
    use crate::{Address, EnvelopeRole, MessageStore, StoreError};

    pub(crate) fn temp_db_path() -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "mailmirror-core-{}-{}.db",
            std::process::id(),
            ts
        ))
    }

    pub(crate) async fn fresh_store() -> anyhow::Result<(SqliteMailStore, PathBuf)> {
        let db_path = temp_db_path();
        let _ = std::fs::remove_file(&db_path);
        let store = SqliteMailStore::connect(
            db_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("invalid temp db path"))?,
        )
        .await?;
        store.init().await?;
        Ok((store, db_path))
    }

    pub(crate) fn raw_message(
        message_id: &str,
        subject: &str,
        date: &str,
        in_reply_to: Option<&str>,
    ) -> Vec<u8> {
        let mut raw = String::new();
        raw.push_str(&format!("Message-ID: {}\r\n", message_id));
        raw.push_str("From: Alice Example <alice@example.org>\r\n");
        raw.push_str("To: list@lists.example.org\r\n");
        raw.push_str(&format!("Subject: {}\r\n", subject));
        raw.push_str(&format!("Date: {}\r\n", date));
        if let Some(parent) = in_reply_to {
            raw.push_str(&format!("In-Reply-To: {}\r\n", parent));
        }
        raw.push_str("\r\n");
        raw.push_str("body text\r\n");
        raw.into_bytes()
    }

    #[tokio::test]
    async fn init_creates_schema_on_fresh_db() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;

        let tables: HashSet<String> = sqlx::query_as::<_, (String,)>(
            "SELECT name FROM sqlite_master WHERE type = 'table'",
        )
        .fetch_all(&store.pool)
        .await?
        .into_iter()
        .map(|row| row.0)
        .collect();
        for required in [
            "params",
            "messages",
            "addresses",
            "envelope_links",
            "mailboxes",
            "mailbox_membership",
        ] {
            assert!(tables.contains(required), "missing table {}", required);
        }

        let version = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM params WHERE key = 'dbversion'",
        )
        .fetch_one(&store.pool)
        .await?;
        assert_eq!(version.0, "1");

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_message_is_rejected_not_overwritten() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let raw = raw_message("<one@example.org>", "first", "Tue, 1 Aug 2023 10:00:00 +0000", None);

        let id = store.add_message(&raw).await?;
        assert_eq!(id, "<one@example.org>");
        assert_eq!(store.message_count().await?, 1);

        let mut altered = raw_message(
            "<one@example.org>",
            "second",
            "Wed, 2 Aug 2023 10:00:00 +0000",
            None,
        );
        altered.extend_from_slice(b"more\r\n");
        let err = store.add_message(&altered).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyPresent(ref id) if id == "<one@example.org>"));
        assert_eq!(store.message_count().await?, 1);

        let stored = store
            .get_message("<one@example.org>")
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing message"))?;
        assert_eq!(stored.subject, "first");
        assert_eq!(stored.raw, raw);
        assert_eq!(stored.size, raw.len() as i64);
        // The rejected message left no envelope rows behind.
        assert_eq!(store.addresses(&id, EnvelopeRole::From).await?.len(), 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn parse_errors_are_distinguishable_and_store_nothing() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;

        let err = store
            .add_message(b"Subject: no id\r\n\r\nbody\r\n")
            .await
            .unwrap_err();
        assert!(err.is_parse());
        assert!(!err.is_already_present());
        assert_eq!(store.message_count().await?, 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn failed_envelope_link_rolls_back_the_message() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        sqlx::query(
            "CREATE TRIGGER fail_to_links BEFORE INSERT ON envelope_links
             WHEN NEW.role = 4 BEGIN SELECT RAISE(ABORT, 'boom'); END",
        )
        .execute(&store.pool)
        .await?;
        let raw = raw_message("<one@example.org>", "first", "Tue, 1 Aug 2023 10:00:00 +0000", None);

        let err = store.add_message(&raw).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert!(!err.is_parse());
        assert_eq!(store.message_count().await?, 0);
        assert!(!store.is_present("<one@example.org>").await?);
        let (addresses,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM addresses")
            .fetch_one(&store.pool)
            .await?;
        assert_eq!(addresses, 0);
        let (links,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM envelope_links")
            .fetch_one(&store.pool)
            .await?;
        assert_eq!(links, 0);

        sqlx::query("DROP TRIGGER fail_to_links")
            .execute(&store.pool)
            .await?;
        store.add_message(&raw).await?;
        assert_eq!(store.message_count().await?, 1);
        assert_eq!(
            store.addresses("<one@example.org>", EnvelopeRole::To).await?.len(),
            1
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn is_present_tracks_inserts() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        assert!(!store.is_present("<one@example.org>").await?);
        store
            .add_message(&raw_message(
                "<one@example.org>",
                "first",
                "Tue, 1 Aug 2023 10:00:00 +0000",
                None,
            ))
            .await?;
        assert!(store.is_present("<one@example.org>").await?);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn same_address_triple_resolves_to_same_id() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let addr = Address::new("Alice Example", "alice", "example.org");

        let first = store.add_address(&addr).await?;
        let second = store.add_address(&addr).await?;
        assert_eq!(first, second);

        let other = store
            .add_address(&Address::new("", "alice", "example.org"))
            .await?;
        assert_ne!(first, other);

        // Ingesting a message from the same sender reuses the row.
        store
            .add_message(&raw_message(
                "<one@example.org>",
                "first",
                "Tue, 1 Aug 2023 10:00:00 +0000",
                None,
            ))
            .await?;
        assert_eq!(store.add_address(&addr).await?, first);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn envelope_links_cover_every_role() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let raw = b"Message-ID: <roles@example.org>\r\n\
From: Alice <alice@example.org>\r\n\
Sender: list-owner@lists.example.org\r\n\
Reply-To: list@lists.example.org\r\n\
To: bob@example.org\r\n\
Cc: carol@example.org, dave@example.org\r\n\
Bcc: eve@example.org\r\n\
Subject: roles\r\n\
Date: Tue, 1 Aug 2023 10:00:00 +0000\r\n\
\r\n\
body\r\n";
        store.add_message(raw).await?;

        let id = "<roles@example.org>";
        let from = store.addresses(id, EnvelopeRole::From).await?;
        assert_eq!(from, vec![Address::new("Alice", "alice", "example.org")]);
        assert_eq!(store.addresses(id, EnvelopeRole::Sender).await?.len(), 1);
        assert_eq!(store.addresses(id, EnvelopeRole::ReplyTo).await?.len(), 1);
        assert_eq!(store.addresses(id, EnvelopeRole::To).await?.len(), 1);
        let cc = store.addresses(id, EnvelopeRole::Cc).await?;
        assert_eq!(cc.len(), 2);
        assert_eq!(cc[1].mailbox, "dave");
        assert_eq!(store.addresses(id, EnvelopeRole::Bcc).await?.len(), 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn create_mailbox_is_idempotent() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let first = store.create_mailbox("INBOX").await?;
        let second = store.create_mailbox("INBOX").await?;
        let other = store.create_mailbox("lists/xen-devel").await?;
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(store.mailbox_id("INBOX").await?, Some(first));
        assert_eq!(store.list_mailboxes().await?.len(), 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn replace_membership_is_exactly_the_deduplicated_set() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        store.create_mailbox("INBOX").await?;
        store.create_mailbox("Archive").await?;

        let ids = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        store
            .replace_membership("INBOX", &ids(&["<a@x>", "<b@x>", "<c@x>"]))
            .await?;
        store.replace_membership("Archive", &ids(&["<a@x>"])).await?;

        store
            .replace_membership("INBOX", &ids(&["<d@x>", "<b@x>", "<d@x>"]))
            .await?;
        assert_eq!(store.membership("INBOX").await?, ids(&["<b@x>", "<d@x>"]));
        // Other mailboxes are untouched.
        assert_eq!(store.membership("Archive").await?, ids(&["<a@x>"]));

        store.replace_membership("INBOX", &[]).await?;
        assert!(store.membership("INBOX").await?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[tokio::test]
    async fn replace_membership_of_unknown_mailbox_fails() -> anyhow::Result<()> {
        let (store, db_path) = fresh_store().await?;
        let err = store
            .replace_membership("nowhere", &["<a@x>".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownMailbox(ref name) if name == "nowhere"));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
