//! SQLite contact store.
//!
//! Uses a single `contacts` table with partial indexes on email, phone
//! number and linked id (each excluding soft-deleted rows).
//!
//! SQLite admits one writer at a time, so resolutions are serialized through
//! a store-wide writer gate taken with a bounded wait, and every transaction
//! opens with `BEGIN IMMEDIATE`. The gate orders writers inside one process;
//! the immediate lock excludes other processes on the same file, waiting at
//! most `busy_timeout`. Both are held until commit or rollback.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use identra_config::DatabaseConfig;
use identra_core::{
    Contact, ContactId, ContactStore, ContactTransaction, LinkPrecedence, LockKey, NewContact,
    StoreError,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

const CONTACT_COLUMNS: &str =
    "id, email, phone_number, linked_id, link_precedence, created_at, updated_at, deleted_at";

/// A SQLite-backed contact store.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    lock_timeout: Duration,
}

impl SqliteStore {
    /// Open a store at `url` with default pool settings.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let config = DatabaseConfig {
            backend: "sqlite".into(),
            url: url.into(),
            ..DatabaseConfig::default()
        };
        let store = Self::connect(&config).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Open a pool as described by `config`. Does not migrate.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Unavailable(format!("Invalid SQLite url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.lock_timeout())
            .foreign_keys(true);

        // Every connection to `:memory:` opens a separate database, so an
        // ephemeral store must live on exactly one connection that never expires.
        let in_memory = config.url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(config.acquire_timeout());
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(config.max_connections)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        info!(url = %config.url, "SQLite contact store opened");
        Ok(Self::from_pool(pool, config.lock_timeout()))
    }

    /// Create from an existing pool (useful for testing).
    pub fn from_pool(pool: SqlitePool, lock_timeout: Duration) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            lock_timeout,
        }
    }

}

#[async_trait]
impl ContactStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                phone_number    TEXT,
                email           TEXT,
                linked_id       INTEGER REFERENCES contacts(id) ON DELETE SET NULL,
                link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary', 'secondary')),
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                deleted_at      TEXT,
                CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
                CHECK ((link_precedence = 'primary') = (linked_id IS NULL))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("contacts table: {e}")))?;

        for (name, column) in [
            ("idx_contacts_email", "email"),
            ("idx_contacts_phone", "phone_number"),
            ("idx_contacts_linked_id", "linked_id"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {name} ON contacts({column}) WHERE deleted_at IS NULL"
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("{name}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    async fn begin(&self, keys: &[LockKey]) -> Result<Box<dyn ContactTransaction>, StoreError> {
        let writer = tokio::time::timeout(self.lock_timeout, self.writer.clone().lock_owned())
            .await
            .map_err(|_| {
                StoreError::LockTimeout(format!(
                    "writer gate busy for {}ms ({} key(s))",
                    self.lock_timeout.as_millis(),
                    keys.len()
                ))
            })?;

        let tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| match map_sqlx("begin", e) {
                StoreError::Conflict(detail) => StoreError::LockTimeout(detail),
                other => other,
            })?;

        Ok(Box::new(SqliteTransaction {
            tx,
            _writer: writer,
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("SQLite contact store closed");
    }
}

/// One resolution's transaction. Field order matters: the transaction is
/// dropped (and rolled back) before the writer gate is released.
pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
    _writer: OwnedMutexGuard<()>,
}

impl SqliteTransaction {
    async fn precedence_of(&mut self, id: ContactId) -> Result<Option<LinkPrecedence>, StoreError> {
        let row = sqlx::query(
            "SELECT link_precedence FROM contacts WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("precedence lookup", e))?;

        row.map(|r| {
            let raw: String = r
                .try_get("link_precedence")
                .map_err(|e| StoreError::QueryFailed(format!("link_precedence column: {e}")))?;
            raw.parse().map_err(StoreError::QueryFailed)
        })
        .transpose()
    }

    async fn require_primary(&mut self, id: ContactId) -> Result<(), StoreError> {
        match self.precedence_of(id).await? {
            Some(LinkPrecedence::Primary) => Ok(()),
            Some(LinkPrecedence::Secondary) => Err(StoreError::Conflict(format!(
                "contact {id} is no longer a primary"
            ))),
            None => Err(StoreError::Conflict(format!("contact {id} does not exist"))),
        }
    }
}

#[async_trait]
impl ContactTransaction for SqliteTransaction {
    async fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, StoreError> {
        if email.is_none() && phone_number.is_none() {
            return Ok(Vec::new());
        }

        // `col = NULL` never matches, so an absent side simply drops out.
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE (email = ?1 OR phone_number = ?2) AND deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(email)
        .bind(phone_number)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("find by email or phone", e))?;

        rows.iter().map(row_to_contact).collect()
    }

    async fn find_cluster(&mut self, primary_id: ContactId) -> Result<Vec<Contact>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts \
             WHERE (id = ?1 OR linked_id = ?1) AND deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(primary_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("find cluster", e))?;

        rows.iter().map(row_to_contact).collect()
    }

    async fn create(&mut self, contact: NewContact) -> Result<Contact, StoreError> {
        if !contact.has_fragment() {
            return Err(StoreError::ConstraintViolation(
                "contact needs an email or a phone number".into(),
            ));
        }
        if let Some(primary_id) = contact.linked_id() {
            self.require_primary(primary_id).await?;
        }

        let now = now_micros();
        let stamp = encode_ts(now);
        let result = sqlx::query(
            "INSERT INTO contacts (email, phone_number, linked_id, link_precedence, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(contact.email())
        .bind(contact.phone_number())
        .bind(contact.linked_id())
        .bind(contact.precedence().as_str())
        .bind(&stamp)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("insert contact", e))?;

        let id = result.last_insert_rowid();
        debug!(id, precedence = %contact.precedence(), "Inserted contact");
        Ok(Contact {
            id,
            email: contact.email().map(String::from),
            phone_number: contact.phone_number().map(String::from),
            linked_id: contact.linked_id(),
            link_precedence: contact.precedence(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    async fn demote(
        &mut self,
        contact_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<(), StoreError> {
        if contact_id == new_primary_id {
            return Err(StoreError::ConstraintViolation(format!(
                "contact {contact_id} cannot link to itself"
            )));
        }
        self.require_primary(new_primary_id).await?;
        self.require_primary(contact_id).await?;

        let dependents: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM contacts WHERE linked_id = ?1 AND deleted_at IS NULL",
        )
        .bind(contact_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("count secondaries", e))?;
        if dependents > 0 {
            return Err(StoreError::Conflict(format!(
                "contact {contact_id} still has {dependents} secondaries"
            )));
        }

        sqlx::query(
            "UPDATE contacts SET link_precedence = 'secondary', linked_id = ?2, updated_at = ?3 \
             WHERE id = ?1",
        )
        .bind(contact_id)
        .bind(new_primary_id)
        .bind(encode_ts(now_micros()))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("demote contact", e))?;
        Ok(())
    }

    async fn repoint(
        &mut self,
        old_primary_id: ContactId,
        new_primary_id: ContactId,
    ) -> Result<u64, StoreError> {
        if old_primary_id == new_primary_id {
            return Err(StoreError::ConstraintViolation(format!(
                "cannot re-point contact {old_primary_id} onto itself"
            )));
        }
        self.require_primary(new_primary_id).await?;

        let result = sqlx::query(
            "UPDATE contacts SET linked_id = ?2, updated_at = ?3 \
             WHERE linked_id = ?1 AND deleted_at IS NULL",
        )
        .bind(old_primary_id)
        .bind(new_primary_id)
        .bind(encode_ts(now_micros()))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx("re-point secondaries", e))?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let SqliteTransaction { tx, _writer } = *self;
        tx.commit().await.map_err(|e| map_sqlx("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let SqliteTransaction { tx, _writer } = *self;
        tx.rollback().await.map_err(|e| map_sqlx("rollback", e))
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so that lexical order
/// is chronological order.
fn encode_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn decode_ts(column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::QueryFailed(format!("{column} column: {e}")))
}

/// Parse a `Contact` from a SQLite row.
fn row_to_contact(row: &SqliteRow) -> Result<Contact, StoreError> {
    let col = |name: &str, e: sqlx::Error| StoreError::QueryFailed(format!("{name} column: {e}"));

    let precedence: String = row
        .try_get("link_precedence")
        .map_err(|e| col("link_precedence", e))?;
    let created_at: String = row.try_get("created_at").map_err(|e| col("created_at", e))?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| col("updated_at", e))?;
    let deleted_at: Option<String> = row.try_get("deleted_at").map_err(|e| col("deleted_at", e))?;

    Ok(Contact {
        id: row.try_get("id").map_err(|e| col("id", e))?,
        email: row.try_get("email").map_err(|e| col("email", e))?,
        phone_number: row
            .try_get("phone_number")
            .map_err(|e| col("phone_number", e))?,
        linked_id: row.try_get("linked_id").map_err(|e| col("linked_id", e))?,
        link_precedence: precedence.parse().map_err(StoreError::QueryFailed)?,
        created_at: decode_ts("created_at", &created_at)?,
        updated_at: decode_ts("updated_at", &updated_at)?,
        deleted_at: deleted_at
            .as_deref()
            .map(|raw| decode_ts("deleted_at", raw))
            .transpose()?,
    })
}

fn map_sqlx(context: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("{context}: timed out waiting for a connection"))
        }
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{context}: {e}"))
        }
        sqlx::Error::Database(db) if db.is_check_violation() || db.is_foreign_key_violation() => {
            StoreError::ConstraintViolation(format!("{context}: {e}"))
        }
        sqlx::Error::Database(db) if is_busy(db.code().as_deref()) => {
            StoreError::Conflict(format!("{context}: {e}"))
        }
        _ => StoreError::QueryFailed(format!("{context}: {e}")),
    }
}

/// SQLITE_BUSY and its extended codes (BUSY_RECOVERY, BUSY_SNAPSHOT,
/// BUSY_TIMEOUT), plus SQLITE_LOCKED.
fn is_busy(code: Option<&str>) -> bool {
    matches!(code, Some("5" | "261" | "517" | "773" | "6"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn email(e: &str) -> Option<String> {
        Some(e.to_string())
    }

    fn phone(p: &str) -> Option<String> {
        Some(p.to_string())
    }

    #[tokio::test]
    async fn create_and_find_cluster() {
        let store = test_store().await;
        let mut tx = store.begin(&[]).await.unwrap();
        let p = tx
            .create(NewContact::primary(email("a@x.com"), phone("111")))
            .await
            .unwrap();
        let s = tx
            .create(NewContact::secondary(email("a@x.com"), phone("222"), p.id))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(&[]).await.unwrap();
        let cluster = tx.find_cluster(p.id).await.unwrap();
        assert_eq!(cluster.len(), 2);
        assert_eq!(cluster[0].id, p.id);
        assert!(cluster[0].is_primary());
        assert_eq!(cluster[1].id, s.id);
        assert_eq!(cluster[1].linked_id, Some(p.id));
        assert_eq!(cluster[1].phone_number.as_deref(), Some("222"));
        assert_eq!(cluster[0].created_at, p.created_at);
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = test_store().await;
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn find_matches_either_field_and_orders_by_age() {
        let store = test_store().await;
        let mut tx = store.begin(&[]).await.unwrap();
        let a = tx
            .create(NewContact::primary(email("a@x.com"), phone("111")))
            .await
            .unwrap();
        let b = tx
            .create(NewContact::primary(email("b@y.com"), phone("222")))
            .await
            .unwrap();
        tx.create(NewContact::primary(email("c@z.com"), phone("333")))
            .await
            .unwrap();

        let found = tx
            .find_by_email_or_phone(Some("a@x.com"), Some("222"))
            .await
            .unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let found = tx.find_by_email_or_phone(None, Some("333")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(tx.find_by_email_or_phone(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_without_fragment_is_constraint_violation() {
        let store = test_store().await;
        let mut tx = store.begin(&[]).await.unwrap();
        let err = tx.create(NewContact::primary(None, None)).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn secondary_of_secondary_is_rejected() {
        let store = test_store().await;
        let mut tx = store.begin(&[]).await.unwrap();
        let p = tx
            .create(NewContact::primary(email("a@x.com"), None))
            .await
            .unwrap();
        let s = tx
            .create(NewContact::secondary(email("a@x.com"), phone("1"), p.id))
            .await
            .unwrap();
        let err = tx
            .create(NewContact::secondary(None, phone("2"), s.id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn repoint_and_demote() {
        let store = test_store().await;
        let mut tx = store.begin(&[]).await.unwrap();
        let old = tx
            .create(NewContact::primary(email("a@x.com"), phone("111")))
            .await
            .unwrap();
        let young = tx
            .create(NewContact::primary(email("b@y.com"), phone("222")))
            .await
            .unwrap();
        let child = tx
            .create(NewContact::secondary(email("c@z.com"), phone("222"), young.id))
            .await
            .unwrap();

        let err = tx.demote(young.id, old.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        assert_eq!(tx.repoint(young.id, old.id).await.unwrap(), 1);
        tx.demote(young.id, old.id).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(&[]).await.unwrap();
        let cluster = tx.find_cluster(old.id).await.unwrap();
        let ids: Vec<_> = cluster.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![old.id, young.id, child.id]);
        assert!(cluster[1..].iter().all(|c| c.linked_id == Some(old.id)));
        assert!(cluster[1..].iter().all(|c| !c.is_primary()));
        assert!(tx.find_cluster(young.id).await.unwrap().iter().all(|c| c.id == young.id));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = test_store().await;
        let mut tx = store.begin(&[]).await.unwrap();
        tx.create(NewContact::primary(email("gone@x.com"), None))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let mut tx = store.begin(&[]).await.unwrap();
        assert!(tx
            .find_by_email_or_phone(Some("gone@x.com"), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn soft_deleted_rows_are_filtered() {
        let store = test_store().await;
        let mut tx = store.begin(&[]).await.unwrap();
        let p = tx
            .create(NewContact::primary(email("a@x.com"), phone("111")))
            .await
            .unwrap();
        let s = tx
            .create(NewContact::secondary(email("a@x.com"), phone("222"), p.id))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        sqlx::query("UPDATE contacts SET deleted_at = ?1 WHERE id = ?2")
            .bind(encode_ts(now_micros()))
            .bind(s.id)
            .execute(&store.pool)
            .await
            .unwrap();

        let mut tx = store.begin(&[]).await.unwrap();
        assert!(tx.find_by_email_or_phone(None, Some("222")).await.unwrap().is_empty());
        assert_eq!(tx.find_cluster(p.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("contacts.db").display());

        let store = SqliteStore::new(&url).await.unwrap();
        let mut tx = store.begin(&[]).await.unwrap();
        let p = tx
            .create(NewContact::primary(email("keep@x.com"), None))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        store.close().await;

        let store = SqliteStore::new(&url).await.unwrap();
        let mut tx = store.begin(&[]).await.unwrap();
        let found = tx
            .find_by_email_or_phone(Some("keep@x.com"), None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, p.id);
    }

    #[tokio::test]
    async fn writer_gate_bounds_the_wait() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::from_pool(pool, Duration::from_millis(20));
        store.migrate().await.unwrap();

        let _held = store.begin(&[]).await.unwrap();
        let err = store.begin(&[]).await.err().unwrap();
        assert!(matches!(err, StoreError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn second_store_on_same_file_waits_for_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            backend: "sqlite".into(),
            url: format!("sqlite://{}", dir.path().join("shared.db").display()),
            lock_timeout_ms: 50,
            ..DatabaseConfig::default()
        };
        let first = SqliteStore::connect(&config).await.unwrap();
        first.migrate().await.unwrap();
        let second = SqliteStore::connect(&config).await.unwrap();

        let mut held = first.begin(&[]).await.unwrap();
        held.create(NewContact::primary(email("a@x.com"), None))
            .await
            .unwrap();

        let err = second.begin(&[]).await.err().unwrap();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        held.commit().await.unwrap();
        let mut tx = second.begin(&[]).await.unwrap();
        let found = tx
            .find_by_email_or_phone(Some("a@x.com"), None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        tx.commit().await.unwrap();

        first.close().await;
        second.close().await;
    }

    #[test]
    fn busy_codes_are_recognised() {
        assert!(is_busy(Some("5")));
        assert!(is_busy(Some("517")));
        assert!(!is_busy(Some("19")));
        assert!(!is_busy(None));
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = encode_ts("2024-01-01T09:00:00.5Z".parse().unwrap());
        let late = encode_ts("2024-01-01T10:00:00Z".parse().unwrap());
        assert!(early < late);
        assert_eq!(early.len(), late.len());
        assert_eq!(decode_ts("t", &late).unwrap().to_rfc3339(), "2024-01-01T10:00:00+00:00");
    }

    #[tokio::test]
    async fn backend_name() {
        assert_eq!(test_store().await.name(), "sqlite");
    }
}
