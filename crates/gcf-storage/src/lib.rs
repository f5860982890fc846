//! SQLite record store + HTTP fetch utilities for GCF.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use gcf_core::{
    Award, CanonicalRecord, Opportunity, Provider, RecordKind, RecordQuery, StoredAward,
    StoredOpportunity,
};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcf-storage";

const STORED_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("creating database directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },
    #[error("{found} record passed to a {expected} batch")]
    KindMismatch {
        expected: RecordKind,
        found: RecordKind,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchOutcome {
    pub cleared: u64,
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl RecordStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!(path = %path.display(), "record store opened");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection that never expires; each new connection would be a fresh database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn upsert_if_absent(&self, record: &CanonicalRecord) -> Result<bool, StoreError> {
        let _writer = self.write_lock.lock().await;
        let inserted = insert_record(&self.pool, record).await?;
        if !inserted {
            debug!(key = %record.natural_key(), "duplicate natural key; insert skipped");
        }
        Ok(inserted)
    }

    /// Insert a provider batch in one transaction, optionally clearing the
    /// kind's table first so readers never observe an empty window.
    pub async fn insert_batch(
        &self,
        kind: RecordKind,
        records: &[CanonicalRecord],
        clear_first: bool,
    ) -> Result<BatchOutcome, StoreError> {
        if let Some(bad) = records.iter().find(|r| r.kind() != kind) {
            return Err(StoreError::KindMismatch {
                expected: kind,
                found: bad.kind(),
            });
        }

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();

        if clear_first {
            outcome.cleared = sqlx::query(&format!("DELETE FROM {}", kind.table_name()))
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        for record in records {
            if insert_record(&mut *tx, record).await? {
                outcome.inserted += 1;
            } else {
                outcome.duplicates += 1;
                debug!(key = %record.natural_key(), "duplicate natural key; insert skipped");
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn clear(&self, kind: RecordKind) -> Result<u64, StoreError> {
        let _writer = self.write_lock.lock().await;
        let deleted = sqlx::query(&format!("DELETE FROM {}", kind.table_name()))
            .execute(&self.pool)
            .await?
            .rows_affected();
        warn!(table = kind.table_name(), deleted, "table cleared");
        Ok(deleted)
    }

    pub async fn count(&self, kind: RecordKind) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", kind.table_name()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn query_opportunities(
        &self,
        query: &RecordQuery,
    ) -> Result<Vec<StoredOpportunity>, StoreError> {
        let rows = select_rows(
            &self.pool,
            "SELECT id, source, solicitation_number, title, agency, date, naics_code, link, \
             CAST(created_at AS TEXT) AS created_at FROM opportunities",
            "title",
            query,
        )
        .await?;
        rows.iter().map(opportunity_from_row).collect()
    }

    pub async fn query_awards(&self, query: &RecordQuery) -> Result<Vec<StoredAward>, StoreError> {
        let rows = select_rows(
            &self.pool,
            "SELECT id, source, award_id, recipient_name, agency, date, naics_code, link, \
             CAST(created_at AS TEXT) AS created_at FROM awards",
            "recipient_name",
            query,
        )
        .await?;
        rows.iter().map(award_from_row).collect()
    }

    pub async fn ensure_seed_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, StoreError> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            return Ok(false);
        }
        sqlx::query("INSERT OR IGNORE INTO users (username, password) VALUES (?, ?)")
            .bind(username)
            .bind(password_digest(password))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(username, "seed user created");
        Ok(true)
    }

    pub async fn user_password_digest(&self, username: &str) -> Result<Option<String>, StoreError> {
        let digest = sqlx::query_scalar("SELECT password FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(digest)
    }
}

pub fn password_digest(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn format_stored_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(STORED_DATE_FORMAT).to_string())
        .unwrap_or_default()
}

fn parse_stored_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, STORED_DATE_FORMAT).ok()
}

async fn insert_record<'e, E>(executor: E, record: &CanonicalRecord) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = match record {
        CanonicalRecord::Opportunity(o) => {
            sqlx::query(
                r#"
                INSERT INTO opportunities
                    (source, solicitation_number, title, agency, date, naics_code, link)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source, solicitation_number) DO NOTHING
                "#,
            )
            .bind(o.provider.as_str())
            .bind(&o.solicitation_number)
            .bind(&o.title)
            .bind(&o.agency)
            .bind(format_stored_date(o.posted_date))
            .bind(&o.classification_code)
            .bind(&o.link)
            .execute(executor)
            .await?
        }
        CanonicalRecord::Award(a) => {
            sqlx::query(
                r#"
                INSERT INTO awards
                    (source, award_id, recipient_name, agency, date, naics_code, link)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(source, award_id) DO NOTHING
                "#,
            )
            .bind(a.provider.as_str())
            .bind(&a.award_id)
            .bind(&a.recipient_name)
            .bind(&a.agency)
            .bind(format_stored_date(a.action_date))
            .bind(&a.classification_code)
            .bind(&a.link)
            .execute(executor)
            .await?
        }
    };
    Ok(result.rows_affected() == 1)
}

async fn select_rows(
    pool: &SqlitePool,
    select: &str,
    keyword_column: &str,
    query: &RecordQuery,
) -> Result<Vec<SqliteRow>, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new(select);
    let mut joiner = " WHERE ";
    if let Some(keyword) = query.keyword() {
        builder
            .push(joiner)
            .push(format!("instr(lower({keyword_column}), lower("))
            .push_bind(keyword.to_string())
            .push(")) > 0");
        joiner = " AND ";
    }
    if let Some(code) = query.classification_code() {
        builder
            .push(joiner)
            .push("naics_code = ")
            .push_bind(code.to_string());
    }
    builder.push(" ORDER BY date DESC, id ASC");
    if let Some(limit) = query.limit {
        builder.push(" LIMIT ").push_bind(i64::from(limit));
    }
    let rows = builder.build().fetch_all(pool).await?;
    Ok(rows)
}

fn provider_from_row(row: &SqliteRow, table: &'static str) -> Result<Provider, StoreError> {
    let source: String = row.try_get("source")?;
    source.parse().map_err(|e: gcf_core::UnknownProvider| StoreError::CorruptRow {
        table,
        message: e.to_string(),
    })
}

fn opportunity_from_row(row: &SqliteRow) -> Result<StoredOpportunity, StoreError> {
    let date: String = row.try_get("date")?;
    Ok(StoredOpportunity {
        id: row.try_get("id")?,
        record: Opportunity {
            provider: provider_from_row(row, "opportunities")?,
            solicitation_number: row.try_get("solicitation_number")?,
            title: row.try_get("title")?,
            agency: row.try_get("agency")?,
            posted_date: parse_stored_date(&date),
            classification_code: row.try_get("naics_code")?,
            link: row.try_get("link")?,
        },
        created_at: row.try_get::<Option<String>, _>("created_at")?.unwrap_or_default(),
    })
}

fn award_from_row(row: &SqliteRow) -> Result<StoredAward, StoreError> {
    let date: String = row.try_get("date")?;
    Ok(StoredAward {
        id: row.try_get("id")?,
        record: Award {
            provider: provider_from_row(row, "awards")?,
            award_id: row.try_get("award_id")?,
            recipient_name: row.try_get("recipient_name")?,
            agency: row.try_get("agency")?,
            action_date: parse_stored_date(&date),
            classification_code: row.try_get("naics_code")?,
            link: row.try_get("link")?,
        },
        created_at: row.try_get::<Option<String>, _>("created_at")?.unwrap_or_default(),
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let mut request = self.client.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        let span = info_span!("http_fetch", %run_id, source_id, method = "GET", url);
        send_json(request).instrument(span).await
    }

    pub async fn post_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        let request = self.client.post(url).json(body);
        let span = info_span!("http_fetch", %run_id, source_id, method = "POST", url);
        send_json(request).instrument(span).await
    }
}

async fn send_json(request: RequestBuilder) -> Result<JsonValue, FetchError> {
    let resp = request.send().await?;
    let status: StatusCode = resp.status();
    let final_url = resp.url().to_string();

    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }

    let body = resp.bytes().await?;
    debug!(status = status.as_u16(), bytes = body.len(), "response received");
    serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
        url: final_url,
        source,
    })
}
