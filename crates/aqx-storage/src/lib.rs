//! SQLite post store, KPI read queries, and the rate-limited HTTP fetcher.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use aqx_core::{StoredPost, Tag, TaggedPost};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aqx-storage";

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        keyword TEXT NOT NULL,
        title TEXT NOT NULL,
        url TEXT NOT NULL,
        body TEXT,
        tag TEXT NOT NULL CHECK (tag IN ('pain', 'active_search', 'objection', 'noise')),
        published_at TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_posts_tag ON posts(tag)",
    "CREATE INDEX IF NOT EXISTS idx_posts_keyword ON posts(keyword)",
    "CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts(created_at)",
];

const POST_COLUMNS: &str = "id, keyword, title, url, body, tag, published_at, created_at";

// Primary SQLite result codes that indicate a transient fault.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;
const SQLITE_FULL: i32 = 13;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("writing post {id} failed: {source}")]
    Write {
        id: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("corrupt row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

impl StorageError {
    /// Only an unopenable database aborts a run; everything else is per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StorageError::Write { source, .. } | StorageError::Query(source) => {
                classify_sqlx_error(source)
            }
            StorageError::Unavailable(_) | StorageError::CorruptRow { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Write seam between the tagging pipeline and persistence.
#[async_trait]
pub trait PostSink: Send + Sync {
    async fn insert_if_absent(&self, post: &TaggedPost) -> Result<InsertOutcome, StorageError>;
}

#[derive(Debug, Clone, Default)]
pub struct PostQuery {
    pub tag: Option<Tag>,
    pub keyword: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyKpi {
    pub day: NaiveDate,
    pub pain: i64,
    pub active_search: i64,
    pub objection: i64,
    pub noise: i64,
    pub total: i64,
}

impl DailyKpi {
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            pain: 0,
            active_search: 0,
            objection: 0,
            noise: 0,
            total: 0,
        }
    }

    fn add(&mut self, tag: Tag, count: i64) {
        match tag {
            Tag::Pain => self.pain += count,
            Tag::ActiveSearch => self.active_search += count,
            Tag::Objection => self.objection += count,
            Tag::Noise => self.noise += count,
        }
        self.total += count;
    }

    pub fn intent(&self) -> i64 {
        self.pain + self.active_search + self.objection
    }

    /// Share of non-noise posts, in percent.
    pub fn intent_pct(&self) -> f64 {
        self.intent() as f64 / self.total.max(1) as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordTagCount {
    pub keyword: String,
    pub tag: Tag,
    pub count: i64,
}

#[derive(Debug, Clone)]
pub struct PostStore {
    pool: SqlitePool,
    retry: BackoffPolicy,
}

impl PostStore {
    /// Open (creating if missing) a file-backed store in WAL mode and apply the schema.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Unavailable)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Unavailable)?;
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory store; the database lives as long as the pool.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(StorageError::Unavailable)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StorageError::Unavailable)?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let store = Self {
            pool,
            retry: BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(500),
            },
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StorageError::Unavailable)?;
        }
        Ok(())
    }

    /// Insert the post unless its id already exists.
    /// Transient faults are retried per the store's policy.
    pub async fn insert_if_absent(&self, post: &TaggedPost) -> Result<InsertOutcome, StorageError> {
        let mut attempt = 0usize;
        loop {
            match self.try_insert(post).await {
                Ok(outcome) => return Ok(outcome),
                Err(err)
                    if attempt < self.retry.max_retries
                        && classify_sqlx_error(&err) == RetryDisposition::Retryable =>
                {
                    warn!(post_id = %post.id, attempt, error = %err, "retrying post insert");
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(StorageError::Write {
                        id: post.id.clone(),
                        source,
                    })
                }
            }
        }
    }

    async fn try_insert(&self, post: &TaggedPost) -> Result<InsertOutcome, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO posts (id, keyword, title, url, body, tag, published_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&post.id)
        .bind(&post.keyword)
        .bind(&post.title)
        .bind(&post.url)
        .bind(post.body.as_deref())
        .bind(post.tag.as_str())
        .bind(post.published_at.map(|ts| ts.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredPost>, StorageError> {
        let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_post).transpose()
    }

    /// Newest first, optionally filtered by tag and keyword.
    pub async fn list(&self, query: &PostQuery) -> Result<Vec<StoredPost>, StorageError> {
        let sql = format!(
            r#"
            SELECT {POST_COLUMNS}
              FROM posts
             WHERE (?1 IS NULL OR tag = ?1)
               AND (?2 IS NULL OR keyword = ?2)
             ORDER BY created_at DESC, id
             LIMIT ?3 OFFSET ?4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.tag.map(Tag::as_str))
            .bind(query.keyword.as_deref())
            .bind(query.limit.unwrap_or(-1))
            .bind(query.offset.unwrap_or(0).max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_post).collect()
    }

    pub async fn count(&self, query: &PostQuery) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM posts
             WHERE (?1 IS NULL OR tag = ?1)
               AND (?2 IS NULL OR keyword = ?2)
            "#,
        )
        .bind(query.tag.map(Tag::as_str))
        .bind(query.keyword.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn tag_counts(&self) -> Result<BTreeMap<Tag, i64>, StorageError> {
        let rows = sqlx::query("SELECT tag, COUNT(DISTINCT id) AS n FROM posts GROUP BY tag")
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(parse_tag_column(&row)?, row.try_get::<i64, _>("n")?);
        }
        Ok(out)
    }

    pub async fn keywords(&self) -> Result<Vec<String>, StorageError> {
        let keywords = sqlx::query_scalar("SELECT DISTINCT keyword FROM posts ORDER BY keyword")
            .fetch_all(&self.pool)
            .await?;
        Ok(keywords)
    }

    /// Distinct posts first stored on `day`, grouped by tag.
    pub async fn daily_kpi(&self, day: NaiveDate) -> Result<DailyKpi, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT tag, COUNT(DISTINCT id) AS n
              FROM posts
             WHERE date(created_at) = ?1
             GROUP BY tag
            "#,
        )
        .bind(day_key(day))
        .fetch_all(&self.pool)
        .await?;

        let mut kpi = DailyKpi::empty(day);
        for row in rows {
            kpi.add(parse_tag_column(&row)?, row.try_get("n")?);
        }
        Ok(kpi)
    }

    /// One entry per day in `[from, to]` that has at least one post.
    pub async fn kpi_series(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyKpi>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT date(created_at) AS day, tag, COUNT(DISTINCT id) AS n
              FROM posts
             WHERE date(created_at) BETWEEN ?1 AND ?2
             GROUP BY day, tag
             ORDER BY day
            "#,
        )
        .bind(day_key(from))
        .bind(day_key(to))
        .fetch_all(&self.pool)
        .await?;

        let mut by_day: BTreeMap<NaiveDate, DailyKpi> = BTreeMap::new();
        for row in rows {
            let raw_day: String = row.try_get("day")?;
            let day = NaiveDate::parse_from_str(&raw_day, "%Y-%m-%d").map_err(|e| {
                StorageError::CorruptRow {
                    id: raw_day.clone(),
                    reason: format!("invalid created_at day: {e}"),
                }
            })?;
            by_day
                .entry(day)
                .or_insert_with(|| DailyKpi::empty(day))
                .add(parse_tag_column(&row)?, row.try_get("n")?);
        }
        Ok(by_day.into_values().collect())
    }

    pub async fn top_keywords(
        &self,
        day: NaiveDate,
        limit: i64,
    ) -> Result<Vec<KeywordTagCount>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT keyword, tag, COUNT(DISTINCT id) AS n
              FROM posts
             WHERE date(created_at) = ?1
               AND tag != 'noise'
             GROUP BY keyword, tag
             ORDER BY n DESC, keyword, tag
             LIMIT ?2
            "#,
        )
        .bind(day_key(day))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<KeywordTagCount, StorageError> {
                Ok(KeywordTagCount {
                    keyword: row.try_get("keyword")?,
                    tag: parse_tag_column(row)?,
                    count: row.try_get("n")?,
                })
            })
            .collect()
    }

    /// Non-noise posts first stored on `day`, newest first.
    pub async fn intent_posts_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<Vec<StoredPost>, StorageError> {
        let sql = format!(
            r#"
            SELECT {POST_COLUMNS}
              FROM posts
             WHERE date(created_at) = ?1
               AND tag != 'noise'
             ORDER BY created_at DESC, id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(day_key(day))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_post).collect()
    }
}

#[async_trait]
impl PostSink for PostStore {
    async fn insert_if_absent(&self, post: &TaggedPost) -> Result<InsertOutcome, StorageError> {
        PostStore::insert_if_absent(self, post).await
    }
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn parse_tag_column(row: &SqliteRow) -> Result<Tag, StorageError> {
    let raw: String = row.try_get("tag")?;
    raw.parse::<Tag>().map_err(|e| StorageError::CorruptRow {
        id: raw.clone(),
        reason: e.to_string(),
    })
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptRow {
            id: id.to_string(),
            reason: format!("invalid timestamp {raw:?}: {e}"),
        })
}

fn row_to_post(row: &SqliteRow) -> Result<StoredPost, StorageError> {
    let id: String = row.try_get("id")?;
    let published_at = row
        .try_get::<Option<String>, _>("published_at")?
        .map(|raw| parse_timestamp(&id, &raw))
        .transpose()?;
    let created_at = parse_timestamp(&id, &row.try_get::<String, _>("created_at")?)?;

    Ok(StoredPost {
        post: TaggedPost {
            tag: parse_tag_column(row)?,
            keyword: row.try_get("keyword")?,
            title: row.try_get("title")?,
            url: row.try_get("url")?,
            body: row.try_get("body")?,
            published_at,
            id,
        },
        created_at,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        sqlx::Error::Database(db_err) => {
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            match primary {
                Some(SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_FULL) => {
                    RetryDisposition::Retryable
                }
                _ => RetryDisposition::NonRetryable,
            }
        }
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// Shared HTTP client with global + per-host concurrency caps, optional token bucket, and retry.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GET `url` as text, retrying transient failures with exponential backoff.
    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        let host = host_key(url)?;
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %run_id, host = %host, url);
        self.fetch_with_retry(url).instrument(span).await
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn host_key(raw: &str) -> Result<String, FetchError> {
    let parsed = url::Url::parse(raw).map_err(|e| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        })
}
