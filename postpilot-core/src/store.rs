use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::job::{Account, Job, Outcome, ProviderKey, PublishStatus, StatusEncoding};
use crate::sqlite::open_connection;

const STORE_SCHEMA: &str = include_str!("../../sql/store.sql");
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open job store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on job store: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("job store path not configured")]
    MissingStore,
    #[error("status {0} has no code in the configured encoding")]
    InvalidStatus(PublishStatus),
    #[error("provider {0} has no store id")]
    UnknownProvider(String),
    #[error("publish record not found: {0}")]
    NotFound(i64),
    #[error("job store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Narrow contract between the orchestrator and the job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Pending jobs for the provider whose not-before time has passed,
    /// with account and ordered image URLs resolved.
    async fn fetch_due(&self, provider: &ProviderKey, now: DateTime<Utc>)
        -> StoreResult<Vec<Job>>;

    /// Claims a job before its attempt. Returns `false` when another worker
    /// already holds it.
    async fn begin_attempt(&self, job_id: i64) -> StoreResult<bool> {
        let _ = job_id;
        Ok(true)
    }

    /// Persists a terminal outcome. Idempotent; a success re-evaluates the
    /// job's group.
    async fn record_outcome(&self, outcome: &Outcome) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub provider: Option<ProviderKey>,
    pub status: Option<PublishStatus>,
    pub limit: Option<usize>,
}

/// Operator view of one `publish_contents` row.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub provider_id: i64,
    pub login: String,
    pub title: String,
    pub status_code: i64,
    pub status: Option<PublishStatus>,
    pub fail_reason: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SqliteJobStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    encoding: StatusEncoding,
    providers: BTreeMap<ProviderKey, i64>,
}

impl Default for SqliteJobStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            encoding: StatusEncoding::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl SqliteJobStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn status_encoding(mut self, encoding: StatusEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Maps a provider key to its id in `platform_accounts.provider_id`.
    pub fn provider(mut self, key: impl Into<ProviderKey>, store_id: i64) -> Self {
        self.providers.insert(key.into(), store_id);
        self
    }

    pub fn build(self) -> StoreResult<SqliteJobStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteJobStore {
            path,
            flags,
            encoding: self.encoding,
            providers: Arc::new(self.providers),
        })
    }
}

/// [`JobStore`] over the shared relational schema in `sql/store.sql`.
/// Every call opens its own connection and transaction.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    path: PathBuf,
    flags: OpenFlags,
    encoding: StatusEncoding,
    providers: Arc<BTreeMap<ProviderKey, i64>>,
}

impl SqliteJobStore {
    pub fn builder() -> SqliteJobStoreBuilder {
        SqliteJobStoreBuilder::new()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encoding(&self) -> &StatusEncoding {
        &self.encoding
    }

    fn open(&self) -> StoreResult<Connection> {
        open_connection(&self.path, self.flags).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })
    }

    fn store_id(&self, provider: &ProviderKey) -> StoreResult<i64> {
        self.providers
            .get(provider)
            .copied()
            .ok_or_else(|| StoreError::UnknownProvider(provider.to_string()))
    }

    fn code(&self, status: PublishStatus) -> StoreResult<i64> {
        self.encoding
            .encode(status)
            .ok_or(StoreError::InvalidStatus(status))
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(())
    }

    pub fn due_jobs(&self, provider: &ProviderKey, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let store_id = self.store_id(provider)?;
        let pending = self.code(PublishStatus::Pending)?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT
                pc.id, pc.content_image_ids, pc.content_video_id, pc.reserved_at, pc.group_id,
                pa.id AS account_id, pa.blog_id, pa.blog_pw, pa.blog_url, pa.category_no,
                ctp.content, ct.content_title
            FROM publish_contents pc
            JOIN platform_accounts pa ON pc.platform_account_id = pa.id
            JOIN content_text_by_provider ctp ON pc.content_text_by_provider_id = ctp.id
            JOIN content_texts ct ON ctp.content_text_id = ct.id
            WHERE pa.provider_id = ?1
              AND pc.publish_status_id = ?2
              AND datetime(pc.reserved_at) <= datetime(?3)
            ORDER BY datetime(pc.reserved_at) ASC, pc.id ASC",
        )?;
        let rows = stmt
            .query_map(params![store_id, pending, format_time(now)], |row| {
                DueRow::from_row(row)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let image_urls = match row.image_ids.as_deref().map(parse_image_ids) {
                None => Vec::new(),
                Some(Ok(ids)) => resolve_images(&conn, &ids)?,
                Some(Err(message)) => {
                    warn!(
                        job_id = row.id,
                        error = %message,
                        "malformed image id list; publishing without images"
                    );
                    Vec::new()
                }
            };
            let not_before = row
                .reserved_at
                .as_deref()
                .and_then(parse_store_time)
                .unwrap_or(now);
            jobs.push(Job {
                id: row.id,
                account: Account {
                    id: row.account_id,
                    login: row.login,
                    secret: row.secret,
                    blog_url: row.blog_url,
                    default_category: row.category,
                },
                category: None,
                title: row.title,
                body: row.body,
                image_urls,
                video: row.video,
                status: PublishStatus::Pending,
                failure_reason: None,
                not_before,
                group_id: row.group_id,
            });
        }
        debug!(provider = %provider, count = jobs.len(), "fetched due jobs");
        Ok(jobs)
    }

    pub fn claim(&self, job_id: i64) -> StoreResult<bool> {
        let Some(in_progress) = self.encoding.in_progress else {
            return Ok(true);
        };
        let pending = self.code(PublishStatus::Pending)?;
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE publish_contents
             SET publish_status_id = ?1, updated_at = ?2
             WHERE id = ?3 AND publish_status_id = ?4",
            params![in_progress, format_time(Utc::now()), job_id, pending],
        )?;
        Ok(changed == 1)
    }

    pub fn record(&self, outcome: &Outcome) -> StoreResult<()> {
        let status = outcome.status();
        let code = self.code(status)?;
        let success = self.code(PublishStatus::Success)?;
        let now = format_time(Utc::now());

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE publish_contents
             SET publish_status_id = ?1, fail_reason = ?2, published_at = ?3, updated_at = ?3
             WHERE id = ?4",
            params![code, outcome.reason(), now, outcome.job_id()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(outcome.job_id()));
        }

        if status == PublishStatus::Success {
            let group_id: Option<i64> = tx
                .query_row(
                    "SELECT group_id FROM publish_contents WHERE id = ?1",
                    [outcome.job_id()],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if let Some(group_id) = group_id {
                let unfinished: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM publish_contents
                     WHERE group_id = ?1 AND publish_status_id != ?2",
                    params![group_id, success],
                    |row| row.get(0),
                )?;
                if unfinished == 0 {
                    tx.execute(
                        "UPDATE publish_contents_groups SET publish_status_id = ?1 WHERE id = ?2",
                        params![success, group_id],
                    )?;
                    info!(group_id, "every job in group published; group marked complete");
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn group_status(&self, group_id: i64) -> StoreResult<Option<PublishStatus>> {
        let conn = self.open()?;
        let code: Option<i64> = conn
            .query_row(
                "SELECT publish_status_id FROM publish_contents_groups WHERE id = ?1",
                [group_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(code.and_then(|code| self.encoding.decode(code)))
    }

    pub fn list(&self, filter: &JobFilter) -> StoreResult<Vec<JobRecord>> {
        let conn = self.open()?;
        let mut query = String::from(
            "SELECT pc.id, pa.provider_id, pa.blog_id, ct.content_title, pc.publish_status_id,
                    pc.fail_reason, pc.reserved_at, pc.published_at, pc.group_id
             FROM publish_contents pc
             JOIN platform_accounts pa ON pc.platform_account_id = pa.id
             JOIN content_text_by_provider ctp ON pc.content_text_by_provider_id = ctp.id
             JOIN content_texts ct ON ctp.content_text_id = ct.id
             WHERE 1 = 1",
        );
        let mut params: Vec<Value> = Vec::new();
        if let Some(provider) = &filter.provider {
            query.push_str(" AND pa.provider_id = ?");
            params.push(Value::Integer(self.store_id(provider)?));
        }
        if let Some(status) = filter.status {
            query.push_str(" AND pc.publish_status_id = ?");
            params.push(Value::Integer(self.code(status)?));
        }
        query.push_str(" ORDER BY datetime(pc.reserved_at) DESC, pc.id DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let status_code: i64 = row.get(4)?;
            records.push(JobRecord {
                id: row.get(0)?,
                provider_id: row.get(1)?,
                login: row.get(2)?,
                title: row.get(3)?,
                status_code,
                status: self.encoding.decode(status_code),
                fail_reason: row.get(5)?,
                reserved_at: row
                    .get::<_, Option<String>>(6)?
                    .as_deref()
                    .and_then(parse_store_time),
                published_at: row
                    .get::<_, Option<String>>(7)?
                    .as_deref()
                    .and_then(parse_store_time),
                group_id: row.get(8)?,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn fetch_due(
        &self,
        provider: &ProviderKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        let store = self.clone();
        let provider = provider.clone();
        tokio::task::spawn_blocking(move || store.due_jobs(&provider, now))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
    }

    async fn begin_attempt(&self, job_id: i64) -> StoreResult<bool> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.claim(job_id))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
    }

    async fn record_outcome(&self, outcome: &Outcome) -> StoreResult<()> {
        let store = self.clone();
        let outcome = outcome.clone();
        tokio::task::spawn_blocking(move || store.record(&outcome))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

struct DueRow {
    id: i64,
    image_ids: Option<String>,
    video: Option<i64>,
    reserved_at: Option<String>,
    group_id: Option<i64>,
    account_id: i64,
    login: String,
    secret: String,
    blog_url: Option<String>,
    category: Option<String>,
    body: String,
    title: String,
}

impl DueRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            image_ids: value_to_text(row.get("content_image_ids")?),
            video: row.get("content_video_id")?,
            reserved_at: value_to_text(row.get("reserved_at")?),
            group_id: row.get("group_id")?,
            account_id: row.get("account_id")?,
            login: row.get("blog_id")?,
            secret: row.get("blog_pw")?,
            blog_url: row.get("blog_url")?,
            category: value_to_text(row.get("category_no")?),
            body: row.get::<_, Option<String>>("content")?.unwrap_or_default(),
            title: row
                .get::<_, Option<String>>("content_title")?
                .unwrap_or_default(),
        })
    }
}

fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(number) => Some(number.to_string()),
        Value::Real(number) => Some(number.to_string()),
        Value::Text(text) => Some(text),
        Value::Blob(bytes) => String::from_utf8(bytes).ok(),
    }
}

/// Parses `content_image_ids`, a JSON array of ids written either as
/// numbers or numeric strings.
pub fn parse_image_ids(raw: &str) -> Result<Vec<i64>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let values: Vec<serde_json::Value> =
        serde_json::from_str(trimmed).map_err(|err| err.to_string())?;
    values
        .into_iter()
        .map(|value| match &value {
            serde_json::Value::Number(number) => number
                .as_i64()
                .ok_or_else(|| format!("image id {number} is not an integer")),
            serde_json::Value::String(text) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("image id {text:?} is not numeric")),
            other => Err(format!("unexpected image id {other}")),
        })
        .collect()
}

fn resolve_images(conn: &Connection, ids: &[i64]) -> StoreResult<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let query = format!(
        "SELECT image_url FROM content_images WHERE id IN ({placeholders}) ORDER BY \"order\" ASC, id ASC"
    );
    let mut stmt = conn.prepare(&query)?;
    let urls = stmt
        .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
            row.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(urls)
}

fn format_time(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Accepts RFC 3339 and SQLite's naive `YYYY-MM-DD HH:MM:SS` (taken as UTC).
pub fn parse_store_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ids_accept_numbers_and_numeric_strings() {
        assert_eq!(parse_image_ids("[3, \"1\", 2]").unwrap(), vec![3, 1, 2]);
        assert_eq!(parse_image_ids("").unwrap(), Vec::<i64>::new());
        assert_eq!(parse_image_ids("null").unwrap(), Vec::<i64>::new());
        assert!(parse_image_ids("[\"a\"]").is_err());
        assert!(parse_image_ids("{oops").is_err());
    }

    #[test]
    fn store_times_parse_in_both_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        assert_eq!(parse_store_time("2024-05-01 03:00:00"), Some(expected));
        assert_eq!(parse_store_time("2024-05-01T12:00:00+09:00"), Some(expected));
        assert_eq!(parse_store_time("yesterday"), None);
    }

    #[test]
    fn builder_requires_path() {
        assert!(matches!(
            SqliteJobStore::builder().build(),
            Err(StoreError::MissingStore)
        ));
    }
}
