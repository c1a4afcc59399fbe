use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use rusqlite::{params, Connection};

use postpilot_core::{
    Failure, FailureKind, JobFilter, JobStore, Outcome, ProviderKey, PublishStatus,
    SqliteJobStore, StatusEncoding,
};

const NAVER: i64 = 19;
const TISTORY: i64 = 8;

struct Fixture {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite");
        Self { _dir: dir, path }
    }

    fn store(&self, encoding: StatusEncoding) -> SqliteJobStore {
        let store = SqliteJobStore::builder()
            .path(&self.path)
            .status_encoding(encoding)
            .provider("naver", NAVER)
            .provider("tistory", TISTORY)
            .build()
            .unwrap();
        store.initialize().unwrap();
        store
    }

    fn conn(&self) -> Connection {
        Connection::open(&self.path).unwrap()
    }
}

fn seed_account(conn: &Connection, provider_id: i64, login: &str, category: Option<&str>) -> i64 {
    conn.execute(
        "INSERT INTO platform_accounts (provider_id, blog_id, blog_pw, blog_url, category_no)
         VALUES (?1, ?2, 'secret', NULL, ?3)",
        params![provider_id, login, category],
    )
    .unwrap();
    conn.last_insert_rowid()
}

fn seed_text(conn: &Connection, provider_id: i64, title: &str, body: &str) -> i64 {
    conn.execute(
        "INSERT INTO content_texts (content_title) VALUES (?1)",
        [title],
    )
    .unwrap();
    let text_id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO content_text_by_provider (content_text_id, provider_id, content)
         VALUES (?1, ?2, ?3)",
        params![text_id, provider_id, body],
    )
    .unwrap();
    conn.last_insert_rowid()
}

fn seed_image(conn: &Connection, url: &str, order: i64) -> i64 {
    conn.execute(
        "INSERT INTO content_images (image_url, \"order\") VALUES (?1, ?2)",
        params![url, order],
    )
    .unwrap();
    conn.last_insert_rowid()
}

fn seed_job(
    conn: &Connection,
    account: i64,
    text: i64,
    image_ids: Option<&str>,
    status: i64,
    reserved_at: &str,
    group: Option<i64>,
) -> i64 {
    conn.execute(
        "INSERT INTO publish_contents
            (platform_account_id, content_text_by_provider_id, content_image_ids,
             publish_status_id, reserved_at, group_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![account, text, image_ids, status, reserved_at, group],
    )
    .unwrap();
    conn.last_insert_rowid()
}

fn seed_group(conn: &Connection) -> i64 {
    conn.execute("INSERT INTO publish_contents_groups (publish_status_id) VALUES (1)", [])
        .unwrap();
    conn.last_insert_rowid()
}

fn stamp(offset: Duration) -> String {
    (Utc::now() + offset).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn status_of(path: &Path, job_id: i64) -> (i64, Option<String>, Option<String>) {
    Connection::open(path)
        .unwrap()
        .query_row(
            "SELECT publish_status_id, fail_reason, published_at FROM publish_contents WHERE id = ?1",
            [job_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap()
}

#[tokio::test]
async fn fetch_due_joins_account_text_and_ordered_images() {
    let fixture = Fixture::new();
    let store = fixture.store(StatusEncoding::default());
    let conn = fixture.conn();

    let naver = seed_account(&conn, NAVER, "writer", Some("7"));
    let tistory = seed_account(&conn, TISTORY, "other", None);
    let text = seed_text(&conn, NAVER, "Spring menu", "line one\nline two");
    let second = seed_image(&conn, "https://cdn.example.com/second.png", 2);
    let first = seed_image(&conn, "https://cdn.example.com/first.png", 1);
    let ids = format!("[{second}, \"{first}\"]");

    let due = seed_job(&conn, naver, text, Some(&ids), 1, &stamp(Duration::minutes(-5)), None);
    seed_job(&conn, naver, text, None, 1, &stamp(Duration::hours(2)), None);
    seed_job(&conn, naver, text, None, 3, &stamp(Duration::minutes(-5)), None);
    seed_job(&conn, tistory, text, None, 1, &stamp(Duration::minutes(-5)), None);

    let jobs = store.fetch_due(&ProviderKey::new("naver"), Utc::now()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.id, due);
    assert_eq!(job.title, "Spring menu");
    assert_eq!(job.body, "line one\nline two");
    assert_eq!(job.account.login, "writer");
    assert_eq!(job.effective_category(), Some("7"));
    assert_eq!(
        job.image_urls,
        vec![
            "https://cdn.example.com/first.png".to_string(),
            "https://cdn.example.com/second.png".to_string(),
        ]
    );
    assert_eq!(job.status, PublishStatus::Pending);
}

#[tokio::test]
async fn malformed_image_ids_still_yield_the_job() {
    let fixture = Fixture::new();
    let store = fixture.store(StatusEncoding::default());
    let conn = fixture.conn();
    let account = seed_account(&conn, TISTORY, "writer", None);
    let text = seed_text(&conn, TISTORY, "t", "b");
    seed_job(&conn, account, text, Some("[oops"), 1, &stamp(Duration::minutes(-1)), None);

    let jobs = store.fetch_due(&ProviderKey::new("tistory"), Utc::now()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].image_urls.is_empty());
}

#[tokio::test]
async fn unknown_provider_is_an_error() {
    let fixture = Fixture::new();
    let store = fixture.store(StatusEncoding::default());
    assert!(store
        .fetch_due(&ProviderKey::new("medium"), Utc::now())
        .await
        .is_err());
}

#[tokio::test]
async fn success_completes_group_once_every_member_succeeded() {
    let fixture = Fixture::new();
    let store = fixture.store(StatusEncoding::default());
    let conn = fixture.conn();
    let account = seed_account(&conn, NAVER, "writer", None);
    let text = seed_text(&conn, NAVER, "t", "b");
    let group = seed_group(&conn);
    let reserved = stamp(Duration::minutes(-1));
    let first = seed_job(&conn, account, text, None, 1, &reserved, Some(group));
    let second = seed_job(&conn, account, text, None, 1, &reserved, Some(group));

    store.record_outcome(&Outcome::success(first)).await.unwrap();
    assert_eq!(store.group_status(group).unwrap(), Some(PublishStatus::Pending));

    store.record_outcome(&Outcome::success(second)).await.unwrap();
    assert_eq!(store.group_status(group).unwrap(), Some(PublishStatus::Success));

    // Recording again is harmless.
    store.record_outcome(&Outcome::success(second)).await.unwrap();
    assert_eq!(store.group_status(group).unwrap(), Some(PublishStatus::Success));

    let (code, reason, published_at) = status_of(&fixture.path, first);
    assert_eq!(code, 3);
    assert!(reason.is_none());
    assert!(published_at.is_some());
}

#[tokio::test]
async fn failure_records_reason_and_leaves_group_open() {
    let fixture = Fixture::new();
    let store = fixture.store(StatusEncoding::default());
    let conn = fixture.conn();
    let account = seed_account(&conn, NAVER, "writer", None);
    let text = seed_text(&conn, NAVER, "t", "b");
    let group = seed_group(&conn);
    let job = seed_job(&conn, account, text, None, 1, &stamp(Duration::minutes(-1)), Some(group));

    let outcome = Outcome::failure(
        job,
        Failure::new(FailureKind::LoginFailed, "no signed-in marker"),
    );
    store.record_outcome(&outcome).await.unwrap();

    let (code, reason, _) = status_of(&fixture.path, job);
    assert_eq!(code, 2);
    assert_eq!(reason.as_deref(), Some("LOGIN_FAILED: no signed-in marker"));
    assert_eq!(store.group_status(group).unwrap(), Some(PublishStatus::Pending));

    // Failed jobs are terminal and no longer due.
    let due = store.fetch_due(&ProviderKey::new("naver"), Utc::now()).await.unwrap();
    assert!(due.is_empty());
}

#[tokio::test]
async fn recording_an_unknown_job_fails() {
    let fixture = Fixture::new();
    let store = fixture.store(StatusEncoding::default());
    assert!(store.record_outcome(&Outcome::success(404)).await.is_err());
}

#[tokio::test]
async fn claims_are_exclusive_when_in_progress_is_encoded() {
    let fixture = Fixture::new();
    let encoding = StatusEncoding {
        in_progress: Some(4),
        ..StatusEncoding::default()
    };
    let store = fixture.store(encoding);
    let conn = fixture.conn();
    let account = seed_account(&conn, NAVER, "writer", None);
    let text = seed_text(&conn, NAVER, "t", "b");
    let job = seed_job(&conn, account, text, None, 1, &stamp(Duration::minutes(-1)), None);

    assert!(store.begin_attempt(job).await.unwrap());
    assert!(!store.begin_attempt(job).await.unwrap());
    assert_eq!(status_of(&fixture.path, job).0, 4);

    let listed = store
        .list(&JobFilter {
            provider: Some(ProviderKey::new("naver")),
            status: Some(PublishStatus::InProgress),
            limit: Some(10),
        })
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, Some(PublishStatus::InProgress));
}

#[tokio::test]
async fn claim_without_in_progress_code_always_succeeds() {
    let fixture = Fixture::new();
    let store = fixture.store(StatusEncoding::default());
    assert!(store.begin_attempt(1).await.unwrap());
    assert!(store.begin_attempt(1).await.unwrap());
}
