use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable key of a publishing provider (`naver`, `tistory`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderKey(String);

impl ProviderKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Pending => "pending",
            PublishStatus::InProgress => "in_progress",
            PublishStatus::Success => "success",
            PublishStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PublishStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown publish status: {other}")),
        }
    }
}

/// Integer codes the job store uses for [`PublishStatus`].
///
/// The store owns this encoding; it is configuration so a schema revision
/// only touches `postpilot.toml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEncoding {
    pub pending: i64,
    pub failed: i64,
    pub success: i64,
    #[serde(default)]
    pub in_progress: Option<i64>,
}

impl Default for StatusEncoding {
    fn default() -> Self {
        Self {
            pending: 1,
            failed: 2,
            success: 3,
            in_progress: None,
        }
    }
}

impl StatusEncoding {
    pub fn encode(&self, status: PublishStatus) -> Option<i64> {
        match status {
            PublishStatus::Pending => Some(self.pending),
            PublishStatus::InProgress => self.in_progress,
            PublishStatus::Success => Some(self.success),
            PublishStatus::Failed => Some(self.failed),
        }
    }

    pub fn decode(&self, code: i64) -> Option<PublishStatus> {
        if code == self.pending {
            Some(PublishStatus::Pending)
        } else if code == self.success {
            Some(PublishStatus::Success)
        } else if code == self.failed {
            Some(PublishStatus::Failed)
        } else if self.in_progress == Some(code) {
            Some(PublishStatus::InProgress)
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut codes = vec![self.pending, self.failed, self.success];
        codes.extend(self.in_progress);
        let total = codes.len();
        codes.sort_unstable();
        codes.dedup();
        if codes.len() != total {
            return Err("status codes must be distinct".into());
        }
        Ok(())
    }
}

/// Platform identity, read-only for the orchestrator.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub login: String,
    pub secret: String,
    pub blog_url: Option<String>,
    pub default_category: Option<String>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("login", &self.login)
            .field("secret", &"<redacted>")
            .field("blog_url", &self.blog_url)
            .field("default_category", &self.default_category)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub account: Account,
    pub category: Option<String>,
    pub title: String,
    pub body: String,
    pub image_urls: Vec<String>,
    pub video: Option<i64>,
    pub status: PublishStatus,
    pub failure_reason: Option<String>,
    pub not_before: DateTime<Utc>,
    pub group_id: Option<i64>,
}

impl Job {
    /// Category to publish under: the job's own, else the account default.
    /// Empty values and the store's `0` placeholder mean "no category".
    pub fn effective_category(&self) -> Option<&str> {
        self.category
            .as_deref()
            .or(self.account.default_category.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty() && *value != "0")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    SessionInitFailed,
    LoginFailed,
    ChallengeDetected,
    ComposeFailed,
    PublishFailed,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SessionInitFailed => "SESSION_INIT_FAILED",
            FailureKind::LoginFailed => "LOGIN_FAILED",
            FailureKind::ChallengeDetected => "CHALLENGE_DETECTED",
            FailureKind::ComposeFailed => "COMPOSE_FAILED",
            FailureKind::PublishFailed => "PUBLISH_FAILED",
            FailureKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub detail: String,
}

impl Failure {
    pub fn new(kind: FailureKind, detail: impl fmt::Display) -> Self {
        Self {
            kind,
            detail: detail.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.detail)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishResult {
    Success,
    Failure,
}

/// Terminal result of one publish attempt. Built only through
/// [`Outcome::success`] and [`Outcome::failure`] so a reason exists exactly
/// when the attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    job_id: i64,
    failure: Option<Failure>,
}

impl Outcome {
    pub fn success(job_id: i64) -> Self {
        Self {
            job_id,
            failure: None,
        }
    }

    pub fn failure(job_id: i64, failure: Failure) -> Self {
        Self {
            job_id,
            failure: Some(failure),
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn result(&self) -> PublishResult {
        if self.failure.is_some() {
            PublishResult::Failure
        } else {
            PublishResult::Success
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|failure| failure.kind)
    }

    /// Free-text reason persisted next to the job status.
    pub fn reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    pub fn status(&self) -> PublishStatus {
        if self.is_success() {
            PublishStatus::Success
        } else {
            PublishStatus::Failed
        }
    }
}
