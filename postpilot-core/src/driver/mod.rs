mod flow;
mod profile;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::browser::{BrowserSession, Pacer, SessionCookie, SessionProvider};
use crate::config::TimeoutsSection;
use crate::formatter::ContentFormatter;
use crate::job::{Failure, FailureKind, Job, Outcome, ProviderKey};

pub use profile::{
    AmbiguousVerification, BodyFormat, CategoryPicker, ComposeFlow, Interstitial, LoginFlow,
    PlatformProfile, PrepareStep, PublishFlow, VerifyRules,
};

/// Progress of one publish attempt. A failure is reported together with the
/// last state reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Start,
    SessionAcquired,
    LoggedIn,
    OnComposeSurface,
    TitleSet,
    BodySet,
    CategorySet,
    PublishRequested,
    PublishConfirmed,
    Failed,
}

impl DriverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverState::Start => "start",
            DriverState::SessionAcquired => "session_acquired",
            DriverState::LoggedIn => "logged_in",
            DriverState::OnComposeSurface => "on_compose_surface",
            DriverState::TitleSet => "title_set",
            DriverState::BodySet => "body_set",
            DriverState::CategorySet => "category_set",
            DriverState::PublishRequested => "publish_requested",
            DriverState::PublishConfirmed => "publish_confirmed",
            DriverState::Failed => "failed",
        }
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Posts one job to one platform and reports how it went.
#[async_trait(?Send)]
pub trait Publisher {
    fn provider(&self) -> &ProviderKey;

    /// Never fails: every error is folded into the returned [`Outcome`].
    async fn publish(&self, job: &Job) -> Outcome;
}

/// Upper bounds for the waits inside an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTimeouts {
    pub element_wait: Duration,
    pub surface_wait: Duration,
    pub login_verify: Duration,
    pub poll_interval: Duration,
}

impl Default for DriverTimeouts {
    fn default() -> Self {
        Self {
            element_wait: Duration::from_secs(10),
            surface_wait: Duration::from_secs(5),
            login_verify: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl From<&TimeoutsSection> for DriverTimeouts {
    fn from(section: &TimeoutsSection) -> Self {
        Self {
            element_wait: Duration::from_millis(section.element_wait_ms),
            surface_wait: Duration::from_millis(section.surface_wait_ms),
            login_verify: Duration::from_millis(section.login_verify_ms),
            poll_interval: Duration::from_millis(section.poll_interval_ms.max(1)),
        }
    }
}

/// Profile-driven automation for one platform. One instance per provider;
/// each [`Publisher::publish`] call owns a fresh session from acquisition to
/// release.
pub struct PublishDriver {
    provider: ProviderKey,
    profile: Arc<PlatformProfile>,
    sessions: Arc<dyn SessionProvider>,
    formatter: ContentFormatter,
    timeouts: DriverTimeouts,
    pacer: Pacer,
    cookies: Option<Vec<SessionCookie>>,
    artifact_dir: Option<PathBuf>,
}

impl fmt::Debug for PublishDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishDriver")
            .field("provider", &self.provider)
            .field("profile", &self.profile.name)
            .field("timeouts", &self.timeouts)
            .field("cookies", &self.cookies.as_ref().map(Vec::len))
            .field("artifact_dir", &self.artifact_dir)
            .finish()
    }
}

impl PublishDriver {
    pub fn new(
        provider: ProviderKey,
        profile: PlatformProfile,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            provider,
            profile: Arc::new(profile),
            sessions,
            formatter: ContentFormatter::new(),
            timeouts: DriverTimeouts::default(),
            pacer: Pacer::instant(),
            cookies: None,
            artifact_dir: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: DriverTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_formatter(mut self, formatter: ContentFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_cookies(mut self, cookies: Option<Vec<SessionCookie>>) -> Self {
        self.cookies = cookies.filter(|list| !list.is_empty());
        self
    }

    /// Reads pre-authentication cookies from the profile's cookie variable.
    /// A malformed value is logged and ignored.
    pub fn with_cookies_from_env<F>(self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(name) = self.profile.login.cookie_env.clone() else {
            return self;
        };
        let cookies = lookup(&name).and_then(|raw| match SessionCookie::parse_list(&raw) {
            Ok(list) => Some(list),
            Err(err) => {
                warn!(
                    provider = %self.provider,
                    variable = %name,
                    error = %err,
                    "ignoring cookie variable"
                );
                None
            }
        });
        self.with_cookies(cookies)
    }

    pub fn with_artifact_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.artifact_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    /// Writes a PNG of the page at the failing state. Never affects the
    /// outcome.
    async fn capture_snapshot(
        &self,
        session: &mut dyn BrowserSession,
        job: &Job,
        state: DriverState,
    ) -> Option<PathBuf> {
        let dir = self.artifact_dir.as_ref()?;
        let bytes = match session.snapshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(provider = %self.provider, job_id = job.id, error = %err, "snapshot failed");
                return None;
            }
        };
        let path = dir.join(snapshot_file_name(&self.provider, job.id, state));
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            warn!(path = %dir.display(), error = %err, "cannot create artifact dir");
            return None;
        }
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                info!(
                    provider = %self.provider,
                    job_id = job.id,
                    state = %state,
                    path = %path.display(),
                    "diagnostic snapshot saved"
                );
                Some(path)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to write snapshot");
                None
            }
        }
    }
}

pub fn snapshot_file_name(provider: &ProviderKey, job_id: i64, state: DriverState) -> String {
    format!(
        "{provider}-{job_id}-{state}-{}.png",
        Utc::now().format("%Y%m%dT%H%M%SZ")
    )
}

#[async_trait(?Send)]
impl Publisher for PublishDriver {
    fn provider(&self) -> &ProviderKey {
        &self.provider
    }

    async fn publish(&self, job: &Job) -> Outcome {
        info!(
            provider = %self.provider,
            job_id = job.id,
            title = %job.title,
            "publish attempt started"
        );
        let mut session = match self.sessions.acquire().await {
            Ok(session) => session,
            Err(err) => {
                error!(
                    provider = %self.provider,
                    job_id = job.id,
                    error = %err,
                    "session init failed"
                );
                return Outcome::failure(job.id, Failure::new(FailureKind::SessionInitFailed, err));
            }
        };

        let (result, state) = {
            let mut attempt = flow::Attempt::new(self, session.as_mut(), job);
            let result = AssertUnwindSafe(attempt.run()).catch_unwind().await;
            let state = attempt.state();
            let result = result.unwrap_or_else(|panic| {
                Err(Failure::new(FailureKind::Unknown, panic_message(&*panic)))
            });
            (result, state)
        };

        let outcome = match result {
            Ok(()) => {
                info!(provider = %self.provider, job_id = job.id, "publish confirmed");
                Outcome::success(job.id)
            }
            Err(failure) => {
                error!(
                    provider = %self.provider,
                    job_id = job.id,
                    state = %state,
                    reason = %failure,
                    "publish attempt failed"
                );
                self.capture_snapshot(session.as_mut(), job, state).await;
                Outcome::failure(job.id, failure)
            }
        };

        if let Err(err) = session.close().await {
            warn!(provider = %self.provider, job_id = job.id, error = %err, "session close failed");
        }
        outcome
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_carry_provider_job_and_state() {
        let name =
            snapshot_file_name(&ProviderKey::new("tistory"), 42, DriverState::PublishRequested);
        assert!(name.starts_with("tistory-42-publish_requested-"));
        assert!(name.ends_with("Z.png"));
    }

    #[test]
    fn timeouts_convert_from_config() {
        let timeouts = DriverTimeouts::from(&TimeoutsSection {
            element_wait_ms: 1500,
            surface_wait_ms: 900,
            login_verify_ms: 300,
            poll_interval_ms: 0,
        });
        assert_eq!(timeouts.element_wait, Duration::from_millis(1500));
        assert_eq!(timeouts.poll_interval, Duration::from_millis(1));
    }
}
