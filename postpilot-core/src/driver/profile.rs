use serde::{Deserialize, Serialize};

use crate::browser::{Key, Locator, StrategyList};
use crate::job::Job;

/// Everything that differs between two blogging platforms: URLs, ordered
/// strategy lists for each UI target, interstitials and verification rules.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformProfile {
    pub name: String,
    pub login: LoginFlow,
    pub compose: ComposeFlow,
    pub publish: PublishFlow,
    pub verify: VerifyRules,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginFlow {
    pub home_url: String,
    pub login_url: String,
    /// Env var holding a JSON cookie array injected before interactive login.
    #[serde(default)]
    pub cookie_env: Option<String>,
    /// Best-effort clicks on the login page before the form shows up, such
    /// as choosing a federated identity provider.
    #[serde(default)]
    pub entry: StrategyList,
    pub username: StrategyList,
    pub password: StrategyList,
    pub submit: StrategyList,
    /// Positive markers of a signed-in page (a logout affordance).
    pub logged_in: Vec<Locator>,
    #[serde(default)]
    pub logged_in_text: Vec<String>,
    #[serde(default)]
    pub challenge_text: Vec<String>,
    #[serde(default)]
    pub challenge_url: Vec<String>,
    #[serde(default)]
    pub verify_url: Option<String>,
}

impl LoginFlow {
    pub fn verify_url(&self) -> &str {
        self.verify_url.as_deref().unwrap_or(&self.home_url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    /// Body text as-is, for rich editors that take keystrokes.
    Plain,
    /// Markup from the content formatter, for HTML-mode editors.
    Html,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComposeFlow {
    /// Authoring URL template; `{blog}` and `{login}` are substituted.
    pub url: String,
    /// Blog base used when the account has no blog URL.
    pub default_blog: String,
    /// Appended to the authoring URL when the job has a category.
    #[serde(default)]
    pub category_query: Option<String>,
    /// Nested document the editor is rendered into, when present.
    #[serde(default)]
    pub frame: Option<String>,
    #[serde(default)]
    pub interstitials: Vec<Interstitial>,
    #[serde(default)]
    pub prepare: Vec<PrepareStep>,
    pub title: StrategyList,
    pub body: StrategyList,
    pub body_format: BodyFormat,
    #[serde(default)]
    pub category: Option<CategoryPicker>,
}

/// A transient surface that may or may not appear after the editor loads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Interstitial {
    Dialog {
        #[serde(default)]
        accept: bool,
    },
    Key {
        key: Key,
    },
    Click {
        locate: Vec<Locator>,
    },
}

/// Editor setup performed before input, e.g. switching to HTML mode.
#[derive(Debug, Clone, Deserialize)]
pub struct PrepareStep {
    pub name: String,
    pub strategies: StrategyList,
    #[serde(default)]
    pub accept_dialog: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryPicker {
    pub open: StrategyList,
    pub list: Vec<Locator>,
    /// Item locator; `{category}` is replaced with the category id.
    pub item: Locator,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishFlow {
    pub open: StrategyList,
    #[serde(default = "default_open_attempts")]
    pub open_attempts: usize,
    #[serde(default = "default_open_backoff_ms")]
    pub open_backoff_ms: u64,
    /// The confirmation layer; the confirm control is searched only inside it.
    pub surface: Vec<Locator>,
    #[serde(default)]
    pub surface_steps: StrategyList,
    pub confirm: StrategyList,
}

fn default_open_attempts() -> usize {
    3
}

fn default_open_backoff_ms() -> u64 {
    2000
}

/// What to conclude when neither a success nor a failure marker is seen
/// after confirming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguousVerification {
    AssumeSuccess,
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRules {
    #[serde(default)]
    pub success_url: Vec<String>,
    #[serde(default)]
    pub failure_url: Vec<String>,
    #[serde(default)]
    pub error_text: Vec<String>,
    pub ambiguous: AmbiguousVerification,
}

impl PlatformProfile {
    /// Blog base URL for the job's account, always with a scheme and without
    /// a trailing slash.
    pub fn blog_url(&self, job: &Job) -> String {
        let configured = job
            .account
            .blog_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.compose
                    .default_blog
                    .replace("{login}", &job.account.login)
            });
        let trimmed = configured.trim_end_matches('/');
        if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        }
    }

    pub fn compose_url(&self, job: &Job) -> String {
        let mut url = self
            .compose
            .url
            .replace("{blog}", &self.blog_url(job))
            .replace("{login}", &job.account.login);
        if let (Some(category), Some(query)) =
            (job.effective_category(), &self.compose.category_query)
        {
            url.push_str(&query.replace("{category}", category));
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::job::{Account, PublishStatus};

    const PROFILE: &str = r#"
name = "sample"

[login]
home_url = "https://www.example.com"
login_url = "https://www.example.com/login"
username = [{ locate = "css:#id", interact = "set_value" }]
password = [{ locate = "css:#pw", interact = "set_value" }]
submit = [{ locate = "css:#login" }]
logged_in = ["css:.btn_logout"]

[compose]
url = "{blog}?Redirect=Write"
default_blog = "https://blog.example.com/{login}"
category_query = "&categoryNo={category}"
frame = "mainFrame"
title = [{ locate = "css:.title", interact = "type" }]
body = [{ locate = "css:.body", interact = "type" }]
body_format = "plain"
interstitials = [
    { kind = "dialog" },
    { kind = "key", key = "escape" },
    { kind = "click", locate = ["css:.popup-cancel"] },
]

[publish]
open = [{ locate = "css:.publish" }]
surface = ["css:div[class*='layer_publish']"]
confirm = [{ locate = "css:.confirm" }]

[verify]
ambiguous = "assume_success"
"#;

    fn job(blog_url: Option<&str>, category: Option<&str>) -> Job {
        Job {
            id: 1,
            account: Account {
                id: 1,
                login: "writer".into(),
                secret: "pw".into(),
                blog_url: blog_url.map(str::to_string),
                default_category: None,
            },
            category: category.map(str::to_string),
            title: "title".into(),
            body: "body".into(),
            image_urls: vec![],
            video: None,
            status: PublishStatus::Pending,
            failure_reason: None,
            not_before: Utc::now(),
            group_id: None,
        }
    }

    #[test]
    fn parses_profile_with_defaults() {
        let profile: PlatformProfile = toml::from_str(PROFILE).unwrap();
        assert_eq!(profile.publish.open_attempts, 3);
        assert_eq!(profile.publish.open_backoff_ms, 2000);
        assert_eq!(profile.compose.interstitials.len(), 3);
        assert_eq!(
            profile.compose.interstitials[1],
            Interstitial::Key { key: Key::Escape }
        );
        assert_eq!(profile.verify.ambiguous, AmbiguousVerification::AssumeSuccess);
        assert_eq!(profile.login.verify_url(), "https://www.example.com");
    }

    #[test]
    fn compose_url_uses_default_blog_and_category() {
        let profile: PlatformProfile = toml::from_str(PROFILE).unwrap();
        assert_eq!(
            profile.compose_url(&job(None, Some("5"))),
            "https://blog.example.com/writer?Redirect=Write&categoryNo=5"
        );
        assert_eq!(
            profile.compose_url(&job(Some("myblog.example.org/"), None)),
            "https://myblog.example.org?Redirect=Write"
        );
    }
}
