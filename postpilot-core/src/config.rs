use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::driver::PlatformProfile;
use crate::error::{ConfigError, Result};
use crate::job::{ProviderKey, StatusEncoding};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PostpilotConfig {
    pub system: SystemSection,
    pub paths: PathsSection,
    #[serde(default)]
    pub store: StoreSection,
    pub dispatcher: DispatcherSection,
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    pub providers: Vec<ProviderEntry>,
}

impl PostpilotConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    /// Directory for the rotating log file, when file logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.paths.log_dir.as_ref().map(|dir| self.resolve_path(dir))
    }

    pub fn provider(&self, key: &ProviderKey) -> Option<&ProviderEntry> {
        self.providers.iter().find(|entry| &entry.key == key)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub artifact_dir: String,
    pub database: String,
    #[serde(default)]
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub status_codes: StatusEncoding,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSection {
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    pub enabled: bool,
    pub timezone: String,
    pub check_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,
    #[serde(default)]
    pub rotation: LogRotation,
    /// Log files kept on disk, the active one included.
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            file_prefix: default_log_prefix(),
            rotation: LogRotation::default(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_prefix() -> String {
    "automation".to_string()
}

fn default_max_log_files() -> usize {
    4
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub key: ProviderKey,
    /// Provider id used by the job store's account table.
    pub store_id: i64,
    /// Platform profile file, relative to the config directory.
    pub profile: String,
    pub trigger_minutes: Vec<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub user_agents: UserAgentSection,
    pub viewport: ViewportSection,
    pub environment: EnvironmentSection,
    pub timeouts: TimeoutsSection,
    pub pacing: PacingSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    #[serde(default)]
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
    #[serde(default = "default_enabled")]
    pub probe_version: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub disable_blink_features: Vec<String>,
    pub lang: Option<String>,
    pub accept_language: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentSection {
    /// Desktop agent presented by headless sessions; `{chrome_major}` is
    /// replaced with the probed browser version.
    pub headless: String,
    pub headed: String,
    pub fallback_chrome_major: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewportSection {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentSection {
    /// Env var whose `true`/`false` value overrides `chromium.headless`.
    pub headless_override: String,
    /// Env vars whose presence marks a display-less server.
    pub server_markers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    pub element_wait_ms: u64,
    pub surface_wait_ms: u64,
    pub login_verify_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacingSection {
    pub settle_ms: [u64; 2],
    pub compose_settle_ms: [u64; 2],
    pub field_ms: [u64; 2],
    pub post_publish_ms: [u64; 2],
}

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub postpilot: PostpilotConfig,
    pub browser: BrowserConfig,
    pub profiles: BTreeMap<ProviderKey, PlatformProfile>,
}

impl ConfigBundle {
    pub fn from_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let postpilot = load_postpilot_config(dir.join("postpilot.toml"))?;
        let browser = load_browser_config(dir.join("browser.toml"))?;
        postpilot
            .store
            .status_codes
            .validate()
            .map_err(|message| ConfigError::Invalid {
                field: "store.status_codes".into(),
                message,
            })?;
        let mut profiles = BTreeMap::new();
        for entry in &postpilot.providers {
            if let Some(minute) = entry.trigger_minutes.iter().find(|minute| **minute > 59) {
                return Err(ConfigError::Invalid {
                    field: format!("providers.{}.trigger_minutes", entry.key),
                    message: format!("minute {minute} is outside 0-59"),
                });
            }
            let profile = load_platform_profile(dir.join(&entry.profile))?;
            profiles.insert(entry.key.clone(), profile);
        }
        Ok(Self {
            postpilot,
            browser,
            profiles,
        })
    }

    pub fn profile(&self, key: &ProviderKey) -> Result<&PlatformProfile> {
        self.profiles
            .get(key)
            .ok_or_else(|| ConfigError::UnknownProvider(key.to_string()))
    }
}

pub fn load_postpilot_config<P: AsRef<Path>>(path: P) -> Result<PostpilotConfig> {
    load_toml(path)
}

pub fn load_browser_config<P: AsRef<Path>>(path: P) -> Result<BrowserConfig> {
    load_toml(path)
}

pub fn load_platform_profile<P: AsRef<Path>>(path: P) -> Result<PlatformProfile> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{AmbiguousVerification, BodyFormat};

    #[test]
    fn load_fixture_configs() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let bundle = ConfigBundle::from_directory(dir).expect("configs should parse");
        assert_eq!(bundle.postpilot.system.node_name, "postpilot-primary");
        assert_eq!(bundle.postpilot.scheduler.timezone, "Asia/Seoul");
        assert_eq!(bundle.postpilot.store.status_codes, StatusEncoding::default());
        assert_eq!(bundle.postpilot.log_dir(), Some(PathBuf::from("./logs")));
        assert_eq!(bundle.postpilot.logging.rotation, LogRotation::Daily);
        assert_eq!(bundle.postpilot.logging.max_files, 4);

        let naver = bundle.profile(&ProviderKey::new("naver")).unwrap();
        assert_eq!(naver.compose.frame.as_deref(), Some("mainFrame"));
        assert_eq!(naver.compose.body_format, BodyFormat::Plain);
        assert_eq!(naver.publish.open_attempts, 3);

        let tistory = bundle.profile(&ProviderKey::new("tistory")).unwrap();
        assert_eq!(tistory.compose.body_format, BodyFormat::Html);
        assert!(tistory.compose.category.is_some());
        assert_eq!(tistory.verify.success_url, vec!["/entry/".to_string()]);
        assert_eq!(
            tistory.verify.ambiguous,
            AmbiguousVerification::AssumeSuccess
        );

        let entry = bundle.postpilot.provider(&ProviderKey::new("naver")).unwrap();
        assert_eq!(entry.store_id, 19);
        assert_eq!(entry.trigger_minutes, vec![0, 30]);
        assert!(bundle.browser.user_agents.headless.contains("{chrome_major}"));
        assert!(bundle.profile(&ProviderKey::new("medium")).is_err());
    }

    #[test]
    fn file_logging_is_off_without_log_dir() {
        let config: PostpilotConfig = toml::from_str(
            r#"
            [system]
            node_name = "edge"
            environment = "staging"

            [paths]
            base_dir = "/srv/postpilot"
            artifact_dir = "artifacts"
            database = "data/store.sqlite"

            [dispatcher]
            cooldown_seconds = 1

            [scheduler]
            enabled = false
            timezone = "UTC"
            check_interval_seconds = 30

            [[providers]]
            key = "naver"
            store_id = 19
            profile = "naver.toml"
            trigger_minutes = [0]
            "#,
        )
        .unwrap();
        assert!(config.log_dir().is_none());
        assert_eq!(config.logging.file_prefix, "automation");
        assert_eq!(config.logging.rotation, LogRotation::Daily);
    }
}
