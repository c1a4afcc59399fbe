use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;

use super::chromium::ChromiumSession;
use super::error::{BrowserError, BrowserResult};
use super::session::{BrowserSession, SessionProvider};

/// Executables probed when `chromium.executable_path` is unset.
const EXECUTABLE_CANDIDATES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium",
    "chromium-browser",
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How one session will be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub headless: bool,
    /// `None` leaves executable discovery to chromiumoxide.
    pub executable: Option<PathBuf>,
    pub chrome_major: u32,
    pub user_agent: String,
    /// Whether the plan is pinned to a probed browser version.
    pub pinned: bool,
}

/// Launches one Chromium process per acquired session.
#[derive(Debug, Clone)]
pub struct ChromiumSessionProvider {
    config: Arc<BrowserConfig>,
    headless: bool,
}

impl ChromiumSessionProvider {
    /// Builds a provider whose headless mode is resolved from the process
    /// environment.
    pub fn new(config: BrowserConfig) -> Self {
        let headless = resolve_headless(&config, |name| std::env::var(name).ok());
        Self::with_headless(config, headless)
    }

    pub fn with_headless(config: BrowserConfig, headless: bool) -> Self {
        Self {
            config: Arc::new(config),
            headless,
        }
    }

    pub fn headless(&self) -> bool {
        self.headless
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    /// Probes the installed browser and pins the user agent to its version.
    pub async fn plan(&self) -> LaunchPlan {
        if !self.config.chromium.probe_version {
            return self.unpinned_plan();
        }
        let candidates: Vec<String> = match &self.config.chromium.executable_path {
            Some(path) => vec![path.clone()],
            None => EXECUTABLE_CANDIDATES.iter().map(|c| c.to_string()).collect(),
        };
        for candidate in candidates {
            if let Some(major) = probe_chrome_major(Path::new(&candidate)).await {
                debug!(executable = %candidate, chrome_major = major, "probed browser version");
                return LaunchPlan {
                    headless: self.headless,
                    executable: Some(PathBuf::from(candidate)),
                    chrome_major: major,
                    user_agent: self.user_agent_for(major),
                    pinned: true,
                };
            }
        }
        warn!("browser version probe failed; launching unpinned");
        self.unpinned_plan()
    }

    pub fn unpinned_plan(&self) -> LaunchPlan {
        let major = self.config.user_agents.fallback_chrome_major;
        LaunchPlan {
            headless: self.headless,
            executable: self
                .config
                .chromium
                .executable_path
                .as_ref()
                .filter(|_| !self.config.chromium.probe_version)
                .map(PathBuf::from),
            chrome_major: major,
            user_agent: self.user_agent_for(major),
            pinned: false,
        }
    }

    fn user_agent_for(&self, major: u32) -> String {
        let template = if self.headless {
            &self.config.user_agents.headless
        } else {
            &self.config.user_agents.headed
        };
        render_user_agent(template, major)
    }

    pub async fn launch(&self, plan: &LaunchPlan) -> BrowserResult<ChromiumSession> {
        let chromium_config = self.build_chromium_config(plan)?;
        info!(
            headless = plan.headless,
            pinned = plan.pinned,
            chrome_major = plan.chrome_major,
            ua = %plan.user_agent,
            "launching chromium session"
        );

        let (mut browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let page = match self.open_page(&browser, plan).await {
            Ok(page) => page,
            Err(err) => {
                if let Err(close_err) = browser.close().await {
                    debug!(error = %close_err, "failed to close browser after setup error");
                }
                handler_task.abort();
                return Err(BrowserError::Launch(format!("page setup failed: {err}")));
            }
        };

        let label = format!(
            "chrome-{}{}",
            plan.chrome_major,
            if plan.pinned { "" } else { "-unpinned" }
        );
        Ok(ChromiumSession::attach(browser, page, handler_task, label).await)
    }

    async fn open_page(&self, browser: &Browser, plan: &LaunchPlan) -> BrowserResult<Page> {
        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        self.configure_page(&page, plan).await?;
        Ok(page)
    }

    fn build_chromium_config(&self, plan: &LaunchPlan) -> BrowserResult<ChromiumConfig> {
        let viewport = &self.config.viewport;
        let mut builder = ChromiumConfig::builder().viewport(ChromiumViewport {
            width: viewport.width,
            height: viewport.height,
            device_scale_factor: Some(viewport.device_scale_factor),
            emulating_mobile: false,
            is_landscape: viewport.width >= viewport.height,
            has_touch: false,
        });

        if let Some(executable) = &plan.executable {
            builder = builder.chrome_executable(executable);
        }
        if !plan.headless {
            builder = builder.with_head();
        }
        if !self.config.chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(seconds) = self.config.chromium.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(seconds));
        }

        let flags = &self.config.flags;
        let mut args = vec![
            format!("--user-agent={}", plan.user_agent),
            format!("--window-size={},{}", viewport.width, viewport.height),
        ];
        if self.config.chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if let Some(lang) = &flags.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(accept) = &flags.accept_language {
            args.push(format!("--accept-lang={accept}"));
        }
        for feature in &flags.disable_blink_features {
            args.push(format!("--disable-blink-features={feature}"));
        }
        if flags.no_first_run {
            args.push("--no-first-run".into());
        }
        args.extend(flags.extra_args.iter().cloned());

        builder = builder.args(args);
        builder.build().map_err(BrowserError::Configuration)
    }

    async fn configure_page(&self, page: &Page, plan: &LaunchPlan) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&plan.user_agent).await?;

        let mut params_builder =
            SetUserAgentOverrideParams::builder().user_agent(plan.user_agent.clone());
        if let Some(accept) = &self.config.flags.accept_language {
            params_builder = params_builder.accept_language(accept.clone());
        }
        let params = params_builder
            .build()
            .map_err(BrowserError::Configuration)?;
        page.set_user_agent(params).await?;

        if let Some(lang) = &self.config.flags.lang {
            let languages_script = format!(
                "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\nObject.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'en-US'] }});"
            );
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(languages_script)
                    .build()
                    .map_err(BrowserError::Configuration)?,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl SessionProvider for ChromiumSessionProvider {
    async fn acquire(&self) -> BrowserResult<Box<dyn BrowserSession>> {
        let plan = self.plan().await;
        match self.launch(&plan).await {
            Ok(session) => Ok(Box::new(session)),
            Err(err) if plan.pinned => {
                warn!(error = %err, "pinned launch failed; retrying unpinned");
                let fallback = LaunchPlan {
                    executable: None,
                    ..self.unpinned_plan()
                };
                let session = self.launch(&fallback).await?;
                Ok(Box::new(session))
            }
            Err(err) => Err(err),
        }
    }
}

/// Server markers force headless; otherwise the override variable decides,
/// falling back to `chromium.headless`.
pub fn resolve_headless<F>(config: &BrowserConfig, lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let env = &config.environment;
    let on_server = env
        .server_markers
        .iter()
        .any(|name| lookup(name).is_some_and(|value| !value.trim().is_empty()));
    if on_server {
        return true;
    }
    match lookup(&env.headless_override)
        .map(|value| value.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("true" | "1" | "yes") => true,
        Some("false" | "0" | "no") => false,
        _ => config.chromium.headless,
    }
}

pub fn render_user_agent(template: &str, chrome_major: u32) -> String {
    template.replace("{chrome_major}", &chrome_major.to_string())
}

/// Extracts the major version from `--version` output such as
/// `Google Chrome 124.0.6367.91`.
pub fn parse_chrome_major(output: &str) -> Option<u32> {
    let pattern = Regex::new(r"(\d+)\.\d+\.\d+").ok()?;
    pattern
        .captures(output)
        .and_then(|captures| captures.get(1))
        .and_then(|major| major.as_str().parse().ok())
}

async fn probe_chrome_major(executable: &Path) -> Option<u32> {
    let output = timeout(
        PROBE_TIMEOUT,
        Command::new(executable).arg("--version").output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_chrome_major(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::load_browser_config;

    fn fixture() -> BrowserConfig {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/browser.toml");
        load_browser_config(path).unwrap()
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn server_markers_force_headless() {
        let mut config = fixture();
        config.chromium.headless = false;
        assert!(!resolve_headless(&config, lookup(&[])));
        assert!(resolve_headless(&config, lookup(&[("HEADLESS", "true")])));
        assert!(resolve_headless(
            &config,
            lookup(&[("HEADLESS", "false"), ("CI", "1")])
        ));

        config.chromium.headless = true;
        assert!(!resolve_headless(&config, lookup(&[("HEADLESS", "false")])));
        assert!(resolve_headless(&config, lookup(&[("HEADLESS", "maybe")])));
    }

    #[test]
    fn parses_browser_version_output() {
        assert_eq!(parse_chrome_major("Google Chrome 124.0.6367.91 \n"), Some(124));
        assert_eq!(parse_chrome_major("Chromium 119.0.6045.105 built on Debian"), Some(119));
        assert_eq!(parse_chrome_major("command not found"), None);
    }

    #[test]
    fn user_agent_follows_mode_and_version() {
        let headless = ChromiumSessionProvider::with_headless(fixture(), true);
        let plan = headless.unpinned_plan();
        assert!(!plan.pinned);
        assert!(plan.user_agent.contains("Windows NT 10.0"));
        assert!(plan.user_agent.contains("Chrome/120.0.0.0"));

        let headed = ChromiumSessionProvider::with_headless(fixture(), false);
        assert!(headed.unpinned_plan().user_agent.contains("Macintosh"));
        assert_eq!(
            render_user_agent("Chrome/{chrome_major}.0.0.0", 126),
            "Chrome/126.0.0.0"
        );
    }
}
