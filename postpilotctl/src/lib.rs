use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use postpilot_core::browser::{ChromiumSessionProvider, Pacer, SessionProvider};
use postpilot_core::{
    load_postpilot_config, BodyFormat, ConfigBundle, ContentFormatter, CycleReport,
    CycleScheduler, Dispatcher, DriverTimeouts, JobFilter, JobRecord, LogRotation, ProviderKey,
    PublishDriver, PublishStatus, SchedulerError, SqliteJobStore, StoreError,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] postpilot_core::ConfigError),
    #[error("job store error: {0}")]
    Store(#[from] StoreError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("provider {0} is not configured")]
    UnknownProvider(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Scheduled blog publishing worker and operator tools",
    long_about = None
)]
pub struct Cli {
    /// Directory holding postpilot.toml, browser.toml and the platform profiles
    #[arg(long, env = "POSTPILOT_CONFIG_DIR", default_value = "configs")]
    pub config_dir: PathBuf,
    /// Job store path; overrides paths.database
    #[arg(long, env = "POSTPILOT_DATABASE")]
    pub database: Option<PathBuf>,
    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
    /// Directory for the rotating log file; overrides paths.log_dir
    #[arg(long, env = "POSTPILOT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
    /// Output format for command results
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the scheduler until interrupted
    Run,
    /// Runs one dispatch cycle for a provider now
    Cycle(CycleArgs),
    /// Lists jobs in the store
    Jobs(JobsArgs),
    /// Previews formatter output for a body file
    Format(FormatArgs),
    /// Applies the job store schema
    InitStore,
}

#[derive(Args, Debug)]
pub struct CycleArgs {
    #[arg(long)]
    pub provider: String,
}

#[derive(Args, Debug)]
pub struct JobsArgs {
    #[arg(long)]
    pub provider: Option<String>,
    /// pending, in_progress, success or failed
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct FormatArgs {
    /// Plain-text body file
    #[arg(long)]
    pub body: PathBuf,
    /// Image URL attached to the job; repeatable
    #[arg(long = "image")]
    pub images: Vec<String>,
    /// Render for keystroke editors instead of HTML mode
    #[arg(long, default_value_t = false)]
    pub plain: bool,
}

/// Rotating, append-only log file written next to stderr output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub dir: PathBuf,
    pub prefix: String,
    pub rotation: LogRotation,
    pub max_files: usize,
}

impl LogFile {
    /// `--log-dir` wins over `paths.log_dir`; with neither, logs go to
    /// stderr only. An unreadable config is reported later by `run`.
    pub fn resolve(cli: &Cli) -> Option<Self> {
        let config = load_postpilot_config(cli.config_dir.join("postpilot.toml")).ok();
        let dir = cli
            .log_dir
            .clone()
            .or_else(|| config.as_ref().and_then(|config| config.log_dir()))?;
        let logging = config.map(|config| config.logging).unwrap_or_default();
        Some(Self {
            dir,
            prefix: logging.file_prefix,
            rotation: logging.rotation,
            max_files: logging.max_files,
        })
    }

    fn appender(&self) -> Result<RollingFileAppender> {
        fs::create_dir_all(&self.dir)?;
        let rotation = match self.rotation {
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        };
        RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(self.prefix.as_str())
            .filename_suffix("log")
            .max_log_files(self.max_files.max(1))
            .build(&self.dir)
            .map_err(|err| AppError::Logging(err.to_string()))
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `--verbose`. The
/// returned guard flushes the log file when dropped.
pub fn init_tracing(
    verbose: bool,
    format: LogFormat,
    log_file: Option<&LogFile>,
) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (file_writer, guard) = match log_file {
        Some(log_file) => {
            let (writer, guard) = tracing_appender::non_blocking(log_file.appender()?);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer)))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(file_writer.map(|writer| fmt::layer().json().with_writer(writer)))
            .try_init(),
    };
    installed.map_err(|err| AppError::Logging(err.to_string()))?;
    Ok(guard)
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run => context.run_worker().await?,
        Commands::Cycle(args) => {
            let report = context.run_cycle(&args.provider).await?;
            render(&report, cli.format)?;
        }
        Commands::Jobs(args) => {
            let jobs = context.list_jobs(args)?;
            render(&jobs, cli.format)?;
        }
        Commands::Format(args) => {
            let preview = format_preview(args)?;
            render(&preview, cli.format)?;
        }
        Commands::InitStore => {
            let report = context.init_store()?;
            render(&report, cli.format)?;
        }
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    bundle: ConfigBundle,
    database: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let bundle = ConfigBundle::from_directory(&cli.config_dir)?;
        let database = cli
            .database
            .clone()
            .unwrap_or_else(|| bundle.postpilot.resolve_path(&bundle.postpilot.paths.database));
        Ok(Self { bundle, database })
    }

    fn store(&self) -> Result<SqliteJobStore> {
        if let Some(parent) = self.database.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut builder = SqliteJobStore::builder()
            .path(&self.database)
            .status_encoding(self.bundle.postpilot.store.status_codes);
        for entry in &self.bundle.postpilot.providers {
            builder = builder.provider(entry.key.clone(), entry.store_id);
        }
        Ok(builder.build()?)
    }

    fn provider_key(&self, raw: &str) -> Result<ProviderKey> {
        let key = ProviderKey::new(raw.trim().to_lowercase());
        if self.bundle.postpilot.provider(&key).is_none() {
            return Err(AppError::UnknownProvider(raw.to_string()));
        }
        Ok(key)
    }

    fn driver(
        &self,
        key: &ProviderKey,
        sessions: Arc<dyn SessionProvider>,
    ) -> Result<PublishDriver> {
        let profile = self.bundle.profile(key)?.clone();
        let browser = &self.bundle.browser;
        let artifacts = self
            .bundle
            .postpilot
            .resolve_path(&self.bundle.postpilot.paths.artifact_dir);
        Ok(PublishDriver::new(key.clone(), profile, sessions)
            .with_timeouts(DriverTimeouts::from(&browser.timeouts))
            .with_pacer(Pacer::new(browser.pacing.clone()))
            .with_cookies_from_env(|name| std::env::var(name).ok())
            .with_artifact_dir(artifacts))
    }

    fn dispatcher(&self, shutdown: Option<watch::Receiver<bool>>) -> Result<Dispatcher> {
        let sessions: Arc<dyn SessionProvider> =
            Arc::new(ChromiumSessionProvider::new(self.bundle.browser.clone()));
        let cooldown = Duration::from_secs(self.bundle.postpilot.dispatcher.cooldown_seconds);
        let mut dispatcher = Dispatcher::new(Arc::new(self.store()?)).with_cooldown(cooldown);
        if let Some(shutdown) = shutdown {
            dispatcher = dispatcher.with_shutdown(shutdown);
        }
        for entry in self.bundle.postpilot.providers.iter().filter(|e| e.enabled) {
            let driver = self.driver(&entry.key, sessions.clone())?;
            dispatcher = dispatcher.register(Box::new(driver));
        }
        Ok(dispatcher)
    }

    async fn run_worker(&self) -> Result<()> {
        if !self.bundle.postpilot.scheduler.enabled {
            warn!("scheduler disabled in postpilot.toml; nothing to run");
            return Ok(());
        }
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; stopping after the current job");
                let _ = tx.send(true);
            }
        });

        let dispatcher = self.dispatcher(Some(rx.clone()))?;
        let mut scheduler = CycleScheduler::from_config(&self.bundle.postpilot)?;
        info!(
            node = %self.bundle.postpilot.system.node_name,
            database = %self.database.display(),
            "worker started"
        );
        scheduler.run(&dispatcher, rx).await;
        Ok(())
    }

    async fn run_cycle(&self, provider: &str) -> Result<CycleReport> {
        let key = self.provider_key(provider)?;
        let dispatcher = self.dispatcher(None)?;
        Ok(dispatcher.run_cycle(&key).await)
    }

    fn list_jobs(&self, args: &JobsArgs) -> Result<JobList> {
        let provider = args
            .provider
            .as_deref()
            .map(|raw| self.provider_key(raw))
            .transpose()?;
        let status = args
            .status
            .as_deref()
            .map(|raw| raw.parse::<PublishStatus>())
            .transpose()
            .map_err(AppError::InvalidArgument)?;
        let store = self.store()?;
        let rows = store.list(&JobFilter {
            provider,
            status,
            limit: Some(args.limit),
        })?;
        Ok(JobList { rows })
    }

    fn init_store(&self) -> Result<InitReport> {
        let store = self.store()?;
        store.initialize()?;
        Ok(InitReport {
            database: store.path().to_path_buf(),
        })
    }
}

fn format_preview(args: &FormatArgs) -> Result<FormatPreview> {
    let body = fs::read_to_string(&args.body)?;
    let formatter = ContentFormatter::new();
    let (format, rendered) = if args.plain {
        (BodyFormat::Plain, formatter.format_plain(&body, &args.images))
    } else {
        (BodyFormat::Html, formatter.format_html(&body, &args.images))
    };
    Ok(FormatPreview {
        source: args.body.clone(),
        format,
        body: rendered,
    })
}

#[derive(Debug, Serialize)]
struct JobList {
    rows: Vec<JobRecord>,
}

#[derive(Debug, Serialize)]
struct InitReport {
    database: PathBuf,
}

#[derive(Debug, Serialize)]
struct FormatPreview {
    source: PathBuf,
    format: BodyFormat,
    body: String,
}

impl DisplayFallback for CycleReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{}: found={} attempted={} succeeded={} failed={} skipped={} ({} ms)",
            self.provider,
            self.jobs_found,
            self.attempted,
            self.succeeded,
            self.failed,
            self.skipped,
            self.duration_ms
        )];
        for error in &self.errors {
            lines.push(format!("  error: {error}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for JobList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no jobs found".to_string();
        }
        self.rows
            .iter()
            .map(|row| {
                let status = row
                    .status
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| format!("code {}", row.status_code));
                let reserved = row
                    .reserved_at
                    .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let mut line = format!(
                    "#{} {} | {} | {} | reserved {}",
                    row.id, row.login, row.title, status, reserved
                );
                if let Some(reason) = &row.fail_reason {
                    line.push_str(&format!(" | {reason}"));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for InitReport {
    fn display(&self) -> String {
        format!("job store ready at {}", self.database.display())
    }
}

impl DisplayFallback for FormatPreview {
    fn display(&self) -> String {
        self.body.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use tempfile::TempDir;

    fn cli(database: &Path, command: Commands) -> Cli {
        Cli {
            config_dir: PathBuf::from("../configs"),
            database: Some(database.to_path_buf()),
            verbose: false,
            log_format: LogFormat::Text,
            log_dir: None,
            format: OutputFormat::Json,
            command,
        }
    }

    #[test]
    fn init_store_then_list_is_empty() {
        let temp = TempDir::new().unwrap();
        let database = temp.path().join("data").join("store.sqlite");
        let context = AppContext::new(&cli(&database, Commands::InitStore)).unwrap();

        let report = context.init_store().unwrap();
        assert_eq!(report.database, database);
        assert!(database.exists());

        let jobs = context
            .list_jobs(&JobsArgs {
                provider: Some("Naver".into()),
                status: Some("pending".into()),
                limit: 5,
            })
            .unwrap();
        assert!(jobs.rows.is_empty());
        assert_eq!(jobs.display(), "no jobs found");
    }

    #[test]
    fn unknown_provider_and_status_are_rejected() {
        let temp = TempDir::new().unwrap();
        let database = temp.path().join("store.sqlite");
        let context = AppContext::new(&cli(&database, Commands::InitStore)).unwrap();
        assert!(matches!(
            context.provider_key("medium"),
            Err(AppError::UnknownProvider(_))
        ));
        let err = context
            .list_jobs(&JobsArgs {
                provider: None,
                status: Some("published".into()),
                limit: 5,
            })
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn format_preview_renders_html_and_plain() {
        let temp = TempDir::new().unwrap();
        let body = temp.path().join("body.txt");
        fs::write(&body, "hello\n\nworld").unwrap();

        let html = format_preview(&FormatArgs {
            body: body.clone(),
            images: vec!["https://cdn.example.com/a.png".into()],
            plain: false,
        })
        .unwrap();
        assert!(html.body.contains("<hr"));
        assert!(html.display().contains("a.png"));

        let plain = format_preview(&FormatArgs {
            body,
            images: vec![],
            plain: true,
        })
        .unwrap();
        assert_eq!(plain.body, "hello\n\nworld");
    }

    #[test]
    fn cycle_report_text_lists_errors() {
        let report = CycleReport {
            provider: "naver".into(),
            jobs_found: 2,
            attempted: 2,
            succeeded: 1,
            failed: 1,
            skipped: 0,
            errors: vec!["job 7: store busy".into()],
            duration_ms: 1200,
        };
        let text = report.display();
        assert!(text.starts_with("naver: found=2 attempted=2 succeeded=1 failed=1"));
        assert!(text.contains("error: job 7: store busy"));
    }

    fn read_logs(dir: &Path) -> String {
        let mut contents = String::new();
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            assert!(path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("automation"));
            contents.push_str(&fs::read_to_string(path).unwrap());
        }
        contents
    }

    fn write_log_line(log_file: &LogFile, message: &'static str) {
        let (writer, guard) = tracing_appender::non_blocking(log_file.appender().unwrap());
        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(writer));
        tracing::subscriber::with_default(subscriber, || {
            info!(job_id = 7, "{message}");
        });
        drop(guard);
    }

    #[test]
    fn log_file_appends_across_runs() {
        let temp = TempDir::new().unwrap();
        let log_file = LogFile {
            dir: temp.path().join("logs"),
            prefix: "automation".into(),
            rotation: LogRotation::Never,
            max_files: 4,
        };

        write_log_line(&log_file, "first run");
        write_log_line(&log_file, "second run");

        let contents = read_logs(&log_file.dir);
        assert!(contents.contains("first run"));
        assert!(contents.contains("second run"));
        assert!(contents.contains("job_id=7"));
    }

    #[test]
    fn log_dir_flag_overrides_config() {
        let temp = TempDir::new().unwrap();
        let mut cli = cli(&temp.path().join("store.sqlite"), Commands::InitStore);

        let from_config = LogFile::resolve(&cli).unwrap();
        assert_eq!(from_config.dir, PathBuf::from("./logs"));
        assert_eq!(from_config.prefix, "automation");
        assert_eq!(from_config.rotation, LogRotation::Daily);

        cli.log_dir = Some(temp.path().join("override"));
        let overridden = LogFile::resolve(&cli).unwrap();
        assert_eq!(overridden.dir, temp.path().join("override"));
        assert_eq!(overridden.max_files, 4);

        cli.config_dir = temp.path().join("missing");
        cli.log_dir = None;
        assert!(LogFile::resolve(&cli).is_none());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "postpilotctl",
            "--config-dir",
            "/etc/postpilot",
            "--format",
            "json",
            "jobs",
            "--provider",
            "tistory",
            "--limit",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.config_dir, PathBuf::from("/etc/postpilot"));
        assert!(matches!(cli.format, OutputFormat::Json));
        match cli.command {
            Commands::Jobs(args) => {
                assert_eq!(args.provider.as_deref(), Some("tistory"));
                assert_eq!(args.limit, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
