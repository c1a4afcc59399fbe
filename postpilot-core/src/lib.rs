pub mod browser;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod formatter;
pub mod job;
pub mod scheduler;
pub mod sqlite;
pub mod store;

pub use config::{
    load_browser_config, load_platform_profile, load_postpilot_config, BrowserConfig,
    ConfigBundle, LogRotation, LoggingSection, PostpilotConfig, ProviderEntry,
};
pub use dispatcher::{CycleReport, Dispatcher};
pub use driver::{
    AmbiguousVerification, BodyFormat, DriverState, DriverTimeouts, PlatformProfile,
    PublishDriver, Publisher,
};
pub use error::{ConfigError, Result};
pub use formatter::{ContentFormatter, ContentPayload};
pub use job::{
    Account, Failure, FailureKind, Job, Outcome, ProviderKey, PublishResult, PublishStatus,
    StatusEncoding,
};
pub use scheduler::{CycleScheduler, SchedulerError};
pub use store::{
    JobFilter, JobRecord, JobStore, SqliteJobStore, SqliteJobStoreBuilder, StoreError,
    StoreResult,
};
