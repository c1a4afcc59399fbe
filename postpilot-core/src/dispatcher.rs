use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::driver::{panic_message, Publisher};
use crate::job::{Failure, FailureKind, Job, Outcome, ProviderKey};
use crate::store::JobStore;

/// Summary of one dispatch cycle for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub provider: String,
    pub jobs_found: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl CycleReport {
    fn new(provider: &ProviderKey) -> Self {
        Self {
            provider: provider.to_string(),
            ..Self::default()
        }
    }

    /// True when the cycle hit a store or routing error.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Runs the due jobs of one provider one at a time.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    publishers: BTreeMap<ProviderKey, Box<dyn Publisher>>,
    cooldown: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("providers", &self.publishers.keys().collect::<Vec<_>>())
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            publishers: BTreeMap::new(),
            cooldown: Duration::from_secs(5),
            shutdown: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Stops a cycle between jobs once the channel reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn register(mut self, publisher: Box<dyn Publisher>) -> Self {
        self.publishers.insert(publisher.provider().clone(), publisher);
        self
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderKey> {
        self.publishers.keys()
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    /// Processes every due job of `provider`. Never returns an error: store
    /// failures end the cycle and are carried in the report.
    pub async fn run_cycle(&self, provider: &ProviderKey) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(provider);

        let Some(publisher) = self.publishers.get(provider) else {
            error!(provider = %provider, "no publisher registered");
            report.errors.push(format!("no publisher registered for {provider}"));
            return finish(report, started);
        };

        let jobs = match self.store.fetch_due(provider, Utc::now()).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(
                    provider = %provider,
                    error = %err,
                    "failed to fetch due jobs; cycle aborted"
                );
                report.errors.push(err.to_string());
                return finish(report, started);
            }
        };
        report.jobs_found = jobs.len();
        if jobs.is_empty() {
            debug!(provider = %provider, "no due jobs");
            return finish(report, started);
        }
        info!(provider = %provider, jobs = jobs.len(), "dispatch cycle started");

        let total = jobs.len();
        for (index, job) in jobs.into_iter().enumerate() {
            if self.shutdown_requested() {
                warn!(
                    provider = %provider,
                    remaining = total - index,
                    "shutdown requested; leaving remaining jobs pending"
                );
                report.skipped += total - index;
                break;
            }

            match self.store.begin_attempt(job.id).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(provider = %provider, job_id = job.id, "job already claimed; skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(
                        provider = %provider,
                        job_id = job.id,
                        error = %err,
                        "claim failed; skipping"
                    );
                    report.errors.push(format!("job {}: {err}", job.id));
                    report.skipped += 1;
                    continue;
                }
            }

            report.attempted += 1;
            let outcome = attempt(publisher.as_ref(), &job).await;
            if outcome.is_success() {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }

            if let Err(err) = self.store.record_outcome(&outcome).await {
                error!(
                    provider = %provider,
                    job_id = job.id,
                    error = %err,
                    "failed to record outcome"
                );
                report.errors.push(format!("job {}: {err}", job.id));
            }

            if index + 1 < total && !self.cooldown.is_zero() {
                debug!(
                    provider = %provider,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "cooling down"
                );
                sleep(self.cooldown).await;
            }
        }

        let report = finish(report, started);
        info!(
            provider = %provider,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "dispatch cycle finished"
        );
        report
    }
}

async fn attempt(publisher: &dyn Publisher, job: &Job) -> Outcome {
    match AssertUnwindSafe(publisher.publish(job)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(&*panic);
            error!(job_id = job.id, reason = %message, "publisher panicked");
            Outcome::failure(job.id, Failure::new(FailureKind::Unknown, message))
        }
    }
}

fn finish(mut report: CycleReport, started: Instant) -> CycleReport {
    report.duration_ms = started.elapsed().as_millis() as u64;
    report
}
