use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::PostpilotConfig;
use crate::dispatcher::Dispatcher;
use crate::job::ProviderKey;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("trigger minute {minute} for provider {provider} is outside 0-59")]
    InvalidMinute { provider: String, minute: u32 },
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("provider {0} has no trigger minutes")]
    EmptyTrigger(String),
}

#[derive(Debug, Clone)]
struct Trigger {
    provider: ProviderKey,
    minutes: BTreeSet<u32>,
}

/// Decides which providers run at the current wall-clock minute and drives
/// the dispatcher from a fixed-interval check loop.
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    timezone: Tz,
    check_interval: Duration,
    triggers: Vec<Trigger>,
    last_fired: HashMap<ProviderKey, String>,
}

impl CycleScheduler {
    pub fn new(timezone: &str, check_interval: Duration) -> Result<Self, SchedulerError> {
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| SchedulerError::UnknownTimezone(timezone.to_string()))?;
        Ok(Self {
            timezone,
            check_interval: check_interval.max(Duration::from_secs(1)),
            triggers: Vec::new(),
            last_fired: HashMap::new(),
        })
    }

    /// Scheduler for every enabled provider in the config, in config order.
    pub fn from_config(config: &PostpilotConfig) -> Result<Self, SchedulerError> {
        let mut scheduler = Self::new(
            &config.scheduler.timezone,
            Duration::from_secs(config.scheduler.check_interval_seconds),
        )?;
        for entry in config.providers.iter().filter(|entry| entry.enabled) {
            scheduler = scheduler.with_trigger(entry.key.clone(), &entry.trigger_minutes)?;
        }
        Ok(scheduler)
    }

    pub fn with_trigger(
        mut self,
        provider: ProviderKey,
        minutes: &[u32],
    ) -> Result<Self, SchedulerError> {
        if minutes.is_empty() {
            return Err(SchedulerError::EmptyTrigger(provider.to_string()));
        }
        if let Some(minute) = minutes.iter().copied().find(|minute| *minute > 59) {
            return Err(SchedulerError::InvalidMinute {
                provider: provider.to_string(),
                minute,
            });
        }
        self.triggers.retain(|trigger| trigger.provider != provider);
        self.triggers.push(Trigger {
            provider,
            minutes: minutes.iter().copied().collect(),
        });
        Ok(self)
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Providers due at `now`. Each provider fires at most once per local
    /// minute marker no matter how often this is called.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<ProviderKey> {
        let local = now.with_timezone(&self.timezone);
        let minute = local.minute();
        let marker = local.format("%Y-%m-%d %H:%M").to_string();

        let mut due = Vec::new();
        for trigger in &self.triggers {
            if !trigger.minutes.contains(&minute) {
                continue;
            }
            if self.last_fired.get(&trigger.provider) == Some(&marker) {
                continue;
            }
            self.last_fired
                .insert(trigger.provider.clone(), marker.clone());
            due.push(trigger.provider.clone());
        }
        due
    }

    /// Checks the clock every interval and runs a cycle for each due
    /// provider until `shutdown` reads `true`. Cycle errors are logged by
    /// the dispatcher and never end the loop.
    pub async fn run(&mut self, dispatcher: &Dispatcher, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            target: "postpilot_scheduler",
            timezone = %self.timezone,
            check_interval_secs = self.check_interval.as_secs(),
            providers = self.triggers.len(),
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            for provider in self.tick(Utc::now()) {
                if *shutdown.borrow() {
                    break;
                }
                tracing::info!(
                    target: "postpilot_scheduler",
                    provider = %provider,
                    "trigger fired"
                );
                let report = dispatcher.run_cycle(&provider).await;
                if report.has_errors() {
                    tracing::warn!(
                        target: "postpilot_scheduler",
                        provider = %provider,
                        errors = ?report.errors,
                        "cycle finished with errors"
                    );
                } else {
                    tracing::debug!(
                        target: "postpilot_scheduler",
                        provider = %provider,
                        attempted = report.attempted,
                        "cycle finished"
                    );
                }
            }
        }

        tracing::info!(target: "postpilot_scheduler", "scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn scheduler() -> CycleScheduler {
        CycleScheduler::new("Asia/Seoul", Duration::from_secs(30))
            .unwrap()
            .with_trigger(ProviderKey::new("naver"), &[0, 30])
            .unwrap()
            .with_trigger(ProviderKey::new("tistory"), &[15, 45])
            .unwrap()
    }

    #[test]
    fn fires_in_local_time() {
        let mut scheduler = scheduler();
        // 09:30 KST
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 30, 10).unwrap();
        assert_eq!(scheduler.tick(now), vec![ProviderKey::new("naver")]);
    }

    #[test]
    fn repeated_checks_within_a_minute_fire_once() {
        let mut scheduler = scheduler();
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 0, 15, 0).unwrap();
        assert_eq!(scheduler.tick(first), vec![ProviderKey::new("tistory")]);
        assert!(scheduler.tick(first + chrono::Duration::seconds(30)).is_empty());
        // Same minute an hour later fires again.
        assert_eq!(
            scheduler.tick(first + chrono::Duration::hours(1)),
            vec![ProviderKey::new("tistory")]
        );
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(
            CycleScheduler::new("Mars/Olympus", Duration::from_secs(30)),
            Err(SchedulerError::UnknownTimezone(_))
        ));
        let base = CycleScheduler::new("Asia/Seoul", Duration::from_secs(30)).unwrap();
        assert!(matches!(
            base.clone().with_trigger(ProviderKey::new("naver"), &[60]),
            Err(SchedulerError::InvalidMinute { minute: 60, .. })
        ));
        assert!(matches!(
            base.with_trigger(ProviderKey::new("naver"), &[]),
            Err(SchedulerError::EmptyTrigger(_))
        ));
    }
}
