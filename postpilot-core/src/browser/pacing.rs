use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::sleep;

use crate::config::PacingSection;

/// Named pause points in a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacePoint {
    /// After a navigation, before probing the page.
    Settle,
    /// After the authoring surface loads; editors hydrate slowly.
    ComposeSettle,
    /// Between field inputs.
    Field,
    /// After confirming, before reading the result page.
    PostPublish,
}

/// Randomised human-like pauses between interactions.
#[derive(Debug, Clone)]
pub struct Pacer {
    config: PacingSection,
}

impl Pacer {
    pub fn new(config: PacingSection) -> Self {
        Self { config }
    }

    /// A pacer that never sleeps.
    pub fn instant() -> Self {
        Self::new(PacingSection {
            settle_ms: [0, 0],
            compose_settle_ms: [0, 0],
            field_ms: [0, 0],
            post_publish_ms: [0, 0],
        })
    }

    pub async fn pause(&self, point: PacePoint) {
        let delay = self.duration_for(point);
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    pub fn duration_for(&self, point: PacePoint) -> Duration {
        let bounds = match point {
            PacePoint::Settle => self.config.settle_ms,
            PacePoint::ComposeSettle => self.config.compose_settle_ms,
            PacePoint::Field => self.config.field_ms,
            PacePoint::PostPublish => self.config.post_publish_ms,
        };
        random_duration(bounds)
    }
}

fn random_duration(bounds: [u64; 2]) -> Duration {
    let (low, high) = if bounds[0] <= bounds[1] {
        (bounds[0], bounds[1])
    } else {
        (bounds[1], bounds[0])
    };
    if high == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(thread_rng().gen_range(low..=high))
}
