use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};

use postpilot_core::store::{StoreError, StoreResult};
use postpilot_core::{
    Account, Dispatcher, Failure, FailureKind, Job, JobStore, Outcome, ProviderKey,
    PublishStatus, Publisher,
};

#[derive(Default)]
struct MockStore {
    jobs: Vec<Job>,
    unreachable: bool,
    claimed_elsewhere: HashSet<i64>,
    recorded: Arc<Mutex<Vec<Outcome>>>,
}

#[async_trait]
impl JobStore for MockStore {
    async fn fetch_due(
        &self,
        _provider: &ProviderKey,
        _now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        if self.unreachable {
            return Err(StoreError::Task("connection refused".into()));
        }
        Ok(self.jobs.clone())
    }

    async fn begin_attempt(&self, job_id: i64) -> StoreResult<bool> {
        Ok(!self.claimed_elsewhere.contains(&job_id))
    }

    async fn record_outcome(&self, outcome: &Outcome) -> StoreResult<()> {
        self.recorded.lock().await.push(outcome.clone());
        Ok(())
    }
}

struct MockPublisher {
    provider: ProviderKey,
    failing: HashSet<i64>,
    panicking: HashSet<i64>,
    attempted: Arc<Mutex<Vec<i64>>>,
}

#[async_trait(?Send)]
impl Publisher for MockPublisher {
    fn provider(&self) -> &ProviderKey {
        &self.provider
    }

    async fn publish(&self, job: &Job) -> Outcome {
        self.attempted.lock().await.push(job.id);
        if self.panicking.contains(&job.id) {
            panic!("editor vanished");
        }
        if self.failing.contains(&job.id) {
            Outcome::failure(job.id, Failure::new(FailureKind::PublishFailed, "no confirm"))
        } else {
            Outcome::success(job.id)
        }
    }
}

fn job(id: i64) -> Job {
    Job {
        id,
        account: Account {
            id: 1,
            login: "writer".into(),
            secret: "pw".into(),
            blog_url: None,
            default_category: None,
        },
        category: None,
        title: format!("post {id}"),
        body: "body".into(),
        image_urls: vec![],
        video: None,
        status: PublishStatus::Pending,
        failure_reason: None,
        not_before: Utc::now(),
        group_id: None,
    }
}

fn publisher(
    failing: &[i64],
    panicking: &[i64],
) -> (Box<dyn Publisher>, Arc<Mutex<Vec<i64>>>) {
    let attempted = Arc::new(Mutex::new(Vec::new()));
    let publisher = MockPublisher {
        provider: ProviderKey::new("naver"),
        failing: failing.iter().copied().collect(),
        panicking: panicking.iter().copied().collect(),
        attempted: attempted.clone(),
    };
    (Box::new(publisher), attempted)
}

#[tokio::test(start_paused = true)]
async fn failure_in_one_job_does_not_stop_the_rest() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let store = MockStore {
        jobs: (1..=4).map(job).collect(),
        recorded: recorded.clone(),
        ..MockStore::default()
    };
    let (publisher, attempted) = publisher(&[2], &[]);
    let dispatcher = Dispatcher::new(Arc::new(store))
        .with_cooldown(Duration::from_secs(5))
        .register(publisher);

    let started = tokio::time::Instant::now();
    let report = dispatcher.run_cycle(&ProviderKey::new("naver")).await;

    assert_eq!(*attempted.lock().await, vec![1, 2, 3, 4]);
    let recorded = recorded.lock().await;
    assert_eq!(recorded.len(), 4);
    assert!(!recorded[1].is_success());
    assert!(recorded[3].is_success());
    assert_eq!(report.jobs_found, 4);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 1);
    assert!(!report.has_errors());
    // Cooldown only between jobs.
    assert_eq!(started.elapsed(), Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn panicking_publisher_is_recorded_as_unknown() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let store = MockStore {
        jobs: vec![job(1), job(2)],
        recorded: recorded.clone(),
        ..MockStore::default()
    };
    let (publisher, attempted) = publisher(&[], &[1]);
    let dispatcher = Dispatcher::new(Arc::new(store))
        .with_cooldown(Duration::ZERO)
        .register(publisher);

    let report = dispatcher.run_cycle(&ProviderKey::new("naver")).await;

    assert_eq!(*attempted.lock().await, vec![1, 2]);
    let recorded = recorded.lock().await;
    assert_eq!(recorded[0].failure_kind(), Some(FailureKind::Unknown));
    assert!(recorded[0].reason().unwrap().contains("editor vanished"));
    assert!(recorded[1].is_success());
    assert_eq!(report.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_aborts_without_marking_jobs() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let store = MockStore {
        jobs: vec![job(1)],
        unreachable: true,
        recorded: recorded.clone(),
        ..MockStore::default()
    };
    let (publisher, attempted) = publisher(&[], &[]);
    let dispatcher = Dispatcher::new(Arc::new(store)).register(publisher);

    let report = dispatcher.run_cycle(&ProviderKey::new("naver")).await;

    assert!(report.has_errors());
    assert_eq!(report.attempted, 0);
    assert!(attempted.lock().await.is_empty());
    assert!(recorded.lock().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn jobs_claimed_elsewhere_are_skipped() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let store = MockStore {
        jobs: vec![job(1), job(2), job(3)],
        claimed_elsewhere: [2].into_iter().collect(),
        recorded: recorded.clone(),
        ..MockStore::default()
    };
    let (publisher, attempted) = publisher(&[], &[]);
    let dispatcher = Dispatcher::new(Arc::new(store))
        .with_cooldown(Duration::ZERO)
        .register(publisher);

    let report = dispatcher.run_cycle(&ProviderKey::new("naver")).await;

    assert_eq!(*attempted.lock().await, vec![1, 3]);
    assert_eq!(report.skipped, 1);
    assert_eq!(recorded.lock().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_remaining_jobs_pending() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let store = MockStore {
        jobs: vec![job(1), job(2)],
        recorded: recorded.clone(),
        ..MockStore::default()
    };
    let (publisher, attempted) = publisher(&[], &[]);
    let (tx, rx) = watch::channel(true);
    let dispatcher = Dispatcher::new(Arc::new(store))
        .with_shutdown(rx)
        .register(publisher);

    let report = dispatcher.run_cycle(&ProviderKey::new("naver")).await;
    drop(tx);

    assert!(attempted.lock().await.is_empty());
    assert_eq!(report.skipped, 2);
    assert!(recorded.lock().await.is_empty());
}

#[tokio::test]
async fn unknown_provider_is_reported_not_raised() {
    let dispatcher = Dispatcher::new(Arc::new(MockStore::default()));
    let report = dispatcher.run_cycle(&ProviderKey::new("tistory")).await;
    assert!(report.has_errors());
    assert_eq!(report.jobs_found, 0);
}
