use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use txcache_core::SyncRunSummary;
use uuid::Uuid;

use crate::{ConcurrentRunRejected, RunSlot, SyncOrchestrator, SyncRequest};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// How late a tick may fire and still run; later ticks are dropped.
    pub misfire_grace: Duration,
    pub job_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            misfire_grace: Duration::from_secs(300),
            job_name: "Daily Transaction Sync".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub name: String,
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger: String,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub run_in_progress: bool,
    pub jobs: Vec<JobStatus>,
    pub last_run: Option<SyncRunSummary>,
}

#[derive(Debug)]
pub enum TickOutcome {
    Ran(Box<SyncRunSummary>),
    Missed { late_by: chrono::Duration },
    /// A catch-up fire for a slot already accounted for; nothing runs and
    /// the schedule does not move.
    Stale { early_by: chrono::Duration },
    Rejected,
    Stopped,
}

struct ActiveJob {
    scheduler: JobScheduler,
    job_id: Uuid,
}

#[derive(Default)]
struct ScheduleState {
    active: Option<ActiveJob>,
    next_run_at: Option<DateTime<Utc>>,
}

struct Inner {
    orchestrator: Arc<SyncOrchestrator>,
    config: SchedulerConfig,
    slot: Arc<RunSlot>,
    state: Mutex<ScheduleState>,
    last_run: Mutex<Option<SyncRunSummary>>,
}

/// Recurring day sync plus on-demand triggers, all sharing one run slot so at
/// most one sync executes at a time.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                config,
                slot: Arc::new(RunSlot::default()),
                state: Mutex::new(ScheduleState::default()),
                last_run: Mutex::new(None),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.inner.orchestrator
    }

    fn interval(&self) -> chrono::Duration {
        chrono_duration(self.inner.config.interval.max(Duration::from_secs(1)))
    }

    /// Arm the recurring job. Starting an already running scheduler is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.active.is_some() {
            warn!("scheduler already running; start ignored");
            return Ok(());
        }

        let scheduler = JobScheduler::new().await.context("creating job scheduler")?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job = Job::new_repeated_async(self.inner.config.interval, move |_uuid, _l| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    SyncScheduler { inner }.tick(Utc::now()).await;
                }
            })
        })
        .context("building recurring sync job")?;
        let job_id = scheduler.add(job).await.context("adding recurring sync job")?;
        scheduler.start().await.context("starting job scheduler")?;

        let next_run_at = Utc::now() + self.interval();
        state.active = Some(ActiveJob { scheduler, job_id });
        state.next_run_at = Some(next_run_at);
        info!(
            job = %self.inner.config.job_name,
            interval_seconds = self.inner.config.interval.as_secs(),
            next_run_at = %next_run_at,
            "scheduler started"
        );
        Ok(())
    }

    /// Disarm the recurring job. An in-flight run finishes on its own.
    pub async fn stop(&self) -> Result<()> {
        let active = {
            let mut state = self.inner.state.lock().await;
            state.next_run_at = None;
            state.active.take()
        };
        let Some(mut active) = active else {
            warn!("scheduler not running; stop ignored");
            return Ok(());
        };
        active
            .scheduler
            .shutdown()
            .await
            .context("shutting down job scheduler")?;
        info!(job_id = %active.job_id, "scheduler stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.active.is_some()
    }

    /// Handle one firing of the recurring job. Ticks later than the grace
    /// window are dropped, and missed slots are never replayed: after a pause
    /// the job fires its backlog in quick succession, and every fire that
    /// lands well before the next due slot is ignored.
    pub async fn tick(&self, fired_at: DateTime<Utc>) -> TickOutcome {
        let interval = self.interval();
        let grace = chrono_duration(self.inner.config.misfire_grace);
        let early_tolerance = grace.min(interval / 2);

        let scheduled_for = {
            let mut state = self.inner.state.lock().await;
            if state.active.is_none() {
                return TickOutcome::Stopped;
            }
            let Some(scheduled_for) = state.next_run_at else {
                return TickOutcome::Stopped;
            };

            let early_by = scheduled_for - fired_at;
            if early_by > early_tolerance {
                debug!(
                    scheduled_for = %scheduled_for,
                    early_by_seconds = early_by.num_seconds(),
                    "ignoring catch-up fire"
                );
                return TickOutcome::Stale { early_by };
            }

            let mut upcoming = scheduled_for + interval;
            while upcoming <= fired_at {
                upcoming += interval;
            }
            state.next_run_at = Some(upcoming);
            scheduled_for
        };

        let late_by = fired_at - scheduled_for;
        if late_by > grace {
            warn!(
                scheduled_for = %scheduled_for,
                late_by_seconds = late_by.num_seconds(),
                "scheduled sync missed its grace window; skipping"
            );
            return TickOutcome::Missed { late_by };
        }

        match self.trigger(SyncRequest::Day(None)).await {
            Ok(summary) => TickOutcome::Ran(Box::new(summary)),
            Err(ConcurrentRunRejected) => TickOutcome::Rejected,
        }
    }

    /// Run a sync now on the caller's task, sharing the scheduler's run slot.
    pub async fn trigger(&self, request: SyncRequest) -> Result<SyncRunSummary, ConcurrentRunRejected> {
        let Some(_permit) = self.inner.slot.try_acquire() else {
            warn!(?request, "sync already in progress; request rejected");
            return Err(ConcurrentRunRejected);
        };
        let summary = self.inner.orchestrator.run_request(request).await;
        *self.inner.last_run.lock().await = Some(summary.clone());
        Ok(summary)
    }

    /// Like [`trigger`](Self::trigger), but the run continues on a spawned task.
    /// Rejection is decided before this returns.
    pub fn trigger_detached(
        &self,
        request: SyncRequest,
    ) -> Result<JoinHandle<SyncRunSummary>, ConcurrentRunRejected> {
        let Some(permit) = self.inner.slot.try_acquire() else {
            warn!(?request, "sync already in progress; request rejected");
            return Err(ConcurrentRunRejected);
        };
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move {
            let _permit = permit;
            let summary = inner.orchestrator.run_request(request).await;
            *inner.last_run.lock().await = Some(summary.clone());
            summary
        }))
    }

    pub async fn run_full_sync(&self) -> Result<SyncRunSummary, ConcurrentRunRejected> {
        self.trigger(SyncRequest::Full).await
    }

    pub async fn run_scoped_sync(
        &self,
        day: Option<chrono::NaiveDate>,
    ) -> Result<SyncRunSummary, ConcurrentRunRejected> {
        self.trigger(SyncRequest::Day(day)).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        let jobs = {
            let state = self.inner.state.lock().await;
            state
                .active
                .as_ref()
                .map(|active| JobStatus {
                    id: active.job_id,
                    name: format!(
                        "{} (every {} minutes)",
                        self.inner.config.job_name,
                        self.inner.config.interval.as_secs() / 60
                    ),
                    next_run_time: state.next_run_at,
                    trigger: format!("interval[{}s]", self.inner.config.interval.as_secs()),
                    interval_seconds: self.inner.config.interval.as_secs(),
                })
                .into_iter()
                .collect::<Vec<_>>()
        };
        SchedulerStatus {
            running: !jobs.is_empty(),
            run_in_progress: self.inner.slot.is_busy(),
            jobs,
            last_run: self.inner.last_run.lock().await.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{tx_json, ScriptedFeed};

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use txcache_core::{
        CacheRecord, RawRecord, RawRecordBatch, SyncKind, SyncScope, TransactionRecord, UpsertCounts,
    };
    use txcache_feed::{SourceError, TransactionFeed};
    use txcache_storage::{CacheStore, MemoryCacheStore, StoreError};

    fn hourly() -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            misfire_grace: Duration::from_secs(300),
            ..SchedulerConfig::default()
        }
    }

    fn scheduler_over(feed: Arc<dyn TransactionFeed>) -> SyncScheduler {
        let orchestrator = SyncOrchestrator::new(feed, Arc::new(MemoryCacheStore::new()));
        SyncScheduler::new(Arc::new(orchestrator), hourly())
    }

    async fn next_run(scheduler: &SyncScheduler) -> DateTime<Utc> {
        scheduler.status().await.jobs[0].next_run_time.expect("armed")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_stop_are_idempotent() {
        let scheduler = scheduler_over(Arc::new(ScriptedFeed::new(vec![vec![]])));

        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        let status = scheduler.status().await;
        assert!(status.running);
        assert_eq!(status.jobs.len(), 1);
        assert_eq!(status.jobs[0].interval_seconds, 3600);

        scheduler.stop().await.unwrap();
        scheduler.stop().await.unwrap();
        let status = scheduler.status().await;
        assert!(!status.running);
        assert!(status.jobs.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tick_within_grace_runs_a_day_sync() {
        let feed = Arc::new(ScriptedFeed::new(vec![vec![tx_json("t-1")]]));
        let scheduler = scheduler_over(feed.clone());
        scheduler.start().await.unwrap();

        let due = next_run(&scheduler).await;
        let outcome = scheduler.tick(due + chrono::Duration::seconds(30)).await;

        let TickOutcome::Ran(summary) = outcome else {
            panic!("expected a run, got {outcome:?}");
        };
        assert_eq!(summary.kind, SyncKind::Day);
        assert_eq!(summary.inserted_count, 1);
        assert!(matches!(feed.requests.lock().unwrap()[0].0, SyncScope::Day(_)));
        assert_eq!(next_run(&scheduler).await, due + chrono::Duration::hours(1));
        assert!(scheduler.status().await.last_run.is_some());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_tick_is_dropped_without_replay() {
        let feed = Arc::new(ScriptedFeed::new(vec![vec![tx_json("t-1")]]));
        let scheduler = scheduler_over(feed.clone());
        scheduler.start().await.unwrap();

        let due = next_run(&scheduler).await;
        let fired_at = due + chrono::Duration::minutes(150);
        let outcome = scheduler.tick(fired_at).await;

        assert!(matches!(outcome, TickOutcome::Missed { late_by } if late_by == chrono::Duration::minutes(150)));
        assert!(feed.requests.lock().unwrap().is_empty());
        // Slots at +1h and +2h are skipped; the next one is after the late tick.
        assert_eq!(next_run(&scheduler).await, due + chrono::Duration::hours(3));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backlog_fires_after_a_pause_are_not_replayed() {
        let feed = Arc::new(ScriptedFeed::new(vec![vec![tx_json("t-1")]]));
        let scheduler = scheduler_over(feed.clone());
        scheduler.start().await.unwrap();

        let due = next_run(&scheduler).await;
        let resumed = due + chrono::Duration::minutes(150);
        let mut outcomes = Vec::new();
        for step in 0..3 {
            outcomes.push(scheduler.tick(resumed + chrono::Duration::milliseconds(500 * step)).await);
        }

        assert!(matches!(outcomes[0], TickOutcome::Missed { .. }));
        assert!(matches!(outcomes[1], TickOutcome::Stale { .. }));
        assert!(matches!(outcomes[2], TickOutcome::Stale { .. }));
        assert!(feed.requests.lock().unwrap().is_empty());

        let next = next_run(&scheduler).await;
        assert_eq!(next, due + chrono::Duration::hours(3));
        assert!(next - resumed < chrono::Duration::hours(1));

        // The regular fire at the next slot runs normally.
        assert!(matches!(scheduler.tick(next).await, TickOutcome::Ran(_)));
        assert_eq!(feed.requests.lock().unwrap().len(), 1);
        assert_eq!(next_run(&scheduler).await, due + chrono::Duration::hours(4));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slightly_early_fire_counts_as_on_time() {
        let feed = Arc::new(ScriptedFeed::new(vec![vec![tx_json("t-1")]]));
        let scheduler = scheduler_over(feed.clone());
        scheduler.start().await.unwrap();

        let due = next_run(&scheduler).await;
        let outcome = scheduler.tick(due - chrono::Duration::seconds(2)).await;
        assert!(matches!(outcome, TickOutcome::Ran(_)));
        assert_eq!(next_run(&scheduler).await, due + chrono::Duration::hours(1));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tick_after_stop_does_nothing() {
        let feed = Arc::new(ScriptedFeed::new(vec![vec![tx_json("t-1")]]));
        let scheduler = scheduler_over(feed.clone());
        scheduler.start().await.unwrap();
        let due = next_run(&scheduler).await;
        scheduler.stop().await.unwrap();

        assert!(matches!(scheduler.tick(due).await, TickOutcome::Stopped));
        assert!(feed.requests.lock().unwrap().is_empty());
    }

    /// Blocks inside the first page fetch until released.
    struct GatedFeed {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl TransactionFeed for GatedFeed {
        async fn fetch_page(&self, _scope: &SyncScope, page: u32) -> Result<RawRecordBatch, SourceError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(RawRecordBatch {
                page,
                last_page: Some(1),
                has_more: false,
                records: vec![RawRecord::from_json(tx_json("gated")).unwrap()],
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_requests_are_rejected_while_a_run_is_active() {
        let feed = Arc::new(GatedFeed {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let scheduler = scheduler_over(feed.clone());
        scheduler.start().await.unwrap();
        let due = next_run(&scheduler).await;

        let running = scheduler.trigger_detached(SyncRequest::Full).unwrap();
        feed.entered.notified().await;

        assert!(scheduler.status().await.run_in_progress);
        assert_eq!(
            scheduler.trigger(SyncRequest::Day(None)).await.unwrap_err(),
            ConcurrentRunRejected
        );
        assert!(scheduler.trigger_detached(SyncRequest::Full).is_err());
        assert!(matches!(scheduler.tick(due).await, TickOutcome::Rejected));

        feed.release.notify_one();
        let summary = running.await.unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.inserted_count, 1);
        assert!(!scheduler.status().await.run_in_progress);

        scheduler.stop().await.unwrap();
    }

    /// Tracks how many `apply` calls overlap.
    #[derive(Default)]
    struct ProbeStore {
        rows: MemoryCacheStore,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for ProbeStore {
        async fn apply(&self, batch: &[TransactionRecord]) -> Result<UpsertCounts, StoreError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let counts = self.rows.apply(batch).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            counts
        }

        async fn get(&self, id: &str) -> Result<Option<CacheRecord>, StoreError> {
            self.rows.get(id).await
        }

        async fn list_created_between(
            &self,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<CacheRecord>, StoreError> {
            self.rows.list_created_between(from, to).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_triggers_never_overlap_store_writes() {
        let pages = (0..3)
            .map(|p| (0..5).map(|i| tx_json(&format!("race-{p}-{i}"))).collect())
            .collect();
        let store = Arc::new(ProbeStore::default());
        let orchestrator = SyncOrchestrator::new(Arc::new(ScriptedFeed::new(pages)), store.clone());
        let scheduler = SyncScheduler::new(Arc::new(orchestrator), hourly());

        let attempts = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.trigger(SyncRequest::Full).await })
            })
            .collect::<Vec<_>>();

        let mut ran = 0;
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(summary) => {
                    assert!(summary.succeeded());
                    ran += 1;
                }
                Err(ConcurrentRunRejected) => rejected += 1,
            }
        }

        assert!(ran >= 1);
        assert_eq!(ran + rejected, 8);
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
        assert_eq!(store.rows.len().await, 15);
    }
}
