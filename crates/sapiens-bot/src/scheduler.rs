// Daily report scheduler.
//
// One timer loop per scheduler. Each fire is spawned as its own task so that
// stopping or replacing the loop never cancels a run already in flight. A run
// holds the run lock for its whole duration; `wait_for_in_flight` takes the
// same lock, so the process can outlive the last run on shutdown.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::{watch, Mutex as RunLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use sapiens_core::config::{DailyTime, ReportSchedule};
use sapiens_core::model::UserId;
use sapiens_core::store::{ProfileStore, StoreOutcome};
use sapiens_llm::NarrativeGenerator;

use crate::broadcaster::{daily_report_message, Broadcaster, FanOutReport};

/// Days searched for the next valid local time. Only DST gaps skip a day.
const SEARCH_DAYS: u32 = 8;

// ---------------------------------------------------------------------------
// Fire-time computation
// ---------------------------------------------------------------------------

/// Next instant strictly after `after` at which the wall clock in `tz` reads
/// `time`. A date on which that local time does not exist (DST gap) is
/// skipped; a local time that occurs twice (DST fold) resolves to the earlier
/// instant.
pub fn next_fire_after(after: DateTime<Utc>, time: DailyTime, tz: Tz) -> Option<DateTime<Utc>> {
    let mut date: NaiveDate = after.with_timezone(&tz).date_naive();

    for _ in 0..SEARCH_DAYS {
        let naive = date.and_hms_opt(time.hour, time.minute, 0)?;
        let candidate = match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt),
            LocalResult::Ambiguous(a, b) => Some(if a <= b { a } else { b }),
            LocalResult::None => None,
        };
        if let Some(candidate) = candidate.map(|dt| dt.with_timezone(&Utc)) {
            if candidate > after {
                return Some(candidate);
            }
        }
        date = date.succ_opt()?;
    }

    None
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// The work done on every fire.
#[async_trait]
pub trait ReportJob: Send + Sync + 'static {
    async fn run(&self);
}

/// Reads all users, generates the ecosystem report and sends it to each one.
pub struct DailyReportJob {
    store: Arc<dyn ProfileStore>,
    narrative: Arc<NarrativeGenerator>,
    broadcaster: Arc<Broadcaster>,
}

impl DailyReportJob {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        narrative: Arc<NarrativeGenerator>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            store,
            narrative,
            broadcaster,
        }
    }

    /// One report run. `None` when the run was skipped (no users, or the
    /// store could not be read).
    pub async fn run_once(&self) -> Option<FanOutReport> {
        info!("Starting daily Species Report generation");

        let users = match self.store.list_users_with_bots().await {
            StoreOutcome::Found(users) => users,
            StoreOutcome::NotFound => Vec::new(),
            StoreOutcome::Failed(e) => {
                error!("Could not read users for the daily report, skipping run: {e}");
                return None;
            }
        };

        if users.is_empty() {
            warn!("No users found, skipping report generation");
            return None;
        }

        let report = self.narrative.generate_ecosystem_report(&users).await;
        let recipients: Vec<UserId> = users.iter().map(|u| u.id()).collect();
        let result = self
            .broadcaster
            .fan_out_to_users(&recipients, &daily_report_message(&report))
            .await;

        info!(
            "Daily report sent: {} successful, {} failed",
            result.sent, result.failed
        );
        Some(result)
    }
}

#[async_trait]
impl ReportJob for DailyReportJob {
    async fn run(&self) {
        self.run_once().await;
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled { next: DateTime<Utc> },
    Running,
    Stopped,
}

struct LoopHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

pub struct ReportScheduler {
    schedule: ReportSchedule,
    job: Arc<dyn ReportJob>,
    state: Arc<Mutex<SchedulerState>>,
    active: Mutex<Option<LoopHandle>>,
    run_lock: Arc<RunLock<()>>,
}

impl ReportScheduler {
    pub fn new(schedule: ReportSchedule, job: Arc<dyn ReportJob>) -> Self {
        Self {
            schedule,
            job,
            state: Arc::new(Mutex::new(SchedulerState::Idle)),
            active: Mutex::new(None),
            run_lock: Arc::new(RunLock::new(())),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *lock(&self.state)
    }

    /// Start the timer loop, replacing any loop this scheduler already runs.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            self.schedule,
            Arc::clone(&self.job),
            Arc::clone(&self.state),
            Arc::clone(&self.run_lock),
            shutdown_rx,
        ));

        let previous = lock(&self.active).replace(LoopHandle {
            task,
            shutdown: shutdown_tx,
        });
        if let Some(previous) = previous {
            info!("Replacing existing daily report job");
            previous.task.abort();
        }

        info!(
            "Scheduler configured: daily report at {} {}",
            self.schedule.time, self.schedule.timezone
        );
    }

    /// Cancel the pending trigger. A run already in flight completes.
    pub fn shutdown(&self) {
        if let Some(active) = lock(&self.active).take() {
            let _ = active.shutdown.send(true);
            *lock(&self.state) = SchedulerState::Stopped;
            info!("Scheduler stopped");
        }
    }

    /// Resolve once no report run is executing. Call after `shutdown` so
    /// the process does not exit halfway through a fan-out.
    pub async fn wait_for_in_flight(&self) {
        let _idle = self.run_lock.lock().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_loop(
    schedule: ReportSchedule,
    job: Arc<dyn ReportJob>,
    state: Arc<Mutex<SchedulerState>>,
    run_lock: Arc<RunLock<()>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut previous: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        // Never fire the same instant twice, even if the wall clock lags the timer.
        let after = previous.map_or(now, |p| p.max(now));
        let Some(next) = next_fire_after(after, schedule.time, schedule.timezone) else {
            error!(
                "No valid fire time for {} {}, scheduler stopping",
                schedule.time, schedule.timezone
            );
            *lock(&state) = SchedulerState::Stopped;
            return;
        };

        *lock(&state) = SchedulerState::Scheduled { next };
        info!("Next daily report at {next}");

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {
                *lock(&state) = SchedulerState::Stopped;
                return;
            }
        }

        previous = Some(next);

        // Taken before the run is spawned, so a waiter never sees a gap
        // between the timer firing and the run starting.
        let guard = Arc::clone(&run_lock).lock_owned().await;
        if *shutdown.borrow() {
            *lock(&state) = SchedulerState::Stopped;
            return;
        }
        *lock(&state) = SchedulerState::Running;

        let run = tokio::spawn({
            let job = Arc::clone(&job);
            async move {
                job.run().await;
                drop(guard);
            }
        });
        tokio::select! {
            result = run => {
                if let Err(e) = result {
                    error!("Daily report run failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                info!("Shutdown requested during a report run; the run will complete");
                *lock(&state) = SchedulerState::Stopped;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Timelike;

    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn at(hour: u32, minute: u32) -> DailyTime {
        DailyTime { hour, minute }
    }

    // -- Fire-time computation --

    #[test]
    fn next_fire_same_day() {
        let next = next_fire_after(utc("2024-05-01T08:00:00Z"), at(9, 0), Tz::UTC).unwrap();
        assert_eq!(next, utc("2024-05-01T09:00:00Z"));
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let next = next_fire_after(utc("2024-05-01T09:00:00Z"), at(9, 0), Tz::UTC).unwrap();
        assert_eq!(next, utc("2024-05-02T09:00:00Z"));

        let next = next_fire_after(utc("2024-05-01T09:00:01Z"), at(9, 0), Tz::UTC).unwrap();
        assert_eq!(next, utc("2024-05-02T09:00:00Z"));
    }

    #[test]
    fn next_fire_in_named_timezone() {
        let next = next_fire_after(
            utc("2024-05-01T05:00:00Z"),
            at(9, 0),
            chrono_tz::Europe::Moscow,
        )
        .unwrap();
        assert_eq!(next, utc("2024-05-01T06:00:00Z"));
    }

    #[test]
    fn dst_gap_skips_the_day() {
        // 02:30 does not exist in New York on 2024-03-10.
        let next = next_fire_after(
            utc("2024-03-10T05:00:00Z"),
            at(2, 30),
            chrono_tz::America::New_York,
        )
        .unwrap();
        assert_eq!(next, utc("2024-03-11T06:30:00Z"));
    }

    #[test]
    fn dst_fold_uses_earlier_instant() {
        // 01:30 occurs twice in New York on 2024-11-03 (EDT, then EST).
        let next = next_fire_after(
            utc("2024-11-03T04:00:00Z"),
            at(1, 30),
            chrono_tz::America::New_York,
        )
        .unwrap();
        assert_eq!(next, utc("2024-11-03T05:30:00Z"));
    }

    // -- Scheduler loop --

    #[derive(Default)]
    struct CountingJob {
        fires: AtomicUsize,
    }

    #[async_trait]
    impl ReportJob for CountingJob {
        async fn run(&self) {
            self.fires.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Signals when a run starts, then takes a while to finish.
    #[derive(Default)]
    struct SlowJob {
        started: tokio::sync::Notify,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl ReportJob for SlowJob {
        async fn run(&self) {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(500)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A schedule about twelve hours ahead of the real clock.
    fn schedule_in_twelve_hours() -> ReportSchedule {
        let target = Utc::now() + chrono::Duration::hours(12);
        ReportSchedule {
            time: at(target.hour(), target.minute()),
            timezone: Tz::UTC,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_within_the_day() {
        let job = Arc::new(CountingJob::default());
        let scheduler = ReportScheduler::new(schedule_in_twelve_hours(), job.clone());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(13 * 3600)).await;

        assert_eq!(job.fires.load(Ordering::SeqCst), 1);
        assert!(matches!(scheduler.state(), SchedulerState::Scheduled { .. }));
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_replaces_the_job() {
        let job = Arc::new(CountingJob::default());
        let scheduler = ReportScheduler::new(schedule_in_twelve_hours(), job.clone());

        scheduler.start();
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(13 * 3600)).await;

        assert_eq!(job.fires.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_trigger() {
        let job = Arc::new(CountingJob::default());
        let scheduler = ReportScheduler::new(schedule_in_twelve_hours(), job.clone());

        scheduler.start();
        tokio::task::yield_now().await;
        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(13 * 3600)).await;

        assert_eq!(job.fires.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_running_report_finish() {
        let job = Arc::new(SlowJob::default());
        let scheduler = ReportScheduler::new(schedule_in_twelve_hours(), job.clone());

        scheduler.start();
        job.started.notified().await;
        scheduler.shutdown();
        assert_eq!(job.finished.load(Ordering::SeqCst), 0);

        scheduler.wait_for_in_flight().await;
        assert_eq!(job.finished.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_in_flight_is_immediate_when_idle() {
        let scheduler = ReportScheduler::new(
            schedule_in_twelve_hours(),
            Arc::new(CountingJob::default()),
        );
        scheduler.start();
        scheduler.shutdown();

        let waited =
            tokio::time::timeout(Duration::from_secs(1), scheduler.wait_for_in_flight()).await;
        assert!(waited.is_ok());
    }
}
