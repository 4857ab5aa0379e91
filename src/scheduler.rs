// Daily rotation scheduler.
//
// A single perpetual task: wait until the configured local time of day, fire
// the rotation job for every game slot, re-arm for the next day. It has no
// terminal state and shares nothing with request handlers except the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, Local, LocalResult, NaiveDate, NaiveTime, TimeZone};
use tokio::task::JoinHandle;

use crate::metrics;
use crate::picks::SlotOutcome;

/// Work performed at every rotation instant.
#[async_trait]
pub trait RotationJob: Send + Sync {
    async fn rotate(&self) -> Vec<SlotOutcome>;
}

/// Source of wall-clock time for the scheduler loop.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SchedulerState {
    Waiting { next: DateTime<Local> },
    Firing { scheduled: DateTime<Local> },
}

pub struct DailyScheduler<C: Clock = SystemClock> {
    job: Arc<dyn RotationJob>,
    fire_time: NaiveTime,
    clock: C,
}

impl DailyScheduler<SystemClock> {
    pub fn new(job: Arc<dyn RotationJob>, fire_time: NaiveTime) -> Self {
        Self::with_clock(job, fire_time, SystemClock)
    }
}

impl<C: Clock> DailyScheduler<C> {
    pub fn with_clock(job: Arc<dyn RotationJob>, fire_time: NaiveTime, clock: C) -> Self {
        Self {
            job,
            fire_time,
            clock,
        }
    }

    /// Spawn the loop as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run forever.
    pub async fn run(self) {
        let now = self.clock.now();
        let mut state = SchedulerState::Waiting {
            next: next_fire_instant(&now, self.fire_time),
        };

        loop {
            state = match state {
                SchedulerState::Waiting { next } => {
                    let wait = wait_until(&self.clock.now(), &next);
                    tracing::info!(
                        "Time until next daily pokémon: {} (at {})",
                        format_wait(wait),
                        next.to_rfc3339()
                    );
                    metrics::SECONDS_UNTIL_ROTATION.set(wait.as_secs() as i64);
                    tokio::time::sleep(wait).await;

                    // The wall clock may have been set back while we slept.
                    if self.clock.now() < next {
                        SchedulerState::Waiting { next }
                    } else {
                        SchedulerState::Firing { scheduled: next }
                    }
                }
                SchedulerState::Firing { scheduled } => {
                    self.fire().await;

                    let now = self.clock.now();
                    let mut next = following_day(&scheduled, self.fire_time);
                    if next <= now {
                        tracing::warn!(
                            "Rotation for {} ran past the next instant, rolling forward",
                            scheduled.to_rfc3339()
                        );
                        next = next_fire_instant(&now, self.fire_time);
                    }
                    SchedulerState::Waiting { next }
                }
            };
        }
    }

    async fn fire(&self) {
        metrics::ROTATIONS_FIRED_TOTAL.inc();
        let outcomes = self.job.rotate().await;
        let created = outcomes.iter().filter(|o| o.is_created()).count();
        for failed in outcomes.iter().filter(|o| !o.is_created()) {
            tracing::warn!(
                "Daily rotation: game_id {} failed: {}",
                failed.game_id,
                failed.error.as_deref().unwrap_or("unknown error")
            );
        }
        tracing::info!(
            "Daily rotation finished: {created}/{} slots created",
            outcomes.len()
        );
    }
}

/// The first instant strictly after `now` whose local time is `fire_time`:
/// today if still ahead, otherwise tomorrow.
pub fn next_fire_instant<Tz: TimeZone>(now: &DateTime<Tz>, fire_time: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    let candidate = resolve_local(&tz, today, fire_time);
    if candidate > *now {
        return candidate;
    }
    match today.checked_add_days(Days::new(1)) {
        Some(tomorrow) => resolve_local(&tz, tomorrow, fire_time),
        None => now.clone() + chrono::Duration::days(1),
    }
}

/// `fire_time` on the calendar day after `scheduled`.
pub fn following_day<Tz: TimeZone>(scheduled: &DateTime<Tz>, fire_time: NaiveTime) -> DateTime<Tz> {
    match scheduled.date_naive().checked_add_days(Days::new(1)) {
        Some(next_day) => resolve_local(&scheduled.timezone(), next_day, fire_time),
        None => scheduled.clone() + chrono::Duration::days(1),
    }
}

/// Sleep needed from `now` to reach `target`; zero if already past.
pub fn wait_until<Tz: TimeZone>(now: &DateTime<Tz>, target: &DateTime<Tz>) -> Duration {
    target
        .clone()
        .signed_duration_since(now.clone())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Resolve a local date and time to an instant. Ambiguous times (clocks going
/// back) take the earlier instant; times inside a gap (clocks going forward)
/// move to the first valid minute after it.
fn resolve_local<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(time);
    let mut probe = naive;
    // Gaps are at most a few hours.
    for _ in 0..(24 * 60) {
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(dt) => return dt,
            LocalResult::Ambiguous(earliest, _) => return earliest,
            LocalResult::None => probe += chrono::Duration::minutes(1),
        }
    }
    tz.from_utc_datetime(&naive)
}

fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs();
    format!("{}h{:02}m{:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};
    use tokio::sync::mpsc;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_armed_before_fire_time_fires_today() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 22, 0, 0).unwrap();
        let next = next_fire_instant(&now, at(23, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap());

        let wait = wait_until(&now, &next);
        assert_eq!(wait, Duration::from_secs(3600));
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_armed_after_fire_time_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap();
        let next = next_fire_instant(&now, at(23, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 2, 23, 0, 0).unwrap());

        // 24h minus the 30 minutes elapsed since today's fire time
        let wait = wait_until(&now, &next);
        assert_eq!(wait, Duration::from_secs(24 * 3600 - 30 * 60));
    }

    #[test]
    fn test_armed_exactly_at_fire_time_waits_a_full_day() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let next = next_fire_instant(&now, at(0, 0));
        assert_eq!(wait_until(&now, &next), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_midnight_rotation_across_month_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 1).unwrap();
        let next = next_fire_instant(&now, at(0, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(wait_until(&now, &next), Duration::from_secs(24 * 3600 - 1));
    }

    #[test]
    fn test_fire_time_is_local_to_the_offset() {
        let tz = FixedOffset::east_opt(9 * 3600).unwrap();
        // 14:30 UTC is 23:30 at +09:00, so 23:00 local has passed.
        let now = Utc
            .with_ymd_and_hms(2024, 6, 1, 14, 30, 0)
            .unwrap()
            .with_timezone(&tz);
        let next = next_fire_instant(&now, at(23, 0));
        assert_eq!(next, tz.with_ymd_and_hms(2024, 6, 2, 23, 0, 0).unwrap());
    }

    #[test]
    fn test_following_day_and_past_targets() {
        let fired = Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        assert_eq!(
            following_day(&fired, at(23, 0)),
            Utc.with_ymd_and_hms(2025, 1, 1, 23, 0, 0).unwrap()
        );

        let later = fired + chrono::Duration::seconds(5);
        assert_eq!(wait_until(&later, &fired), Duration::ZERO);
    }

    #[test]
    fn test_format_wait() {
        assert_eq!(format_wait(Duration::from_secs(3 * 3600 + 5 * 60 + 9)), "3h05m09s");
        assert_eq!(format_wait(Duration::ZERO), "0h00m00s");
    }

    /// Wall clock that advances with tokio's (pausable) clock.
    #[derive(Clone)]
    struct VirtualClock {
        base: DateTime<Local>,
        origin: tokio::time::Instant,
    }

    impl VirtualClock {
        fn starting_at(base: DateTime<Local>) -> Self {
            Self {
                base,
                origin: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for VirtualClock {
        fn now(&self) -> DateTime<Local> {
            self.base + chrono::Duration::from_std(self.origin.elapsed()).unwrap()
        }
    }

    struct RecordingJob {
        clock: VirtualClock,
        fired: mpsc::UnboundedSender<DateTime<Local>>,
    }

    #[async_trait]
    impl RotationJob for RecordingJob {
        async fn rotate(&self) -> Vec<SlotOutcome> {
            let _ = self.fired.send(self.clock.now());
            Vec::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_fires_once_then_rearms_for_next_day() {
        let base = Local.with_ymd_and_hms(2024, 1, 10, 22, 0, 0).unwrap();
        let clock = VirtualClock::starting_at(base);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = Arc::new(RecordingJob {
            clock: clock.clone(),
            fired: tx,
        });

        let handle = DailyScheduler::with_clock(job, at(23, 0), clock).spawn();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, Local.with_ymd_and_hms(2024, 1, 10, 23, 0, 0).unwrap());

        let second = rx.recv().await.unwrap();
        assert_eq!(second, Local.with_ymd_and_hms(2024, 1, 11, 23, 0, 0).unwrap());
        assert_eq!(second - first, chrono::Duration::hours(24));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_started_after_fire_time_waits_for_tomorrow() {
        let base = Local.with_ymd_and_hms(2024, 1, 10, 23, 30, 0).unwrap();
        let clock = VirtualClock::starting_at(base);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = Arc::new(RecordingJob {
            clock: clock.clone(),
            fired: tx,
        });

        let handle = DailyScheduler::with_clock(job, at(23, 0), clock).spawn();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, Local.with_ymd_and_hms(2024, 1, 11, 23, 0, 0).unwrap());
        assert_eq!(first - base, chrono::Duration::minutes(23 * 60 + 30));

        handle.abort();
    }
}
