//! Due-time computation for job definitions
//!
//! A definition is due when its next execution time falls inside the current
//! loop window. Cron and fixed-delay schedules that fell behind (node down,
//! long run) only catch up on due times younger than the catch-up window.

use chrono::{DateTime, Duration, Utc};
use croner::Cron;

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::types::{JobConfiguration, SchedulingType};

/// Parse a cron expression; a leading seconds field is optional
pub fn parse_cron(expression: &str) -> JobResult<Cron> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| JobError::InvalidCronExpression(format!("{expression}: {e}")))
}

/// The time window one scheduling tick looks at
#[derive(Debug, Clone, Copy)]
pub struct DueWindow {
    pub now: DateTime<Utc>,
    /// Length of one loop interval; jobs due before `now + window` are picked up
    pub window: Duration,
    pub max_catch_up: Duration,
}

impl DueWindow {
    pub fn new(now: DateTime<Utc>, window: Duration, max_catch_up: Duration) -> Self {
        Self {
            now,
            window,
            max_catch_up,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.now + self.window
    }

    /// Due time of the definition if it falls into this window
    pub fn due_time(&self, job: &JobConfiguration) -> Option<DateTime<Utc>> {
        next_execution_time(job, self.now, self.max_catch_up).filter(|due| *due <= self.end())
    }
}

/// Next time the definition should run, or `None` when it never runs on its
/// own (queue followers, broken cron expressions)
pub fn next_execution_time(
    job: &JobConfiguration,
    now: DateTime<Utc>,
    max_catch_up: Duration,
) -> Option<DateTime<Utc>> {
    if job.is_queue_follower() && job.scheduling_type != SchedulingType::RunOnce {
        return None;
    }

    match job.scheduling_type {
        SchedulingType::RunOnce => Some(now),
        SchedulingType::FixedDelay => {
            let delay = Duration::seconds(job.delay?.max(0));
            let Some(finished) = job.last_finished else {
                return Some(now);
            };
            Some(next_delay_time(finished + delay, delay, now, max_catch_up))
        }
        SchedulingType::Cron => {
            let since = job
                .last_executed
                .map_or(now, |executed| executed + Duration::seconds(1));
            next_cron_time(job.cron_expression.as_deref()?, since, now, max_catch_up)
        }
        SchedulingType::QueueMember => None,
    }
}

/// Roll `due` forward in steps of `delay` past the catch-up window
fn next_delay_time(
    due: DateTime<Utc>,
    delay: Duration,
    now: DateTime<Utc>,
    max_catch_up: Duration,
) -> DateTime<Utc> {
    let earliest = now - max_catch_up;
    if due >= earliest {
        return due;
    }
    let step = delay.num_milliseconds();
    if step == 0 {
        return earliest;
    }
    let behind = (earliest - due).num_milliseconds();
    due + Duration::milliseconds((behind + step - 1) / step * step)
}

fn next_cron_time(
    expression: &str,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    max_catch_up: Duration,
) -> Option<DateTime<Utc>> {
    let cron = match parse_cron(expression) {
        Ok(cron) => cron,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping definition with unparsable cron expression");
            return None;
        }
    };

    // Occurrences older than the catch-up window are skipped
    let earliest = now - max_catch_up;
    let start = since.max(earliest);
    cron.find_next_occurrence(&start, true).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobType;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_cron_accepts_five_and_six_fields() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(matches!(
            parse_cron("every day"),
            Err(JobError::InvalidCronExpression(_))
        ));
    }

    #[test]
    fn test_run_once_is_due_immediately() {
        let job = JobConfiguration::new("once", JobType::Test);
        let now = at(10, 0, 0);
        assert_eq!(
            next_execution_time(&job, now, Duration::minutes(5)),
            Some(now)
        );
    }

    #[test]
    fn test_fixed_delay_counts_from_last_finish() {
        let now = at(10, 0, 0);
        let mut job = JobConfiguration::new("delay", JobType::Test).with_delay(60);
        assert_eq!(
            next_execution_time(&job, now, Duration::minutes(5)),
            Some(now)
        );

        job.last_finished = Some(at(9, 59, 30));
        assert_eq!(
            next_execution_time(&job, now, Duration::minutes(5)),
            Some(at(10, 0, 30))
        );
    }

    #[test]
    fn test_fixed_delay_catch_up_window_skips_old_due_times() {
        // finished two days ago, 60s delay, 60 minute catch-up window
        let now = at(12, 0, 0);
        let mut job = JobConfiguration::new("delay", JobType::Test).with_delay(60);
        job.last_finished = Some(now - Duration::days(2));

        let next = next_execution_time(&job, now, Duration::minutes(60)).unwrap();
        assert!(next >= now - Duration::minutes(60));
        assert!(next < now - Duration::minutes(59));
        assert_eq!((next - job.last_finished.unwrap()).num_seconds() % 60, 0);

        let window = DueWindow::new(now, Duration::seconds(20), Duration::minutes(60));
        assert_eq!(window.due_time(&job), Some(next));
    }

    #[test]
    fn test_fixed_delay_long_delay_lands_after_window() {
        // one day delay, last finished 50 hours ago: the missed slot is
        // older than the catch-up window, the next one is tomorrow
        let now = at(12, 0, 0);
        let mut job = JobConfiguration::new("daily", JobType::Test).with_delay(86_400);
        job.last_finished = Some(now - Duration::hours(50));

        let next = next_execution_time(&job, now, Duration::minutes(30)).unwrap();
        assert_eq!(next, now + Duration::hours(22));
        let window = DueWindow::new(now, Duration::seconds(20), Duration::minutes(30));
        assert_eq!(window.due_time(&job), None);
    }

    #[test]
    fn test_queue_follower_is_never_due_on_its_own() {
        let job = JobConfiguration::new("member", JobType::Test).in_queue("q", 1);
        let window = DueWindow::new(at(10, 0, 0), Duration::seconds(20), Duration::minutes(5));
        assert_eq!(window.due_time(&job), None);
    }

    #[test]
    fn test_cron_next_occurrence_after_last_execution() {
        let mut job = JobConfiguration::new("cron", JobType::Test).with_cron("0 * * * * *");
        job.last_executed = Some(at(10, 0, 0));
        assert_eq!(
            next_execution_time(&job, at(10, 0, 10), Duration::minutes(5)),
            Some(at(10, 1, 0))
        );
    }

    #[test]
    fn test_cron_catch_up_window_skips_old_occurrences() {
        // hourly job, last run 3 hours ago, 5 minute catch-up window
        let mut job = JobConfiguration::new("cron", JobType::Test).with_cron("0 0 * * * *");
        job.last_executed = Some(at(7, 0, 0));
        let now = at(10, 30, 0);

        let next = next_execution_time(&job, now, Duration::minutes(5)).unwrap();
        assert_eq!(next, at(11, 0, 0));

        let window = DueWindow::new(now, Duration::seconds(20), Duration::minutes(5));
        assert_eq!(window.due_time(&job), None);
    }

    #[test]
    fn test_cron_missed_occurrence_inside_catch_up_window_is_due() {
        let mut job = JobConfiguration::new("cron", JobType::Test).with_cron("0 0 * * * *");
        job.last_executed = Some(at(9, 0, 0));
        let now = at(10, 3, 0);

        let window = DueWindow::new(now, Duration::seconds(20), Duration::minutes(5));
        assert_eq!(window.due_time(&job), Some(at(10, 0, 0)));
    }

    #[test]
    fn test_cron_never_executed_waits_for_next_occurrence() {
        let job = JobConfiguration::new("cron", JobType::Test).with_cron("0 0 * * * *");
        let window = DueWindow::new(at(10, 59, 50), Duration::seconds(20), Duration::minutes(5));
        assert_eq!(window.due_time(&job), Some(at(11, 0, 0)));

        let window = DueWindow::new(at(10, 30, 0), Duration::seconds(20), Duration::minutes(5));
        assert_eq!(window.due_time(&job), None);
    }

    proptest! {
        #[test]
        fn prop_fixed_delay_due_time_never_older_than_catch_up(
            finished_offset in 0i64..604_800,
            delay in 0i64..7_200,
            catch_up_minutes in 1i64..120,
        ) {
            let now = at(12, 0, 0);
            let mut job = JobConfiguration::new("delay", JobType::Test).with_delay(delay);
            job.last_finished = Some(now - Duration::seconds(finished_offset));
            let max_catch_up = Duration::minutes(catch_up_minutes);

            let next = next_execution_time(&job, now, max_catch_up).unwrap();
            prop_assert!(next >= now - max_catch_up);
            prop_assert!(next >= job.last_finished.unwrap() + Duration::seconds(delay));
        }

        #[test]
        fn prop_cron_due_time_never_older_than_catch_up(
            last_offset in 0i64..86_400,
            catch_up_minutes in 1i64..120,
        ) {
            let now = at(12, 0, 0);
            let mut job = JobConfiguration::new("cron", JobType::Test).with_cron("0 */7 * * * *");
            job.last_executed = Some(now - Duration::seconds(last_offset));
            let max_catch_up = Duration::minutes(catch_up_minutes);

            let next = next_execution_time(&job, now, max_catch_up).unwrap();
            prop_assert!(next >= now - max_catch_up);
            prop_assert!(next > job.last_executed.unwrap());
        }

        #[test]
        fn prop_cron_due_time_is_monotonic_in_last_execution(
            a in 0i64..86_400,
            b in 0i64..86_400,
        ) {
            let now = at(12, 0, 0);
            let (earlier, later) = if a > b { (a, b) } else { (b, a) };
            let mut first = JobConfiguration::new("cron", JobType::Test).with_cron("0 */3 * * * *");
            let mut second = first.clone();
            first.last_executed = Some(now - Duration::seconds(earlier));
            second.last_executed = Some(now - Duration::seconds(later));

            let max_catch_up = Duration::minutes(30);
            let next_first = next_execution_time(&first, now, max_catch_up).unwrap();
            let next_second = next_execution_time(&second, now, max_catch_up).unwrap();
            prop_assert!(next_first <= next_second);
        }
    }
}
