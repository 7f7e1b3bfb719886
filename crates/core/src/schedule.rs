//! Due-check used by the scheduler on every poll.
//!
//! A job is due at time `now` when its latest fire time `prev <= now` is
//! still inside the grace window, no run of the job started in
//! `[prev, now]`, and the job is not already running in this process. The
//! first condition is decided here; the other two need the run history and
//! the in-memory running set, so [`due_tick`] only returns the candidate
//! tick and the caller finishes the check.

use std::time::Duration;

use crate::cron::CronExpr;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default scheduler polling cadence.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default grace window. One poll interval plus slack so that a tick is
/// always seen by at least one poll.
pub const DEFAULT_GRACE_WINDOW_SECS: u64 = 61;

/// Default sleep after a poll that failed to read the job store.
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Due-check
// ---------------------------------------------------------------------------

/// Return the fire time `now` falls under, if it is still within `grace`.
///
/// `None` means the latest tick is older than the grace window (missed) or
/// the expression never fires.
pub fn due_tick(expr: &CronExpr, now: Timestamp, grace: Duration) -> Option<Timestamp> {
    let prev = expr.prev_fire(&now)?;
    let elapsed = (now - prev).to_std().ok()?;
    (elapsed <= grace).then_some(prev)
}

/// Check that a grace window covers at least one poll interval.
///
/// A shorter window lets a tick fall between two polls and never run.
pub fn grace_covers_interval(grace: Duration, poll_interval: Duration) -> bool {
    grace >= poll_interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn grace() -> Duration {
        Duration::from_secs(DEFAULT_GRACE_WINDOW_SECS)
    }

    #[test]
    fn due_five_seconds_after_tick() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 5).unwrap();
        assert_eq!(
            due_tick(&expr, now, grace()),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn due_exactly_at_grace_boundary() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 2, 1, 1).unwrap();
        assert!(due_tick(&expr, now, grace()).is_some());
    }

    #[test]
    fn not_due_after_grace_window() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 2, 1, 2).unwrap();
        assert_eq!(due_tick(&expr, now, grace()), None);
    }

    #[test]
    fn every_poll_in_grace_window_sees_same_tick() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        let tick = Utc.with_ymd_and_hms(2024, 1, 15, 10, 15, 0).unwrap();
        for offset in [0, 30, 60] {
            let now = tick + chrono::Duration::seconds(offset);
            assert_eq!(due_tick(&expr, now, grace()), Some(tick));
        }
    }

    #[test]
    fn polls_every_interval_never_skip_a_tick() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        let poll = Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS);
        // Start at an odd offset so polls never line up with the tick.
        let mut now = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 17).unwrap();
        let end = now + chrono::Duration::hours(3);
        let mut seen = std::collections::BTreeSet::new();
        while now < end {
            if let Some(tick) = due_tick(&expr, now, grace()) {
                seen.insert(tick);
            }
            now += chrono::Duration::from_std(poll).unwrap();
        }
        assert_eq!(seen.len(), 12);
    }

    #[test]
    fn grace_must_cover_interval() {
        assert!(grace_covers_interval(
            Duration::from_secs(61),
            Duration::from_secs(30)
        ));
        assert!(!grace_covers_interval(
            Duration::from_secs(10),
            Duration::from_secs(30)
        ));
    }
}
