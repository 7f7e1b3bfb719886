//! Archive retention selection for keep-daily / keep-monthly / keep-yearly.
//!
//! Mirrors the archiving tool's documented prune rules so the pipeline can
//! reason about (and tests can check) which archives a prune keeps:
//!
//! - rules apply in the order daily, monthly, yearly;
//! - each rule walks archives newest first and keeps the newest archive of
//!   every period it has not seen yet, until it has kept `n` archives;
//! - an archive already kept by an earlier rule still claims its period for
//!   the later rule but does not count against that rule's `n`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Default keep counts.
pub const DEFAULT_KEEP_DAILY: u32 = 7;
pub const DEFAULT_KEEP_MONTHLY: u32 = 6;
pub const DEFAULT_KEEP_YEARLY: u32 = 1;

/// Retention counts for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_daily: DEFAULT_KEEP_DAILY,
            keep_monthly: DEFAULT_KEEP_MONTHLY,
            keep_yearly: DEFAULT_KEEP_YEARLY,
        }
    }
}

impl RetentionPolicy {
    /// `true` when every count is zero, i.e. nothing would be kept.
    pub fn keeps_nothing(&self) -> bool {
        self.keep_daily == 0 && self.keep_monthly == 0 && self.keep_yearly == 0
    }

    fn rules(&self) -> [(u32, &'static str); 3] {
        [
            (self.keep_daily, "%Y-%m-%d"),
            (self.keep_monthly, "%Y-%m"),
            (self.keep_yearly, "%Y"),
        ]
    }
}

/// Return the indices of `archives` (by timestamp) that survive a prune.
///
/// The input order does not matter. Indices are returned sorted ascending.
pub fn select_kept(archives: &[Timestamp], policy: &RetentionPolicy) -> Vec<usize> {
    let mut order: Vec<usize> = (0..archives.len()).collect();
    order.sort_by(|a, b| archives[*b].cmp(&archives[*a]));

    let mut kept: HashSet<usize> = HashSet::new();

    for (count, pattern) in policy.rules() {
        if count == 0 {
            continue;
        }
        let mut kept_by_rule = 0;
        let mut last_period: Option<String> = None;
        for &idx in &order {
            let period = archives[idx].format(pattern).to_string();
            if last_period.as_deref() == Some(period.as_str()) {
                continue;
            }
            last_period = Some(period);
            if kept.insert(idx) {
                kept_by_rule += 1;
                if kept_by_rule == count {
                    break;
                }
            }
        }
    }

    let mut result: Vec<usize> = kept.into_iter().collect();
    result.sort_unstable();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn daily_series(days: i64) -> Vec<Timestamp> {
        let newest = Utc.with_ymd_and_hms(2024, 6, 30, 2, 0, 0).unwrap();
        (0..days).map(|d| newest - Duration::days(d)).collect()
    }

    #[test]
    fn keeps_everything_when_fewer_than_daily_count() {
        let archives = daily_series(5);
        assert_eq!(
            select_kept(&archives, &RetentionPolicy::default()),
            vec![0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn default_policy_over_two_years_of_dailies() {
        // 2024-06-30 back to 2022-06-30.
        let archives = daily_series(731);
        let kept = select_kept(&archives, &RetentionPolicy::default());
        let kept_dates: Vec<String> = kept
            .iter()
            .map(|i| archives[*i].format("%Y-%m-%d").to_string())
            .collect();

        // 7 newest days.
        for d in 24..=30 {
            assert!(kept_dates.contains(&format!("2024-06-{d:02}")));
        }
        // June's period is claimed by 06-30, so monthly picks the last day
        // of the six preceding months.
        for m in [
            "2024-05-31",
            "2024-04-30",
            "2024-03-31",
            "2024-02-29",
            "2024-01-31",
            "2023-12-31",
        ] {
            assert!(kept_dates.contains(&m.to_string()), "missing {m}");
        }
        // 2024 and 2023 are claimed by archives already kept, so the single
        // yearly slot goes to the end of 2022.
        assert!(kept_dates.contains(&"2022-12-31".to_string()));
        assert_eq!(kept.len(), 7 + 6 + 1);
    }

    #[test]
    fn several_archives_per_day_keep_only_newest() {
        let base = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let archives = vec![
            base + Duration::hours(1),
            base + Duration::hours(12),
            base + Duration::hours(23),
            base - Duration::hours(1),
        ];
        let policy = RetentionPolicy {
            keep_daily: 2,
            keep_monthly: 0,
            keep_yearly: 0,
        };
        assert_eq!(select_kept(&archives, &policy), vec![2, 3]);
    }

    #[test]
    fn input_order_does_not_matter() {
        let mut archives = daily_series(40);
        let policy = RetentionPolicy::default();
        let expected: HashSet<Timestamp> = select_kept(&archives, &policy)
            .into_iter()
            .map(|i| archives[i])
            .collect();
        archives.reverse();
        let actual: HashSet<Timestamp> = select_kept(&archives, &policy)
            .into_iter()
            .map(|i| archives[i])
            .collect();
        assert_eq!(expected, actual);
    }

    #[test]
    fn zero_policy_keeps_nothing() {
        let policy = RetentionPolicy {
            keep_daily: 0,
            keep_monthly: 0,
            keep_yearly: 0,
        };
        assert!(policy.keeps_nothing());
        assert!(select_kept(&daily_series(10), &policy).is_empty());
    }
}
