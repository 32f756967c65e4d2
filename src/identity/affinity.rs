//! Time-of-day affinity
//!
//! Each identity prefers one hour of the day. Its score for the current hour
//! is a Gaussian of the distance to that slot, wrapped around midnight so
//! 23:00 and 01:00 are two hours apart.

use chrono::{DateTime, TimeZone, Timelike};
use statrs::distribution::{Continuous, Normal};
use std::cmp::Ordering;

use crate::models::Identity;

const HOURS_PER_DAY: f64 = 24.0;

/// Affinity between `hour` and a preferred `slot`, both in hours
///
/// The density is summed at `hour` and one day either side, so the score is
/// symmetric across midnight whichever side of it the slot falls on.
pub fn affinity(hour: f64, slot: f64, sigma: f64) -> f64 {
    let Ok(normal) = Normal::new(slot, sigma) else {
        return 0.0;
    };
    normal.pdf(hour) + normal.pdf(hour + HOURS_PER_DAY) + normal.pdf(hour - HOURS_PER_DAY)
}

/// Fractional hour of day of a timestamp in its own time zone
pub fn hour_of_day<Tz: TimeZone>(at: &DateTime<Tz>) -> f64 {
    f64::from(at.hour()) + f64::from(at.minute()) / 60.0 + f64::from(at.second()) / 3600.0
}

/// Identities off cooldown, best match for `hour` first
///
/// Ties go to the identity rested longest.
pub fn rank_candidates(
    identities: &[Identity],
    now_epoch: f64,
    hour: f64,
    cooldown_secs: f64,
    sigma: f64,
) -> Vec<Identity> {
    let mut scored: Vec<(f64, &Identity)> = identities
        .iter()
        .filter(|identity| now_epoch - identity.last_used >= cooldown_secs)
        .map(|identity| (affinity(hour, identity.preferred_slot, sigma), identity))
        .collect();

    scored.sort_by(|(a_score, a), (b_score, b)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.last_used
                    .partial_cmp(&b.last_used)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.name.cmp(&b.name))
    });

    scored.into_iter().map(|(_, identity)| identity.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    const DAY: f64 = 86_400.0;

    #[test]
    fn test_affinity_peaks_at_slot() {
        let at_slot = affinity(10.0, 10.0, 2.0);
        assert!(at_slot > affinity(11.0, 10.0, 2.0));
        assert!(affinity(11.0, 10.0, 2.0) > affinity(14.0, 10.0, 2.0));
    }

    #[test]
    fn test_affinity_wraps_midnight() {
        let across = affinity(23.0, 1.0, 2.0);
        let same_side = affinity(3.0, 1.0, 2.0);
        assert!((across - same_side).abs() < 1e-9);

        let late_slot = affinity(1.0, 23.0, 2.0);
        assert!((late_slot - same_side).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_sigma_scores_zero() {
        assert_eq!(affinity(1.0, 1.0, 0.0), 0.0);
    }

    #[test]
    fn test_hour_of_day() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let at = tz.with_ymd_and_hms(2024, 3, 1, 13, 30, 0).unwrap();
        assert!((hour_of_day(&at) - 13.5).abs() < 1e-9);
    }

    #[test]
    fn test_two_hours_beats_fourteen() {
        let now = Utc::now().timestamp() as f64;
        let hour = 8.0;
        let identities = vec![
            Identity::new("far.ovpn", 22.0, now - 2.0 * DAY),
            Identity::new("near.ovpn", 10.0, now - 2.0 * DAY),
        ];

        let ranked = rank_candidates(&identities, now, hour, DAY, 2.0);
        assert_eq!(ranked[0].name, "near.ovpn");
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_cooldown_filters_recent_identities() {
        let now = 1_700_000_000.0;
        let identities = vec![
            Identity::new("recent.ovpn", 8.0, now - 3600.0),
            Identity::new("rested.ovpn", 20.0, now - DAY - 1.0),
        ];

        let ranked = rank_candidates(&identities, now, 8.0, DAY, 2.0);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "rested.ovpn");

        assert!(rank_candidates(&identities[..1], now, 8.0, DAY, 2.0).is_empty());
    }

    #[test]
    fn test_ties_prefer_longest_rested() {
        let now = 1_700_000_000.0;
        let identities = vec![
            Identity::new("b.ovpn", 8.0, now - 2.0 * DAY),
            Identity::new("a.ovpn", 8.0, now - 5.0 * DAY),
        ];
        let ranked = rank_candidates(&identities, now, 8.0, DAY, 2.0);
        assert_eq!(ranked[0].name, "a.ovpn");
    }
}
