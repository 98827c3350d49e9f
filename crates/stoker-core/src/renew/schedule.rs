//! Renewal scheduling arithmetic.
//!
//! All decisions about *when* a lease is renewed live here, as plain
//! functions over [`LeaseEntry`] state. The surrounding manager owns the
//! locking and task plumbing; nothing in this module blocks or allocates
//! beyond the entry map itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::CallError;
use crate::lease::{DURATION_ANY, Lease, LeaseKey, RenewalFailureListener};

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Map key ordering pending entries by scheduled renewal time, with the
/// entry id breaking ties. Ascending iteration visits the soonest
/// deadline first; reverse iteration visits the farthest.
pub(crate) type SlotKey = (i64, u64);

/// One managed lease and its renewal schedule.
pub(crate) struct LeaseEntry {
    /// Monotonic id, unique for the lifetime of the manager.
    pub id: u64,
    pub lease: Arc<dyn Lease>,
    /// Expiration the caller wants maintained.
    pub desired_expiration: i64,
    /// Duration to request per renewal, or [`DURATION_ANY`].
    pub renewal_duration: i64,
    /// Expiration most recently granted by the grantor.
    pub end_time: i64,
    /// When the next renewal should logically happen.
    pub renew_time: i64,
    /// When the next renewal will actually be dispatched, pulled earlier
    /// than `renew_time` when the task pool is contended.
    pub actual_renew: i64,
    /// Last indefinite failure, cleared by the next successful renewal.
    pub last_error: Option<CallError>,
    pub listener: Option<Arc<dyn RenewalFailureListener>>,
    /// Set when the entry was removed while its renewal was in flight;
    /// the completion is then discarded instead of rescheduled.
    pub doomed: bool,
}

impl LeaseEntry {
    pub fn new(
        id: u64,
        lease: Arc<dyn Lease>,
        desired_expiration: i64,
        renewal_duration: i64,
        listener: Option<Arc<dyn RenewalFailureListener>>,
    ) -> Self {
        let end_time = lease.expiration();
        Self {
            id,
            lease,
            desired_expiration,
            renewal_duration,
            end_time,
            renew_time: end_time,
            actual_renew: end_time,
            last_error: None,
            listener,
            doomed: false,
        }
    }

    pub fn key(&self) -> LeaseKey {
        LeaseKey::of(&self.lease)
    }

    pub fn slot(&self) -> SlotKey {
        (self.renew_time, self.id)
    }

    /// Whether the granted expiration already covers the caller's goal,
    /// so no further renewals are needed.
    pub fn renewals_done(&self) -> bool {
        self.end_time >= self.desired_expiration
    }

    /// Recompute `renew_time` from the current grant.
    ///
    /// The slack reserved before expiration scales with how long the
    /// grant is: short grants are renewed one round trip before they
    /// expire, longer ones proportionally earlier, and grants beyond two
    /// weeks are renewed three days ahead. The chosen slack is never less
    /// than one round trip.
    pub fn calc_renew_time(&mut self, now: i64, rtt: i64) {
        if self.renewals_done() {
            // Nothing left to renew. The entry stays queued until the
            // desired expiration so the drop can be reported.
            self.renew_time = self.desired_expiration;
            return;
        }
        let mut delta = self.end_time.saturating_sub(now);
        if delta <= 2 * rtt {
            delta = rtt;
        } else if delta <= 8 * rtt {
            delta /= 2;
        } else if delta <= 7 * DAY_MS {
            delta /= 8;
        } else if delta <= 14 * DAY_MS {
            delta = DAY_MS;
        } else {
            delta = 3 * DAY_MS;
        }
        self.renew_time = self.end_time.saturating_sub(delta);
    }

    /// Push `renew_time` later after an indefinite failure, retrying
    /// quickly near expiration and lazily when plenty of time remains.
    /// `renew_time` never moves past `end_time`.
    pub fn delay_renew_time(&mut self, rtt: i64) {
        let mut delta = self.end_time.saturating_sub(self.renew_time);
        if delta <= rtt {
            return;
        }
        if delta <= HOUR_MS {
            delta /= 3;
        } else if delta <= DAY_MS {
            delta = 30 * MINUTE_MS;
        } else if delta <= 7 * DAY_MS {
            delta = 3 * HOUR_MS;
        } else {
            delta = 8 * HOUR_MS;
        }
        self.renew_time = self.renew_time.saturating_add(delta);
    }

    /// Duration to request from the grantor for the renewal happening at
    /// `now`: the configured duration, clipped so the grant does not
    /// overshoot the desired expiration.
    pub fn request_duration(&self, now: i64) -> i64 {
        if self.renewal_duration == DURATION_ANY {
            DURATION_ANY
        } else {
            self.renewal_duration
                .min(self.desired_expiration.saturating_sub(now).max(1))
        }
    }

    /// Whether this entry (the one renewing later) may be folded into a
    /// batch built around `due`.
    ///
    /// Both leases must agree at the transport level, and both sides must
    /// tolerate being renewed at `due.renew_time` instead of their own
    /// schedule: either the side lets the grantor pick durations, or the
    /// two times are within half a round trip, or renewing early wastes
    /// less than half of that side's fixed duration.
    pub fn can_join_batch(&self, due: &LeaseEntry, rtt: i64) -> bool {
        if !self.lease.can_batch(due.lease.as_ref()) || !due.lease.can_batch(self.lease.as_ref()) {
            return false;
        }
        let gap = self.renew_time.saturating_sub(due.renew_time);
        let later_side = self.renewal_duration == DURATION_ANY
            || gap <= rtt / 2
            || self.end_time.saturating_sub(due.renew_time) <= self.renewal_duration / 2;
        let due_side = due.renewal_duration == DURATION_ANY
            || gap <= rtt / 2
            || due.end_time.saturating_sub(due.renew_time) <= due.renewal_duration / 2;
        later_side && due_side
    }
}

/// Recompute `actual_renew` for every pending entry and return the next
/// wakeup instant (the minimum over all entries).
///
/// Entries are visited from the farthest deadline to the nearest. Each
/// entry wants to run at its `renew_time`; when more than `max_slots`
/// already-assigned dispatch windows of width `rtt` would overlap it, the
/// entry is pulled earlier so its window starts one round trip before the
/// earliest tracked window. Entries whose renewals are done occupy no
/// dispatch slot, they only wake the queuer for removal.
pub(crate) fn calc_actual_renews(
    pending: &mut BTreeMap<SlotKey, LeaseEntry>,
    rtt: i64,
    max_slots: usize,
) -> i64 {
    let max_slots = max_slots.max(1);
    let mut slots: Vec<i64> = Vec::new();
    let mut next_wake = i64::MAX;

    for entry in pending.values_mut().rev() {
        if entry.renewals_done() {
            entry.actual_renew = entry.renew_time;
            next_wake = next_wake.min(entry.actual_renew);
            continue;
        }
        let mut actual = entry.renew_time;
        // Windows starting a full round trip after this one can no longer
        // overlap anything scheduled from here on.
        slots.retain(|slot| slot.saturating_sub(actual) < rtt);
        if slots.len() >= max_slots {
            let earliest = slots.iter().copied().min().unwrap_or(actual);
            actual = earliest.saturating_sub(rtt);
        }
        entry.actual_renew = actual;
        next_wake = next_wake.min(actual);
        slots.push(actual);
    }
    next_wake
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{FOREVER, LocalLease};

    const RTT: i64 = 10 * SECOND_MS;

    fn entry(id: u64, end_time: i64, desired: i64, duration: i64) -> LeaseEntry {
        let lease: Arc<dyn Lease> = Arc::new(LocalLease::new(end_time, SECOND_MS));
        let mut e = LeaseEntry::new(id, lease, desired, duration, None);
        e.end_time = end_time;
        e
    }

    fn batchable_entry(id: u64, end_time: i64, desired: i64, duration: i64) -> LeaseEntry {
        let lease: Arc<dyn Lease> =
            Arc::new(LocalLease::in_batch_group(end_time, SECOND_MS, "g"));
        let mut e = LeaseEntry::new(id, lease, desired, duration, None);
        e.end_time = end_time;
        e
    }

    #[test]
    fn short_grant_renews_one_round_trip_early() {
        // 15 s left: inside the 2*rtt band.
        let mut e = entry(1, 15 * SECOND_MS, FOREVER, DURATION_ANY);
        e.calc_renew_time(0, RTT);
        assert_eq!(e.renew_time, 15 * SECOND_MS - RTT);
    }

    #[test]
    fn medium_grant_renews_at_half() {
        // 60 s left: between 2*rtt and 8*rtt.
        let mut e = entry(1, 60 * SECOND_MS, FOREVER, DURATION_ANY);
        e.calc_renew_time(0, RTT);
        assert_eq!(e.renew_time, 30 * SECOND_MS);
    }

    #[test]
    fn long_grant_renews_at_seven_eighths() {
        // 1000 s left with a 10 s round trip falls in the divide-by-eight
        // band, so the renewal lands 125 s before expiration.
        let mut e = entry(1, 1_000 * SECOND_MS, FOREVER, DURATION_ANY);
        e.calc_renew_time(0, RTT);
        assert_eq!(e.renew_time, 1_000 * SECOND_MS - 125 * SECOND_MS);
    }

    #[test]
    fn week_scale_grant_renews_a_day_early() {
        let mut e = entry(1, 10 * DAY_MS, FOREVER, DURATION_ANY);
        e.calc_renew_time(0, RTT);
        assert_eq!(e.renew_time, 9 * DAY_MS);
    }

    #[test]
    fn open_ended_grant_renews_three_days_early() {
        let mut e = entry(1, 30 * DAY_MS, FOREVER, DURATION_ANY);
        e.calc_renew_time(0, RTT);
        assert_eq!(e.renew_time, 27 * DAY_MS);
    }

    #[test]
    fn slack_never_below_one_round_trip() {
        let boundaries = [
            1,
            RTT,
            2 * RTT,
            2 * RTT + 1,
            8 * RTT,
            8 * RTT + 1,
            7 * DAY_MS,
            7 * DAY_MS + 1,
            14 * DAY_MS,
            14 * DAY_MS + 1,
            90 * DAY_MS,
        ];
        for delta in boundaries {
            let mut e = entry(1, delta, FOREVER, DURATION_ANY);
            e.calc_renew_time(0, RTT);
            assert!(
                e.end_time - e.renew_time >= RTT,
                "delta {delta} left only {} ms of slack",
                e.end_time - e.renew_time
            );
        }
    }

    #[test]
    fn done_entry_parks_at_desired_expiration() {
        let mut e = entry(1, 500 * SECOND_MS, 400 * SECOND_MS, DURATION_ANY);
        e.calc_renew_time(0, RTT);
        assert!(e.renewals_done());
        assert_eq!(e.renew_time, 400 * SECOND_MS);
    }

    #[test]
    fn expired_grant_schedules_immediately() {
        // Grant already in the past: the computed renew time is also in
        // the past, so the queuer wakes at once and drops the lease.
        let mut e = entry(1, -5 * SECOND_MS, FOREVER, DURATION_ANY);
        e.calc_renew_time(0, RTT);
        assert!(e.renew_time <= 0);
    }

    #[test]
    fn backoff_leaves_tight_schedules_alone() {
        let mut e = entry(1, 100 * SECOND_MS, FOREVER, DURATION_ANY);
        e.renew_time = 100 * SECOND_MS - RTT;
        e.delay_renew_time(RTT);
        assert_eq!(e.renew_time, 100 * SECOND_MS - RTT);
    }

    #[test]
    fn backoff_retries_thirds_within_an_hour() {
        let mut e = entry(1, 30 * MINUTE_MS, FOREVER, DURATION_ANY);
        e.renew_time = 0;
        e.delay_renew_time(RTT);
        assert_eq!(e.renew_time, 10 * MINUTE_MS);
    }

    #[test]
    fn backoff_steps_by_half_hour_within_a_day() {
        let mut e = entry(1, 10 * HOUR_MS, FOREVER, DURATION_ANY);
        e.renew_time = 0;
        e.delay_renew_time(RTT);
        assert_eq!(e.renew_time, 30 * MINUTE_MS);
    }

    #[test]
    fn backoff_steps_by_three_hours_within_a_week() {
        let mut e = entry(1, 3 * DAY_MS, FOREVER, DURATION_ANY);
        e.renew_time = 0;
        e.delay_renew_time(RTT);
        assert_eq!(e.renew_time, 3 * HOUR_MS);
    }

    #[test]
    fn backoff_steps_by_eight_hours_beyond_a_week() {
        let mut e = entry(1, 30 * DAY_MS, FOREVER, DURATION_ANY);
        e.renew_time = 0;
        e.delay_renew_time(RTT);
        assert_eq!(e.renew_time, 8 * HOUR_MS);
    }

    #[test]
    fn backoff_never_passes_end_time() {
        let mut e = entry(1, 2 * HOUR_MS, FOREVER, DURATION_ANY);
        e.renew_time = 0;
        for _ in 0..64 {
            e.delay_renew_time(RTT);
            assert!(e.renew_time <= e.end_time);
        }
    }

    #[test]
    fn request_duration_forwards_any() {
        let e = entry(1, SECOND_MS, FOREVER, DURATION_ANY);
        assert_eq!(e.request_duration(0), DURATION_ANY);
    }

    #[test]
    fn request_duration_clips_to_desired() {
        let e = entry(1, SECOND_MS, 90 * SECOND_MS, 60 * SECOND_MS);
        assert_eq!(e.request_duration(0), 60 * SECOND_MS);
        assert_eq!(e.request_duration(50 * SECOND_MS), 40 * SECOND_MS);
    }

    #[test]
    fn batching_requires_transport_consent() {
        let due = entry(1, 60 * SECOND_MS, FOREVER, DURATION_ANY);
        let mut later = entry(2, 61 * SECOND_MS, FOREVER, DURATION_ANY);
        later.renew_time = due.renew_time;
        assert!(!later.can_join_batch(&due, RTT));
    }

    #[test]
    fn grantor_chosen_durations_batch_freely() {
        let mut due = batchable_entry(1, 60 * SECOND_MS, FOREVER, DURATION_ANY);
        let mut later = batchable_entry(2, 400 * SECOND_MS, FOREVER, DURATION_ANY);
        due.calc_renew_time(0, RTT);
        later.calc_renew_time(0, RTT);
        assert!(later.renew_time > due.renew_time);
        assert!(later.can_join_batch(&due, RTT));
    }

    #[test]
    fn near_simultaneous_fixed_durations_batch() {
        let mut due = batchable_entry(1, 60 * SECOND_MS, FOREVER, 60 * SECOND_MS);
        let mut later = batchable_entry(2, 60 * SECOND_MS + RTT / 4, FOREVER, 60 * SECOND_MS);
        due.calc_renew_time(0, RTT);
        later.calc_renew_time(0, RTT);
        assert!(later.renew_time - due.renew_time <= RTT / 2);
        assert!(later.can_join_batch(&due, RTT));
    }

    #[test]
    fn distant_fixed_duration_does_not_batch() {
        // Renewing the later lease now would throw away most of its fixed
        // duration, so it stays on its own schedule.
        let mut due = batchable_entry(1, 60 * SECOND_MS, FOREVER, 60 * SECOND_MS);
        let mut later = batchable_entry(2, 600 * SECOND_MS, FOREVER, 60 * SECOND_MS);
        due.calc_renew_time(0, RTT);
        later.calc_renew_time(0, RTT);
        assert!(!later.can_join_batch(&due, RTT));
    }

    fn pending_of(entries: Vec<LeaseEntry>) -> BTreeMap<SlotKey, LeaseEntry> {
        entries.into_iter().map(|e| (e.slot(), e)).collect()
    }

    #[test]
    fn uncontended_entries_keep_preferred_times() {
        let mut pending = pending_of(
            (0..3)
                .map(|i| {
                    let mut e = entry(i, (100 + 100 * i as i64) * SECOND_MS, FOREVER, DURATION_ANY);
                    e.calc_renew_time(0, RTT);
                    e
                })
                .collect(),
        );
        let wake = calc_actual_renews(&mut pending, RTT, 4);
        for e in pending.values() {
            assert_eq!(e.actual_renew, e.renew_time);
        }
        let min_renew = pending.values().map(|e| e.renew_time).min().unwrap();
        assert_eq!(wake, min_renew);
    }

    #[test]
    fn contended_entries_spread_by_one_round_trip() {
        // Three renewals due at the same instant with a single dispatch
        // slot: each successive one is pulled a round trip earlier.
        let mut pending = pending_of(
            (0..3)
                .map(|i| {
                    let mut e = entry(i, 100 * SECOND_MS, FOREVER, DURATION_ANY);
                    e.renew_time = 60 * SECOND_MS;
                    e
                })
                .collect(),
        );
        let wake = calc_actual_renews(&mut pending, RTT, 1);
        let mut actuals: Vec<i64> = pending.values().map(|e| e.actual_renew).collect();
        actuals.sort_unstable();
        assert_eq!(
            actuals,
            vec![60 * SECOND_MS - 2 * RTT, 60 * SECOND_MS - RTT, 60 * SECOND_MS]
        );
        assert_eq!(wake, 60 * SECOND_MS - 2 * RTT);
    }

    #[test]
    fn pulled_windows_never_exceed_slot_bound() {
        let mut pending = pending_of(
            (0..8)
                .map(|i| {
                    let mut e = entry(i, 100 * SECOND_MS, FOREVER, DURATION_ANY);
                    e.renew_time = 60 * SECOND_MS + (i as i64 % 3) * (RTT / 4);
                    e
                })
                .collect(),
        );
        calc_actual_renews(&mut pending, RTT, 2);
        let actuals: Vec<i64> = pending.values().map(|e| e.actual_renew).collect();
        for &a in &actuals {
            let overlapping = actuals
                .iter()
                .filter(|&&b| (b - a).abs() < RTT)
                .count();
            assert!(
                overlapping <= 2,
                "window at {a} overlaps {overlapping} windows"
            );
        }
    }

    #[test]
    fn done_entries_occupy_no_slot() {
        let mut done = entry(0, 50 * SECOND_MS, 40 * SECOND_MS, DURATION_ANY);
        done.calc_renew_time(0, RTT);
        let mut live = entry(1, 100 * SECOND_MS, FOREVER, DURATION_ANY);
        live.renew_time = 40 * SECOND_MS;
        let mut pending = pending_of(vec![done, live]);
        let wake = calc_actual_renews(&mut pending, RTT, 1);
        // The live entry keeps its preferred time even though the done
        // entry parks at the same instant.
        for e in pending.values() {
            assert_eq!(e.actual_renew, 40 * SECOND_MS);
        }
        assert_eq!(wake, 40 * SECOND_MS);
    }
}
