//! Timeout pool implementation

use std::collections::{BTreeSet, HashMap};

/// Timer handle
///
/// Handles are allocated from a counter starting at 1 and are never reused
/// for the lifetime of a pool.
pub type TimerId = u64;

/// Firings in one sweep above which [`TimeoutPool::pop_expired`] warns
///
/// A repeating event swept late yields one firing per missed interval, so a
/// large batch usually means the caller stalled.
pub const CATCH_UP_WARN_FIRINGS: usize = 1024;

#[derive(Debug, Clone)]
struct Entry<P> {
    /// Next firing time
    expiration: u64,
    /// Re-arm interval, `None` for one-shot events
    repeat_interval: Option<u64>,
    /// Caller data returned on firing
    payload: P,
}

/// A fired event returned by [`TimeoutPool::pop_expired`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired<P> {
    /// Handle of the event
    pub id: TimerId,
    /// Time at which this firing was scheduled
    pub expiration: u64,
    /// Caller data
    pub payload: P,
}

/// Keyed pool of expiration events
///
/// Events are indexed twice: by handle for cancellation and by
/// `(expiration, handle)` for ordered extraction.
pub struct TimeoutPool<P> {
    /// All pending events by handle
    entries: HashMap<TimerId, Entry<P>>,
    /// Pending events ordered by expiration, ties broken by handle
    by_expiration: BTreeSet<(u64, TimerId)>,
    /// Next handle to hand out
    next_id: TimerId,
}

impl<P> TimeoutPool<P> {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty pool with room for `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            by_expiration: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Schedule a one-shot event at `now + delay`
    pub fn add(&mut self, now: u64, delay: u64, payload: P) -> TimerId {
        self.insert(now.saturating_add(delay), None, payload)
    }

    /// Schedule a repeating event first firing at `now + interval`
    ///
    /// Every firing re-arms the event at `firing_time + interval`. A zero
    /// interval is raised to 1ms.
    ///
    /// Missed firings are never coalesced: a sweep that runs `d` ms late
    /// returns `d / interval` entries for this event and costs as much. Pick
    /// the interval against the longest stall the caller can have.
    pub fn add_repeating(&mut self, now: u64, interval: u64, payload: P) -> TimerId {
        let interval = if interval == 0 {
            tracing::warn!("zero repeat interval raised to 1ms");
            1
        } else {
            interval
        };
        self.insert(now.saturating_add(interval), Some(interval), payload)
    }

    fn insert(&mut self, expiration: u64, repeat_interval: Option<u64>, payload: P) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.entries.insert(
            id,
            Entry {
                expiration,
                repeat_interval,
                payload,
            },
        );
        self.by_expiration.insert((expiration, id));

        tracing::trace!(timer_id = id, expiration, ?repeat_interval, "timer added");
        id
    }

    /// Remove a pending event
    ///
    /// Returns whether the event existed. Cancelling an unknown, fired or
    /// already cancelled handle returns `false`.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.by_expiration.remove(&(entry.expiration, id));
                tracing::trace!(timer_id = id, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Earliest pending expiration, if any
    pub fn next_expiration(&self) -> Option<u64> {
        self.by_expiration.first().map(|&(expiration, _)| expiration)
    }

    /// Scheduled expiration of a pending event
    pub fn expiration_of(&self, id: TimerId) -> Option<u64> {
        self.entries.get(&id).map(|entry| entry.expiration)
    }

    /// Check whether a handle is pending
    pub fn contains(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no events are pending
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every pending event
    ///
    /// The handle counter keeps running so old handles stay dead.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_expiration.clear();
    }
}

impl<P: Clone> TimeoutPool<P> {
    /// Remove and return every event expired at `now`
    ///
    /// Events come back in ascending expiration order. A repeating event is
    /// re-armed before the batch is returned, and a late call returns one
    /// entry per missed firing. Cancelling a handle while the batch is being
    /// handled only affects firings after it.
    pub fn pop_expired(&mut self, now: u64) -> Vec<Expired<P>> {
        let mut expired = Vec::new();

        while let Some(&(expiration, id)) = self.by_expiration.first() {
            if expiration > now {
                break;
            }
            self.by_expiration.remove(&(expiration, id));

            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };

            match entry.repeat_interval {
                Some(interval) => {
                    let next = expiration.saturating_add(interval);
                    let payload = entry.payload.clone();
                    if next > expiration {
                        entry.expiration = next;
                        self.by_expiration.insert((next, id));
                    } else {
                        // Saturated at the end of time, cannot re-arm
                        self.entries.remove(&id);
                    }
                    expired.push(Expired {
                        id,
                        expiration,
                        payload,
                    });
                }
                None => {
                    if let Some(entry) = self.entries.remove(&id) {
                        expired.push(Expired {
                            id,
                            expiration,
                            payload: entry.payload,
                        });
                    }
                }
            }
        }

        if expired.len() > CATCH_UP_WARN_FIRINGS {
            tracing::warn!(
                now,
                fired = expired.len(),
                threshold = CATCH_UP_WARN_FIRINGS,
                "timer sweep fell behind"
            );
        } else if !expired.is_empty() {
            tracing::trace!(now, fired = expired.len(), "timers expired");
        }
        expired
    }
}

impl<P> Default for TimeoutPool<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> std::fmt::Debug for TimeoutPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutPool")
            .field("pending", &self.entries.len())
            .field("next_expiration", &self.next_expiration())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_sequential() {
        let mut pool = TimeoutPool::new();
        let now = 1_000;

        assert_eq!(pool.add(now, 5, ()), 1);
        assert_eq!(pool.add_repeating(now, 10, ()), 2);
        assert_eq!(pool.add_repeating(now, 15, ()), 3);
        assert_eq!(pool.add(now, 20, ()), 4);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_next_expiration() {
        let mut pool = TimeoutPool::new();
        assert_eq!(pool.next_expiration(), None);

        let a = pool.add(100, 50, 'a');
        pool.add(100, 20, 'b');
        assert_eq!(pool.next_expiration(), Some(120));

        pool.cancel(a);
        assert_eq!(pool.next_expiration(), Some(120));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_pop_expired_in_order() {
        let mut pool = TimeoutPool::new();
        pool.add(0, 30, "c");
        pool.add(0, 10, "a");
        pool.add(0, 20, "b");
        pool.add(0, 40, "d");

        let fired = pool.pop_expired(30);
        let payloads: Vec<_> = fired.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["a", "b", "c"]);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.next_expiration(), Some(40));
    }

    #[test]
    fn test_pop_expired_boundary_is_inclusive() {
        let mut pool = TimeoutPool::new();
        pool.add(0, 100, ());
        assert!(pool.pop_expired(99).is_empty());
        assert_eq!(pool.pop_expired(100).len(), 1);
    }

    #[test]
    fn test_pop_expired_empty() {
        let mut pool: TimeoutPool<()> = TimeoutPool::new();
        assert!(pool.pop_expired(u64::MAX).is_empty());
    }

    #[test]
    fn test_repeating_rearms() {
        let mut pool = TimeoutPool::new();
        let id = pool.add_repeating(0, 10, ());

        let fired = pool.pop_expired(10);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].expiration, 10);
        assert!(pool.contains(id));
        assert_eq!(pool.expiration_of(id), Some(20));
    }

    #[test]
    fn test_repeating_catch_up() {
        let mut pool = TimeoutPool::new();
        let t = 1_000;
        let interval = 100;
        let id = pool.add_repeating(t, interval, ());

        let fired = pool.pop_expired(t + 2 * interval + interval / 2);
        let times: Vec<_> = fired.iter().map(|e| e.expiration).collect();
        assert_eq!(times, vec![t + interval, t + 2 * interval]);
        assert!(fired.iter().all(|e| e.id == id));
        assert_eq!(pool.expiration_of(id), Some(t + 3 * interval));
    }

    #[test]
    fn test_cancel_after_firing_suppresses_future() {
        let mut pool = TimeoutPool::new();
        let id = pool.add_repeating(0, 10, ());

        let fired = pool.pop_expired(10);
        assert_eq!(fired.len(), 1);
        assert!(pool.cancel(id));
        assert!(pool.pop_expired(100).is_empty());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut pool = TimeoutPool::new();
        let id = pool.add(0, 10, ());
        assert!(pool.cancel(id));
        assert!(!pool.cancel(id));
        assert!(!pool.cancel(id));
    }

    #[test]
    fn test_cancel_fired_one_shot() {
        let mut pool = TimeoutPool::new();
        let id = pool.add(0, 10, ());
        pool.pop_expired(10);
        assert!(!pool.cancel(id));
        assert!(!pool.cancel(id));
    }

    #[test]
    fn test_zero_interval_raised() {
        let mut pool = TimeoutPool::new();
        pool.add_repeating(0, 0, ());
        assert_eq!(pool.next_expiration(), Some(1));
        assert_eq!(pool.pop_expired(3).len(), 3);
    }

    #[test]
    fn test_saturated_repeating_is_dropped() {
        let mut pool = TimeoutPool::new();
        let id = pool.add_repeating(u64::MAX - 5, 10, ());
        assert_eq!(pool.next_expiration(), Some(u64::MAX));
        assert_eq!(pool.pop_expired(u64::MAX).len(), 1);
        assert!(!pool.contains(id));
    }

    #[test]
    fn test_late_sweep_catches_up_every_interval() {
        let mut pool = TimeoutPool::new();
        let id = pool.add_repeating(0, 1, ());

        let fired = pool.pop_expired(5_000);
        assert!(fired.len() > CATCH_UP_WARN_FIRINGS);
        assert_eq!(fired.len(), 5_000);
        assert_eq!(fired[0].expiration, 1);
        assert_eq!(fired[4_999].expiration, 5_000);
        assert!(fired.iter().all(|e| e.id == id));

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.next_expiration(), Some(5_001));
        assert!(pool.pop_expired(5_000).is_empty());
    }

    #[test]
    fn test_clear_keeps_counter() {
        let mut pool = TimeoutPool::new();
        pool.add(0, 1, ());
        pool.add(0, 2, ());
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.next_expiration(), None);
        assert_eq!(pool.add(0, 1, ()), 3);
    }
}
