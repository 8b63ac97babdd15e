//! Per-worker timer wheel.
//!
//! Entries carry an interval and a repeat count (`-1` = forever). The wheel
//! is a binary heap ordered by deadline with an insertion sequence tiebreak,
//! so timers sharing a deadline fire in FIFO order. Removal is lazy: a
//! cancelled id is skipped when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// What a session-correlated timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionFire {
    /// Resume the session normally (a `sleep` completing).
    Wake,
    /// Resume the session with a timeout error, cancelling the slot.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// A user timer delivered through the service's timer callback.
    User,
    /// An internal single-shot timer bound to a suspended session.
    Session { session: i32, fire: SessionFire },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    next_fire: i64,
    seq: u64,
    id: u32,
    owner: u32,
    interval_ms: u32,
    remaining: i32,
    kind: TimerKind,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.next_fire, self.seq).cmp(&(other.next_fire, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One expiration handed back to the worker.
#[derive(Debug)]
pub(crate) struct Fired {
    pub id: u32,
    pub owner: u32,
    pub kind: TimerKind,
    pub is_last: bool,
}

#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Reverse<Entry>>,
    cancelled: HashSet<u32>,
    live: HashSet<u32>,
    next_id: u32,
    seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.live.contains(&self.next_id) {
                return self.next_id;
            }
        }
    }

    fn push(&mut self, mut entry: Entry) {
        self.seq += 1;
        entry.seq = self.seq;
        self.heap.push(Reverse(entry));
    }

    /// Arm a repeating timer. `times == -1` repeats until removed.
    pub fn repeated(&mut self, owner: u32, interval_ms: u32, times: i32, now_ms: i64) -> u32 {
        let id = self.alloc_id();
        self.live.insert(id);
        self.push(Entry {
            next_fire: now_ms + i64::from(interval_ms),
            seq: 0,
            id,
            owner,
            interval_ms,
            remaining: times,
            kind: TimerKind::User,
        });
        id
    }

    /// Arm a single-shot timer that resumes `session` on expiry.
    pub fn once_session(
        &mut self,
        owner: u32,
        session: i32,
        fire: SessionFire,
        delay_ms: u32,
        now_ms: i64,
    ) -> u32 {
        let id = self.alloc_id();
        self.live.insert(id);
        self.push(Entry {
            next_fire: now_ms + i64::from(delay_ms),
            seq: 0,
            id,
            owner,
            interval_ms: delay_ms,
            remaining: 1,
            kind: TimerKind::Session { session, fire },
        });
        id
    }

    /// Cancel by id; safe to call from a timer's own fire.
    pub fn remove(&mut self, id: u32) {
        if self.live.remove(&id) {
            self.cancelled.insert(id);
        }
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.heap.peek().map(|Reverse(e)| e.next_fire)
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Pop every due entry, rescheduling repeats. The returned list is in
    /// fire order.
    pub fn fire(&mut self, now_ms: i64) -> Vec<Fired> {
        let mut fired = Vec::new();

        while let Some(Reverse(entry)) = self.heap.peek().copied() {
            if entry.next_fire > now_ms {
                break;
            }
            self.heap.pop();

            if self.cancelled.remove(&entry.id) {
                continue;
            }

            let remaining = if entry.remaining > 0 {
                entry.remaining - 1
            } else {
                entry.remaining
            };
            let is_last = remaining == 0;

            if is_last {
                self.live.remove(&entry.id);
            } else {
                self.push(Entry {
                    next_fire: entry.next_fire + i64::from(entry.interval_ms),
                    remaining,
                    ..entry
                });
            }

            fired.push(Fired {
                id: entry.id,
                owner: entry.owner,
                kind: entry.kind,
                is_last,
            });
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let slow = wheel.repeated(1, 200, 1, 0);
        let fast = wheel.repeated(1, 100, 1, 0);

        let fired = wheel.fire(250);
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].id, fast);
        assert_eq!(fired[1].id, slow);
        assert!(fired.iter().all(|f| f.is_last));
        assert!(wheel.is_empty());
    }

    #[test]
    fn equal_deadlines_fire_fifo() {
        let mut wheel = TimerWheel::new();
        let first = wheel.repeated(1, 100, 1, 0);
        let second = wheel.repeated(1, 100, 1, 0);

        let fired = wheel.fire(100);
        assert_eq!(fired[0].id, first);
        assert_eq!(fired[1].id, second);
    }

    #[test]
    fn repeating_timer_reschedules() {
        let mut wheel = TimerWheel::new();
        let id = wheel.repeated(1, 100, 3, 0);

        let fired = wheel.fire(100);
        assert_eq!(fired.len(), 1);
        assert!(!fired[0].is_last);

        let fired = wheel.fire(200);
        assert_eq!(fired.len(), 1);

        let fired = wheel.fire(300);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].is_last);
        assert_eq!(fired[0].id, id);

        assert!(wheel.fire(1000).is_empty());
    }

    #[test]
    fn unbounded_timer_keeps_firing() {
        let mut wheel = TimerWheel::new();
        wheel.repeated(1, 50, -1, 0);

        for tick in 1..=5 {
            let fired = wheel.fire(tick * 50);
            assert_eq!(fired.len(), 1);
            assert!(!fired[0].is_last);
        }
    }

    #[test]
    fn removed_timer_does_not_fire() {
        let mut wheel = TimerWheel::new();
        let id = wheel.repeated(1, 100, -1, 0);
        wheel.remove(id);
        assert!(wheel.fire(500).is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_during_own_fire_stops_repeats() {
        let mut wheel = TimerWheel::new();
        let id = wheel.repeated(1, 100, -1, 0);

        let fired = wheel.fire(100);
        assert_eq!(fired.len(), 1);
        // Callback cancels its own timer after the entry was rescheduled.
        wheel.remove(id);
        assert!(wheel.fire(1000).is_empty());
    }

    #[test]
    fn next_deadline_tracks_head() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next_deadline(), None);
        wheel.repeated(1, 300, 1, 0);
        wheel.repeated(1, 100, 1, 0);
        assert_eq!(wheel.next_deadline(), Some(100));
    }
}
