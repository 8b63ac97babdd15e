//! Session bookkeeping for suspended calls.
//!
//! Each service owns a map of live session ids to suspended continuations.
//! A continuation is a boxed closure resumed with the reply; the cancelled
//! sentinel keeps the slot so a late reply is dropped silently instead of
//! being reported as a protocol error.

use std::any::Any;
use std::collections::HashMap;

use skep_protocol::{Message, Value};

use crate::context::Context;

/// A reply delivered to a suspended continuation. `value` is populated when
/// the protocol record for the message's ptype has an unpack function.
#[derive(Debug)]
pub struct Reply {
    pub message: Message,
    pub value: Option<Value>,
}

impl Reply {
    pub fn text(&self) -> &str {
        self.message.body_text()
    }
}

/// `Err` carries the error text: dispatch failures, timeouts, exits.
pub type CallReply = Result<Reply, String>;

/// A suspended continuation. The first argument is the service's behavior,
/// downcast by the wrapper that created the closure.
pub type Resume = Box<dyn FnOnce(&mut dyn Any, &mut Context<'_>, CallReply)>;

/// Largest session id before wrapping around.
pub const SESSION_MAX: i32 = 0x7FFF_FFFF;

enum Slot {
    Waiting { resume: Resume, receiver: u32 },
    Cancelled,
}

pub(crate) enum Take {
    Waiting(Resume),
    /// Slot held the cancelled sentinel; the reply is dropped.
    Cancelled,
    Unknown,
}

#[derive(Default)]
pub(crate) struct SessionMap {
    slots: HashMap<i32, Slot>,
    next: i32,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh positive session id and record the continuation.
    /// Ids are monotonic, wrap at `SESSION_MAX`, skip zero, and never
    /// collide with a live entry.
    pub fn allocate(&mut self, resume: Resume, receiver: u32) -> i32 {
        loop {
            self.next = if self.next >= SESSION_MAX { 1 } else { self.next + 1 };
            if !self.slots.contains_key(&self.next) {
                break;
            }
        }
        self.slots.insert(self.next, Slot::Waiting { resume, receiver });
        self.next
    }

    /// Remove and classify the slot for an arriving reply.
    pub fn take(&mut self, session: i32) -> Take {
        match self.slots.remove(&session) {
            Some(Slot::Waiting { resume, .. }) => Take::Waiting(resume),
            Some(Slot::Cancelled) => Take::Cancelled,
            None => Take::Unknown,
        }
    }

    /// Take the continuation but leave the cancelled sentinel behind, so a
    /// reply that still arrives is dropped. Used by call timeouts.
    pub fn take_and_cancel(&mut self, session: i32) -> Option<Resume> {
        match self.slots.remove(&session) {
            Some(Slot::Waiting { resume, .. }) => {
                self.slots.insert(session, Slot::Cancelled);
                Some(resume)
            }
            Some(Slot::Cancelled) => {
                self.slots.insert(session, Slot::Cancelled);
                None
            }
            None => None,
        }
    }

    /// Overwrite the slot with the cancelled sentinel. Idempotent; unknown
    /// sessions are ignored.
    pub fn cancel(&mut self, session: i32) {
        if let Some(slot) = self.slots.get_mut(&session) {
            *slot = Slot::Cancelled;
        }
    }

    /// Drain every continuation waiting on `receiver`; used when that
    /// service exits before replying.
    pub fn take_by_receiver(&mut self, receiver: u32) -> Vec<(i32, Resume)> {
        let matching: Vec<i32> = self
            .slots
            .iter()
            .filter_map(|(session, slot)| match slot {
                Slot::Waiting { receiver: r, .. } if *r == receiver => Some(*session),
                _ => None,
            })
            .collect();

        matching
            .into_iter()
            .filter_map(|session| match self.slots.remove(&session) {
                Some(Slot::Waiting { resume, .. }) => Some((session, resume)),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Resume {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn allocation_is_monotonic_and_nonzero() {
        let mut map = SessionMap::new();
        let a = map.allocate(noop(), 9);
        let b = map.allocate(noop(), 9);
        assert!(a > 0 && b > 0);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn wraparound_skips_live_entries() {
        let mut map = SessionMap::new();
        map.next = SESSION_MAX - 1;
        let a = map.allocate(noop(), 1);
        assert_eq!(a, SESSION_MAX);
        let b = map.allocate(noop(), 1);
        assert_eq!(b, 1);
        // Sessions a and b are both live; the next allocation skips them.
        map.next = SESSION_MAX - 1;
        let c = map.allocate(noop(), 1);
        assert_eq!(c, 2);
    }

    #[test]
    fn take_consumes_the_slot() {
        let mut map = SessionMap::new();
        let s = map.allocate(noop(), 1);
        assert!(matches!(map.take(s), Take::Waiting(_)));
        assert!(matches!(map.take(s), Take::Unknown));
    }

    #[test]
    fn cancel_is_idempotent_and_drops_late_reply() {
        let mut map = SessionMap::new();
        let s = map.allocate(noop(), 1);
        map.cancel(s);
        map.cancel(s);
        assert!(matches!(map.take(s), Take::Cancelled));
        // The sentinel is consumed along with the late reply.
        assert!(matches!(map.take(s), Take::Unknown));
    }

    #[test]
    fn timeout_leaves_sentinel() {
        let mut map = SessionMap::new();
        let s = map.allocate(noop(), 1);
        assert!(map.take_and_cancel(s).is_some());
        assert!(map.take_and_cancel(s).is_none());
        assert!(matches!(map.take(s), Take::Cancelled));
    }

    #[test]
    fn receiver_watcher_drains_only_matching() {
        let mut map = SessionMap::new();
        let a = map.allocate(noop(), 7);
        let _b = map.allocate(noop(), 8);
        let c = map.allocate(noop(), 7);

        let drained = map.take_by_receiver(7);
        let mut sessions: Vec<i32> = drained.iter().map(|(s, _)| *s).collect();
        sessions.sort_unstable();
        assert_eq!(sessions, vec![a, c]);
        assert_eq!(map.len(), 1);
    }
}
