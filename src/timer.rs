//! The timeout scheduler (§4.7): each connection's timer period is reset on
//! every fire to whatever `time_remaining` reports, and re-armed (not
//! accumulated) across rekeys. `mio` has no timer wheel of its own, so this
//! is a small deadline-ordered queue the event loop consults to compute its
//! next `poll` timeout.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::table::ConnectionHandle;

#[derive(PartialEq, Eq)]
struct Deadline {
    at: Instant,
    handle: ConnectionHandle,
    /// Incremented each time this connection's timer is (re)armed; a fired
    /// entry whose generation no longer matches the connection's current
    /// generation is stale and is discarded rather than acted on. This
    /// is what makes "stop and restart, never accumulate" (§4.7) correct
    /// without walking the heap to remove the old entry.
    generation: u64,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerScheduler {
    heap: BinaryHeap<Reverse<Deadline>>,
    generations: std::collections::HashMap<ConnectionHandle, u64>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        TimerScheduler {
            heap: BinaryHeap::new(),
            generations: std::collections::HashMap::new(),
        }
    }

    /// Arm (or re-arm) a connection's timer for `seconds` from now.
    pub fn arm(&mut self, handle: ConnectionHandle, seconds: u32) {
        let generation = self.generations.entry(handle).or_insert(0);
        *generation += 1;
        self.heap.push(Reverse(Deadline {
            at: Instant::now() + Duration::from_secs(seconds as u64),
            handle,
            generation: *generation,
        }));
    }

    /// Stop a connection's timer; any already-queued entry becomes stale.
    pub fn cancel(&mut self, handle: ConnectionHandle) {
        if let Some(g) = self.generations.get_mut(&handle) {
            *g += 1;
        }
    }

    pub fn remove(&mut self, handle: ConnectionHandle) {
        self.generations.remove(&handle);
    }

    /// Pop every deadline that has fired and is still current, draining stale
    /// entries silently. Used by the event loop each time `poll` returns.
    pub fn poll_expired(&mut self) -> Vec<ConnectionHandle> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.at > now {
                break;
            }
            let Reverse(deadline) = self.heap.pop().unwrap();
            if self.generations.get(&deadline.handle) == Some(&deadline.generation) {
                fired.push(deadline.handle);
            }
        }
        fired
    }

    /// How long until the next live deadline, for bounding `mio::Poll::poll`'s
    /// timeout. `None` means no timers are armed.
    pub fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.heap
            .iter()
            .filter(|Reverse(d)| self.generations.get(&d.handle) == Some(&d.generation))
            .map(|Reverse(d)| d.at.saturating_duration_since(now))
            .min()
    }
}
