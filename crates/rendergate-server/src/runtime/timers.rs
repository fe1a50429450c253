//! Timer Guard
//!
//! Tracks every `setTimeout`/`setInterval` scheduled inside one sandbox. The
//! JavaScript callbacks stay inside the sandbox; the guard only knows ids and
//! deadlines, which lets the render's teardown close it from any thread. Once
//! closed, pending timers are dropped and new ones are refused, so nothing
//! scheduled by sandboxed code can fire after the render returns.

use rendergate_common::{CloseFlag, Closeable, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Interval timers never repeat faster than this.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    due: Instant,
    interval: Option<Duration>,
}

/// A timer whose deadline has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimer {
    pub id: u32,
    pub repeating: bool,
}

#[derive(Debug, Default)]
struct TimerState {
    next_id: u32,
    timers: BTreeMap<u32, TimerEntry>,
}

#[derive(Debug, Default)]
pub struct TimerGuard {
    closed: CloseFlag,
    state: Mutex<TimerState>,
}

impl TimerGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tracks a new timer. Returns `None` once the guard is closed.
    pub fn schedule(&self, delay: Duration, repeat: bool) -> Option<u32> {
        if self.closed.is_closed() {
            return None;
        }
        let mut state = self.state();
        state.next_id = state.next_id.wrapping_add(1).max(1);
        let id = state.next_id;
        state.timers.insert(
            id,
            TimerEntry {
                due: Instant::now() + delay,
                interval: repeat.then(|| delay.max(MIN_INTERVAL)),
            },
        );
        Some(id)
    }

    /// Returns `true` if the timer was still pending.
    pub fn cancel(&self, id: u32) -> bool {
        self.state().timers.remove(&id).is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state().timers.values().map(|t| t.due).min()
    }

    /// Removes and returns the timers due at `now`, earliest first.
    /// Intervals are rescheduled rather than removed.
    pub fn take_due(&self, now: Instant) -> Vec<DueTimer> {
        if self.closed.is_closed() {
            return Vec::new();
        }
        let mut state = self.state();
        let mut due: Vec<(Instant, u32)> = state
            .timers
            .iter()
            .filter(|(_, t)| t.due <= now)
            .map(|(id, t)| (t.due, *id))
            .collect();
        due.sort();

        due.into_iter()
            .map(|(_, id)| {
                let repeating = match state.timers.get_mut(&id) {
                    Some(entry) => match entry.interval {
                        Some(interval) => {
                            entry.due = now + interval;
                            true
                        }
                        None => false,
                    },
                    None => false,
                };
                if !repeating {
                    state.timers.remove(&id);
                }
                DueTimer { id, repeating }
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.state().timers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

impl Closeable for TimerGuard {
    fn name(&self) -> &str {
        "timer-guard"
    }

    fn close(&self) -> Result<()> {
        if self.closed.close() {
            let cancelled = std::mem::take(&mut self.state().timers).len();
            tracing::debug!(cancelled, "Timer guard closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_take_due() {
        let guard = TimerGuard::new();
        let later = guard.schedule(Duration::from_secs(60), false).unwrap();
        let now_id = guard.schedule(Duration::ZERO, false).unwrap();
        assert_ne!(later, now_id);
        assert_eq!(guard.pending(), 2);

        let due = guard.take_due(Instant::now());
        assert_eq!(due, vec![DueTimer { id: now_id, repeating: false }]);
        assert_eq!(guard.pending(), 1);
    }

    #[test]
    fn test_interval_is_rescheduled() {
        let guard = TimerGuard::new();
        let id = guard.schedule(Duration::from_millis(10), true).unwrap();
        let first = Instant::now() + Duration::from_millis(20);

        assert_eq!(guard.take_due(first), vec![DueTimer { id, repeating: true }]);
        assert_eq!(guard.pending(), 1);
        assert!(guard.next_deadline().unwrap() > first);

        assert!(guard.cancel(id));
        assert!(!guard.cancel(id));
        assert_eq!(guard.pending(), 0);
    }

    #[test]
    fn test_due_order_follows_deadline() {
        let guard = TimerGuard::new();
        let slow = guard.schedule(Duration::from_millis(5), false).unwrap();
        let fast = guard.schedule(Duration::ZERO, false).unwrap();
        let due = guard.take_due(Instant::now() + Duration::from_millis(10));
        let ids: Vec<u32> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![fast, slow]);
    }

    #[test]
    fn test_close_cancels_pending_and_refuses_new() {
        let guard = TimerGuard::new();
        guard.schedule(Duration::ZERO, false).unwrap();
        guard.schedule(Duration::ZERO, true).unwrap();

        guard.close().unwrap();
        guard.close().unwrap();

        assert!(guard.is_closed());
        assert_eq!(guard.pending(), 0);
        assert!(guard.take_due(Instant::now() + Duration::from_secs(1)).is_empty());
        assert!(guard.schedule(Duration::ZERO, false).is_none());
        assert!(guard.next_deadline().is_none());
    }

    #[test]
    fn test_guards_are_independent() {
        let a = TimerGuard::new();
        let b = TimerGuard::new();
        a.schedule(Duration::ZERO, false).unwrap();
        let b_id = b.schedule(Duration::ZERO, false).unwrap();

        a.close().unwrap();

        assert!(a.take_due(Instant::now()).is_empty());
        assert_eq!(b.take_due(Instant::now()), vec![DueTimer { id: b_id, repeating: false }]);
    }
}
