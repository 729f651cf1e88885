//! Event-loop timers
//!
//! Deadlines are plain `Instant`s owned by the connector; the event loop sleeps
//! until [`Timers::next_deadline`] and hands due kinds back to the connector.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    BatteryPoll,
    PacketRate,
    Reconnect,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: TimerKind,
    deadline: Instant,
    period: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct Timers {
    entries: Vec<Entry>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every `period`, first at `now + period`. Replaces an existing entry.
    pub fn schedule_repeating(&mut self, kind: TimerKind, now: Instant, period: Duration) {
        self.insert(Entry {
            kind,
            deadline: now + period,
            period: Some(period.max(Duration::from_millis(1))),
        });
    }

    /// Fire once at `now + delay`. Replaces an existing entry.
    pub fn schedule_once(&mut self, kind: TimerKind, now: Instant, delay: Duration) {
        self.insert(Entry {
            kind,
            deadline: now + delay,
            period: None,
        });
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.kind != kind);
        self.entries.len() != before
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_scheduled(&self, kind: TimerKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Pop every timer due at `now`, earliest first
    ///
    /// One-shot entries are removed; repeating entries are re-armed on their
    /// own cadence, skipping periods that were missed entirely.
    pub fn take_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due: Vec<(Instant, TimerKind)> = Vec::new();

        self.entries.retain_mut(|entry| {
            if entry.deadline > now {
                return true;
            }
            due.push((entry.deadline, entry.kind));
            match entry.period {
                Some(period) => {
                    while entry.deadline <= now {
                        entry.deadline += period;
                    }
                    true
                }
                None => false,
            }
        });

        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, kind)| kind).collect()
    }

    fn insert(&mut self, entry: Entry) {
        self.cancel(entry.kind);
        self.entries.push(entry);
    }
}
