//! Observer feed
//!
//! Read-only notifications for a UI or any other consumer. Every subscriber gets its
//! own bounded queue; publishing never blocks the capture loop. When a queue is full
//! the notification is dropped for that subscriber and counted.

use crate::cycle::CycleStatSnapshot;
use crate::trace::TraceLine;
use crate::types::{CanEvent, SessionFault, SessionState, WallClock};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// State transition report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStateChange {
    pub from: SessionState,
    pub to: SessionState,
    /// Set when `to` is `Faulted`
    pub fault: Option<SessionFault>,
    pub at: WallClock,
}

/// Diagnostic counters at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub frames_received: u64,
    pub lines_written: u64,
    pub jitter_clamps: u64,
    pub invalid_frames: u64,
    pub paused_discards: u64,
    pub disconnect_retries: u64,
    pub notifications_dropped: u64,
}

/// Counter selector for [`DiagnosticCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    FramesReceived,
    LinesWritten,
    JitterClamps,
    InvalidFrames,
    PausedDiscards,
    DisconnectRetries,
    NotificationsDropped,
}

/// Live counters shared between the capture loop and the controller
#[derive(Debug, Default)]
pub struct DiagnosticCounters {
    frames_received: AtomicU64,
    lines_written: AtomicU64,
    jitter_clamps: AtomicU64,
    invalid_frames: AtomicU64,
    paused_discards: AtomicU64,
    disconnect_retries: AtomicU64,
    notifications_dropped: AtomicU64,
}

impl DiagnosticCounters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::FramesReceived => &self.frames_received,
            Counter::LinesWritten => &self.lines_written,
            Counter::JitterClamps => &self.jitter_clamps,
            Counter::InvalidFrames => &self.invalid_frames,
            Counter::PausedDiscards => &self.paused_discards,
            Counter::DisconnectRetries => &self.disconnect_retries,
            Counter::NotificationsDropped => &self.notifications_dropped,
        }
    }

    pub fn bump(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    /// Mirror a count owned elsewhere (the recorder owns lines and clamps)
    pub fn set(&self, counter: Counter, value: u64) {
        self.slot(counter).store(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            lines_written: self.lines_written.load(Ordering::Relaxed),
            jitter_clamps: self.jitter_clamps.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            paused_discards: self.paused_discards.load(Ordering::Relaxed),
            disconnect_retries: self.disconnect_retries.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for slot in [
            &self.frames_received,
            &self.lines_written,
            &self.jitter_clamps,
            &self.invalid_frames,
            &self.paused_discards,
            &self.disconnect_retries,
            &self.notifications_dropped,
        ] {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// Everything an observer can be told about
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Notification {
    Event(CanEvent),
    CycleStat(CycleStatSnapshot),
    Line(TraceLine),
    StateChange(SessionStateChange),
    Diagnostics(Diagnostics),
}

/// Fan-out of notifications to bounded subscriber queues
#[derive(Default)]
pub struct ObserverHub {
    subscribers: Mutex<Vec<Sender<Notification>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a queue of `capacity` notifications
    pub fn subscribe(&self, capacity: usize) -> Receiver<Notification> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver to every subscriber without blocking
    ///
    /// Full queues drop the notification (counted in `notifications_dropped`);
    /// subscribers whose receiver is gone are removed.
    pub fn publish(&self, notification: Notification, counters: &DiagnosticCounters) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }

        subscribers.retain(|tx| match tx.try_send(notification.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                counters.bump(Counter::NotificationsDropped);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(frames: u64) -> Notification {
        Notification::Diagnostics(Diagnostics {
            frames_received: frames,
            ..Diagnostics::default()
        })
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let hub = ObserverHub::new();
        let counters = DiagnosticCounters::default();
        let rx = hub.subscribe(2);

        for i in 0..5 {
            hub.publish(diag(i), &counters);
        }

        assert_eq!(rx.len(), 2);
        assert_eq!(counters.snapshot().notifications_dropped, 3);
        assert_eq!(rx.recv().unwrap(), diag(0));
    }

    #[test]
    fn test_disconnected_subscribers_are_pruned() {
        let hub = ObserverHub::new();
        let counters = DiagnosticCounters::default();
        let keep = hub.subscribe(8);
        drop(hub.subscribe(8));
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(diag(1), &counters);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(keep.len(), 1);
    }

    #[test]
    fn test_counters_reset() {
        let counters = DiagnosticCounters::default();
        counters.bump(Counter::InvalidFrames);
        counters.set(Counter::JitterClamps, 4);
        assert_eq!(counters.snapshot().invalid_frames, 1);
        assert_eq!(counters.snapshot().jitter_clamps, 4);

        counters.reset();
        assert_eq!(counters.snapshot(), Diagnostics::default());
    }
}
