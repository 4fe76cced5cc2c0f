//! Per-identifier cycle statistics
//!
//! Backs the live "Cycle Count" / "Cycle Time (ms)" view. The reported cycle time is
//! the instant delta between the last two observations of an id; nothing is smoothed.

use crate::types::{CanEvent, CanId, Payload};
use serde::Serialize;
use std::collections::HashMap;

/// Running statistics for one CAN identifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleStat {
    pub count: u64,
    pub last_timestamp_us: Option<u64>,
    /// `None` until the id has been seen twice
    pub last_cycle_time_ms: Option<f64>,
    /// DLC of the most recent frame
    pub dlc: u8,
    /// Payload of the most recent frame
    pub data: Payload,
}

/// Statistics for one id right after an observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleStatSnapshot {
    pub id: CanId,
    pub stat: CycleStat,
}

/// Tracks cycle statistics for every id seen in the session
///
/// Entries are never evicted; memory is bounded by the number of distinct ids.
#[derive(Debug, Default)]
pub struct CycleTracker {
    stats: HashMap<CanId, CycleStat>,
}

impl CycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one event and return the updated statistics of its id
    pub fn observe(&mut self, event: &CanEvent) -> CycleStatSnapshot {
        let timestamp = event.timestamp_us();
        let stat = self
            .stats
            .entry(event.id())
            .and_modify(|stat| {
                if let Some(last) = stat.last_timestamp_us {
                    stat.last_cycle_time_ms = Some(timestamp.saturating_sub(last) as f64 / 1000.0);
                }
                stat.count += 1;
                stat.last_timestamp_us = Some(timestamp);
                stat.dlc = event.dlc();
                stat.data = *event.data();
            })
            .or_insert_with(|| CycleStat {
                count: 1,
                last_timestamp_us: Some(timestamp),
                last_cycle_time_ms: None,
                dlc: event.dlc(),
                data: *event.data(),
            });

        CycleStatSnapshot {
            id: event.id(),
            stat: *stat,
        }
    }

    pub fn get(&self, id: &CanId) -> Option<&CycleStat> {
        self.stats.get(id)
    }

    /// Number of distinct ids observed
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// All statistics, sorted by id
    pub fn snapshot(&self) -> Vec<CycleStatSnapshot> {
        let mut all: Vec<CycleStatSnapshot> = self
            .stats
            .iter()
            .map(|(id, stat)| CycleStatSnapshot { id: *id, stat: *stat })
            .collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Forget every id (explicit session reset only)
    pub fn reset(&mut self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn event(id: u32, data: &[u8], ts: u64) -> CanEvent {
        CanEvent::new(
            CanId::standard(id).unwrap(),
            Payload::new(data).unwrap(),
            ts,
            Direction::Rx,
        )
    }

    #[test]
    fn test_first_observation_has_no_cycle_time() {
        let mut tracker = CycleTracker::new();
        let snap = tracker.observe(&event(0x100, &[1], 1_000));
        assert_eq!(snap.stat.count, 1);
        assert_eq!(snap.stat.last_timestamp_us, Some(1_000));
        assert_eq!(snap.stat.last_cycle_time_ms, None);
    }

    #[test]
    fn test_second_observation_reports_delta() {
        let mut tracker = CycleTracker::new();
        tracker.observe(&event(0x100, &[1], 1_000));
        let snap = tracker.observe(&event(0x100, &[2, 3], 11_500));

        assert_eq!(snap.stat.count, 2);
        assert_eq!(snap.stat.last_cycle_time_ms, Some(10.5));
        assert_eq!(snap.stat.dlc, 2);
        assert_eq!(snap.stat.data.as_slice(), &[2, 3]);
    }

    #[test]
    fn test_ids_are_tracked_independently() {
        let mut tracker = CycleTracker::new();
        tracker.observe(&event(0x100, &[], 0));
        tracker.observe(&event(0x200, &[], 5_000));
        let snap = tracker.observe(&event(0x100, &[], 20_000));

        assert_eq!(snap.stat.last_cycle_time_ms, Some(20.0));
        let other = tracker.get(&CanId::standard(0x200).unwrap()).unwrap();
        assert_eq!(other.count, 1);
        assert_eq!(other.last_cycle_time_ms, None);
    }

    #[test]
    fn test_standard_and_extended_are_different_ids() {
        let mut tracker = CycleTracker::new();
        tracker.observe(&event(0x100, &[], 0));
        let ext = CanEvent::new(
            CanId::extended(0x100).unwrap(),
            Payload::default(),
            10,
            Direction::Rx,
        );
        let snap = tracker.observe(&ext);
        assert_eq!(snap.stat.count, 1);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_snapshot_sorted_and_reset() {
        let mut tracker = CycleTracker::new();
        for (i, id) in [0x300, 0x100, 0x200].into_iter().enumerate() {
            tracker.observe(&event(id, &[], i as u64));
        }
        let ids: Vec<u32> = tracker.snapshot().iter().map(|s| s.id.raw()).collect();
        assert_eq!(ids, vec![0x100, 0x200, 0x300]);

        tracker.reset();
        assert!(tracker.is_empty());
    }
}
