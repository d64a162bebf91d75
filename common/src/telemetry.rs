use std::collections::VecDeque;

use log::{info, warn};

use crate::{remote::RemoteSync, types::SensorReport};

/// Bounded FIFO of sensor reports taken while the backend was unreachable.
/// When full, the oldest report is dropped to make room.
#[derive(Debug, Clone)]
pub struct TelemetryBacklog {
    capacity: usize,
    records: VecDeque<SensorReport>,
    dropped: u64,
}

impl TelemetryBacklog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total reports discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorReport> {
        self.records.iter()
    }

    /// Returns `true` when an older report had to be discarded.
    pub fn push(&mut self, report: SensorReport) -> bool {
        let overflowed = self.records.len() >= self.capacity;
        if overflowed {
            self.records.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
        self.records.push_back(report);
        overflowed
    }

    /// Publishes buffered reports oldest first, stopping at the first failure
    /// so ordering is preserved for the next attempt. Returns how many were
    /// sent.
    pub fn drain_into<R: RemoteSync + ?Sized>(&mut self, remote: &mut R) -> usize {
        let mut sent = 0;
        while let Some(report) = self.records.front() {
            if let Err(err) = remote.publish_sensor_report(report) {
                warn!(
                    "backlog drain stopped after {sent} reports ({} left): {err}",
                    self.records.len()
                );
                break;
            }
            self.records.pop_front();
            sent += 1;
        }
        if sent > 0 {
            info!("drained {sent} buffered sensor reports");
        }
        sent
    }
}
