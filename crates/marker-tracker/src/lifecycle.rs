//! Marker lifecycle state machine.
//!
//! Detections arrive in sparse per-frame batches: a marker missing from one
//! batch is not gone. Found and updated transitions happen as batches arrive,
//! while loss is decided only by the periodic [`LifecycleTracker::sweep`].

use std::collections::BTreeMap;
use std::time::Duration;

use marker_protocol::{Detection, MarkerId};
use tokio::time::Instant;

/// Where a tracked marker stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// Seen within the last frame period
    Visible,
    /// Missed one or more frames, not yet past the loss threshold
    StalePendingRemoval,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRecord {
    pub id: MarkerId,
    pub last_seen_at: Instant,
    pub visible: bool,
    pub consecutive_misses: u32,
}

impl MarkerRecord {
    pub fn state(&self) -> MarkerState {
        if self.consecutive_misses == 0 {
            MarkerState::Visible
        } else {
            MarkerState::StalePendingRemoval
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Found(Detection),
    Updated(Detection),
    Lost(MarkerId),
}

impl LifecycleEvent {
    pub fn marker_id(&self) -> MarkerId {
        match self {
            Self::Found(d) | Self::Updated(d) => d.id,
            Self::Lost(id) => *id,
        }
    }
}

/// One record per currently or recently seen marker id.
#[derive(Debug)]
pub struct LifecycleTracker {
    records: BTreeMap<MarkerId, MarkerRecord>,
    frame_duration: Duration,
    lost_threshold: u32,
}

impl LifecycleTracker {
    pub fn new(lost_threshold: u32, frame_duration: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            frame_duration,
            lost_threshold,
        }
    }

    /// Time without a sighting after which a marker is lost.
    pub fn lost_after(&self) -> Duration {
        self.frame_duration.saturating_mul(self.lost_threshold)
    }

    /// Apply one detection batch.
    ///
    /// Ids repeated within the batch collapse to their last detection, so each
    /// id yields at most one event. Ids absent from the batch are untouched.
    pub fn apply_batch(&mut self, detections: Vec<Detection>, now: Instant) -> Vec<LifecycleEvent> {
        let mut latest: Vec<Detection> = Vec::with_capacity(detections.len());
        for detection in detections {
            match latest.iter_mut().find(|d| d.id == detection.id) {
                Some(slot) => *slot = detection,
                None => latest.push(detection),
            }
        }

        latest
            .into_iter()
            .map(|detection| match self.records.get_mut(&detection.id) {
                Some(record) if record.visible => {
                    record.last_seen_at = now;
                    record.consecutive_misses = 0;
                    LifecycleEvent::Updated(detection)
                }
                Some(record) => {
                    record.visible = true;
                    record.last_seen_at = now;
                    record.consecutive_misses = 0;
                    LifecycleEvent::Found(detection)
                }
                None => {
                    self.records.insert(
                        detection.id,
                        MarkerRecord {
                            id: detection.id,
                            last_seen_at: now,
                            visible: true,
                            consecutive_misses: 0,
                        },
                    );
                    LifecycleEvent::Found(detection)
                }
            })
            .collect()
    }

    /// Remove markers unseen for longer than [`Self::lost_after`].
    ///
    /// Survivors get their miss counter refreshed and stay visible.
    pub fn sweep(&mut self, now: Instant) -> Vec<LifecycleEvent> {
        let lost_after = self.lost_after();
        let frame_ms = self.frame_duration.as_millis().max(1);
        let mut lost = Vec::new();

        self.records.retain(|id, record| {
            let elapsed = now.saturating_duration_since(record.last_seen_at);
            if elapsed > lost_after {
                lost.push(LifecycleEvent::Lost(*id));
                return false;
            }
            record.consecutive_misses = u32::try_from(elapsed.as_millis() / frame_ms).unwrap_or(u32::MAX);
            true
        });
        lost
    }

    pub fn record(&self, id: MarkerId) -> Option<&MarkerRecord> {
        self.records.get(&id)
    }

    /// Ids with a live record, ascending.
    pub fn ids(&self) -> Vec<MarkerId> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every record without emitting events.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
