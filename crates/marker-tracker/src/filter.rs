//! Raw engine event filter.

use std::collections::HashSet;

use marker_protocol::{MarkerId, RawMarkerEvent};

use crate::config::TrackerConfig;

/// Decides which raw `getMarker` events reach the host.
#[derive(Debug, Clone)]
pub struct RawEventFilter {
    marker_type: i32,
    min_confidence: f64,
    tracked: HashSet<MarkerId>,
}

impl RawEventFilter {
    pub fn new(marker_type: i32, min_confidence: f64) -> Self {
        Self {
            marker_type,
            min_confidence,
            tracked: HashSet::new(),
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        let mut filter = Self::new(config.pattern_marker_type, config.min_confidence);
        filter.tracked.extend(config.tracked_patterns.iter().copied());
        filter
    }

    /// Restrict forwarding to `id` (plus any other tracked ids).
    pub fn track(&mut self, id: MarkerId) -> bool {
        self.tracked.insert(id)
    }

    pub fn is_tracked(&self, id: MarkerId) -> bool {
        self.tracked.contains(&id)
    }

    pub fn accepts(&self, event: &RawMarkerEvent) -> bool {
        event.marker_type == self.marker_type
            && event.confidence() >= self.min_confidence
            && event.has_full_matrix()
            && (self.tracked.is_empty() || self.tracked.contains(&event.marker_id()))
    }
}
