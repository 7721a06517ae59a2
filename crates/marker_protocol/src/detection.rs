//! Detection results and raw engine events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Engine-assigned identifier of a loaded marker pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(pub i32);

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 4x4 transform in the engine's own convention (column-major for the
/// engines this crate targets). Never reordered on its way to the host.
pub type PoseMatrix = [f64; 16];

/// Four image-space corners in the order the engine reports them.
pub type Corners = [[f64; 2]; 4];

/// Number of entries a complete pose matrix carries.
pub const POSE_MATRIX_LEN: usize = 16;

/// One marker seen in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub id: MarkerId,
    pub confidence: f64,
    pub pose_matrix: PoseMatrix,
    pub corners: Corners,
    pub frame_id: u64,
}

impl Detection {
    /// Build a detection from the engine's per-marker info and pose.
    ///
    /// Missing vertices leave the corners zeroed; extra vertices are ignored.
    pub fn from_engine(info: &RawMarkerInfo, pose: PoseMatrix, frame_id: u64) -> Self {
        let mut corners = [[0.0; 2]; 4];
        if let Some(vertex) = &info.vertex {
            for (slot, point) in corners.iter_mut().zip(vertex.iter()) {
                *slot = *point;
            }
        }
        Self {
            id: MarkerId(info.id_patt),
            confidence: info.cf_patt,
            pose_matrix: pose,
            corners,
            frame_id,
        }
    }
}

/// Per-marker payload of a raw engine event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMarkerInfo {
    pub id_patt: i32,
    pub cf_patt: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_matrix: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cf_matrix: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex: Option<Vec<[f64; 2]>>,
}

impl RawMarkerInfo {
    pub fn pattern(id: i32, confidence: f64) -> Self {
        Self {
            id_patt: id,
            cf_patt: confidence,
            id_matrix: None,
            cf_matrix: None,
            vertex: None,
        }
    }
}

/// A detection event exactly as the engine's listener produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMarkerEvent {
    /// Engine marker kind (pattern, barcode, ...).
    #[serde(rename = "type")]
    pub marker_type: i32,
    pub matrix: Vec<f64>,
    pub marker: RawMarkerInfo,
}

impl RawMarkerEvent {
    pub fn marker_id(&self) -> MarkerId {
        MarkerId(self.marker.id_patt)
    }

    pub fn confidence(&self) -> f64 {
        self.marker.cf_patt
    }

    /// Whether the event carries a full 4x4 transform.
    pub fn has_full_matrix(&self) -> bool {
        self.matrix.len() >= POSE_MATRIX_LEN
    }
}
