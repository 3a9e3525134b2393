//! Identifiers and per-frame observations.

use nalgebra::Vector2;

/// Identifier of a fiducial marker as decoded by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkerId(pub u32);

impl std::fmt::Display for MarkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Identifier of a video frame.
///
/// Frame ids are assigned by the caller and only need to be unique and
/// ordered within one recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u64);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// One detected marker in one frame.
///
/// `verts` are image pixels in the detector's fixed corner order, matching the
/// canonical corners `(0,0)`, `(1,0)`, `(1,1)`, `(0,1)` of the marker square.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub marker_id: MarkerId,
    pub frame_id: FrameId,
    /// Seconds since the start of the recording.
    pub timestamp: f64,
    pub verts: [Vector2<f64>; 4],
    /// Centroid normalized to `[0, 1]²` by the image size.
    pub centroid: Vector2<f64>,
}

impl Detection {
    /// Builds a detection, deriving the normalized centroid from the image size.
    pub fn new(
        frame_id: FrameId,
        marker_id: MarkerId,
        timestamp: f64,
        verts: [Vector2<f64>; 4],
        image_size: (u32, u32),
    ) -> Self {
        let mean = verts.iter().sum::<Vector2<f64>>() / 4.0;
        let centroid = Vector2::new(
            mean.x / image_size.0.max(1) as f64,
            mean.y / image_size.1.max(1) as f64,
        );
        Self {
            marker_id,
            frame_id,
            timestamp,
            verts,
            centroid,
        }
    }
}

/// A retained observation used by the optimizer. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMarker {
    pub frame_id: FrameId,
    pub marker_id: MarkerId,
    pub verts: [Vector2<f64>; 4],
    /// Spatial bin `(column, row)` of the detection centroid.
    pub bin: (usize, usize),
}
