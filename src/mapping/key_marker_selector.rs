//! Sampling policy deciding which frames contribute key markers.
//!
//! A frame is considered every `sampling_interval` calls. It must contain at
//! least `min_markers_per_frame` detections, and at least one of its markers
//! has to land in a spatial bin that is still under-represented for that
//! marker. When accepted, every detection of the frame becomes a key marker so
//! the co-observations reach the visibility graph.

use serde::Deserialize;
use tracing::trace;

use crate::markers::{Detection, FrameId, KeyMarker, KeyMarkerStore};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KeyMarkerSelectorConfig {
    /// Only every N-th call is considered.
    pub sampling_interval: usize,
    /// Frames with fewer detections are rejected. Must be at least 2.
    pub min_markers_per_frame: usize,
    /// Horizontal bin count of the centroid grid.
    pub bins_x: usize,
    /// Vertical bin count of the centroid grid.
    pub bins_y: usize,
    /// A `(marker, bin)` pair is under-represented below this count.
    pub max_same_markers_per_bin: usize,
}

impl Default for KeyMarkerSelectorConfig {
    fn default() -> Self {
        Self {
            sampling_interval: 3,
            min_markers_per_frame: 2,
            bins_x: 4,
            bins_y: 3,
            max_same_markers_per_bin: 1,
        }
    }
}

pub struct KeyMarkerSelector {
    config: KeyMarkerSelectorConfig,
    /// Calls since the last sampled frame.
    frames_since_sample: usize,
}

impl KeyMarkerSelector {
    pub fn new(config: KeyMarkerSelectorConfig) -> Self {
        Self {
            config,
            frames_since_sample: 0,
        }
    }

    pub fn config(&self) -> &KeyMarkerSelectorConfig {
        &self.config
    }

    /// Key markers to retain for `frame_id`, or an empty list.
    ///
    /// The store is only read; the caller inserts the returned key markers.
    pub fn select(
        &mut self,
        frame_id: FrameId,
        detections: &[Detection],
        store: &KeyMarkerStore,
    ) -> Vec<KeyMarker> {
        let sample = self.frames_since_sample == 0;
        let interval = self.config.sampling_interval.max(1);
        self.frames_since_sample = (self.frames_since_sample + 1) % interval;
        if !sample {
            return Vec::new();
        }

        if detections.is_empty() || detections.len() < self.config.min_markers_per_frame.max(2) {
            return Vec::new();
        }

        let binned: Vec<_> = detections.iter().map(|d| (d, self.bin_of(d))).collect();
        let novel = binned.iter().any(|(d, bin)| {
            store.bin_count(d.marker_id, *bin) < self.config.max_same_markers_per_bin
        });
        if !novel {
            trace!("{}: every marker over-represented in its bin", frame_id);
            return Vec::new();
        }

        binned
            .into_iter()
            .map(|(d, bin)| KeyMarker {
                frame_id,
                marker_id: d.marker_id,
                verts: d.verts,
                bin,
            })
            .collect()
    }

    /// Spatial bin of a detection centroid, clamped into the grid.
    pub fn bin_of(&self, detection: &Detection) -> (usize, usize) {
        let bx = self.config.bins_x.max(1);
        let by = self.config.bins_y.max(1);
        let cell = |v: f64, n: usize| -> usize {
            let c = (v * n as f64).floor();
            if c.is_nan() || c < 0.0 {
                0
            } else {
                (c as usize).min(n - 1)
            }
        };
        (cell(detection.centroid.x, bx), cell(detection.centroid.y, by))
    }

    /// Restarts the sampling counter; the next call is sampled.
    pub fn reset(&mut self) {
        self.frames_since_sample = 0;
    }
}

impl Default for KeyMarkerSelector {
    fn default() -> Self {
        Self::new(KeyMarkerSelectorConfig::default())
    }
}
