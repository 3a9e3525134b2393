//! Mapper configuration.
//!
//! Every field has a default; a YAML file only needs the keys it overrides:
//!
//! ```yaml
//! optimize_interval: 20
//! origin_override: 7
//! selector:
//!   sampling_interval: 1
//! bundle_adjustment:
//!   loss: huber
//!   failure_threshold: 8.0
//! ```

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::MapperError;
use crate::mapping::{InitialGuessConfig, KeyMarkerSelectorConfig};
use crate::markers::MarkerId;
use crate::optimizer::BundleAdjustmentConfig;
use crate::tracking::CameraLocalizerConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub selector: KeyMarkerSelectorConfig,
    pub initial_guess: InitialGuessConfig,
    pub bundle_adjustment: BundleAdjustmentConfig,
    pub localizer: CameraLocalizerConfig,
    /// New key markers between two optimizations.
    pub optimize_interval: usize,
    /// Run bundle adjustment on a worker thread instead of inline.
    pub background_optimization: bool,
    /// Also optimize the nine intrinsics parameters.
    pub refine_intrinsics: bool,
    /// Representative frames taken per visibility-graph edge.
    pub representative_frames_per_edge: usize,
    /// Active key markers needed before an origin is chosen.
    pub min_key_markers_for_origin: usize,
    /// Preferred origin marker id.
    pub origin_override: Option<u32>,
    /// Largest accepted deviation of the origin from identity in an update.
    pub origin_tolerance: f64,
    /// Offline runs yield a snapshot every this many frames.
    pub yield_every: usize,
    /// Optimizations run after the last offline frame.
    pub final_optimization_passes: usize,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            selector: KeyMarkerSelectorConfig::default(),
            initial_guess: InitialGuessConfig::default(),
            bundle_adjustment: BundleAdjustmentConfig::default(),
            localizer: CameraLocalizerConfig::default(),
            optimize_interval: 10,
            background_optimization: true,
            refine_intrinsics: false,
            representative_frames_per_edge: 3,
            min_key_markers_for_origin: 4,
            origin_override: None,
            origin_tolerance: 1e-3,
            yield_every: 30,
            final_optimization_passes: 2,
        }
    }
}

impl MapperConfig {
    /// Loads a config from YAML and validates it.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse mapper config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn origin_override(&self) -> Option<MarkerId> {
        self.origin_override.map(MarkerId)
    }

    /// Rejects values the components cannot work with.
    pub fn validate(&self) -> Result<(), MapperError> {
        let s = &self.selector;
        let ba = &self.bundle_adjustment;
        let checks: [(bool, &str); 13] = [
            (s.sampling_interval >= 1, "selector.sampling_interval must be at least 1"),
            (s.min_markers_per_frame >= 2, "selector.min_markers_per_frame must be at least 2"),
            (s.bins_x >= 1 && s.bins_y >= 1, "selector bins must be at least 1"),
            (
                s.max_same_markers_per_bin >= 1,
                "selector.max_same_markers_per_bin must be at least 1",
            ),
            (self.optimize_interval >= 1, "optimize_interval must be at least 1"),
            (
                self.representative_frames_per_edge >= 1,
                "representative_frames_per_edge must be at least 1",
            ),
            (ba.loss_scale > 0.0, "bundle_adjustment.loss_scale must be positive"),
            (ba.failure_threshold > 0.0, "bundle_adjustment.failure_threshold must be positive"),
            (
                ba.origin_epsilon >= 0.0 && ba.origin_epsilon <= self.origin_tolerance,
                "bundle_adjustment.origin_epsilon must lie within [0, origin_tolerance]",
            ),
            (
                ba.focal_bound_ratio > 0.0 && ba.focal_bound_ratio < 1.0,
                "bundle_adjustment.focal_bound_ratio must lie within (0, 1)",
            ),
            (self.localizer.max_step > 0.0, "localizer.max_step must be positive"),
            (
                self.localizer.max_failure_streak >= 1,
                "localizer.max_failure_streak must be at least 1",
            ),
            (self.yield_every >= 1, "yield_every must be at least 1"),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(MapperError::InvalidConfig((*message).to_string())),
            None => Ok(()),
        }
    }
}
