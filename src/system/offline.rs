//! Offline mapping of a recorded sequence.
//!
//! [`OfflineRun`] is an iterator: each `next()` processes frames until a safe
//! point and yields progress with a complete snapshot of the map. Safe points
//! are every `yield_every` frames, after each optimization and once at the end
//! after the final optimization passes. Cancellation is only checked between
//! yields, so an abandoned run never leaves half-applied state behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::config::MapperConfig;
use super::mapper::MarkerMapper;
use super::shared_state::MapSnapshot;
use crate::camera::CameraModel;
use crate::error::MapperError;
use crate::geometry::Extrinsics;
use crate::markers::{Detection, FrameId};
use crate::tracking::CameraLocalizer;

/// Share of the progress bar covered by frame processing.
const FRAME_PHASE_WEIGHT: f64 = 0.9;

/// Detections of one recorded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    pub frame_id: FrameId,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
}

/// Shared flag stopping an offline run at its next yield.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct OfflineProgress {
    /// Fraction of the run completed, in `[0, 1]`.
    pub progress: f64,
    pub frames_processed: usize,
    pub snapshot: MapSnapshot,
}

/// Camera pose of one frame against the final map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    pub frame_id: FrameId,
    pub timestamp: f64,
    /// World→camera pose.
    pub extrinsics: Extrinsics,
}

pub struct OfflineRun {
    mapper: MarkerMapper,
    frames: Vec<RecordedFrame>,
    next_frame: usize,
    finished: bool,
    cancel: CancelToken,
    trajectory: Vec<TrajectoryPoint>,
}

impl OfflineRun {
    /// Prepares a run; optimizations always run inline.
    pub fn new(
        mut config: MapperConfig,
        camera: CameraModel,
        frames: Vec<RecordedFrame>,
    ) -> Result<Self, MapperError> {
        config.background_optimization = false;
        Ok(Self {
            mapper: MarkerMapper::new(config, camera)?,
            frames,
            next_frame: 0,
            finished: false,
            cancel: CancelToken::new(),
            trajectory: Vec::new(),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn mapper(&self) -> &MarkerMapper {
        &self.mapper
    }

    pub fn into_mapper(self) -> MarkerMapper {
        self.mapper
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Localized frames against the final map; filled once the run finishes.
    pub fn trajectory(&self) -> &[TrajectoryPoint] {
        &self.trajectory
    }

    fn progress(&self, fraction: f64) -> OfflineProgress {
        OfflineProgress {
            progress: fraction.clamp(0.0, 1.0),
            frames_processed: self.next_frame,
            snapshot: self.mapper.snapshot(),
        }
    }

    fn frame_fraction(&self) -> f64 {
        if self.frames.is_empty() {
            return FRAME_PHASE_WEIGHT;
        }
        FRAME_PHASE_WEIGHT * self.next_frame as f64 / self.frames.len() as f64
    }

    fn finish(&mut self) -> OfflineProgress {
        let passes = self.mapper.config().final_optimization_passes;
        for pass in 0..passes {
            match self.mapper.optimize_now() {
                Ok(Some(summary)) => debug!(
                    "final pass {}: cost {:.3} -> {:.3}",
                    pass, summary.initial_cost, summary.final_cost
                ),
                Ok(None) => break,
                Err(e) => {
                    info!("skipping final optimization: {}", e);
                    break;
                }
            }
        }

        let mut localizer = CameraLocalizer::new(self.mapper.config().localizer.clone());
        self.trajectory = self
            .frames
            .iter()
            .filter_map(|frame| {
                let localization = localizer.localize(
                    &frame.detections,
                    self.mapper.model().markers(),
                    self.mapper.camera(),
                );
                localization.extrinsics().map(|ext| TrajectoryPoint {
                    frame_id: frame.frame_id,
                    timestamp: frame.timestamp,
                    extrinsics: *ext,
                })
            })
            .collect();

        self.finished = true;
        info!(
            "offline run finished: {} markers, {}/{} frames localized",
            self.mapper.model().len(),
            self.trajectory.len(),
            self.frames.len()
        );
        self.progress(1.0)
    }
}

impl Iterator for OfflineRun {
    type Item = OfflineProgress;

    fn next(&mut self) -> Option<OfflineProgress> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            info!("offline run cancelled after {} frames", self.next_frame);
            self.finished = true;
            return None;
        }

        let yield_every = self.mapper.config().yield_every.max(1);
        while self.next_frame < self.frames.len() {
            let frame = &self.frames[self.next_frame];
            let report = self.mapper.process_frame(frame.frame_id, &frame.detections);
            self.next_frame += 1;
            if report.optimization.is_some() || self.next_frame % yield_every == 0 {
                return Some(self.progress(self.frame_fraction()));
            }
        }

        Some(self.finish())
    }
}
