//! Online orchestrator.
//!
//! Per frame, synchronously:
//! 1. pick up a finished background optimization and apply it
//! 2. select key markers and grow the visibility graph
//! 3. choose the origin marker once enough key markers exist
//! 4. every `optimize_interval` new key markers, collect a working set from
//!    the graph, bootstrap unknown poses and start a bundle adjustment
//! 5. localize the camera against the current model
//! 6. publish a snapshot for readers
//!
//! The mapper is the only writer of the model, the key-marker store and the
//! graph; background workers only see cloned problems.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::background::BundleTask;
use super::config::MapperConfig;
use super::model::ModelStorage;
use super::shared_state::{MapSnapshot, SharedState, SnapshotHandle};
use crate::camera::CameraModel;
use crate::error::MapperError;
use crate::geometry::Extrinsics;
use crate::mapping::{choose_origin, InitialGuessEstimator, KeyMarkerSelector, VisibilityGraph};
use crate::markers::{Detection, FrameId, KeyMarkerStore, MarkerId};
use crate::optimizer::{solve_bundle, BundleProblem, BundleResult};
use crate::tracking::{CameraLocalizer, Localization, LocalizerState};

/// What happened while processing one frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame_id: FrameId,
    /// Key markers retained from this frame.
    pub key_markers_added: usize,
    /// Set when this frame chose the origin marker.
    pub origin_chosen: Option<MarkerId>,
    /// A bundle adjustment was started (or run inline) for this frame.
    pub optimization_started: bool,
    /// Optimization applied while processing this frame.
    pub optimization: Option<OptimizationSummary>,
    pub localization: Localization,
    pub processing_time: Duration,
}

/// Effect of one applied bundle adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationSummary {
    pub frames: usize,
    pub markers: usize,
    pub failed_frames: usize,
    pub failed_markers: usize,
    /// Key markers discarded as outliers.
    pub discarded_key_markers: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
}

pub struct MarkerMapper {
    config: MapperConfig,
    camera: CameraModel,
    selector: KeyMarkerSelector,
    store: KeyMarkerStore,
    graph: VisibilityGraph,
    estimator: InitialGuessEstimator,
    model: ModelStorage,
    /// World→camera poses of key frames from the last optimizations.
    frame_poses: BTreeMap<FrameId, Extrinsics>,
    localizer: CameraLocalizer,
    task: BundleTask,
    shared: Arc<SharedState>,
    key_markers_since_optimization: usize,
    optimizations: usize,
    last_frame: Option<FrameId>,
}

impl MarkerMapper {
    pub fn new(config: MapperConfig, camera: CameraModel) -> Result<Self, MapperError> {
        config.validate()?;
        Ok(Self {
            selector: KeyMarkerSelector::new(config.selector.clone()),
            estimator: InitialGuessEstimator::new(config.initial_guess.clone()),
            localizer: CameraLocalizer::new(config.localizer.clone()),
            model: ModelStorage::new(config.origin_tolerance),
            store: KeyMarkerStore::new(),
            graph: VisibilityGraph::new(),
            frame_poses: BTreeMap::new(),
            task: BundleTask::new(),
            shared: SharedState::new(),
            key_markers_since_optimization: 0,
            optimizations: 0,
            last_frame: None,
            config,
            camera,
        })
    }

    /// Processes the detections of one frame.
    pub fn process_frame(&mut self, frame_id: FrameId, detections: &[Detection]) -> FrameReport {
        let t_start = Instant::now();

        let mut optimization = self.collect_background_result();

        let selected = self.selector.select(frame_id, detections, &self.store);
        let key_markers_added = selected.len();
        if !selected.is_empty() {
            let ids: Vec<MarkerId> = selected.iter().map(|km| km.marker_id).collect();
            self.graph.add_frame(frame_id, &ids);
            for km in selected {
                self.store.insert(km);
            }
            self.key_markers_since_optimization += key_markers_added;
            debug!("{}: {} key markers retained", frame_id, key_markers_added);
        }

        let origin_chosen = self.update_origin();

        let mut optimization_started = false;
        if self.model.origin().is_some()
            && self.key_markers_since_optimization >= self.config.optimize_interval
            && !self.task.is_running()
        {
            if self.config.background_optimization {
                optimization_started = self.start_background();
            } else {
                let summary = self.run_inline(false);
                optimization_started = summary.is_some();
                optimization = summary.or(optimization);
            }
        }

        let localization = self.localize_frame(detections);
        self.last_frame = Some(frame_id);
        self.publish();

        FrameReport {
            frame_id,
            key_markers_added,
            origin_chosen,
            optimization_started,
            optimization,
            localization,
            processing_time: t_start.elapsed(),
        }
    }

    /// Localizes detections against the current model without mapping.
    pub fn localize_frame(&mut self, detections: &[Detection]) -> Localization {
        self.localizer
            .localize(detections, self.model.markers(), &self.camera)
    }

    /// Runs one optimization inline.
    ///
    /// Fails while a background optimization is in flight. Returns `None`
    /// when there is nothing to optimize.
    pub fn optimize_now(&mut self) -> Result<Option<OptimizationSummary>, MapperError> {
        if self.task.is_running() {
            return Err(MapperError::TaskAlreadyRunning);
        }
        if self.model.origin().is_none() {
            return Err(MapperError::UnknownOrigin);
        }
        let summary = self.run_inline(true);
        self.publish();
        Ok(summary)
    }

    /// Blocks until the background optimization, if any, has finished and
    /// applies its result.
    pub fn wait_for_optimization(&mut self) -> Option<OptimizationSummary> {
        self.task.wait();
        let summary = self.collect_background_result();
        self.publish();
        summary
    }

    /// Drops the whole map, including the origin.
    pub fn reset(&mut self) {
        self.task.cancel();
        self.task.wait();
        // A cancelled or stale result must not leak into the new map.
        let _ = self.task.take_result();
        self.shared.set_optimizing(false);

        self.selector.reset();
        self.store.clear();
        self.graph.clear();
        self.model.reset();
        self.frame_poses.clear();
        self.localizer.reset();
        self.key_markers_since_optimization = 0;
        self.optimizations = 0;
        self.last_frame = None;
        info!("marker map reset");
        self.publish();
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Camera model, refined when intrinsics optimization is enabled.
    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    pub fn model(&self) -> &ModelStorage {
        &self.model
    }

    pub fn key_markers(&self) -> &KeyMarkerStore {
        &self.store
    }

    pub fn visibility_graph(&self) -> &VisibilityGraph {
        &self.graph
    }

    pub fn frame_poses(&self) -> &BTreeMap<FrameId, Extrinsics> {
        &self.frame_poses
    }

    pub fn localizer_state(&self) -> LocalizerState {
        self.localizer.state()
    }

    pub fn optimizations(&self) -> usize {
        self.optimizations
    }

    pub fn is_optimizing(&mut self) -> bool {
        self.task.is_running()
    }

    /// Handle readers can keep to follow the published map.
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        Arc::clone(&self.shared)
    }

    fn update_origin(&mut self) -> Option<MarkerId> {
        if self.model.origin().is_some() {
            return None;
        }
        let origin = choose_origin(
            &self.store,
            self.config.origin_override(),
            self.config.min_key_markers_for_origin,
        )?;
        self.model.set_origin(origin).then_some(origin)
    }

    /// Working set for the next bundle adjustment, with unknown poses
    /// bootstrapped by the initial-guess estimator.
    ///
    /// With nothing new to locate the periodic optimization is postponed;
    /// `refine_known` re-optimizes the poses already known instead.
    fn prepare_problem(&self, refine_known: bool) -> Option<BundleProblem> {
        let origin = self.model.origin()?;
        let model_ids: BTreeSet<MarkerId> = self.model.markers().keys().copied().collect();
        let frames = self.graph.frames_to_optimize(
            origin,
            &model_ids,
            self.config.representative_frames_per_edge,
        );
        let observations = self.store.active_in_frames(&frames);
        if observations.is_empty() {
            return None;
        }

        let known_frames: BTreeMap<FrameId, Extrinsics> = self
            .frame_poses
            .iter()
            .filter(|(id, _)| frames.contains(*id))
            .map(|(id, ext)| (*id, *ext))
            .collect();
        let (frame_poses, markers) = match self.estimator.estimate(
            &known_frames,
            self.model.markers(),
            &observations,
            &self.camera,
        ) {
            Some(guess) => (guess.frames, guess.markers),
            None if refine_known => (known_frames, self.model.markers().clone()),
            None => {
                debug!("nothing new to locate, optimization postponed");
                return None;
            }
        };
        if frame_poses.is_empty() {
            debug!("no frame of the working set could be located");
            return None;
        }

        Some(BundleProblem {
            frames: frame_poses,
            markers,
            origin,
            observations,
            camera: self.camera.clone(),
            refine_intrinsics: self.config.refine_intrinsics,
        })
    }

    fn start_background(&mut self) -> bool {
        let Some(problem) = self.prepare_problem(false) else {
            return false;
        };
        match self.task.start(problem, self.config.bundle_adjustment.clone()) {
            Ok(()) => {
                self.key_markers_since_optimization = 0;
                self.shared.set_optimizing(true);
                true
            }
            Err(e) => {
                warn!("could not start bundle adjustment: {}", e);
                false
            }
        }
    }

    fn run_inline(&mut self, refine_known: bool) -> Option<OptimizationSummary> {
        let problem = self.prepare_problem(refine_known)?;
        self.key_markers_since_optimization = 0;
        let result = solve_bundle(&problem, &self.config.bundle_adjustment, &|| false)?;
        Some(self.apply_result(result))
    }

    fn collect_background_result(&mut self) -> Option<OptimizationSummary> {
        if self.task.is_running() {
            return None;
        }
        self.shared.set_optimizing(false);
        let result = self.task.take_result()?;
        Some(self.apply_result(result))
    }

    /// Applies a bundle-adjustment result to the map.
    ///
    /// Failed observations are discarded from the key-marker store and the
    /// graph, failed markers leave the model, and everything else is
    /// overwritten with the optimized values.
    pub(crate) fn apply_result(&mut self, result: BundleResult) -> OptimizationSummary {
        let mut discarded = 0;
        for &(frame, marker) in &result.failed_pairs {
            discarded += self.store.discard(frame, marker);
            self.graph.remove_observation(frame, marker);
        }
        for frame in &result.failed_frames {
            self.frame_poses.remove(frame);
        }
        for &marker in &result.failed_markers {
            self.model.remove(marker);
        }

        self.frame_poses.extend(result.frames.iter().map(|(id, ext)| (*id, *ext)));
        if let Err(e) = self.model.apply_markers(&result.markers) {
            warn!("bundle adjustment result violated the model: {}", e);
        }
        if let Some(camera) = &result.intrinsics {
            debug!(
                "intrinsics refined: fx {:.2} fy {:.2} cx {:.2} cy {:.2}",
                camera.fx, camera.fy, camera.cx, camera.cy
            );
            self.camera = camera.clone();
        }
        self.optimizations += 1;

        info!(
            "optimization {}: {} frames, {} markers, cost {:.3} -> {:.3}, {} key markers discarded",
            self.optimizations,
            result.frames.len(),
            result.markers.len(),
            result.initial_cost,
            result.final_cost,
            discarded
        );

        OptimizationSummary {
            frames: result.frames.len(),
            markers: result.markers.len(),
            failed_frames: result.failed_frames.len(),
            failed_markers: result.failed_markers.len(),
            discarded_key_markers: discarded,
            initial_cost: result.initial_cost,
            final_cost: result.final_cost,
            iterations: result.iterations,
        }
    }

    /// Current snapshot, as published to readers.
    pub fn snapshot(&self) -> MapSnapshot {
        MapSnapshot {
            origin: self.model.origin(),
            markers: self.model.markers().clone(),
            marker_points: self.model.marker_points().clone(),
            camera_pose: self.localizer.pose_matrix(),
            frame_id: self.last_frame,
            optimizations: self.optimizations,
            key_markers: self.store.active_len(),
        }
    }

    fn publish(&self) {
        self.shared.publish(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::KeyMarkerSelectorConfig;
    use crate::testing::SyntheticScene;

    fn config(background: bool) -> MapperConfig {
        MapperConfig {
            selector: KeyMarkerSelectorConfig {
                sampling_interval: 1,
                bins_x: 8,
                bins_y: 6,
                max_same_markers_per_bin: 2,
                ..Default::default()
            },
            optimize_interval: 8,
            background_optimization: background,
            origin_override: Some(1),
            ..Default::default()
        }
    }

    fn run(mapper: &mut MarkerMapper, scene: &SyntheticScene, frames: usize) -> Vec<FrameReport> {
        (0..frames)
            .map(|i| {
                let detections = scene.detections(i as u64, i, &[1, 2, 3, 4]);
                mapper.process_frame(FrameId(i as u64), &detections)
            })
            .collect()
    }

    fn assert_model_matches(mapper: &MarkerMapper, scene: &SyntheticScene) {
        assert_eq!(mapper.model().len(), 4);
        assert_eq!(mapper.model().check_origin(), Ok(()));
        for id in scene.marker_ids() {
            let est = mapper.model().get(MarkerId(id)).unwrap();
            assert!(
                est.max_abs_diff(&scene.marker(id)) < 1e-3,
                "marker {} off by {}",
                id,
                est.max_abs_diff(&scene.marker(id))
            );
        }
    }

    #[test]
    fn test_inline_mapping_recovers_scene() {
        let scene = SyntheticScene::new();
        let mut mapper = MarkerMapper::new(config(false), scene.camera.clone()).unwrap();
        let reports = run(&mut mapper, &scene, 12);

        assert_eq!(reports[0].origin_chosen, Some(MarkerId(1)));
        assert!(reports.iter().skip(1).all(|r| r.origin_chosen.is_none()));
        assert!(mapper.optimizations() >= 1);
        mapper.optimize_now().unwrap();
        assert_model_matches(&mapper, &scene);

        let last = reports.last().unwrap();
        let pose = last.localization.extrinsics().unwrap();
        assert!(pose.max_abs_diff(&scene.camera_pose(11)) < 1e-3);
        assert_eq!(mapper.localizer_state(), LocalizerState::HasPrior);

        let snapshot = mapper.snapshot_handle().snapshot();
        assert_eq!(snapshot.origin, Some(MarkerId(1)));
        assert_eq!(snapshot.markers.len(), 4);
        assert_eq!(snapshot.frame_id, Some(FrameId(11)));
        assert!(snapshot.camera_pose.is_some());
    }

    #[test]
    fn test_background_mapping() {
        let scene = SyntheticScene::new();
        let mut mapper = MarkerMapper::new(config(true), scene.camera.clone()).unwrap();
        let reports = run(&mut mapper, &scene, 12);
        assert!(reports.iter().any(|r| r.optimization_started));

        mapper.wait_for_optimization();
        assert!(!mapper.snapshot_handle().is_optimizing());
        assert!(mapper.optimize_now().unwrap().is_some());
        assert_model_matches(&mapper, &scene);
    }

    #[test]
    fn test_failed_pairs_are_discarded() {
        let scene = SyntheticScene::new();
        let mut mapper = MarkerMapper::new(config(false), scene.camera.clone()).unwrap();
        run(&mut mapper, &scene, 12);

        let frame = mapper
            .key_markers()
            .active()
            .find(|km| km.marker_id == MarkerId(2))
            .map(|km| km.frame_id)
            .unwrap();
        let active_before = mapper.key_markers().active_len();
        let result = BundleResult {
            frames: BTreeMap::new(),
            markers: mapper.model().markers().clone(),
            failed_frames: BTreeSet::new(),
            failed_markers: BTreeSet::new(),
            failed_pairs: vec![(frame, MarkerId(2))],
            intrinsics: None,
            initial_cost: 1.0,
            final_cost: 1.0,
            iterations: 1,
            termination: String::from("test"),
        };
        let summary = mapper.apply_result(result);

        assert_eq!(summary.discarded_key_markers, 1);
        assert_eq!(mapper.key_markers().active_len(), active_before - 1);
        assert!(!mapper.key_markers().active_markers_in_frame(frame).contains(&MarkerId(2)));
        assert!(mapper
            .visibility_graph()
            .edge_frames(MarkerId(1), MarkerId(2))
            .map_or(true, |frames| !frames.contains(&frame)));
        assert_model_matches(&mapper, &scene);
    }

    #[test]
    fn test_corrupted_key_frame_leaves_active_set() {
        let scene = SyntheticScene::new();
        let mut mapper = MarkerMapper::new(config(false), scene.camera.clone()).unwrap();
        run(&mut mapper, &scene, 12);

        let pose = scene.camera_pose(20);
        let mut shifted = scene.key_marker(20, 3, &pose);
        for v in shifted.verts.iter_mut() {
            v.x += 200.0;
        }
        mapper.graph.add_frame(FrameId(20), &[MarkerId(1), MarkerId(3)]);
        mapper.store.insert(scene.key_marker(20, 1, &pose));
        mapper.store.insert(shifted);

        let frames: BTreeMap<FrameId, Extrinsics> = (0..12)
            .map(|i| (FrameId(i as u64), scene.camera_pose(i)))
            .chain([(FrameId(20), pose)])
            .collect();
        let problem = BundleProblem {
            frames,
            markers: scene.markers(),
            origin: MarkerId(1),
            observations: mapper.key_markers().active().cloned().collect(),
            camera: scene.camera.clone(),
            refine_intrinsics: false,
        };
        let result = solve_bundle(&problem, &mapper.config().bundle_adjustment, &|| false).unwrap();
        let summary = mapper.apply_result(result);

        assert_eq!(summary.failed_frames, 1);
        assert_eq!(summary.discarded_key_markers, 2);
        assert!(mapper.key_markers().active().all(|km| km.frame_id != FrameId(20)));
        assert!(mapper
            .visibility_graph()
            .edge_frames(MarkerId(1), MarkerId(3))
            .map_or(true, |frames| !frames.contains(&FrameId(20))));
        assert!(!mapper.frame_poses().contains_key(&FrameId(20)));
        assert_model_matches(&mapper, &scene);
    }

    #[test]
    fn test_optimization_postponed_without_new_poses() {
        let scene = SyntheticScene::new();
        let mut mapper = MarkerMapper::new(config(false), scene.camera.clone()).unwrap();
        run(&mut mapper, &scene, 12);
        mapper.optimize_now().unwrap();
        mapper.optimize_now().unwrap();
        let optimizations = mapper.optimizations();

        // Every pose of the working set is known now.
        assert!(mapper.prepare_problem(false).is_none());
        assert!(mapper.prepare_problem(true).is_some());

        let interval = mapper.config().optimize_interval;
        mapper.key_markers_since_optimization = interval;
        let report = mapper.process_frame(FrameId(12), &[]);
        assert!(!report.optimization_started);
        assert!(report.optimization.is_none());
        assert_eq!(mapper.optimizations(), optimizations);
        assert_eq!(mapper.key_markers_since_optimization, interval);
    }

    #[test]
    fn test_reset_clears_everything() {
        let scene = SyntheticScene::new();
        let mut mapper = MarkerMapper::new(config(false), scene.camera.clone()).unwrap();
        run(&mut mapper, &scene, 4);
        mapper.reset();

        assert!(mapper.model().is_empty());
        assert!(mapper.model().origin().is_none());
        assert!(mapper.key_markers().is_empty());
        assert_eq!(mapper.visibility_graph().num_markers(), 0);
        assert_eq!(mapper.localizer_state(), LocalizerState::NoPrior);
        assert_eq!(mapper.snapshot_handle().snapshot(), MapSnapshot::default());
        assert_eq!(mapper.optimize_now(), Err(MapperError::UnknownOrigin));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let scene = SyntheticScene::new();
        let mut cfg = config(false);
        cfg.optimize_interval = 0;
        assert!(matches!(
            MarkerMapper::new(cfg, scene.camera.clone()),
            Err(MapperError::InvalidConfig(_))
        ));
    }
}
