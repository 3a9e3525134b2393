//! Orchestration: the marker model, the online mapper and offline runs.
//!
//! - [`MarkerMapper`] - per-frame pipeline with single-flight background bundle adjustment
//! - [`OfflineRun`] - iterator over a recorded sequence yielding progress snapshots
//! - [`ModelStorage`] - marker poses anchored at the origin marker
//! - [`SharedState`] - snapshot published to read-only consumers

pub mod background;
pub mod config;
pub mod mapper;
pub mod model;
pub mod offline;
pub mod shared_state;

pub use background::{BundleTask, TaskState};
pub use config::MapperConfig;
pub use mapper::{FrameReport, MarkerMapper, OptimizationSummary};
pub use model::ModelStorage;
pub use offline::{CancelToken, OfflineProgress, OfflineRun, RecordedFrame, TrajectoryPoint};
pub use shared_state::{MapSnapshot, SharedState, SnapshotHandle};
