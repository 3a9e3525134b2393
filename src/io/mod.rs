//! Loading recorded sequences and exporting results.

pub mod recording;

pub use recording::{load_camera, load_detections, write_model_csv, write_trajectory_csv, Recording};
