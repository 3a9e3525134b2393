//! Marker observations and the key-marker store.
//!
//! - [`Detection`] - one decoded marker quadrilateral in one frame
//! - [`KeyMarker`] - a detection retained for optimization
//! - [`KeyMarkerStore`] - all key markers plus their active flags and bin counters

mod store;
mod types;

pub use store::KeyMarkerStore;
pub use types::{Detection, FrameId, KeyMarker, MarkerId};
