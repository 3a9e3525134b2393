//! Per-frame camera localization against the marker map.
//!
//! - [`CameraLocalizer`] - PnP against mapped markers with continuity checks
//! - [`LocalizerState`] - whether a prior pose seeds the next solve
//! - [`Localization`] - per-frame outcome

pub mod localizer;
pub mod result;
pub mod state;

pub use localizer::{CameraLocalizer, CameraLocalizerConfig};
pub use result::{Localization, LocalizationFailure};
pub use state::LocalizerState;
