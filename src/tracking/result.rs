//! Per-frame localization outcome.

use crate::geometry::Extrinsics;

/// Result of localizing one frame against the marker map.
#[derive(Debug, Clone, PartialEq)]
pub enum Localization {
    Localized {
        /// World→camera pose.
        extrinsics: Extrinsics,
        /// Number of mapped markers used by the solve.
        markers_used: usize,
    },
    NotLocalized(LocalizationFailure),
}

impl Localization {
    pub fn is_localized(&self) -> bool {
        matches!(self, Localization::Localized { .. })
    }

    pub fn extrinsics(&self) -> Option<&Extrinsics> {
        match self {
            Localization::Localized { extrinsics, .. } => Some(extrinsics),
            Localization::NotLocalized(_) => None,
        }
    }
}

/// Why a frame could not be localized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalizationFailure {
    /// Fewer mapped markers visible than required.
    TooFewMarkers { found: usize, required: usize },
    /// PnP did not produce a pose.
    SolverFailed,
    /// Rotation out of range or a marker behind the camera.
    Implausible,
    /// Camera centre moved farther than allowed from the prior.
    Jump { distance: f64 },
}

impl std::fmt::Display for LocalizationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooFewMarkers { found, required } => {
                write!(f, "{} mapped markers visible, {} required", found, required)
            }
            Self::SolverFailed => write!(f, "PnP failed"),
            Self::Implausible => write!(f, "implausible pose"),
            Self::Jump { distance } => write!(f, "camera jumped {:.3}", distance),
        }
    }
}
