//! Domain errors of the mapper.
//!
//! Numerical failures (too few points, divergence, outliers) are not errors:
//! they surface as `Option`, empty collections or
//! [`Localization::NotLocalized`](crate::tracking::Localization). The variants
//! below are invariant violations and misuse of the orchestrator.

use thiserror::Error;

use crate::markers::MarkerId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapperError {
    /// An update moved the origin marker away from identity. The origin is
    /// re-pinned before this is returned.
    #[error("origin marker {marker} drifted by {drift:.3e} from identity")]
    OriginDrift { marker: MarkerId, drift: f64 },
    /// Single-flight violation: a bundle adjustment is still in flight.
    #[error("a bundle adjustment task is already running")]
    TaskAlreadyRunning,
    /// The model has no origin marker yet.
    #[error("no origin marker has been chosen")]
    UnknownOrigin,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
