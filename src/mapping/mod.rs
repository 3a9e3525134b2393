//! Map building: key-marker sampling, co-observation graph and pose bootstrapping.

pub mod initial_guess;
pub mod key_marker_selector;
pub mod visibility_graph;

pub use initial_guess::{InitialGuess, InitialGuessConfig, InitialGuessEstimator};
pub use key_marker_selector::{KeyMarkerSelector, KeyMarkerSelectorConfig};
pub use visibility_graph::{choose_origin, VisibilityGraph};
