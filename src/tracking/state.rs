//! Camera localizer state.

/// Whether the localizer holds a trusted previous pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalizerState {
    /// No usable prior; the next solve starts from scratch.
    #[default]
    NoPrior,
    /// The last accepted pose seeds the next solve.
    HasPrior,
}
