//! The marker map: marker poses in the world frame of the origin marker.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use tracing::{error, info};

use crate::error::MapperError;
use crate::geometry::{marker_points_world, Extrinsics};
use crate::markers::MarkerId;

/// Marker poses plus their derived world corners.
///
/// The origin marker, once chosen, is always stored as exact identity.
#[derive(Debug, Clone)]
pub struct ModelStorage {
    markers: BTreeMap<MarkerId, Extrinsics>,
    marker_points: BTreeMap<MarkerId, [Vector3<f64>; 4]>,
    origin: Option<MarkerId>,
    origin_tolerance: f64,
}

impl ModelStorage {
    pub fn new(origin_tolerance: f64) -> Self {
        Self {
            markers: BTreeMap::new(),
            marker_points: BTreeMap::new(),
            origin: None,
            origin_tolerance,
        }
    }

    pub fn origin(&self) -> Option<MarkerId> {
        self.origin
    }

    /// Sets the origin marker and pins it at identity.
    ///
    /// Returns `false` when an origin already exists; it only changes on
    /// [`ModelStorage::reset`].
    pub fn set_origin(&mut self, marker: MarkerId) -> bool {
        if self.origin.is_some() {
            return false;
        }
        info!("origin marker set to {}", marker);
        self.origin = Some(marker);
        self.insert(marker, Extrinsics::identity());
        true
    }

    pub fn markers(&self) -> &BTreeMap<MarkerId, Extrinsics> {
        &self.markers
    }

    pub fn get(&self, marker: MarkerId) -> Option<&Extrinsics> {
        self.markers.get(&marker)
    }

    pub fn contains(&self, marker: MarkerId) -> bool {
        self.markers.contains_key(&marker)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// World corners of every marker, in canonical corner order.
    pub fn marker_points(&self) -> &BTreeMap<MarkerId, [Vector3<f64>; 4]> {
        &self.marker_points
    }

    /// Writes optimized marker poses into the model.
    ///
    /// Non-finite poses are skipped. An origin update is never stored: the
    /// origin stays exact identity, and a deviation above the tolerance is
    /// reported as [`MapperError::OriginDrift`] after all other updates are
    /// applied.
    pub fn apply_markers(
        &mut self,
        updates: &BTreeMap<MarkerId, Extrinsics>,
    ) -> Result<usize, MapperError> {
        let origin = self.origin.ok_or(MapperError::UnknownOrigin)?;
        let mut applied = 0;
        let mut drift = 0.0;

        for (&id, ext) in updates {
            if id == origin {
                drift = ext.max_abs_diff(&Extrinsics::identity());
                continue;
            }
            if !ext.is_finite() {
                continue;
            }
            self.insert(id, *ext);
            applied += 1;
        }
        self.insert(origin, Extrinsics::identity());

        if drift > self.origin_tolerance || drift.is_nan() {
            error!("origin marker {} drifted by {:.3e}; re-pinned", origin, drift);
            return Err(MapperError::OriginDrift {
                marker: origin,
                drift,
            });
        }
        Ok(applied)
    }

    /// Removes a marker; the origin cannot be removed.
    pub fn remove(&mut self, marker: MarkerId) -> bool {
        if Some(marker) == self.origin {
            return false;
        }
        self.marker_points.remove(&marker);
        self.markers.remove(&marker).is_some()
    }

    /// Checks that the origin is present and exactly identity.
    pub fn check_origin(&self) -> Result<(), MapperError> {
        let origin = self.origin.ok_or(MapperError::UnknownOrigin)?;
        match self.markers.get(&origin) {
            Some(ext) if ext.is_exact_identity() => Ok(()),
            Some(ext) => Err(MapperError::OriginDrift {
                marker: origin,
                drift: ext.max_abs_diff(&Extrinsics::identity()),
            }),
            None => Err(MapperError::UnknownOrigin),
        }
    }

    /// Plain `id → [rx, ry, rz, tx, ty, tz]` map for persistence.
    pub fn to_plain(&self) -> BTreeMap<u32, [f64; 6]> {
        self.markers
            .iter()
            .map(|(id, ext)| (id.0, ext.to_array()))
            .collect()
    }

    pub fn reset(&mut self) {
        self.markers.clear();
        self.marker_points.clear();
        self.origin = None;
    }

    fn insert(&mut self, marker: MarkerId, ext: Extrinsics) {
        self.marker_points.insert(marker, marker_points_world(&ext));
        self.markers.insert(marker, ext);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_origin_set_once() {
        let mut model = ModelStorage::new(1e-3);
        assert!(model.set_origin(MarkerId(5)));
        assert!(!model.set_origin(MarkerId(6)));
        assert_eq!(model.origin(), Some(MarkerId(5)));
        assert_eq!(model.to_plain()[&5], [0.0; 6]);
        assert_eq!(model.check_origin(), Ok(()));
    }

    #[test]
    fn test_apply_keeps_origin_exact() {
        let mut model = ModelStorage::new(1e-3);
        model.set_origin(MarkerId(1));
        let updates = BTreeMap::from([
            (MarkerId(1), Extrinsics::from_array([1e-7, 0.0, 0.0, 0.0, -1e-7, 0.0])),
            (MarkerId(2), Extrinsics::from_array([0.0, 0.1, 0.0, 2.0, 0.0, 0.0])),
        ]);
        assert_eq!(model.apply_markers(&updates), Ok(1));
        assert_eq!(model.to_plain()[&1], [0.0; 6]);
        assert_relative_eq!(model.marker_points()[&MarkerId(2)][0], Vector3::new(2.0, 0.0, 0.0));
        assert_eq!(model.check_origin(), Ok(()));
    }

    #[test]
    fn test_origin_drift_reported_and_repinned() {
        let mut model = ModelStorage::new(1e-3);
        model.set_origin(MarkerId(1));
        let updates = BTreeMap::from([
            (MarkerId(1), Extrinsics::from_array([0.0, 0.0, 0.0, 0.5, 0.0, 0.0])),
            (MarkerId(3), Extrinsics::from_array([0.0, 0.0, 0.0, 0.0, 2.0, 0.0])),
        ]);
        let err = model.apply_markers(&updates).unwrap_err();
        assert!(matches!(err, MapperError::OriginDrift { marker: MarkerId(1), .. }));
        assert_eq!(model.to_plain()[&1], [0.0; 6]);
        assert!(model.contains(MarkerId(3)));
    }

    #[test]
    fn test_apply_without_origin() {
        let mut model = ModelStorage::new(1e-3);
        assert_eq!(
            model.apply_markers(&BTreeMap::new()),
            Err(MapperError::UnknownOrigin)
        );
    }

    #[test]
    fn test_origin_not_removable_and_reset() {
        let mut model = ModelStorage::new(1e-3);
        model.set_origin(MarkerId(1));
        assert!(!model.remove(MarkerId(1)));
        model.reset();
        assert!(model.is_empty());
        assert!(model.origin().is_none());
        assert!(model.set_origin(MarkerId(2)));
    }
}
