//! Container of retained key markers with an active/discarded flag.
//!
//! Key markers are never edited in place. Discarding one flips its flag and
//! updates the per-bin counters so the selector stops counting it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{FrameId, KeyMarker, MarkerId};

#[derive(Debug, Default, Clone)]
pub struct KeyMarkerStore {
    entries: Vec<KeyMarker>,
    active: Vec<bool>,
    /// Active key markers per `(marker, bin)`.
    bin_counts: HashMap<(MarkerId, (usize, usize)), usize>,
    /// Active key markers per marker id.
    frequencies: BTreeMap<MarkerId, usize>,
    by_frame: BTreeMap<FrameId, Vec<usize>>,
    num_active: usize,
}

impl KeyMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_marker: KeyMarker) {
        let idx = self.entries.len();
        *self
            .bin_counts
            .entry((key_marker.marker_id, key_marker.bin))
            .or_insert(0) += 1;
        *self.frequencies.entry(key_marker.marker_id).or_insert(0) += 1;
        self.by_frame.entry(key_marker.frame_id).or_default().push(idx);
        self.entries.push(key_marker);
        self.active.push(true);
        self.num_active += 1;
    }

    /// Discards the active key markers of `marker` in `frame`.
    ///
    /// Returns how many were discarded.
    pub fn discard(&mut self, frame: FrameId, marker: MarkerId) -> usize {
        let Some(indices) = self.by_frame.get(&frame) else {
            return 0;
        };
        let mut discarded = 0;
        for &idx in indices {
            let km = &self.entries[idx];
            if km.marker_id != marker || !self.active[idx] {
                continue;
            }
            self.active[idx] = false;
            self.num_active -= 1;
            discarded += 1;
            if let Some(c) = self.bin_counts.get_mut(&(km.marker_id, km.bin)) {
                *c = c.saturating_sub(1);
            }
            if let Some(c) = self.frequencies.get_mut(&km.marker_id) {
                *c = c.saturating_sub(1);
                if *c == 0 {
                    self.frequencies.remove(&km.marker_id);
                }
            }
        }
        discarded
    }

    pub fn bin_count(&self, marker: MarkerId, bin: (usize, usize)) -> usize {
        self.bin_counts.get(&(marker, bin)).copied().unwrap_or(0)
    }

    pub fn active_len(&self) -> usize {
        self.num_active
    }

    /// Total number of key markers ever inserted, including discarded ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &KeyMarker> {
        self.entries
            .iter()
            .zip(&self.active)
            .filter(|(_, a)| **a)
            .map(|(km, _)| km)
    }

    /// Active key markers belonging to any of `frames`, in frame order.
    pub fn active_in_frames(&self, frames: &BTreeSet<FrameId>) -> Vec<KeyMarker> {
        frames
            .iter()
            .filter_map(|f| self.by_frame.get(f))
            .flatten()
            .filter(|&&idx| self.active[idx])
            .map(|&idx| self.entries[idx].clone())
            .collect()
    }

    /// Marker ids with at least one active key marker in `frame`.
    pub fn active_markers_in_frame(&self, frame: FrameId) -> BTreeSet<MarkerId> {
        self.by_frame
            .get(&frame)
            .into_iter()
            .flatten()
            .filter(|&&idx| self.active[idx])
            .map(|&idx| self.entries[idx].marker_id)
            .collect()
    }

    /// Active key marker count per marker id.
    pub fn frequencies(&self) -> &BTreeMap<MarkerId, usize> {
        &self.frequencies
    }

    /// Most frequent marker id among active key markers; ties go to the smallest id.
    pub fn most_frequent_marker(&self) -> Option<MarkerId> {
        self.frequencies
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(id, _)| *id)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn km(frame: u64, marker: u32, bin: (usize, usize)) -> KeyMarker {
        KeyMarker {
            frame_id: FrameId(frame),
            marker_id: MarkerId(marker),
            verts: [Vector2::zeros(); 4],
            bin,
        }
    }

    #[test]
    fn test_insert_and_discard_update_counts() {
        let mut store = KeyMarkerStore::new();
        store.insert(km(0, 1, (0, 0)));
        store.insert(km(0, 2, (1, 0)));
        store.insert(km(1, 1, (0, 0)));

        assert_eq!(store.bin_count(MarkerId(1), (0, 0)), 2);
        assert_eq!(store.discard(FrameId(0), MarkerId(1)), 1);
        assert_eq!(store.bin_count(MarkerId(1), (0, 0)), 1);
        assert_eq!(store.active_len(), 2);
        assert_eq!(store.len(), 3);

        // Discarding twice is a no-op.
        assert_eq!(store.discard(FrameId(0), MarkerId(1)), 0);
    }

    #[test]
    fn test_active_in_frames_skips_discarded() {
        let mut store = KeyMarkerStore::new();
        store.insert(km(0, 1, (0, 0)));
        store.insert(km(0, 2, (1, 0)));
        store.insert(km(1, 3, (0, 0)));
        store.discard(FrameId(0), MarkerId(2));

        let frames: BTreeSet<_> = [FrameId(0), FrameId(1)].into_iter().collect();
        let ids: Vec<_> = store
            .active_in_frames(&frames)
            .iter()
            .map(|k| k.marker_id)
            .collect();
        assert_eq!(ids, vec![MarkerId(1), MarkerId(3)]);
    }

    #[test]
    fn test_most_frequent_breaks_ties_by_smallest_id() {
        let mut store = KeyMarkerStore::new();
        store.insert(km(0, 5, (0, 0)));
        store.insert(km(0, 3, (0, 0)));
        assert_eq!(store.most_frequent_marker(), Some(MarkerId(3)));

        store.insert(km(1, 5, (1, 1)));
        assert_eq!(store.most_frequent_marker(), Some(MarkerId(5)));
    }
}
