//! Marker co-observation multigraph.
//!
//! Nodes are marker ids. Two markers share one edge per accepted frame in
//! which both were seen, so every edge is keyed by its frame id. The
//! connected component of the origin marker is the set of markers that can be
//! expressed in the world frame, and shortest paths to the origin decide
//! which frames enter a bundle adjustment.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::markers::{FrameId, KeyMarkerStore, MarkerId};

#[derive(Debug, Default, Clone)]
pub struct VisibilityGraph {
    adjacency: BTreeMap<MarkerId, BTreeMap<MarkerId, BTreeSet<FrameId>>>,
}

impl VisibilityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an edge keyed by `frame_id` between every pair of `markers`.
    pub fn add_frame(&mut self, frame_id: FrameId, markers: &[MarkerId]) {
        for &m in markers {
            self.adjacency.entry(m).or_default();
        }
        for (i, &a) in markers.iter().enumerate() {
            for &b in &markers[i + 1..] {
                if a == b {
                    continue;
                }
                self.link(a, b, frame_id);
                self.link(b, a, frame_id);
            }
        }
    }

    fn link(&mut self, from: MarkerId, to: MarkerId, frame_id: FrameId) {
        self.adjacency
            .entry(from)
            .or_default()
            .entry(to)
            .or_default()
            .insert(frame_id);
    }

    /// Removes every edge of `marker` keyed by `frame_id`.
    ///
    /// Returns the number of edges removed.
    pub fn remove_observation(&mut self, frame_id: FrameId, marker: MarkerId) -> usize {
        let Some(neighbours) = self.adjacency.get_mut(&marker) else {
            return 0;
        };
        let mut touched = Vec::new();
        neighbours.retain(|&n, frames| {
            if frames.remove(&frame_id) {
                touched.push(n);
            }
            !frames.is_empty()
        });

        for n in &touched {
            if let Some(back) = self.adjacency.get_mut(n) {
                if let Some(frames) = back.get_mut(&marker) {
                    frames.remove(&frame_id);
                    if frames.is_empty() {
                        back.remove(&marker);
                    }
                }
            }
        }
        touched.len()
    }

    pub fn contains(&self, marker: MarkerId) -> bool {
        self.adjacency.contains_key(&marker)
    }

    pub fn markers(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.adjacency.keys().copied()
    }

    pub fn num_markers(&self) -> usize {
        self.adjacency.len()
    }

    /// Frames keying the edges between `a` and `b`.
    pub fn edge_frames(&self, a: MarkerId, b: MarkerId) -> Option<&BTreeSet<FrameId>> {
        self.adjacency.get(&a).and_then(|n| n.get(&b))
    }

    /// Every frame in which `marker` has at least one edge.
    pub fn frames_of(&self, marker: MarkerId) -> BTreeSet<FrameId> {
        self.adjacency
            .get(&marker)
            .into_iter()
            .flat_map(|n| n.values())
            .flatten()
            .copied()
            .collect()
    }

    /// Markers reachable from `root`, including `root` when it is a node.
    pub fn connected_component(&self, root: MarkerId) -> BTreeSet<MarkerId> {
        self.bfs_parents(root).into_keys().collect()
    }

    /// Shortest marker path `from` → `to`, both ends included.
    pub fn shortest_path(&self, from: MarkerId, to: MarkerId) -> Option<Vec<MarkerId>> {
        let parents = self.bfs_parents(to);
        path_to_root(&parents, from)
    }

    /// Frames to feed into the next bundle adjustment.
    ///
    /// For every marker connected to `origin`, up to `per_edge` frames spread
    /// across each edge of its shortest path to the origin; plus every frame
    /// containing a connected marker not yet in `model`.
    pub fn frames_to_optimize(
        &self,
        origin: MarkerId,
        model: &BTreeSet<MarkerId>,
        per_edge: usize,
    ) -> BTreeSet<FrameId> {
        let parents = self.bfs_parents(origin);
        let mut frames = BTreeSet::new();

        for &marker in parents.keys() {
            if marker == origin {
                continue;
            }
            if let Some(path) = path_to_root(&parents, marker) {
                for pair in path.windows(2) {
                    if let Some(edge) = self.edge_frames(pair[0], pair[1]) {
                        frames.extend(spread(edge, per_edge));
                    }
                }
            }
            if !model.contains(&marker) {
                frames.extend(self.frames_of(marker));
            }
        }
        frames
    }

    pub fn clear(&mut self) {
        self.adjacency.clear();
    }

    /// Breadth-first search tree rooted at `root`, neighbours in id order.
    fn bfs_parents(&self, root: MarkerId) -> BTreeMap<MarkerId, Option<MarkerId>> {
        let mut parents = BTreeMap::new();
        if !self.adjacency.contains_key(&root) {
            return parents;
        }
        parents.insert(root, None);
        let mut queue = VecDeque::from([root]);
        while let Some(m) = queue.pop_front() {
            let Some(neighbours) = self.adjacency.get(&m) else {
                continue;
            };
            for &n in neighbours.keys() {
                if !parents.contains_key(&n) {
                    parents.insert(n, Some(m));
                    queue.push_back(n);
                }
            }
        }
        parents
    }
}

fn path_to_root(
    parents: &BTreeMap<MarkerId, Option<MarkerId>>,
    from: MarkerId,
) -> Option<Vec<MarkerId>> {
    let mut path = vec![from];
    let mut current = *parents.get(&from)?;
    while let Some(p) = current {
        path.push(p);
        current = *parents.get(&p)?;
    }
    Some(path)
}

/// Up to `n` frames spread evenly over the sorted frame ids.
fn spread(frames: &BTreeSet<FrameId>, n: usize) -> Vec<FrameId> {
    let sorted: Vec<FrameId> = frames.iter().copied().collect();
    if n == 0 || sorted.is_empty() {
        return Vec::new();
    }
    if sorted.len() <= n {
        return sorted;
    }
    if n == 1 {
        return vec![sorted[sorted.len() / 2]];
    }
    let last = sorted.len() - 1;
    (0..n).map(|i| sorted[i * last / (n - 1)]).collect()
}

/// Picks the origin marker once enough key markers exist.
///
/// The override wins when it has been observed; otherwise the most frequent
/// marker among active key markers, ties broken by the smallest id.
pub fn choose_origin(
    store: &KeyMarkerStore,
    override_id: Option<MarkerId>,
    min_key_markers: usize,
) -> Option<MarkerId> {
    if store.active_len() < min_key_markers.max(1) {
        return None;
    }
    if let Some(id) = override_id {
        if store.frequencies().contains_key(&id) {
            return Some(id);
        }
    }
    store.most_frequent_marker()
}
