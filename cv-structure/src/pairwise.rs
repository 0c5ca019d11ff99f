//! The pairwise relationship graph.
//!
//! Every image is a [`PairwiseView`] and every pair of images with a verified geometric
//! relationship is connected by a [`Motion`]. The graph is built once and then only read by the
//! reconstruction. Views and motions live in arenas and reference each other by index.

use std::collections::HashMap;

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// A pair of feature indices, one in the `src` view of a motion and one in the `dst` view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct AssociatedIndex {
    pub src: usize,
    pub dst: usize,
}

impl AssociatedIndex {
    pub fn new(src: usize, dst: usize) -> Self {
        Self { src, dst }
    }
}

/// An image in the pairwise graph.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PairwiseView {
    /// The unique id of the image in the image database.
    pub id: String,
    /// Position of this view in [`PairwiseGraph::views`].
    pub index: usize,
    /// The number of features observed in the image.
    pub total_observations: usize,
    /// Indices into [`PairwiseGraph::motions`] of every motion touching this view.
    pub connections: Vec<usize>,
}

/// The geometric relationship between two views.
///
/// A motion is undirected, but it is stored with a fixed orientation so that the inlier
/// pairs can be interpreted. Use [`Motion::other`] to walk across it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Motion {
    /// Position of this motion in [`PairwiseGraph::motions`].
    pub index: usize,
    /// The view the `src` side of each inlier belongs to.
    pub src: usize,
    /// The view the `dst` side of each inlier belongs to.
    pub dst: usize,
    /// If the relationship has enough parallax to determine 3D structure.
    pub is_3d: bool,
    /// Confidence in the 3D structure between `0` and `1`. Higher is better.
    pub score_3d: f64,
    /// Features that were consistent with the relationship.
    pub inliers: Vec<AssociatedIndex>,
}

impl Motion {
    /// Returns the view on the opposite end of the motion.
    ///
    /// Panics if `view` is not one of the two endpoints.
    pub fn other(&self, view: usize) -> usize {
        if view == self.src {
            self.dst
        } else if view == self.dst {
            self.src
        } else {
            panic!(
                "view {} is not an endpoint of motion {} ({} <-> {})",
                view, self.index, self.src, self.dst
            );
        }
    }

    /// Returns true if the motion joins `a` and `b`, in either orientation.
    pub fn connects(&self, a: usize, b: usize) -> bool {
        (self.src == a && self.dst == b) || (self.src == b && self.dst == a)
    }

    /// Returns the feature index in `view` and in the other view for an inlier.
    pub fn oriented(&self, view: usize, inlier: AssociatedIndex) -> (usize, usize) {
        if view == self.src {
            (inlier.src, inlier.dst)
        } else {
            (inlier.dst, inlier.src)
        }
    }
}

/// Views connected by motions. See the module documentation.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct PairwiseGraph {
    views: Vec<PairwiseView>,
    motions: Vec<Motion>,
    #[cfg_attr(feature = "serde-serialize", serde(skip))]
    lookup: HashMap<String, usize>,
}

impl PairwiseGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a view and returns its index.
    ///
    /// Panics if the id was already added, since ids must be unique.
    pub fn add_view(&mut self, id: impl Into<String>, total_observations: usize) -> usize {
        let id = id.into();
        let index = self.views.len();
        if self.lookup.insert(id.clone(), index).is_some() {
            panic!("duplicate view id '{}' added to the pairwise graph", id);
        }
        self.views.push(PairwiseView {
            id,
            index,
            total_observations,
            connections: vec![],
        });
        index
    }

    /// Connects two views with a motion and returns the motion index.
    ///
    /// Panics if an inlier references a feature that does not exist in its view, if the score
    /// is not in `[0, 1]`, or if the views are already connected.
    pub fn add_motion(
        &mut self,
        src: usize,
        dst: usize,
        is_3d: bool,
        score_3d: f64,
        inliers: Vec<AssociatedIndex>,
    ) -> usize {
        assert_ne!(src, dst, "a motion must connect two different views");
        assert!(
            (0.0..=1.0).contains(&score_3d),
            "motion score {} between '{}' and '{}' is outside of [0, 1]",
            score_3d,
            self.views[src].id,
            self.views[dst].id
        );
        assert!(
            self.find_motion(src, dst).is_none(),
            "views '{}' and '{}' are already connected",
            self.views[src].id,
            self.views[dst].id
        );
        let src_total = self.views[src].total_observations;
        let dst_total = self.views[dst].total_observations;
        for (ix, inlier) in inliers.iter().enumerate() {
            assert!(
                inlier.src < src_total && inlier.dst < dst_total,
                "inlier {} ({}, {}) of motion '{}' -> '{}' is out of range ({}, {})",
                ix,
                inlier.src,
                inlier.dst,
                self.views[src].id,
                self.views[dst].id,
                src_total,
                dst_total
            );
        }
        let index = self.motions.len();
        self.motions.push(Motion {
            index,
            src,
            dst,
            is_3d,
            score_3d,
            inliers,
        });
        self.views[src].connections.push(index);
        self.views[dst].connections.push(index);
        index
    }

    pub fn views(&self) -> &[PairwiseView] {
        &self.views
    }

    pub fn motions(&self) -> &[Motion] {
        &self.motions
    }

    pub fn view(&self, view: usize) -> &PairwiseView {
        &self.views[view]
    }

    pub fn motion(&self, motion: usize) -> &Motion {
        &self.motions[motion]
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Finds the index of a view from its id.
    pub fn lookup(&self, id: &str) -> Option<usize> {
        self.lookup.get(id).copied()
    }

    /// The id of a view.
    pub fn id(&self, view: usize) -> &str {
        &self.views[view].id
    }

    /// Must be called after deserializing since the id lookup is not serialized.
    pub fn rebuild_lookup(&mut self) {
        self.lookup = self
            .views
            .iter()
            .map(|view| (view.id.clone(), view.index))
            .collect();
    }

    /// Iterates over every motion touching `view`.
    pub fn connections(&self, view: usize) -> impl Iterator<Item = &Motion> + Clone + '_ {
        self.views[view]
            .connections
            .iter()
            .map(move |&motion| &self.motions[motion])
    }

    /// Finds the motion connecting `a` and `b`, if there is one.
    pub fn find_motion(&self, a: usize, b: usize) -> Option<usize> {
        self.views[a]
            .connections
            .iter()
            .copied()
            .find(|&motion| self.motions[motion].connects(a, b))
    }

    /// Finds the motion connecting `a` and `b`, but only if it has 3D information.
    pub fn find_motion_3d(&self, a: usize, b: usize) -> Option<&Motion> {
        self.find_motion(a, b)
            .map(|motion| &self.motions[motion])
            .filter(|motion| motion.is_3d)
    }

    /// Creates a look up table from every feature in `view` to the matching feature on the other
    /// side of `motion`, or `None` if the feature is not an inlier of the motion.
    pub fn table_view_to_other(&self, view: usize, motion: usize) -> Vec<Option<usize>> {
        let motion = &self.motions[motion];
        let mut table = vec![None; self.views[view].total_observations];
        for &inlier in &motion.inliers {
            let (here, there) = motion.oriented(view, inlier);
            table[here] = Some(there);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> PairwiseGraph {
        let mut graph = PairwiseGraph::new();
        let a = graph.add_view("a", 4);
        let b = graph.add_view("b", 4);
        let c = graph.add_view("c", 4);
        graph.add_motion(
            a,
            b,
            true,
            0.9,
            vec![AssociatedIndex::new(0, 1), AssociatedIndex::new(2, 3)],
        );
        graph.add_motion(c, a, false, 0.1, vec![AssociatedIndex::new(3, 0)]);
        graph
    }

    #[test]
    fn other_walks_across() {
        let graph = triangle();
        let motion = graph.motion(graph.find_motion(1, 0).unwrap());
        assert_eq!(motion.other(0), 1);
        assert_eq!(motion.other(1), 0);
        assert!(graph.find_motion_3d(0, 2).is_none());
        assert!(graph.find_motion(1, 2).is_none());
    }

    #[test]
    fn tables_respect_orientation() {
        let graph = triangle();
        let ab = graph.find_motion(0, 1).unwrap();
        assert_eq!(
            graph.table_view_to_other(1, ab),
            vec![None, Some(0), None, Some(2)]
        );
        let ca = graph.find_motion(0, 2).unwrap();
        assert_eq!(
            graph.table_view_to_other(0, ca),
            vec![Some(3), None, None, None]
        );
    }

    #[test]
    #[should_panic]
    fn duplicate_ids_are_rejected() {
        let mut graph = PairwiseGraph::new();
        graph.add_view("a", 1);
        graph.add_view("a", 1);
    }

    #[test]
    #[should_panic]
    fn out_of_range_inliers_are_rejected() {
        let mut graph = PairwiseGraph::new();
        let a = graph.add_view("a", 2);
        let b = graph.add_view("b", 2);
        graph.add_motion(a, b, true, 0.5, vec![AssociatedIndex::new(0, 2)]);
    }
}
