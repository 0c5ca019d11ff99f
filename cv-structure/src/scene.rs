//! The working state of a single scene while it is being reconstructed.
//!
//! A [`SceneWorkingGraph`] owns its cameras and views in arenas. Views are referenced by their
//! position in [`SceneWorkingGraph::views`], which is also their index in bundle adjustment.
//! Anything that crosses scenes (inlier sets, the frontier, merge bookkeeping) refers to views by
//! their index in the [`PairwiseGraph`] instead, since that never changes.

use std::collections::{BTreeMap, BTreeSet};

use crate::{CameraIntrinsics, CameraPrior, PairwiseGraph, WorldToCamera};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Intrinsics shared by every view of a scene that was taken with the same physical camera.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SceneCamera {
    /// The index of the camera in the image database.
    pub db_index: usize,
    /// The calibration reported by the image database.
    pub prior: CameraPrior,
    /// The current estimate.
    pub intrinsics: CameraIntrinsics,
}

/// A set of features that were found to be consistent across several views.
///
/// `observations[i][k]` is the index of a pixel feature in view `views[i]`, and every `k`
/// refers to the same physical feature across all the lists. The first view is the view that
/// owns the record.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct InlierInfo {
    /// Pairwise graph indices of the views that were inliers together.
    pub views: Vec<usize>,
    /// Feature indices, one list per entry in `views`.
    pub observations: Vec<Vec<usize>>,
    /// How good the geometry was when the set was found. Higher is better.
    pub score_geometric: f64,
}

impl InlierInfo {
    pub fn new(views: Vec<usize>) -> Self {
        let observations = vec![vec![]; views.len()];
        Self {
            views,
            observations,
            score_geometric: 0.0,
        }
    }

    /// The number of features in the set.
    pub fn len(&self) -> usize {
        self.observations.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a feature given its index in every view of the set.
    pub fn push(&mut self, features: &[usize]) {
        assert_eq!(
            features.len(),
            self.views.len(),
            "a feature of an inlier set must have one observation per view"
        );
        for (list, &feature) in self.observations.iter_mut().zip(features) {
            list.push(feature);
        }
    }

    /// Removes a feature from every view of the set by swapping the last feature into its place.
    pub fn remove_swap(&mut self, position: usize) {
        for list in &mut self.observations {
            list.swap_remove(position);
        }
    }

    /// Returns true if all lists have the same length and every index is a valid feature.
    pub fn is_consistent(&self, pairwise: &PairwiseGraph) -> bool {
        let len = self.len();
        self.views.len() == self.observations.len()
            && self
                .views
                .iter()
                .zip(&self.observations)
                .all(|(&view, list)| {
                    let total = pairwise.view(view).total_observations;
                    list.len() == len && list.iter().all(|&feature| feature < total)
                })
    }
}

/// A view whose pose has been estimated in a scene.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SceneView {
    /// Index of the view in the pairwise graph.
    pub pview: usize,
    /// Index of the view in the scene.
    pub index: usize,
    /// Index of the camera in the scene.
    pub camera: usize,
    pub world_to_view: WorldToCamera,
    /// Every set of features that was used to estimate this view.
    pub inliers: Vec<InlierInfo>,
}

/// See the module documentation.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SceneWorkingGraph {
    pub cameras: Vec<SceneCamera>,
    pub views: Vec<SceneView>,
    /// Pairwise view index to scene view index.
    view_lookup: BTreeMap<usize, usize>,
    /// Database camera index to scene camera index.
    camera_lookup: BTreeMap<usize, usize>,
    /// Pairwise views that were ever considered for this scene.
    explored: BTreeSet<usize>,
    /// Pairwise views that can be reached from the scene but have not been added yet.
    open: Vec<usize>,
    /// The first views added to the scene were the seed set.
    pub num_seed_views: usize,
}

impl SceneWorkingGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the camera for a database camera, creating it from the prior if needed.
    pub fn add_camera(&mut self, db_index: usize, prior: CameraPrior) -> usize {
        if let Some(&camera) = self.camera_lookup.get(&db_index) {
            return camera;
        }
        let camera = self.cameras.len();
        self.cameras.push(SceneCamera {
            db_index,
            prior,
            intrinsics: CameraIntrinsics::from_prior(&prior),
        });
        self.camera_lookup.insert(db_index, camera);
        camera
    }

    /// Adds a view to the scene and returns its index in the scene.
    ///
    /// Panics if the pairwise view is already part of the scene.
    pub fn add_view(&mut self, pview: usize, camera: usize, world_to_view: WorldToCamera) -> usize {
        assert!(
            camera < self.cameras.len(),
            "camera {} does not exist in a scene with {} cameras",
            camera,
            self.cameras.len()
        );
        let index = self.views.len();
        if self.view_lookup.insert(pview, index).is_some() {
            panic!("pairwise view {} was added to a scene twice", pview);
        }
        self.views.push(SceneView {
            pview,
            index,
            camera,
            world_to_view,
            inliers: vec![],
        });
        index
    }

    /// The scene camera of a database camera, if the scene has one.
    pub fn lookup_camera(&self, db_index: usize) -> Option<usize> {
        self.camera_lookup.get(&db_index).copied()
    }

    /// The scene index of a pairwise view, if it is part of the scene.
    pub fn lookup_view(&self, pview: usize) -> Option<usize> {
        self.view_lookup.get(&pview).copied()
    }

    /// The view for a pairwise view, if it is part of the scene.
    pub fn view_by_pview(&self, pview: usize) -> Option<&SceneView> {
        self.lookup_view(pview).map(|view| &self.views[view])
    }

    /// Like [`SceneWorkingGraph::view_by_pview`], but panics with context when the view is missing.
    pub fn expect_view(&self, pview: usize) -> &SceneView {
        match self.lookup_view(pview) {
            Some(view) => &self.views[view],
            None => panic!(
                "pairwise view {} is referenced but is not part of the scene (views: {:?})",
                pview,
                self.views.iter().map(|v| v.pview).collect::<Vec<_>>()
            ),
        }
    }

    /// The camera a scene view was taken with.
    pub fn camera_of(&self, view: usize) -> &SceneCamera {
        &self.cameras[self.views[view].camera]
    }

    /// Returns true if the pairwise view has a pose in this scene.
    pub fn is_known(&self, pview: usize) -> bool {
        self.view_lookup.contains_key(&pview)
    }

    /// Returns true if the pairwise view was one of the views the scene was spawned from.
    pub fn is_seed_set(&self, pview: usize) -> bool {
        self.lookup_view(pview)
            .map(|view| view < self.num_seed_views)
            .unwrap_or(false)
    }

    /// Iterates over the pairwise indices of every view in the scene.
    pub fn pviews(&self) -> impl Iterator<Item = usize> + Clone + '_ {
        self.views.iter().map(|view| view.pview)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Marks a pairwise view as explored. Returns false if it was already explored.
    pub fn explore(&mut self, pview: usize) -> bool {
        self.explored.insert(pview)
    }

    pub fn is_explored(&self, pview: usize) -> bool {
        self.explored.contains(&pview)
    }

    pub fn explored(&self) -> &BTreeSet<usize> {
        &self.explored
    }

    /// The frontier of views that might be added next.
    pub fn open(&self) -> &[usize] {
        &self.open
    }

    /// Explores a view and puts it on the frontier, unless it was explored before.
    ///
    /// Returns true if the view was added to the frontier.
    pub fn open_view(&mut self, pview: usize) -> bool {
        if self.explore(pview) {
            self.open.push(pview);
            true
        } else {
            false
        }
    }

    /// Removes an entry from the frontier by swapping the last entry into its place.
    pub fn take_open(&mut self, position: usize) -> usize {
        self.open.swap_remove(position)
    }

    /// Panics with context if an inlier set is malformed or refers to a view outside of the scene.
    pub fn assert_inliers_consistent(&self, pairwise: &PairwiseGraph) {
        for view in &self.views {
            for (ix, info) in view.inliers.iter().enumerate() {
                assert_eq!(
                    info.views.first().copied(),
                    Some(view.pview),
                    "inlier set {} of view '{}' does not start with its owner",
                    ix,
                    pairwise.id(view.pview)
                );
                assert!(
                    info.is_consistent(pairwise),
                    "inlier set {} of view '{}' has mismatched or out of range observations",
                    ix,
                    pairwise.id(view.pview)
                );
                for &pview in &info.views {
                    assert!(
                        self.is_known(pview),
                        "inlier set {} of view '{}' references '{}' which is not in the scene",
                        ix,
                        pairwise.id(view.pview),
                        pairwise.id(pview)
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pose;

    fn prior() -> CameraPrior {
        CameraPrior::from_shape(500.0, 640, 480)
    }

    #[test]
    fn cameras_are_shared_by_database_index() {
        let mut scene = SceneWorkingGraph::new();
        let a = scene.add_camera(3, prior());
        let b = scene.add_camera(3, prior());
        let c = scene.add_camera(4, prior());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(scene.cameras.len(), 2);
    }

    #[test]
    fn seed_set_is_the_first_views() {
        let mut scene = SceneWorkingGraph::new();
        let camera = scene.add_camera(0, prior());
        for pview in [5, 2, 9, 7] {
            scene.add_view(pview, camera, WorldToCamera::identity());
        }
        scene.num_seed_views = 3;
        assert!(scene.is_seed_set(9));
        assert!(!scene.is_seed_set(7));
        assert!(!scene.is_seed_set(1));
        assert_eq!(scene.lookup_view(2), Some(1));
    }

    #[test]
    fn explored_views_never_reopen() {
        let mut scene = SceneWorkingGraph::new();
        assert!(scene.open_view(4));
        assert!(scene.open_view(6));
        assert_eq!(scene.take_open(0), 4);
        assert!(!scene.open_view(4));
        assert_eq!(scene.open(), &[6]);
    }

    #[test]
    fn remove_swap_keeps_lists_parallel() {
        let mut info = InlierInfo::new(vec![0, 1]);
        info.push(&[0, 10]);
        info.push(&[1, 11]);
        info.push(&[2, 12]);
        info.remove_swap(0);
        assert_eq!(info.observations, vec![vec![2, 1], vec![12, 11]]);
    }

    #[test]
    #[should_panic]
    fn duplicate_views_are_rejected() {
        let mut scene = SceneWorkingGraph::new();
        let camera = scene.add_camera(0, prior());
        scene.add_view(1, camera, WorldToCamera::identity());
        scene.add_view(1, camera, WorldToCamera::identity());
    }
}
