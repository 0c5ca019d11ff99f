//! Creates a new scene from a seed view and two of its neighbors.

use float_ord::FloatOrd;
use itertools::Itertools;
use log::*;

use crate::{
    check_physical_constraints, BundleAdjuster, ImageDatabase, MetricReconstructor, PairwiseGraph,
    PhysicalConstraints, Pose, ScenePixels, SceneWorkingGraph, SeedCandidate, ThreeViewSolver,
    TriangulatorObservations, TripletMatches, WorldToCamera,
};

/// The number of times the seed scene is refined while bad features are cleaned out of it.
const SPAWN_ATTEMPTS: usize = 2;

/// Picks the two motions of a seed whose views form the strongest triangle with it.
///
/// A triangle is only as strong as its weakest side, so triangles are scored by the lowest 3D
/// score of their three motions. The two neighbors must share a 3D motion, not just any motion,
/// so the three views of every spawned scene are pairwise connected in 3D. Neighbors joined only
/// by a motion without 3D structure never form a triangle, even when the seed connects to both.
/// Returns the views, seed first, and the score of the triangle.
pub fn select_spawn_triplet(
    pairwise: &PairwiseGraph,
    candidate: &SeedCandidate,
) -> Option<([usize; 3], f64)> {
    let seed = candidate.view;
    candidate
        .motions
        .iter()
        .tuple_combinations()
        .filter_map(|(&ab, &ac)| {
            let (ab, ac) = (pairwise.motion(ab), pairwise.motion(ac));
            let (b, c) = (ab.other(seed), ac.other(seed));
            let bc = pairwise.find_motion_3d(b, c)?;
            let score = ab.score_3d.min(ac.score_3d).min(bc.score_3d);
            Some(([seed, b, c], score))
        })
        .max_by_key(|&(_, score)| FloatOrd(score))
}

impl<D, S, B, T> MetricReconstructor<D, S, B, T>
where
    D: ImageDatabase,
    S: ThreeViewSolver,
    B: BundleAdjuster,
    T: TriangulatorObservations,
{
    /// Estimates a metric scene of three views from a seed.
    ///
    /// The scene is refined, and the seed features that end up behind a view or far from where
    /// they were observed are removed. Returns `None` if any step failed.
    pub fn spawn_scene(
        &mut self,
        pairwise: &PairwiseGraph,
        candidate: &SeedCandidate,
    ) -> Option<SceneWorkingGraph> {
        let settings = self.settings;
        let seed_id = pairwise.id(candidate.view);
        let (views, score) = match select_spawn_triplet(pairwise, candidate) {
            Some(triplet) => triplet,
            None => {
                info!("seed '{}' has no pair of connected neighbors", seed_id);
                return None;
            }
        };
        let matches = TripletMatches::gather(pairwise, &self.database, views)?;
        if matches.len() < settings.seed_minimum_common_features {
            info!(
                "seed '{}' has only {} common features, needs {}",
                seed_id,
                matches.len(),
                settings.seed_minimum_common_features
            );
            return None;
        }
        debug!(
            "seed '{}' spawning from triplet {:?} with score {} and {} common features",
            seed_id,
            views.map(|view| pairwise.id(view)),
            score,
            matches.len()
        );

        let problem = matches.problem(pairwise);
        let projective = match self.solver.fit(&problem) {
            Some(projective) => projective,
            None => {
                info!("seed '{}' failed the projective fit", seed_id);
                return None;
            }
        };
        let metric = match self.solver.upgrade(&problem, &projective, [None; 3]) {
            Some(metric) => metric,
            None => {
                info!("seed '{}' failed the metric upgrade", seed_id);
                return None;
            }
        };

        let mut scene = SceneWorkingGraph::new();
        let poses = [
            WorldToCamera::identity(),
            WorldToCamera(metric.view1_to_view2.0),
            WorldToCamera(metric.view1_to_view3.0),
        ];
        for i in 0..3 {
            let id = pairwise.id(views[i]);
            let db_camera = match self.database.view_to_camera(id) {
                Some(camera) => camera,
                None => {
                    warn!("image database has no camera for view '{}'", id);
                    return None;
                }
            };
            let created = scene.cameras.len();
            let camera = scene.add_camera(db_camera, matches.priors[i]);
            if camera == created {
                scene.cameras[camera].intrinsics = metric.intrinsics[i];
            }
            scene.add_view(views[i], camera, poses[i]);
        }
        scene.num_seed_views = 3;
        for i in 0..3 {
            let info = matches.inlier_info(i, &projective.inliers);
            scene.views[i].inliers.push(info);
        }

        if !self.clean_spawned_scene(pairwise, &mut scene) {
            info!("seed '{}' failed while cleaning up the spawned scene", seed_id);
            return None;
        }
        self.sanity_check_scene(pairwise, &scene, [candidate.view]);
        info!(
            "seed '{}' spawned a scene with {} seed features",
            seed_id,
            scene.views[0].inliers[0].len()
        );
        Some(scene)
    }

    /// Refines a freshly spawned scene and removes the features that are not physically possible.
    fn clean_spawned_scene(&mut self, pairwise: &PairwiseGraph, scene: &mut SceneWorkingGraph) -> bool {
        let settings = self.settings;
        let constraints = PhysicalConstraints {
            minimum_depth: 0.0,
            maximum_reprojection_error: settings.spawn_maximum_reprojection_error,
        };
        let pixels = match ScenePixels::for_scene(pairwise, &self.database, scene) {
            Some(pixels) => pixels,
            None => return false,
        };
        for attempt in 0..SPAWN_ATTEMPTS {
            if !self.refine_scene(pairwise, scene) {
                info!("refinement of the spawned scene failed");
                return false;
            }
            let bad = check_physical_constraints(
                &self.triangulator,
                scene,
                &pixels,
                &scene.views[0].inliers[0],
                &constraints,
            );
            let count = bad.iter().filter(|&&bad| bad).count();
            if count == 0 {
                return true;
            }
            if count as f64 > settings.spawn_fraction_bad_features_recover * bad.len() as f64 {
                info!(
                    "spawned scene has {} of {} bad features, too many to recover",
                    count,
                    bad.len()
                );
                return false;
            }
            if attempt + 1 == SPAWN_ATTEMPTS {
                info!("spawned scene still has {} bad features after cleaning", count);
                return false;
            }
            debug!("removing {} bad features from the spawned scene", count);
            // Every view of the seed recorded the same inliers in the same order.
            for view in &mut scene.views {
                let info = &mut view.inliers[0];
                for position in (0..bad.len()).rev() {
                    if bad[position] {
                        info.remove_swap(position);
                    }
                }
            }
            for camera in &mut scene.cameras {
                camera.intrinsics = camera.intrinsics.distortion(0.0, 0.0);
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strongest_triangle_wins() {
        let mut graph = PairwiseGraph::new();
        for i in 0..4 {
            graph.add_view(format!("v{}", i), 0);
        }
        let ab = graph.add_motion(0, 1, true, 0.9, vec![]);
        let ac = graph.add_motion(0, 2, true, 0.8, vec![]);
        let ad = graph.add_motion(0, 3, true, 0.7, vec![]);
        // The strong pair of neighbors is only connected without 3D.
        graph.add_motion(1, 2, false, 1.0, vec![]);
        graph.add_motion(1, 3, true, 0.5, vec![]);
        graph.add_motion(3, 2, true, 0.75, vec![]);
        let candidate = SeedCandidate {
            view: 0,
            score: 2.4,
            motions: vec![ab, ac, ad],
        };
        let (views, score) = select_spawn_triplet(&graph, &candidate).unwrap();
        assert_eq!(views, [0, 2, 3]);
        assert_eq!(score, 0.7);
    }

    #[test]
    fn neighbors_without_a_3d_motion_can_not_spawn() {
        let triangle = |bc_is_3d: bool| {
            let mut graph = PairwiseGraph::new();
            for i in 0..3 {
                graph.add_view(format!("v{}", i), 0);
            }
            let ab = graph.add_motion(0, 1, true, 0.9, vec![]);
            let ac = graph.add_motion(0, 2, true, 0.8, vec![]);
            graph.add_motion(2, 1, bc_is_3d, 0.6, vec![]);
            let candidate = SeedCandidate {
                view: 0,
                score: 1.7,
                motions: vec![ab, ac],
            };
            select_spawn_triplet(&graph, &candidate)
        };
        assert!(triangle(false).is_none());
        assert_eq!(triangle(true), Some(([0, 1, 2], 0.6)));
    }

    #[test]
    fn unconnected_neighbors_can_not_spawn() {
        let mut graph = PairwiseGraph::new();
        for i in 0..3 {
            graph.add_view(format!("v{}", i), 0);
        }
        let ab = graph.add_motion(0, 1, true, 0.9, vec![]);
        let ac = graph.add_motion(0, 2, true, 0.8, vec![]);
        let candidate = SeedCandidate {
            view: 0,
            score: 1.7,
            motions: vec![ab, ac],
        };
        assert!(select_spawn_triplet(&graph, &candidate).is_none());
    }
}
