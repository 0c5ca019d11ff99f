//! Grows scenes one view at a time.
//!
//! Every scene keeps a frontier of views it could expand into. Across all scenes, the frontier
//! view that forms the strongest triangle with two views its scene already knows is added next.
//! The new view is estimated from that triangle alone and then moved into the scale of the scene
//! using the known distance between the two anchor views.

use float_ord::FloatOrd;
use itertools::Itertools;
use log::*;

use crate::{
    triangulate_in_front, triangulation::INFINITY_TOLERANCE, AssociatedTriple, BundleAdjuster,
    BundleObservations, BundleStructure, CameraIntrinsics, CameraToCamera, ImageDatabase,
    MetricReconstructor, Motion, PairwiseGraph, Pose, PoseExt, Reconstruction, SceneKey,
    SceneWorkingGraph, ThreeViewSolver, TriangulatorObservations, TripletMatches,
    ViewObservations, WorldToCamera, WorldToCameraExt,
};

/// Having more known neighbors than this does not make a view a better candidate.
const PREFERRED_CONNECTIONS: usize = 3;

/// The open view a scene would expand into next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpansionCandidate {
    /// Position of the view in the open list of the scene.
    pub open_index: usize,
    pub pview: usize,
    /// The weakest motion of the strongest triangle the view forms with two known views.
    pub score: f64,
    /// The number of known views the view shares a 3D motion with, at most three.
    pub connections: usize,
}

/// The 3D motions between `pview` and views the scene already knows.
fn known_neighbors<'a>(
    pairwise: &'a PairwiseGraph,
    scene: &'a SceneWorkingGraph,
    pview: usize,
) -> impl Iterator<Item = &'a Motion> + Clone + 'a {
    pairwise
        .connections(pview)
        .filter(move |motion| motion.is_3d && scene.is_known(motion.other(pview)))
}

/// Picks the two known neighbors of `target` that share a 3D motion with each other and form the
/// strongest triangle with it. Returns the neighbors and the score of the triangle.
pub fn select_two_connections(
    pairwise: &PairwiseGraph,
    scene: &SceneWorkingGraph,
    target: usize,
) -> Option<([usize; 2], f64)> {
    known_neighbors(pairwise, scene, target)
        .tuple_combinations()
        .filter_map(|(tb, tc)| {
            let (b, c) = (tb.other(target), tc.other(target));
            let bc = pairwise.find_motion_3d(b, c)?;
            Some(([b, c], tb.score_3d.min(tc.score_3d).min(bc.score_3d)))
        })
        .max_by_key(|&(_, score)| FloatOrd(score))
}

/// Picks the open view of a scene to expand into next.
///
/// A view needs a triangle with a score above zero. Views with more known neighbors, up to
/// three, are preferred over views with a better triangle, and the triangle score only breaks
/// ties between views with as many neighbors. Of views that tie on both, the one opened first
/// wins. Returns `None` if no open view can be expanded into.
pub fn select_next(pairwise: &PairwiseGraph, scene: &SceneWorkingGraph) -> Option<ExpansionCandidate> {
    let mut best: Option<ExpansionCandidate> = None;
    for (open_index, &pview) in scene.open().iter().enumerate() {
        let connections = known_neighbors(pairwise, scene, pview)
            .count()
            .min(PREFERRED_CONNECTIONS);
        let score = select_two_connections(pairwise, scene, pview)
            .map(|(_, score)| score)
            .unwrap_or(0.0);
        if score <= 0.0 {
            continue;
        }
        let better = best.map_or(true, |best| {
            (connections, FloatOrd(score)) > (best.connections, FloatOrd(best.score))
        });
        if better {
            best = Some(ExpansionCandidate {
                open_index,
                pview,
                score,
                connections,
            });
        }
    }
    best
}

/// Puts every unexplored view that shares a 3D motion with `pview` on the frontier of a scene.
///
/// Returns the number of views that were opened.
pub fn open_neighbors(pairwise: &PairwiseGraph, scene: &mut SceneWorkingGraph, pview: usize) -> usize {
    let mut opened = 0;
    for motion in pairwise.connections(pview) {
        if motion.is_3d && scene.open_view(motion.other(pview)) {
            opened += 1;
        }
    }
    opened
}

/// Returns true if a scene may continue to expand from `pview`.
///
/// A view another scene already contains may only be expanded from if it is part of the seed
/// set of every such scene. A bad seed can then be jumped over, while scenes that grew into each
/// other stop there instead of turning into duplicates.
pub fn can_expand_from(reconstruction: &Reconstruction, key: SceneKey, pview: usize) -> bool {
    reconstruction
        .viewed_by(pview)
        .iter()
        .filter(|&&other| other != key)
        .all(|&other| {
            reconstruction
                .scene(other)
                .map(|scene| scene.is_seed_set(pview))
                .unwrap_or(true)
        })
}

/// Three views estimated in the frame of the first, which is at the origin.
#[derive(Debug, Clone, Copy)]
struct LocalTriplet {
    /// Scene cameras of the views. The target has none when its camera is new to the scene.
    cameras: [Option<usize>; 3],
    intrinsics: [CameraIntrinsics; 3],
    poses: [WorldToCamera; 3],
}

impl LocalTriplet {
    /// Creates the bundle adjustment problem of the triplet.
    ///
    /// The first two views and their cameras are held fixed, as is the target camera when the
    /// scene already has it. Features that do not triangulate are left out.
    fn bundle(
        &self,
        triangulator: &impl TriangulatorObservations,
        triples: impl Iterator<Item = AssociatedTriple>,
    ) -> (BundleStructure, BundleObservations) {
        let mut structure = BundleStructure::default();
        let mut added: Vec<(Option<usize>, usize)> = vec![];
        for i in 0..3 {
            let shared = self.cameras[i].and_then(|scene_camera| {
                added
                    .iter()
                    .find(|&&(camera, _)| camera == Some(scene_camera))
                    .map(|&(_, bundle_camera)| bundle_camera)
            });
            let camera = match shared {
                Some(camera) => camera,
                None => {
                    let camera = structure.add_camera(self.intrinsics[i], self.cameras[i].is_some());
                    added.push((self.cameras[i], camera));
                    camera
                }
            };
            structure.add_view(camera, self.poses[i], i < 2);
        }

        let mut observations = BundleObservations {
            views: vec![ViewObservations::default(); 3],
        };
        for (position, triple) in triples.enumerate() {
            let pairs = [0, 1, 2].map(|i| (self.poses[i], self.intrinsics[i].bearing(triple.get(i))));
            let point = match triangulate_in_front(triangulator, &pairs) {
                Some(point) => point,
                None => continue,
            };
            if point.w <= INFINITY_TOLERANCE {
                continue;
            }
            let point = structure.add_point((point.xyz() / point.w).into());
            for (view, observation) in observations.views.iter_mut().enumerate() {
                structure.connect(point, view);
                observation.pixels.push(triple.get(view));
                observation.points.push(Some(point));
                observation.features.push(position);
            }
        }
        (structure, observations)
    }
}

/// The number of points that are behind each view.
fn count_behind(structure: &BundleStructure) -> Vec<usize> {
    structure
        .views
        .iter()
        .map(|view| {
            structure
                .points
                .iter()
                .filter(|point| view.world_to_view.transform_point(point.point).z < 0.0)
                .count()
        })
        .collect()
}

impl<D, S, B, T> MetricReconstructor<D, S, B, T>
where
    D: ImageDatabase,
    S: ThreeViewSolver,
    B: BundleAdjuster,
    T: TriangulatorObservations,
{
    /// Estimates a view that is not yet part of a scene from two views the scene knows, and adds
    /// it to the scene along with the inliers it was estimated from.
    ///
    /// Returns false and leaves the scene unmodified if the view could not be estimated.
    pub fn expand_by_one_view(
        &mut self,
        pairwise: &PairwiseGraph,
        scene: &mut SceneWorkingGraph,
        target: usize,
    ) -> bool {
        let settings = self.settings;
        let target_id = pairwise.id(target);
        assert!(
            !scene.is_known(target),
            "view '{}' is already part of the scene it is expanding into",
            target_id
        );
        let [view1, view2] = match select_two_connections(pairwise, scene, target) {
            Some((views, _)) => views,
            None => {
                info!(
                    "view '{}' has no two connected neighbors in the scene to expand from",
                    target_id
                );
                return false;
            }
        };
        let matches = match TripletMatches::gather(pairwise, &self.database, [view1, view2, target]) {
            Some(matches) => matches,
            None => return false,
        };
        debug!(
            "expanding into view '{}' from views '{}' and '{}' with {} common features",
            target_id,
            pairwise.id(view1),
            pairwise.id(view2),
            matches.len()
        );
        let db_camera = match self.database.view_to_camera(target_id) {
            Some(camera) => camera,
            None => {
                warn!("image database has no camera for view '{}'", target_id);
                return false;
            }
        };

        let (world_to_view1, camera1) = {
            let view = scene.expect_view(view1);
            (view.world_to_view, view.camera)
        };
        let (world_to_view2, camera2) = {
            let view = scene.expect_view(view2);
            (view.world_to_view, view.camera)
        };
        let target_camera = scene.lookup_camera(db_camera);
        let (intrinsics1, intrinsics2) = (
            scene.cameras[camera1].intrinsics,
            scene.cameras[camera2].intrinsics,
        );
        let known = [
            Some(intrinsics1),
            Some(intrinsics2),
            target_camera.map(|camera| scene.cameras[camera].intrinsics),
        ];

        let problem = matches.problem(pairwise);
        let projective = match self.solver.fit(&problem) {
            Some(projective) => projective,
            None => {
                info!("expanding into view '{}' failed the projective fit", target_id);
                return false;
            }
        };
        let metric = match self.solver.upgrade(&problem, &projective, known) {
            Some(metric) => metric,
            None => {
                info!("expanding into view '{}' failed the metric upgrade", target_id);
                return false;
            }
        };

        // The local triplet has its own scale. Keep it near one before it is resolved.
        let norm = metric.view1_to_view3.translation().norm();
        if !norm.is_finite() || norm == 0.0 {
            info!(
                "expanding into view '{}' failed since it has no baseline to view '{}'",
                target_id,
                pairwise.id(view1)
            );
            return false;
        }
        let local_view1_to_view2 = metric.view1_to_view2.scale(1.0 / norm);
        let mut view1_to_target = metric.view1_to_view3.scale(1.0 / norm);

        let known_view1_to_view2 = world_to_view1.relative_to(world_to_view2);
        let scale =
            known_view1_to_view2.translation().norm() / local_view1_to_view2.translation().norm();
        if !scale.is_finite() || scale == 0.0 {
            info!(
                "expanding into view '{}' failed since the local scale {} is degenerate",
                target_id, scale
            );
            return false;
        }
        if local_view1_to_view2
            .translation()
            .dot(&known_view1_to_view2.translation())
            < 0.0
        {
            view1_to_target =
                CameraToCamera::from_parts(-view1_to_target.translation(), view1_to_target.rotation());
        }
        let mut target_intrinsics = metric.intrinsics[2];

        if settings.expand_bundle_adjust {
            let triplet = LocalTriplet {
                cameras: [Some(camera1), Some(camera2), target_camera],
                intrinsics: [intrinsics1, intrinsics2, target_intrinsics],
                poses: [
                    WorldToCamera::identity(),
                    WorldToCamera(known_view1_to_view2.scale(1.0 / scale).0),
                    WorldToCamera(view1_to_target.0),
                ],
            };
            match self.adjust_triplet(pairwise, target, &triplet, &matches, &projective.inliers) {
                Some((intrinsics, pose)) => {
                    target_intrinsics = intrinsics;
                    view1_to_target = pose;
                }
                None => return false,
            }
        }

        let world_to_target = world_to_view1.then(view1_to_target.scale(scale));
        let created = scene.cameras.len();
        let camera = scene.add_camera(db_camera, matches.priors[2]);
        if camera == created {
            scene.cameras[camera].intrinsics = target_intrinsics;
        }
        let index = scene.add_view(target, camera, world_to_target);
        scene.views[index]
            .inliers
            .push(matches.inlier_info(2, &projective.inliers));
        info!(
            "expanded into view '{}' with {} of {} features as inliers, scene has {} views",
            target_id,
            projective.inliers.len(),
            matches.len(),
            scene.len()
        );
        true
    }

    /// Bundle adjusts the target of a local triplet and rejects it if too many features end up
    /// behind one of the views. Returns the refined intrinsics and pose of the target.
    fn adjust_triplet(
        &mut self,
        pairwise: &PairwiseGraph,
        target: usize,
        triplet: &LocalTriplet,
        matches: &TripletMatches,
        inliers: &[usize],
    ) -> Option<(CameraIntrinsics, CameraToCamera)> {
        let target_id = pairwise.id(target);
        let (mut structure, observations) = triplet.bundle(
            &self.triangulator,
            inliers.iter().map(|&inlier| matches.triples[inlier]),
        );
        if structure.points.is_empty() {
            info!("expanding into view '{}' failed since no inlier triangulated", target_id);
            return None;
        }
        if structure.points.len() < inliers.len() {
            debug!(
                "{} of {} inliers of view '{}' did not triangulate",
                inliers.len() - structure.points.len(),
                inliers.len(),
                target_id
            );
        }
        if !self.adjuster.optimize(&mut structure, &observations) {
            info!("expanding into view '{}' failed bundle adjustment", target_id);
            return None;
        }

        let behind = count_behind(&structure);
        let allowed = self.settings.expand_maximum_fraction_behind * structure.points.len() as f64;
        if behind.iter().any(|&behind| behind as f64 > allowed) {
            info!(
                "expanding into view '{}' failed with {:?} of {} features behind the views",
                target_id,
                behind,
                structure.points.len()
            );
            return None;
        }
        let view = &structure.views[2];
        Some((
            structure.cameras[view.camera].intrinsics,
            CameraToCamera(view.world_to_view.0),
        ))
    }

    /// Expands every scene until no scene has an open view left that it can expand into.
    ///
    /// Each step expands the one scene, out of all of them, with the best candidate. A view that
    /// fails to be added is dropped from the frontier of that scene for good.
    pub fn expand_scenes(&mut self, pairwise: &PairwiseGraph, reconstruction: &mut Reconstruction) {
        for (key, scene) in reconstruction.scenes_mut() {
            let pviews: Vec<usize> = scene.pviews().collect();
            for &pview in &pviews {
                scene.explore(pview);
            }
            for pview in pviews {
                open_neighbors(pairwise, scene, pview);
            }
            debug!("scene {:?} starts expanding with {} open views", key, scene.open().len());
        }

        let settings = self.settings;
        let (mut expanded, mut discarded) = (0, 0);
        loop {
            let best = reconstruction
                .scenes()
                .filter_map(|(key, scene)| select_next(pairwise, scene).map(|next| (key, next)))
                .fold(None, |best: Option<(SceneKey, ExpansionCandidate)>, (key, next)| {
                    match best {
                        Some((_, best_next)) if next.score <= best_next.score => best,
                        _ => Some((key, next)),
                    }
                });
            let (key, next) = match best {
                Some(best) => best,
                None => break,
            };
            debug!(
                "scene {:?} expands into view '{}' with score {} and {} known neighbors",
                key,
                pairwise.id(next.pview),
                next.score,
                next.connections
            );

            let scene = match reconstruction.scene_mut(key) {
                Some(scene) => scene,
                None => panic!("scene {:?} selected for expansion does not exist", key),
            };
            let target = scene.take_open(next.open_index);
            assert_eq!(
                target, next.pview,
                "open list of scene {:?} changed while selecting a view",
                key
            );
            if !self.expand_by_one_view(pairwise, scene, target) {
                info!(
                    "discarding view '{}' from the frontier of scene {:?}",
                    pairwise.id(target),
                    key
                );
                discarded += 1;
                continue;
            }
            self.sanity_check_scene(pairwise, scene, [target]);
            expanded += 1;

            let opened = if can_expand_from(reconstruction, key, target) {
                match reconstruction.scene_mut(key) {
                    Some(scene) => open_neighbors(pairwise, scene, target),
                    None => 0,
                }
            } else {
                debug!(
                    "view '{}' belongs to another scene, scene {:?} will not expand from it",
                    pairwise.id(target),
                    key
                );
                0
            };
            reconstruction.mark_viewed(key, target);
            debug!("expanding into view '{}' opened {} views", pairwise.id(target), opened);

            if let Some(scene) = reconstruction.scene_mut(key) {
                if scene.len() <= settings.refine_while_expanding_max_views
                    && !self.refine_scene(pairwise, scene)
                {
                    warn!(
                        "refinement of scene {:?} with {} views failed while expanding",
                        key,
                        scene.len()
                    );
                }
            }
        }
        info!(
            "expansion added {} views and discarded {} views",
            expanded, discarded
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CameraPrior;
    use nalgebra::{Point3, Rotation3, Vector3};

    fn scene(pviews: &[usize]) -> SceneWorkingGraph {
        let mut scene = SceneWorkingGraph::new();
        let camera = scene.add_camera(0, CameraPrior::from_shape(500.0, 640, 480));
        for &pview in pviews {
            scene.add_view(pview, camera, WorldToCamera::identity());
        }
        scene
    }

    /// `A`, `B`, and `C` are known. `D` connects to `B` and `C`, `E` only to `A`.
    fn graph() -> PairwiseGraph {
        let mut graph = PairwiseGraph::new();
        for id in ["A", "B", "C", "D", "E"] {
            graph.add_view(id, 0);
        }
        graph.add_motion(0, 1, true, 0.9, vec![]);
        graph.add_motion(0, 2, true, 0.8, vec![]);
        graph.add_motion(1, 2, true, 0.7, vec![]);
        graph.add_motion(3, 1, true, 0.6, vec![]);
        graph.add_motion(3, 2, true, 0.6, vec![]);
        graph.add_motion(4, 0, true, 0.95, vec![]);
        graph
    }

    #[test]
    fn only_views_with_two_connected_neighbors_are_selected() {
        let graph = graph();
        let mut scene = scene(&[0, 1, 2]);
        for pview in 0..3 {
            scene.explore(pview);
            open_neighbors(&graph, &mut scene, pview);
        }
        let mut open = scene.open().to_vec();
        open.sort_unstable();
        assert_eq!(open, vec![3, 4]);

        let next = select_next(&graph, &scene).unwrap();
        assert_eq!(next.pview, 3);
        assert_eq!(next.score, 0.6);
        assert_eq!(next.connections, 2);
        assert_eq!(scene.open()[next.open_index], 3);
        assert_eq!(
            select_two_connections(&graph, &scene, 3),
            Some(([1, 2], 0.6))
        );
    }

    #[test]
    fn more_known_neighbors_beat_a_better_triangle() {
        let mut graph = PairwiseGraph::new();
        for i in 0..6 {
            graph.add_view(format!("v{}", i), 0);
        }
        graph.add_motion(0, 1, true, 1.0, vec![]);
        graph.add_motion(1, 2, true, 1.0, vec![]);
        graph.add_motion(0, 2, true, 1.0, vec![]);
        // View 4 forms a strong triangle with two known views.
        graph.add_motion(4, 0, true, 0.9, vec![]);
        graph.add_motion(4, 1, true, 0.9, vec![]);
        // View 3 is weaker but connects to all three known views.
        graph.add_motion(3, 0, true, 0.5, vec![]);
        graph.add_motion(3, 1, true, 0.5, vec![]);
        graph.add_motion(3, 2, true, 0.5, vec![]);
        for open in [[3, 4], [4, 3]] {
            let mut scene = scene(&[0, 1, 2]);
            for pview in open {
                scene.open_view(pview);
            }
            let next = select_next(&graph, &scene).unwrap();
            assert_eq!(next.pview, 3);
            assert_eq!(next.connections, 3);
        }
    }

    #[test]
    fn neighbor_count_wins_regardless_of_frontier_order() {
        let mut graph = PairwiseGraph::new();
        for i in 0..5 {
            graph.add_view(format!("v{}", i), 0);
        }
        graph.add_motion(0, 1, true, 1.0, vec![]);
        graph.add_motion(1, 2, true, 1.0, vec![]);
        graph.add_motion(0, 2, true, 1.0, vec![]);
        // Both triangles score the same, but view 3 sees every known view.
        graph.add_motion(3, 0, true, 0.5, vec![]);
        graph.add_motion(3, 1, true, 0.5, vec![]);
        graph.add_motion(3, 2, true, 0.5, vec![]);
        graph.add_motion(4, 0, true, 0.5, vec![]);
        graph.add_motion(4, 1, true, 0.5, vec![]);
        for open in [[3, 4], [4, 3]] {
            let mut scene = scene(&[0, 1, 2]);
            for pview in open {
                scene.open_view(pview);
            }
            let next = select_next(&graph, &scene).unwrap();
            assert_eq!(next.pview, 3);
            assert_eq!(next.connections, 3);
            assert_eq!(next.score, 0.5);
            assert_eq!(scene.open()[next.open_index], 3);
        }
    }

    #[test]
    fn equal_candidates_keep_the_first_opened_view() {
        let mut graph = PairwiseGraph::new();
        for i in 0..5 {
            graph.add_view(format!("v{}", i), 0);
        }
        graph.add_motion(0, 1, true, 1.0, vec![]);
        graph.add_motion(3, 0, true, 0.5, vec![]);
        graph.add_motion(3, 1, true, 0.5, vec![]);
        graph.add_motion(4, 0, true, 0.5, vec![]);
        graph.add_motion(4, 1, true, 0.5, vec![]);
        let mut scene = scene(&[0, 1]);
        scene.open_view(4);
        scene.open_view(3);
        assert_eq!(select_next(&graph, &scene).unwrap().pview, 4);
    }

    #[test]
    fn nothing_is_selected_without_a_triangle() {
        let graph = graph();
        let mut scene = scene(&[0, 1, 2]);
        scene.open_view(4);
        assert_eq!(select_next(&graph, &scene), None);
    }

    #[test]
    fn explored_views_are_not_opened_again() {
        let graph = graph();
        let mut scene = scene(&[0, 1, 2]);
        assert_eq!(open_neighbors(&graph, &mut scene, 1), 3);
        let position = scene.open().iter().position(|&pview| pview == 3).unwrap();
        scene.take_open(position);
        assert_eq!(open_neighbors(&graph, &mut scene, 2), 0);
        assert!(!scene.open().contains(&3));
    }

    #[test]
    fn only_seed_views_of_other_scenes_can_be_expanded_from() {
        let mut reconstruction = Reconstruction::new(5);
        let mut other = scene(&[0, 1, 2, 3]);
        other.num_seed_views = 3;
        let other = reconstruction.add_scene(other);
        let key = reconstruction.add_scene(scene(&[4]));
        assert!(can_expand_from(&reconstruction, key, 1));
        assert!(!can_expand_from(&reconstruction, key, 3));
        assert!(can_expand_from(&reconstruction, key, 4));
        assert!(can_expand_from(&reconstruction, other, 3));
    }

    #[test]
    fn behind_points_are_counted_per_view() {
        let mut structure = BundleStructure::default();
        let camera = structure.add_camera(CameraIntrinsics::new(100.0), true);
        structure.add_view(camera, WorldToCamera::identity(), true);
        structure.add_view(
            camera,
            WorldToCamera::from_parts(Vector3::new(0.0, 0.0, -3.0), Rotation3::identity()),
            false,
        );
        structure.add_point(Point3::new(0.0, 0.0, 1.0));
        structure.add_point(Point3::new(0.0, 0.0, 5.0));
        assert_eq!(count_behind(&structure), vec![0, 1]);
    }
}
