//! Turns the inlier sets of a scene into a bundle adjustment problem and writes the optimized
//! poses and intrinsics back into the scene.
//!
//! Inlier sets only say that some observations belong together. The same physical feature is
//! usually found in several inlier sets, so before a new 3D point is created for an inlier, the
//! points that its observations already belong to are tried first.

use log::*;

use crate::{
    triangulate_in_first_frame, triangulation::INFINITY_TOLERANCE, BundleAdjuster,
    BundleObservations, BundleStructure, ImageDatabase, InlierInfo, MetricReconstructor,
    PairwiseGraph, PoseExt, ScenePixels, SceneWorkingGraph, ThreeViewSolver,
    TriangulatorObservations, ViewObservations,
};

/// Cameras and views of a scene that bundle adjustment must not change, by scene index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownParameters {
    pub cameras: Vec<bool>,
    pub views: Vec<bool>,
}

impl KnownParameters {
    /// Nothing is known.
    pub fn none(scene: &SceneWorkingGraph) -> Self {
        Self {
            cameras: vec![false; scene.cameras.len()],
            views: vec![false; scene.views.len()],
        }
    }
}

/// How the observations of the inlier sets were turned into points.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureCounts {
    /// Inlier features where every observation already belonged to a point.
    pub matched: usize,
    /// Inlier features where only some observations already belonged to a point.
    pub mixed: usize,
    /// Inlier features with fewer than two observations left to triangulate.
    pub too_few: usize,
    /// Inlier features that failed to triangulate.
    pub failed: usize,
}

/// A scene converted into the form bundle adjustment works with.
///
/// Scene views and cameras keep their indices, so results can be copied straight back.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneBundle {
    pub structure: BundleStructure,
    pub observations: BundleObservations,
    pub counts: FeatureCounts,
}

impl SceneBundle {
    /// Creates the points of a scene from its inlier sets.
    ///
    /// An observation is only attached to an existing point when it reprojects within
    /// `maximum_reprojection_error` pixels. Returns `None` if the image database is missing pixels.
    pub fn build<D, T>(
        pairwise: &PairwiseGraph,
        database: &D,
        triangulator: &T,
        scene: &SceneWorkingGraph,
        known: &KnownParameters,
        maximum_reprojection_error: f64,
    ) -> Option<Self>
    where
        D: ImageDatabase + ?Sized,
        T: TriangulatorObservations,
    {
        let pixels = ScenePixels::for_scene(pairwise, database, scene)?;

        let mut structure = BundleStructure::default();
        for (ix, camera) in scene.cameras.iter().enumerate() {
            structure.add_camera(camera.intrinsics, known.cameras[ix]);
        }
        let mut observations = BundleObservations::default();
        for (ix, view) in scene.views.iter().enumerate() {
            structure.add_view(view.camera, view.world_to_view, known.views[ix]);
            let view_pixels = pixels.view(view.pview).unwrap_or(&[]).to_vec();
            observations
                .views
                .push(ViewObservations::from_pixels(view_pixels));
        }

        let mut builder = Builder {
            scene,
            triangulator,
            structure,
            observations,
            maximum_error2: maximum_reprojection_error * maximum_reprojection_error,
            counts: FeatureCounts::default(),
        };
        for view in &scene.views {
            for info in &view.inliers {
                builder.add_inlier_set(info);
            }
        }

        let Builder {
            mut observations,
            structure,
            counts,
            ..
        } = builder;
        let removed: usize = observations
            .views
            .iter_mut()
            .map(ViewObservations::remove_unassigned)
            .sum();
        debug!(
            "built {} points with {} observations, {} unassigned observations removed, {:?}",
            structure.points.len(),
            observations.num_assigned(),
            removed,
            counts
        );
        Some(Self {
            structure,
            observations,
            counts,
        })
    }

    /// Copies the optimized intrinsics and poses into the scene.
    pub fn apply(&self, scene: &mut SceneWorkingGraph) {
        assert_eq!(scene.cameras.len(), self.structure.cameras.len());
        assert_eq!(scene.views.len(), self.structure.views.len());
        for (camera, optimized) in scene.cameras.iter_mut().zip(&self.structure.cameras) {
            camera.intrinsics = optimized.intrinsics;
        }
        for (view, optimized) in scene.views.iter_mut().zip(&self.structure.views) {
            view.world_to_view = optimized.world_to_view;
        }
    }
}

struct Builder<'a, T> {
    scene: &'a SceneWorkingGraph,
    triangulator: &'a T,
    structure: BundleStructure,
    observations: BundleObservations,
    maximum_error2: f64,
    counts: FeatureCounts,
}

impl<'a, T> Builder<'a, T>
where
    T: TriangulatorObservations,
{
    fn add_inlier_set(&mut self, info: &InlierInfo) {
        let views: Vec<usize> = info
            .views
            .iter()
            .map(|&pview| self.scene.expect_view(pview).index)
            .collect();
        for position in 0..info.len() {
            let features: Vec<usize> = info
                .observations
                .iter()
                .map(|list| list[position])
                .collect();
            self.add_inlier(&views, &features);
        }
    }

    /// `views` and `features` are parallel, one entry per view of the inlier set.
    fn add_inlier(&mut self, views: &[usize], features: &[usize]) {
        let mut unassigned: Vec<usize> = vec![];
        let mut points: Vec<usize> = vec![];
        for (i, (&view, &feature)) in views.iter().zip(features).enumerate() {
            match self.observations.views[view].points[feature] {
                Some(point) => {
                    if !points.contains(&point) {
                        points.push(point);
                    }
                }
                None => unassigned.push(i),
            }
        }
        if unassigned.is_empty() {
            self.counts.matched += 1;
            return;
        }
        if !points.is_empty() {
            self.counts.mixed += 1;
            unassigned.retain(|&i| !self.assign_to_existing(views[i], features[i], &points));
            if unassigned.is_empty() {
                return;
            }
        }
        if unassigned.len() < 2 {
            self.counts.too_few += 1;
            return;
        }

        // Every observation of the inlier helps with triangulation, even those that already
        // belong to a point.
        let observations: Vec<_> = views
            .iter()
            .zip(features)
            .map(|(&view, &feature)| {
                let pixel = self.observations.views[view].pixels[feature];
                let intrinsics = &self.scene.camera_of(view).intrinsics;
                (self.scene.views[view].world_to_view, intrinsics.bearing(pixel))
            })
            .collect();
        let point = match triangulate_in_first_frame(self.triangulator, &observations) {
            Some(point) if point.w > INFINITY_TOLERANCE => point,
            _ => {
                self.counts.failed += 1;
                return;
            }
        };
        let point = self.structure.add_point((point.xyz() / point.w).into());
        for i in unassigned {
            self.observations.views[views[i]].points[features[i]] = Some(point);
            self.structure.connect(point, views[i]);
        }
    }

    /// Attaches an observation to the point it reprojects best into, if any is close enough.
    fn assign_to_existing(&mut self, view: usize, feature: usize, points: &[usize]) -> bool {
        let pixel = self.observations.views[view].pixels[feature];
        let pose = self.scene.views[view].world_to_view;
        let best = points
            .iter()
            .copied()
            // A point can only be observed once per view.
            .filter(|&point| !self.structure.points[point].views.contains(&view))
            .filter(|&point| pose.transform_point(self.structure.points[point].point).z > 0.0)
            .map(|point| (self.structure.reprojection_error2(view, point, pixel), point))
            .filter(|&(error2, _)| error2 <= self.maximum_error2)
            .min_by_key(|&(error2, _)| float_ord::FloatOrd(error2));
        match best {
            Some((_, point)) => {
                self.observations.views[view].points[feature] = Some(point);
                self.structure.connect(point, view);
                true
            }
            None => false,
        }
    }
}

impl<D, S, B, T> MetricReconstructor<D, S, B, T>
where
    D: ImageDatabase,
    S: ThreeViewSolver,
    B: BundleAdjuster,
    T: TriangulatorObservations,
{
    /// Bundle adjusts every view of a scene. The first view is held fixed.
    ///
    /// Returns false and leaves the scene unmodified if refinement failed.
    pub fn refine_scene(&mut self, pairwise: &PairwiseGraph, scene: &mut SceneWorkingGraph) -> bool {
        let known = KnownParameters::none(scene);
        self.refine_scene_with(pairwise, scene, &known)
    }

    /// Bundle adjusts a scene while holding the `known` cameras and views fixed.
    ///
    /// Returns false and leaves the scene unmodified if refinement failed.
    pub fn refine_scene_with(
        &mut self,
        pairwise: &PairwiseGraph,
        scene: &mut SceneWorkingGraph,
        known: &KnownParameters,
    ) -> bool {
        let bundle = match SceneBundle::build(
            pairwise,
            &self.database,
            &self.triangulator,
            scene,
            known,
            self.settings.refine_maximum_reprojection_error,
        ) {
            Some(bundle) => bundle,
            None => {
                info!("refinement failed because image features are missing");
                return false;
            }
        };
        let SceneBundle {
            mut structure,
            mut observations,
            ..
        } = bundle;
        if structure.points.len() < self.settings.refine_minimum_features {
            info!(
                "refinement failed with only {} features, needs {}",
                structure.points.len(),
                self.settings.refine_minimum_features
            );
            return false;
        }
        structure.fix_gauge();

        if !self.adjuster.optimize(&mut structure, &observations) {
            info!("refinement failed because bundle adjustment failed");
            return false;
        }
        if self.settings.refine_keep_fraction < 1.0 {
            let pruned = observations.prune_worst(&mut structure, self.settings.refine_keep_fraction);
            debug!("pruned {} observations with the largest errors", pruned);
            if pruned != 0 && !self.adjuster.optimize(&mut structure, &observations) {
                info!("refinement failed because the second bundle adjustment failed");
                return false;
            }
        }

        let bundle = SceneBundle {
            structure,
            observations,
            counts: FeatureCounts::default(),
        };
        bundle.apply(scene);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AssociatedIndex, CameraIntrinsics, CameraPrior, LinearEigenTriangulator, MemoryDatabase,
        Pose, WorldToCamera,
    };
    use nalgebra::{Point3, Rotation3, Vector3};

    /// Three views of the same twelve points. Every view owns an inlier set over all three views,
    /// so every feature appears in three inlier sets.
    fn setup() -> (PairwiseGraph, MemoryDatabase, SceneWorkingGraph) {
        let prior = CameraPrior::from_shape(500.0, 640, 480);
        let intrinsics = CameraIntrinsics::from_prior(&prior);
        let poses = [
            WorldToCamera::identity(),
            WorldToCamera::from_parts(
                Vector3::new(-0.6, 0.05, 0.0),
                Rotation3::from_euler_angles(0.0, 0.05, 0.0),
            ),
            WorldToCamera::from_parts(
                Vector3::new(0.5, -0.1, 0.1),
                Rotation3::from_euler_angles(0.02, -0.04, 0.0),
            ),
        ];
        let points: Vec<Point3<f64>> = (0..12)
            .map(|i| {
                let i = i as f64;
                Point3::new((i * 0.7).sin(), (i * 1.3).cos() * 0.5, 5.0 + (i * 0.4).sin())
            })
            .collect();

        let mut database = MemoryDatabase::new();
        let camera = database.add_camera(prior);
        let mut pairwise = PairwiseGraph::new();
        let mut scene = SceneWorkingGraph::new();
        let scene_camera = scene.add_camera(camera, prior);
        for (ix, pose) in poses.iter().enumerate() {
            let id = format!("v{}", ix);
            let features = points
                .iter()
                .map(|&point| prior.uncenter(intrinsics.project(pose.transform_point(point))))
                .collect();
            database.add_image(id.clone(), camera, features);
            pairwise.add_view(id, points.len());
            scene.add_view(ix, scene_camera, *pose);
        }
        let all: Vec<AssociatedIndex> = (0..points.len())
            .map(|i| AssociatedIndex::new(i, i))
            .collect();
        pairwise.add_motion(0, 1, true, 1.0, all.clone());
        pairwise.add_motion(1, 2, true, 1.0, all.clone());
        pairwise.add_motion(0, 2, true, 1.0, all);
        for (owner, order) in [[0, 1, 2], [1, 0, 2], [2, 1, 0]].into_iter().enumerate() {
            let mut info = InlierInfo::new(order.to_vec());
            for i in 0..points.len() {
                info.push(&[i, i, i]);
            }
            scene.views[owner].inliers.push(info);
        }
        (pairwise, database, scene)
    }

    #[test]
    fn observations_are_assigned_once() {
        let (pairwise, database, scene) = setup();
        let bundle = SceneBundle::build(
            &pairwise,
            &database,
            &LinearEigenTriangulator::new(),
            &scene,
            &KnownParameters::none(&scene),
            5.0,
        )
        .unwrap();
        // The later inlier sets only find points that already exist.
        assert_eq!(bundle.structure.points.len(), 12);
        assert_eq!(bundle.counts.matched, 24);
        for (view, observations) in bundle.observations.views.iter().enumerate() {
            assert_eq!(observations.len(), 12);
            let mut points: Vec<usize> = observations.points.iter().map(|p| p.unwrap()).collect();
            points.sort_unstable();
            points.dedup();
            assert_eq!(points.len(), 12);
            for point in points {
                assert_eq!(
                    bundle.structure.points[point]
                        .views
                        .iter()
                        .filter(|&&v| v == view)
                        .count(),
                    1
                );
            }
        }
    }

    #[test]
    fn observations_join_points_that_reproject_nearby() {
        let (pairwise, database, mut scene) = setup();
        // The first view only knows about the second, so the third view has to join its points.
        let mut pair = InlierInfo::new(vec![0, 1]);
        for i in 0..12 {
            pair.push(&[i, i]);
        }
        scene.views[0].inliers[0] = pair;
        // The second view mixes up two features of the third view. They reproject far from the
        // points they are claimed to belong to.
        let view1 = &mut scene.views[1].inliers[0];
        view1.observations[2].swap(0, 1);
        let bundle = SceneBundle::build(
            &pairwise,
            &database,
            &LinearEigenTriangulator::new(),
            &scene,
            &KnownParameters::none(&scene),
            5.0,
        )
        .unwrap();
        assert_eq!(bundle.structure.points.len(), 12);
        // The third view picks the two features up again from its own inlier set.
        assert_eq!(bundle.counts.mixed, 14);
        assert_eq!(bundle.counts.too_few, 2);
        assert_eq!(bundle.observations.views[2].len(), 12);
        assert_eq!(bundle.observations.views[1].len(), 12);
    }

    #[test]
    fn feature_count_mismatch_fails() {
        let (pairwise, mut database, scene) = setup();
        let features = &mut database.images.get_mut("v0").unwrap().features;
        features.push(features[0]);
        // The pairwise graph says `v0` has 12 features.
        let bundle = SceneBundle::build(
            &pairwise,
            &database,
            &LinearEigenTriangulator::new(),
            &scene,
            &KnownParameters::none(&scene),
            5.0,
        );
        assert!(bundle.is_none());
    }

    #[test]
    fn unassigned_observations_are_pruned() {
        let (pairwise, database, mut scene) = setup();
        for view in &mut scene.views {
            for info in &mut view.inliers {
                info.remove_swap(0);
            }
        }
        let bundle = SceneBundle::build(
            &pairwise,
            &database,
            &LinearEigenTriangulator::new(),
            &scene,
            &KnownParameters::none(&scene),
            5.0,
        )
        .unwrap();
        assert_eq!(bundle.structure.points.len(), 11);
        for observations in &bundle.observations.views {
            assert_eq!(observations.len(), 11);
            assert!(!observations.features.contains(&0));
        }
    }
}
