//! Tests that a scene is physically possible.
//!
//! Features of an inlier set are triangulated from the current poses and intrinsics and must land
//! in front of every view that saw them.

use std::collections::BTreeMap;

use log::*;
use nalgebra::{Point2, Vector4};

use crate::{
    centered_features, triangulate_in_first_frame, triangulation::INFINITY_TOLERANCE,
    ImageDatabase, InlierInfo, PairwiseGraph, PoseExt, SceneWorkingGraph,
    TriangulatorObservations,
};

/// The limits a triangulated feature must stay within.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalConstraints {
    /// Features must be at least this deep in every view.
    pub minimum_depth: f64,
    /// The largest reprojection error in pixels that is still physically plausible.
    pub maximum_reprojection_error: f64,
}

impl Default for PhysicalConstraints {
    fn default() -> Self {
        Self {
            minimum_depth: 0.0,
            maximum_reprojection_error: f64::INFINITY,
        }
    }
}

/// Centered feature pixels of views, loaded from the image database on demand.
#[derive(Debug, Clone, Default)]
pub struct ScenePixels {
    pixels: BTreeMap<usize, Vec<Point2<f64>>>,
}

impl ScenePixels {
    /// Loads the pixels of every view in `pviews`. Returns `None` if the database is missing one.
    pub fn load<D>(
        pairwise: &PairwiseGraph,
        database: &D,
        pviews: impl IntoIterator<Item = usize>,
    ) -> Option<Self>
    where
        D: ImageDatabase + ?Sized,
    {
        let mut pixels = BTreeMap::new();
        for pview in pviews {
            if pixels.contains_key(&pview) {
                continue;
            }
            let id = pairwise.id(pview);
            let (_, centered) = centered_features(database, id).or_else(|| {
                warn!("image database has no features for view '{}'", id);
                None
            })?;
            if centered.len() != pairwise.view(pview).total_observations {
                warn!(
                    "image database has {} features for view '{}' but the pairwise graph has {}",
                    centered.len(),
                    id,
                    pairwise.view(pview).total_observations
                );
                return None;
            }
            pixels.insert(pview, centered);
        }
        Some(Self { pixels })
    }

    /// Loads the pixels of every view referenced by the inlier sets of a scene.
    pub fn for_scene<D>(
        pairwise: &PairwiseGraph,
        database: &D,
        scene: &SceneWorkingGraph,
    ) -> Option<Self>
    where
        D: ImageDatabase + ?Sized,
    {
        let referenced = scene
            .views
            .iter()
            .flat_map(|view| view.inliers.iter())
            .flat_map(|info| info.views.iter().copied());
        Self::load(pairwise, database, scene.pviews().chain(referenced))
    }

    /// The centered pixel of a feature.
    ///
    /// Panics if the view was not loaded.
    pub fn get(&self, pview: usize, feature: usize) -> Point2<f64> {
        match self.pixels.get(&pview) {
            Some(pixels) => pixels[feature],
            None => panic!("pixels of pairwise view {} were never loaded", pview),
        }
    }

    pub fn view(&self, pview: usize) -> Option<&[Point2<f64>]> {
        self.pixels.get(&pview).map(Vec::as_slice)
    }
}

/// Triangulates the feature at `position` of an inlier set using the current state of the scene.
pub fn triangulate_inlier(
    triangulator: &impl TriangulatorObservations,
    scene: &SceneWorkingGraph,
    pixels: &ScenePixels,
    info: &InlierInfo,
    position: usize,
) -> Option<Vector4<f64>> {
    let observations: Vec<_> = info
        .views
        .iter()
        .zip(&info.observations)
        .map(|(&pview, features)| {
            let view = scene.expect_view(pview);
            let intrinsics = &scene.cameras[view.camera].intrinsics;
            let pixel = pixels.get(pview, features[position]);
            (view.world_to_view, intrinsics.bearing(pixel))
        })
        .collect();
    triangulate_in_first_frame(triangulator, &observations)
}

/// Returns true if a triangulated feature satisfies the constraints in every view of the set.
fn feature_is_good(
    scene: &SceneWorkingGraph,
    pixels: &ScenePixels,
    info: &InlierInfo,
    position: usize,
    point: Vector4<f64>,
    constraints: &PhysicalConstraints,
) -> bool {
    let at_infinity = point.w.abs() <= INFINITY_TOLERANCE * point.norm();
    info.views
        .iter()
        .zip(&info.observations)
        .all(|(&pview, features)| {
            let view = scene.expect_view(pview);
            let camera = view.world_to_view.transform_homogeneous(point);
            if at_infinity {
                return camera.z > 0.0;
            }
            let depth = camera.z / camera.w;
            if depth <= constraints.minimum_depth {
                return false;
            }
            let intrinsics = &scene.cameras[view.camera].intrinsics;
            let pixel = pixels.get(pview, features[position]);
            let error = (intrinsics.project_homogeneous(camera) - pixel).norm();
            error <= constraints.maximum_reprojection_error
        })
}

/// Finds the features of one inlier set that violate the constraints.
///
/// Returns one flag per feature of the set, true for features that failed to triangulate or
/// broke a constraint.
pub fn check_physical_constraints(
    triangulator: &impl TriangulatorObservations,
    scene: &SceneWorkingGraph,
    pixels: &ScenePixels,
    info: &InlierInfo,
    constraints: &PhysicalConstraints,
) -> Vec<bool> {
    (0..info.len())
        .map(|position| {
            match triangulate_inlier(triangulator, scene, pixels, info, position) {
                Some(point) => !feature_is_good(scene, pixels, info, position, point, constraints),
                None => true,
            }
        })
        .collect()
}

/// Removes the flagged features from an inlier set, unless more than `fraction_recover` of the
/// features are flagged, in which case the set is left alone and false is returned.
pub fn remove_bad_features(info: &mut InlierInfo, bad: &[bool], fraction_recover: f64) -> bool {
    assert_eq!(
        bad.len(),
        info.len(),
        "one flag per feature of the inlier set is required"
    );
    let count = bad.iter().filter(|&&bad| bad).count();
    if count as f64 > fraction_recover * bad.len() as f64 {
        return false;
    }
    // Descending, so the features swapped into place were already checked.
    for position in (0..bad.len()).rev() {
        if bad[position] {
            info.remove_swap(position);
        }
    }
    true
}

/// Checks that at most `fraction_bad` of the inlier features of a view triangulate behind any of
/// the views that observed them. Logs the details when the check fails.
pub fn inlier_triangulate_positive_depth(
    pairwise: &PairwiseGraph,
    triangulator: &impl TriangulatorObservations,
    scene: &SceneWorkingGraph,
    pixels: &ScenePixels,
    pview: usize,
    fraction_bad: f64,
) -> bool {
    let view = scene.expect_view(pview);
    let mut total = 0;
    let mut bad = 0;
    for info in &view.inliers {
        let flags = check_physical_constraints(
            triangulator,
            scene,
            pixels,
            info,
            &PhysicalConstraints::default(),
        );
        total += flags.len();
        bad += flags.into_iter().filter(|&bad| bad).count();
    }
    if bad as f64 > fraction_bad * total as f64 {
        error!(
            "view '{}' has {} of {} inlier features behind a view",
            pairwise.id(pview),
            bad,
            total
        );
        false
    } else {
        debug!(
            "view '{}' has {} of {} inlier features behind a view",
            pairwise.id(pview),
            bad,
            total
        );
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

    /// Two views looking at ten points, where the last point is shifted in the second view so
    /// that its rays meet behind both views.
    fn setup() -> (PairwiseGraph, MemoryDatabase, SceneWorkingGraph, InlierInfo) {
        let prior = CameraPrior::from_shape(500.0, 640, 480);
        let intrinsics = CameraIntrinsics::from_prior(&prior);
        let poses = [
            WorldToCamera::identity(),
            WorldToCamera::from_parts(Vector3::new(-1.0, 0.0, 0.0), Rotation3::identity()),
        ];
        let points: Vec<Point3<f64>> = (0..10)
            .map(|i| {
                let i = i as f64;
                Point3::new(-0.5 + 0.1 * i, 0.2 - 0.05 * i, 4.0 + 0.2 * i)
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
                .enumerate()
                .map(|(p, &point)| {
                    let mut centered = intrinsics.project(pose.transform_point(point));
                    if ix == 1 && p == 9 {
                        centered.x = -centered.x + 100.0;
                    }
                    prior.uncenter(centered)
                })
                .collect();
            database.add_image(id.clone(), camera, features);
            let pview = pairwise.add_view(id, points.len());
            scene.add_view(pview, scene_camera, *pose);
        }
        pairwise.add_motion(
            0,
            1,
            true,
            1.0,
            (0..points.len()).map(|i| AssociatedIndex::new(i, i)).collect(),
        );
        let mut info = InlierInfo::new(vec![0, 1]);
        for i in 0..points.len() {
            info.push(&[i, i]);
        }
        (pairwise, database, scene, info)
    }

    #[test]
    fn feature_behind_a_view_is_flagged() {
        let (pairwise, database, scene, info) = setup();
        let pixels = ScenePixels::for_scene(&pairwise, &database, &scene).unwrap();
        let bad = check_physical_constraints(
            &LinearEigenTriangulator::new(),
            &scene,
            &pixels,
            &info,
            &PhysicalConstraints::default(),
        );
        let flagged: Vec<usize> = (0..bad.len()).filter(|&i| bad[i]).collect();
        assert_eq!(flagged, vec![9]);
    }

    #[test]
    fn small_violations_are_removed() {
        let (pairwise, database, scene, mut info) = setup();
        let pixels = ScenePixels::for_scene(&pairwise, &database, &scene).unwrap();
        let bad = check_physical_constraints(
            &LinearEigenTriangulator::new(),
            &scene,
            &pixels,
            &info,
            &PhysicalConstraints::default(),
        );
        let original = info.clone();
        assert!(!remove_bad_features(&mut info, &bad, 0.05));
        assert_eq!(info, original);
        assert!(remove_bad_features(&mut info, &bad, 0.2));
        assert_eq!(info.len(), 9);
        assert!(!info.observations[0].contains(&9));
    }

    #[test]
    fn positive_depth_check_tolerates_a_fraction() {
        let (pairwise, database, mut scene, info) = setup();
        scene.views[0].inliers.push(info);
        let pixels = ScenePixels::for_scene(&pairwise, &database, &scene).unwrap();
        let triangulator = LinearEigenTriangulator::new();
        assert!(inlier_triangulate_positive_depth(
            &pairwise,
            &triangulator,
            &scene,
            &pixels,
            0,
            0.1
        ));
        assert!(!inlier_triangulate_positive_depth(
            &pairwise,
            &triangulator,
            &scene,
            &pixels,
            0,
            0.05
        ));
    }
}
