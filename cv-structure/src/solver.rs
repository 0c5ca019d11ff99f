//! The seam between the reconstruction and the geometry that estimates three views at a time.
//!
//! A [`ThreeViewSolver`] first fits a projective reconstruction of a triplet, in a frame where
//! the first camera is `[I|0]`. The projective cameras are then upgraded to metric by finding
//! the calibrating homography that turns the first two cameras into `K[R|t]` with their
//! known intrinsics. The default [`ThreeViewSolver::upgrade`] does exactly that, so a strategy
//! only has to provide the projective fit.

use cv_core::{CameraToCamera, Pose, WorldToCamera};
use log::*;
use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x4, Matrix4, Point2, Rotation3, Vector3};

use crate::{
    triangulate_in_front, CameraIntrinsics, CameraPrior, LinearEigenTriangulator, PoseExt,
};

/// The same feature seen in three views, as pixels centered on the principal point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssociatedTriple(pub Point2<f64>, pub Point2<f64>, pub Point2<f64>);

impl AssociatedTriple {
    /// The observation in view `0`, `1`, or `2`.
    pub fn get(&self, view: usize) -> Point2<f64> {
        match view {
            0 => self.0,
            1 => self.1,
            2 => self.2,
            _ => panic!("a triple has no view {}", view),
        }
    }
}

/// The input to a three view solver.
#[derive(Debug, Clone)]
pub struct TripletProblem<'a> {
    /// Ids of the three views in the pairwise graph, used for diagnostics.
    pub views: [&'a str; 3],
    /// The calibration reported by the image database for each view.
    pub priors: [CameraPrior; 3],
    pub triples: Vec<AssociatedTriple>,
}

/// Three camera matrices that are only known up to a projective transform.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectiveTriplet {
    /// The first camera is always `[I|0]`.
    pub cameras: [Matrix3x4<f64>; 3],
    /// Indices of the triples that agreed with the cameras.
    pub inliers: Vec<usize>,
}

/// Metric poses of the second and third views relative to the first, up to a common scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricTriplet {
    pub view1_to_view2: CameraToCamera,
    pub view1_to_view3: CameraToCamera,
    pub intrinsics: [CameraIntrinsics; 3],
}

/// Estimates the geometry of three views from features they have in common.
pub trait ThreeViewSolver {
    /// Robustly fits a projective reconstruction to the triples.
    fn fit(&mut self, problem: &TripletProblem) -> Option<ProjectiveTriplet>;

    /// Elevates a projective reconstruction to a metric one.
    ///
    /// `known` holds the intrinsics of views that are already part of a scene. The first two
    /// views fall back to their database prior when they are not known. The intrinsics of the
    /// third view are estimated when they are not known.
    fn upgrade(
        &mut self,
        problem: &TripletProblem,
        projective: &ProjectiveTriplet,
        known: [Option<CameraIntrinsics>; 3],
    ) -> Option<MetricTriplet> {
        upgrade_to_metric(problem, projective, known)
    }
}

/// See [`ThreeViewSolver::upgrade`].
pub fn upgrade_to_metric(
    problem: &TripletProblem,
    projective: &ProjectiveTriplet,
    known: [Option<CameraIntrinsics>; 3],
) -> Option<MetricTriplet> {
    let k1 = known[0].unwrap_or_else(|| CameraIntrinsics::from_prior(&problem.priors[0]));
    let k2 = known[1].unwrap_or_else(|| CameraIntrinsics::from_prior(&problem.priors[1]));
    let homography = calibrating_homography(&projective.cameras[1], &k1, &k2)?;

    let (view1_to_view2, intrinsics2) =
        decompose_metric_camera(&(projective.cameras[1] * homography), Some(k2))?;
    let (view1_to_view3, intrinsics3) =
        decompose_metric_camera(&(projective.cameras[2] * homography), known[2])?;
    let intrinsics = [k1, intrinsics2, intrinsics3];

    // The homography does not determine which side of the cameras the points are on.
    let in_front = |v12: CameraToCamera, v13: CameraToCamera| {
        count_in_front(problem, &projective.inliers, intrinsics, v12, v13)
    };
    let flip = |pose: CameraToCamera| CameraToCamera::from_parts(-pose.translation(), pose.rotation());
    let forwards = in_front(view1_to_view2, view1_to_view3);
    let backwards = in_front(flip(view1_to_view2), flip(view1_to_view3));
    debug!(
        "metric upgrade of {:?} puts {} features in front when forwards and {} when backwards",
        problem.views, forwards, backwards
    );
    if forwards == 0 && backwards == 0 {
        info!(
            "metric upgrade of {:?} failed because no feature is in front of all views",
            problem.views
        );
        return None;
    }
    let (view1_to_view2, view1_to_view3) = if forwards >= backwards {
        (view1_to_view2, view1_to_view3)
    } else {
        (flip(view1_to_view2), flip(view1_to_view3))
    };

    Some(MetricTriplet {
        view1_to_view2,
        view1_to_view3,
        intrinsics,
    })
}

/// Finds `H` so that `[I|0] H = K1 [I|0]` and `P2 H = s K2 [R|t]`.
///
/// `H` is `[[K1, 0], [vᵀ, 1]]`. The unknown `v` is found linearly from the dual image of the
/// absolute conic of the second view, `s² K2 K2ᵀ = P2 Q P2ᵀ`, where `Q = H diag(1, 1, 1, 0) Hᵀ`.
/// With `p = K1 v` and `q = vᵀv` treated as independent unknowns along with `s²` every entry of
/// the symmetric equation is linear.
pub fn calibrating_homography(
    camera2: &Matrix3x4<f64>,
    k1: &CameraIntrinsics,
    k2: &CameraIntrinsics,
) -> Option<Matrix4<f64>> {
    let a = camera2.fixed_columns::<3>(0).into_owned();
    let t = camera2.column(3).into_owned();
    let k1m = k1.matrix();
    let w = k1m * k1m.transpose();
    let omega = {
        let k2m = k2.matrix();
        k2m * k2m.transpose()
    };
    let rhs = a * w * a.transpose();

    // Unknowns are (p0, p1, p2, q, s²).
    let mut design = DMatrix::<f64>::zeros(6, 5);
    let mut target = DVector::<f64>::zeros(6);
    let mut row = 0;
    for i in 0..3 {
        for j in i..3 {
            for k in 0..3 {
                design[(row, k)] = -(a[(i, k)] * t[j] + t[i] * a[(j, k)]);
            }
            design[(row, 3)] = -t[i] * t[j];
            design[(row, 4)] = omega[(i, j)];
            target[row] = rhs[(i, j)];
            row += 1;
        }
    }
    let solution = design.svd(true, true).solve(&target, 1e-12).ok()?;
    if !solution.iter().all(|n| n.is_finite()) || solution[4] <= 0.0 {
        return None;
    }
    let p = Vector3::new(solution[0], solution[1], solution[2]);
    let v = k1m.try_inverse()? * p;

    let mut homography = Matrix4::zeros();
    homography.fixed_slice_mut::<3, 3>(0, 0).copy_from(&k1m);
    homography
        .fixed_slice_mut::<1, 3>(3, 0)
        .copy_from(&v.transpose());
    homography[(3, 3)] = 1.0;
    Some(homography)
}

/// Splits a metric camera matrix `s K [R|t]` into a pose and intrinsics.
///
/// When `known` is `None` the focal length is recovered from `M Mᵀ = s² K Kᵀ`, assuming square
/// pixels with no skew. The distortion of estimated intrinsics is zero.
pub fn decompose_metric_camera(
    camera: &Matrix3x4<f64>,
    known: Option<CameraIntrinsics>,
) -> Option<(CameraToCamera, CameraIntrinsics)> {
    let m = camera.fixed_columns::<3>(0).into_owned();
    let intrinsics = match known {
        Some(intrinsics) => intrinsics,
        None => {
            let mmt = m * m.transpose();
            let s2 = mmt[(2, 2)];
            let focal2 = (mmt[(0, 0)] + mmt[(1, 1)]) / (2.0 * s2);
            if !(s2 > 0.0 && focal2 > 0.0) {
                return None;
            }
            CameraIntrinsics::new(focal2.sqrt())
        }
    };
    let k_inv = intrinsics.matrix().try_inverse()?;
    let mut rotation = k_inv * m;
    let mut translation = k_inv * camera.column(3);
    if rotation.determinant() < 0.0 {
        rotation = -rotation;
        translation = -translation;
    }
    let svd = rotation.try_svd(true, true, 1e-12, 1000)?;
    let (u, v_t) = (svd.u?, svd.v_t?);
    let scale = svd.singular_values.mean();
    if !(scale > 0.0) {
        return None;
    }
    let rotation = Rotation3::from_matrix_unchecked(u * v_t);
    let translation = translation / scale;
    if !translation.iter().all(|n| n.is_finite()) {
        return None;
    }
    Some((CameraToCamera::from_parts(translation, rotation), intrinsics))
}

fn count_in_front(
    problem: &TripletProblem,
    inliers: &[usize],
    intrinsics: [CameraIntrinsics; 3],
    view1_to_view2: CameraToCamera,
    view1_to_view3: CameraToCamera,
) -> usize {
    let triangulator = LinearEigenTriangulator::new();
    let poses = [
        WorldToCamera::identity(),
        WorldToCamera(view1_to_view2.isometry()),
        WorldToCamera(view1_to_view3.isometry()),
    ];
    inliers
        .iter()
        .filter(|&&ix| {
            let triple = problem.triples[ix];
            let observations =
                [0, 1, 2].map(|view| (poses[view], intrinsics[view].bearing(triple.get(view))));
            triangulate_in_front(&triangulator, &observations)
                .map(|point| point.w > 0.0)
                .unwrap_or(false)
        })
        .count()
}

/// Produces the projective cameras of a metric reconstruction, moved into the frame where
/// the first camera is `[I|0]`.
pub fn projective_from_metric(
    intrinsics: [CameraIntrinsics; 3],
    view1_to_view2: CameraToCamera,
    view1_to_view3: CameraToCamera,
) -> [Matrix3x4<f64>; 3] {
    let metric = |intrinsics: CameraIntrinsics, pose: CameraToCamera| -> Matrix3x4<f64> {
        intrinsics.matrix() * pose.isometry().to_homogeneous().fixed_rows::<3>(0)
    };
    let k1 = intrinsics[0].matrix();
    let mut to_metric = Matrix4::identity();
    to_metric
        .fixed_slice_mut::<3, 3>(0, 0)
        .copy_from(&k1.try_inverse().unwrap_or_else(Matrix3::identity));
    [
        metric(intrinsics[0], CameraToCamera::identity()) * to_metric,
        metric(intrinsics[1], view1_to_view2) * to_metric,
        metric(intrinsics[2], view1_to_view3) * to_metric,
    ]
}
