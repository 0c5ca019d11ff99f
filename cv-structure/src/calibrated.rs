use arrsac::Arrsac;
use cv_core::{
    sample_consensus::{Consensus, Estimator},
    CameraToCamera, FeatureMatch, FeatureWorldMatch, Pose, WorldPoint, WorldToCamera,
};
use eight_point::EightPoint;
use lambda_twist::LambdaTwist;
use log::*;
use nalgebra::UnitVector3;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::{
    projective_from_metric, triangulate_in_front, CameraIntrinsics, LinearEigenTriangulator,
    ProjectiveTriplet, ThreeViewSolver, TripletProblem,
};

/// A [`ThreeViewSolver`] that trusts the focal lengths of the database priors.
///
/// The relative pose of the first two views is estimated with the eight-point algorithm under
/// ARRSAC. The features that survive are triangulated and the third view is resected from
/// them, again under ARRSAC. The triples that agree with both are the inliers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibratedThreeView {
    threshold: f64,
    seed: u64,
    minimum_inliers: usize,
    epsilon: f64,
    max_iterations: usize,
}

impl CalibratedThreeView {
    pub fn new() -> Self {
        Default::default()
    }

    /// The cosine distance below which a feature agrees with a model.
    ///
    /// Default is `1e-5`.
    #[must_use]
    pub fn threshold(self, threshold: f64) -> Self {
        Self { threshold, ..self }
    }

    /// The seed of the random number generator used by the consensus process.
    ///
    /// Default is `0`.
    #[must_use]
    pub fn seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }

    /// Fits with fewer inliers than this are rejected.
    ///
    /// Default is `8`.
    #[must_use]
    pub fn minimum_inliers(self, minimum_inliers: usize) -> Self {
        Self {
            minimum_inliers,
            ..self
        }
    }

    fn consensus(&self) -> Arrsac<Xoshiro256PlusPlus> {
        Arrsac::new(self.threshold, Xoshiro256PlusPlus::seed_from_u64(self.seed))
    }
}

impl Default for CalibratedThreeView {
    fn default() -> Self {
        Self {
            threshold: 1e-5,
            seed: 0,
            minimum_inliers: 8,
            epsilon: 1e-12,
            max_iterations: 1000,
        }
    }
}

impl ThreeViewSolver for CalibratedThreeView {
    fn fit(&mut self, problem: &TripletProblem) -> Option<ProjectiveTriplet> {
        if problem.triples.len() < self.minimum_inliers.max(EightPoint::MIN_SAMPLES) {
            info!(
                "triplet {:?} has only {} features, which is not enough to fit",
                problem.views,
                problem.triples.len()
            );
            return None;
        }
        let bearings: Vec<[UnitVector3<f64>; 3]> = problem
            .triples
            .iter()
            .map(|triple| [0, 1, 2].map(|view| problem.priors[view].bearing(triple.get(view))))
            .collect();

        let eight_point = EightPoint {
            epsilon: self.epsilon,
            iterations: self.max_iterations,
        };
        let matches = bearings.iter().map(|b| FeatureMatch(b[0], b[1]));
        let (view1_to_view2, inliers12) = self
            .consensus()
            .model_inliers(&eight_point, matches)
            .or_else(|| {
                info!("two view consensus failed for triplet {:?}", problem.views);
                None
            })?;
        debug!(
            "eight-point found {} of {} inliers for triplet {:?}",
            inliers12.len(),
            bearings.len(),
            problem.views
        );

        let triangulator = LinearEigenTriangulator::new();
        let view2 = WorldToCamera(view1_to_view2.isometry());
        let points: Vec<(usize, FeatureWorldMatch)> = inliers12
            .iter()
            .filter_map(|&ix| {
                let [a, b, c] = bearings[ix];
                let point = triangulate_in_front(
                    &triangulator,
                    &[(WorldToCamera::identity(), a), (view2, b)],
                )?;
                if point.w <= f64::EPSILON {
                    return None;
                }
                Some((ix, FeatureWorldMatch(c, WorldPoint(point))))
            })
            .collect();
        if points.len() < self.minimum_inliers.max(LambdaTwist::MIN_SAMPLES) {
            info!(
                "only {} features of triplet {:?} triangulated, which is not enough to resect",
                points.len(),
                problem.views
            );
            return None;
        }

        // The frame of the first view is the world of the resection.
        let (view3, inliers13) = self
            .consensus()
            .model_inliers(&LambdaTwist::new(), points.iter().map(|&(_, data)| data))
            .or_else(|| {
                info!("resection consensus failed for triplet {:?}", problem.views);
                None
            })?;
        let view1_to_view3 = CameraToCamera(view3.isometry());
        let mut inliers: Vec<usize> = inliers13.iter().map(|&ix| points[ix].0).collect();
        inliers.sort_unstable();
        if inliers.len() < self.minimum_inliers {
            info!(
                "triplet {:?} has {} inliers, which is below the minimum of {}",
                problem.views,
                inliers.len(),
                self.minimum_inliers
            );
            return None;
        }

        let intrinsics = [
            CameraIntrinsics::from_prior(&problem.priors[0]),
            CameraIntrinsics::from_prior(&problem.priors[1]),
            CameraIntrinsics::from_prior(&problem.priors[2]),
        ];
        Some(ProjectiveTriplet {
            cameras: projective_from_metric(intrinsics, view1_to_view2, view1_to_view3),
            inliers,
        })
    }
}
