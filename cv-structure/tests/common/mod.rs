//! Synthetic worlds shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use cv_structure::{
    nalgebra::{Point2, Point3, Rotation3},
    projective_from_metric, AssociatedIndex, CameraIntrinsics, CameraPrior, CameraToWorld,
    InlierInfo, LevenbergMarquardtAdjuster, LinearEigenTriangulator, MemoryDatabase,
    MetricReconstructor, PairwiseGraph, Pose, PoseExt, ProjectiveTriplet, ReconstructionSettings,
    ScaledWorldToWorld, SceneWorkingGraph, ThreeViewSolver, TripletProblem, WorldToCamera,
    WorldToCameraExt,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};

pub const FOCAL: f64 = 500.0;

pub type OracleReconstructor = MetricReconstructor<
    MemoryDatabase,
    OracleSolver,
    LevenbergMarquardtAdjuster,
    LinearEigenTriangulator,
>;

/// Cameras on an arc, all looking at the same cloud of points.
pub struct World {
    pub prior: CameraPrior,
    pub poses: Vec<WorldToCamera>,
    pub points: Vec<Point3<f64>>,
    /// Features appended to every image after the points. Each one is the projection of a point
    /// behind every camera, so it can never be triangulated.
    pub ghosts: usize,
}

impl World {
    pub fn new(num_views: usize, num_points: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let points = (0..num_points)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(-1.5..1.5),
                    rng.gen_range(6.0..9.0),
                )
            })
            .collect();
        let poses = (0..num_views)
            .map(|i| {
                let x = (i as f64 - (num_views - 1) as f64 / 2.0) * 0.6;
                let center = Point3::new(x, rng.gen_range(-0.1..0.1), rng.gen_range(-0.1..0.1));
                // Turn towards the middle of the cloud.
                let yaw = (-x).atan2(7.5);
                CameraToWorld::from_parts(center.coords, Rotation3::from_euler_angles(0.0, yaw, 0.0))
                    .inverse()
            })
            .collect();
        Self {
            prior: CameraPrior::from_shape(FOCAL, 640, 480),
            poses,
            points,
            ghosts: 0,
        }
    }

    pub fn ghosts(self, ghosts: usize) -> Self {
        Self { ghosts, ..self }
    }

    pub fn id(view: usize) -> String {
        format!("view{}", view)
    }

    pub fn num_features(&self) -> usize {
        self.points.len() + self.ghosts
    }

    /// The feature index of a ghost.
    pub fn ghost(&self, ghost: usize) -> usize {
        self.points.len() + ghost
    }

    /// Image pixels of every feature in a view.
    pub fn pixels(&self, view: usize) -> Vec<Point2<f64>> {
        let intrinsics = CameraIntrinsics::from_prior(&self.prior);
        let ghosts = (0..self.ghosts).map(|ghost| Point3::new(0.3 * ghost as f64, 0.2, -4.0 - ghost as f64));
        self.points
            .iter()
            .copied()
            .chain(ghosts)
            .map(|point| {
                self.prior
                    .uncenter(intrinsics.project(self.poses[view].transform_point(point)))
            })
            .collect()
    }

    pub fn database(&self) -> MemoryDatabase {
        let mut database = MemoryDatabase::new();
        let camera = database.add_camera(self.prior);
        for view in 0..self.poses.len() {
            database.add_image(Self::id(view), camera, self.pixels(view));
        }
        database
    }

    /// A pairwise graph where every edge is a 3D motion matching every real point.
    pub fn pairwise(&self, edges: &[(usize, usize, f64)]) -> PairwiseGraph {
        let mut pairwise = PairwiseGraph::new();
        for view in 0..self.poses.len() {
            pairwise.add_view(Self::id(view), self.num_features());
        }
        let inliers: Vec<AssociatedIndex> = (0..self.points.len())
            .map(|i| AssociatedIndex::new(i, i))
            .collect();
        for &(a, b, score) in edges {
            pairwise.add_motion(a, b, true, score, inliers.clone());
        }
        pairwise
    }

    /// Connects every view to the views at most `reach` away along the arc.
    pub fn chain(&self, reach: usize, score: f64) -> Vec<(usize, usize, f64)> {
        let n = self.poses.len();
        (0..n)
            .flat_map(|a| (a + 1..n.min(a + reach + 1)).map(move |b| (a, b, score)))
            .collect()
    }

    pub fn solver(&self) -> OracleSolver {
        OracleSolver {
            poses: (0..self.poses.len())
                .map(|view| (Self::id(view), self.poses[view]))
                .collect(),
            failing: vec![],
        }
    }

    pub fn reconstructor(&self, settings: ReconstructionSettings) -> OracleReconstructor {
        MetricReconstructor::new(
            settings,
            self.database(),
            self.solver(),
            LevenbergMarquardtAdjuster::from_settings(&settings),
            LinearEigenTriangulator::new(),
        )
    }

    /// A scene of some views whose world is `truth_to_scene` applied to the true world.
    ///
    /// Every view owns an inlier set with the next two views of the scene, holding every real
    /// point.
    pub fn scene(&self, pviews: &[usize], truth_to_scene: ScaledWorldToWorld) -> SceneWorkingGraph {
        let mut scene = SceneWorkingGraph::new();
        let camera = scene.add_camera(0, self.prior);
        for &pview in pviews {
            scene.add_view(pview, camera, truth_to_scene.transform_view(self.poses[pview]));
        }
        scene.num_seed_views = pviews.len().min(3);
        for (ix, &pview) in pviews.iter().enumerate() {
            let others = (1..3).map(|step| pviews[(ix + step) % pviews.len()]);
            let mut info = InlierInfo::new(std::iter::once(pview).chain(others).collect());
            for point in 0..self.points.len() {
                info.push(&[point; 3]);
            }
            info.score_geometric = self.points.len() as f64;
            scene.views[ix].inliers.push(info);
        }
        scene
    }
}

pub fn settings() -> ReconstructionSettings {
    ReconstructionSettings {
        sanity_checks: true,
        ..Default::default()
    }
}

/// Answers from the true poses of the views.
pub struct OracleSolver {
    pub poses: HashMap<String, WorldToCamera>,
    /// Views that make every fit they are part of fail.
    pub failing: Vec<String>,
}

impl ThreeViewSolver for OracleSolver {
    fn fit(&mut self, problem: &TripletProblem) -> Option<ProjectiveTriplet> {
        if problem
            .views
            .iter()
            .any(|id| self.failing.iter().any(|failing| failing == id))
        {
            return None;
        }
        let w1 = *self.poses.get(problem.views[0])?;
        let w2 = *self.poses.get(problem.views[1])?;
        let w3 = *self.poses.get(problem.views[2])?;
        let intrinsics = problem.priors.map(|prior| CameraIntrinsics::from_prior(&prior));
        Some(ProjectiveTriplet {
            cameras: projective_from_metric(intrinsics, w1.relative_to(w2), w1.relative_to(w3)),
            inliers: (0..problem.triples.len()).collect(),
        })
    }
}

/// Checks that two poses of every pair of views agree up to a similarity.
pub fn assert_similar(
    scene: &SceneWorkingGraph,
    truth: &[WorldToCamera],
    epsilon: f64,
) {
    let (first, second) = (&scene.views[0], &scene.views[1]);
    let estimated_baseline = first
        .world_to_view
        .relative_to(second.world_to_view)
        .translation()
        .norm();
    let true_baseline = truth[first.pview]
        .relative_to(truth[second.pview])
        .translation()
        .norm();
    let scale = true_baseline / estimated_baseline;
    for a in &scene.views {
        for b in &scene.views {
            let estimated = a.world_to_view.relative_to(b.world_to_view);
            let expected = truth[a.pview].relative_to(truth[b.pview]);
            approx::assert_relative_eq!(
                estimated.rotation(),
                expected.rotation(),
                epsilon = epsilon
            );
            approx::assert_relative_eq!(
                estimated.translation() * scale,
                expected.translation(),
                epsilon = epsilon
            );
        }
    }
}
