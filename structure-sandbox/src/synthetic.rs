//! Generates the inputs of a reconstruction from a random world, for trying out settings.

use cv_structure::{
    nalgebra::{Point2, Point3, Rotation3, Vector3},
    AssociatedIndex, CameraIntrinsics, CameraPrior, CameraToWorld, MemoryDatabase, PairwiseGraph,
    Pose, PoseExt,
};
use log::*;
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;

pub struct SyntheticWorld {
    pub views: usize,
    pub points: usize,
    /// Views this far apart along the path are matched.
    pub reach: usize,
    /// Standard deviation of the pixel noise.
    pub noise: f64,
}

impl SyntheticWorld {
    /// Walks a camera along a line while it looks at a wall of points.
    pub fn generate(&self, rng: &mut Xoshiro256PlusPlus) -> (PairwiseGraph, MemoryDatabase) {
        let prior = CameraPrior::from_shape(800.0, 1280, 960);
        let intrinsics = CameraIntrinsics::from_prior(&prior);
        let length = self.views as f64 * 0.5;
        let points: Vec<Point3<f64>> = (0..self.points)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-2.0..length + 2.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(8.0..12.0),
                )
            })
            .collect();

        let mut database = MemoryDatabase::new();
        let camera = database.add_camera(prior);
        let mut pairwise = PairwiseGraph::new();
        let mut visible: Vec<Vec<bool>> = vec![];
        for view in 0..self.views {
            let center = Vector3::new(view as f64 * 0.5, rng.gen_range(-0.1..0.1), 0.0);
            let rotation = Rotation3::from_euler_angles(
                rng.gen_range(-0.02..0.02),
                rng.gen_range(-0.05..0.05),
                rng.gen_range(-0.02..0.02),
            );
            let world_to_view = CameraToWorld::from_parts(center, rotation).inverse();
            let (features, in_view): (Vec<Point2<f64>>, Vec<bool>) = points
                .iter()
                .map(|&point| {
                    let point = world_to_view.transform_point(point);
                    let noise = Point2::new(self.gaussian(rng), self.gaussian(rng));
                    let pixel = prior.uncenter(intrinsics.project(point)) + noise.coords;
                    let inside = point.z > 0.0
                        && (0.0..prior.width as f64).contains(&pixel.x)
                        && (0.0..prior.height as f64).contains(&pixel.y);
                    (pixel, inside)
                })
                .unzip();
            let id = format!("synthetic{:04}", view);
            database.add_image(id.clone(), camera, features);
            pairwise.add_view(id, self.points);
            visible.push(in_view);
        }

        for a in 0..self.views {
            for b in a + 1..self.views.min(a + self.reach + 1) {
                let inliers: Vec<AssociatedIndex> = (0..self.points)
                    .filter(|&i| visible[a][i] && visible[b][i])
                    .map(|i| AssociatedIndex::new(i, i))
                    .collect();
                if inliers.len() < 8 {
                    continue;
                }
                let score = inliers.len() as f64 / self.points as f64;
                let (a_id, b_id) = (pairwise.id(a).to_owned(), pairwise.id(b).to_owned());
                database.add_association(a_id, b_id, inliers.clone());
                pairwise.add_motion(a, b, true, score, inliers);
            }
        }
        info!(
            "generated {} views, {} points, and {} motions",
            pairwise.len(),
            points.len(),
            pairwise.motions().len()
        );
        (pairwise, database)
    }

    /// A normal sample from two uniform samples with the Box-Muller transform.
    fn gaussian(&self, rng: &mut Xoshiro256PlusPlus) -> f64 {
        if self.noise == 0.0 {
            return 0.0;
        }
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen();
        self.noise * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}
