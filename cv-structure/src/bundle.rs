//! The problem handed to bundle adjustment.
//!
//! Everything is indexed by position. A view refers to its camera, an observation refers to a
//! point, and a point lists the views that observe it. Pixels are centered on the principal point.

use float_ord::FloatOrd;
use nalgebra::{Point2, Point3};

use crate::{CameraIntrinsics, PoseExt, WorldToCamera};

#[derive(Debug, Clone, PartialEq)]
pub struct BundleCamera {
    pub intrinsics: CameraIntrinsics,
    /// Known cameras are not changed by optimization.
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BundleView {
    pub camera: usize,
    pub world_to_view: WorldToCamera,
    /// Known views are not changed by optimization.
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BundlePoint {
    pub point: Point3<f64>,
    /// Indices of the views that observe the point.
    pub views: Vec<usize>,
}

/// The parameters that bundle adjustment optimizes in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleStructure {
    pub cameras: Vec<BundleCamera>,
    pub views: Vec<BundleView>,
    pub points: Vec<BundlePoint>,
}

impl BundleStructure {
    pub fn add_camera(&mut self, intrinsics: CameraIntrinsics, known: bool) -> usize {
        self.cameras.push(BundleCamera { intrinsics, known });
        self.cameras.len() - 1
    }

    pub fn add_view(&mut self, camera: usize, world_to_view: WorldToCamera, known: bool) -> usize {
        self.views.push(BundleView {
            camera,
            world_to_view,
            known,
        });
        self.views.len() - 1
    }

    pub fn add_point(&mut self, point: Point3<f64>) -> usize {
        self.points.push(BundlePoint {
            point,
            views: vec![],
        });
        self.points.len() - 1
    }

    /// Records that `view` observes `point`.
    pub fn connect(&mut self, point: usize, view: usize) {
        self.points[point].views.push(view);
    }

    /// Predicted centered pixel of a point in a view.
    pub fn project(&self, view: usize, point: usize) -> Point2<f64> {
        let view = &self.views[view];
        let intrinsics = &self.cameras[view.camera].intrinsics;
        intrinsics.project(view.world_to_view.transform_point(self.points[point].point))
    }

    /// Squared reprojection error of an observation.
    pub fn reprojection_error2(&self, view: usize, point: usize, pixel: Point2<f64>) -> f64 {
        (self.project(view, point) - pixel).norm_squared()
    }

    /// Fixes the pose of the first view if no view is fixed, removing the freedom to move the
    /// whole scene around.
    pub fn fix_gauge(&mut self) {
        if !self.views.iter().any(|view| view.known) {
            if let Some(view) = self.views.first_mut() {
                view.known = true;
            }
        }
    }
}

/// The observations made by one view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewObservations {
    pub pixels: Vec<Point2<f64>>,
    /// The point each observation belongs to, if one has been assigned.
    pub points: Vec<Option<usize>>,
    /// The index of each observation in the image database, since removal reorders them.
    pub features: Vec<usize>,
}

impl ViewObservations {
    /// Starts with every feature of the image unassigned.
    pub fn from_pixels(pixels: Vec<Point2<f64>>) -> Self {
        let len = pixels.len();
        Self {
            pixels,
            points: vec![None; len],
            features: (0..len).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Removes an observation by moving the last observation into its place.
    pub fn remove_swap(&mut self, observation: usize) {
        self.pixels.swap_remove(observation);
        self.points.swap_remove(observation);
        self.features.swap_remove(observation);
    }

    /// Drops every observation that was never assigned to a point.
    pub fn remove_unassigned(&mut self) -> usize {
        let mut removed = 0;
        let mut observation = 0;
        while observation < self.len() {
            if self.points[observation].is_none() {
                self.remove_swap(observation);
                removed += 1;
            } else {
                observation += 1;
            }
        }
        removed
    }

    /// Iterates over `(point, pixel)` of every assigned observation.
    pub fn assigned(&self) -> impl Iterator<Item = (usize, Point2<f64>)> + '_ {
        self.points
            .iter()
            .zip(&self.pixels)
            .filter_map(|(&point, &pixel)| point.map(|point| (point, pixel)))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleObservations {
    pub views: Vec<ViewObservations>,
}

impl BundleObservations {
    /// The number of observations that belong to a point.
    pub fn num_assigned(&self) -> usize {
        self.views
            .iter()
            .map(|view| view.points.iter().filter(|p| p.is_some()).count())
            .sum()
    }

    /// Returns `(error², view, observation)` of every assigned observation, worst first.
    fn ranked_errors(&self, structure: &BundleStructure) -> Vec<(f64, usize, usize)> {
        let mut errors: Vec<(f64, usize, usize)> = self
            .views
            .iter()
            .enumerate()
            .flat_map(|(view, observations)| {
                observations
                    .points
                    .iter()
                    .zip(&observations.pixels)
                    .enumerate()
                    .filter_map(move |(observation, (&point, &pixel))| {
                        point.map(|point| {
                            let error = structure.reprojection_error2(view, point, pixel);
                            // Points that project to NaN are the worst of all.
                            let error = if error.is_finite() { error } else { f64::INFINITY };
                            (error, view, observation)
                        })
                    })
            })
            .collect();
        errors.sort_unstable_by_key(|&(error, _, _)| std::cmp::Reverse(FloatOrd(error)));
        errors
    }

    /// Keeps only the best `keep_fraction` of the observations by reprojection error.
    ///
    /// Points lose their link to the removed views. Returns the number of removed observations.
    pub fn prune_worst(&mut self, structure: &mut BundleStructure, keep_fraction: f64) -> usize {
        let errors = self.ranked_errors(structure);
        let keep = (errors.len() as f64 * keep_fraction).ceil() as usize;
        let remove = errors.len().saturating_sub(keep);
        if remove == 0 {
            return 0;
        }
        // Removal swaps observations around, so mark first and remove afterwards.
        for &(_, view, observation) in &errors[..remove] {
            if let Some(point) = self.views[view].points[observation].take() {
                structure.points[point].views.retain(|&v| v != view);
            }
        }
        for view in &mut self.views {
            view.remove_unassigned();
        }
        remove
    }
}

/// Optimizes a [`BundleStructure`] in place.
pub trait BundleAdjuster {
    /// Returns false if the optimization failed, in which case `structure` must not be used.
    fn optimize(
        &mut self,
        structure: &mut BundleStructure,
        observations: &BundleObservations,
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pose;

    #[test]
    fn unassigned_observations_are_removed() {
        let mut observations = ViewObservations::from_pixels(vec![Point2::origin(); 5]);
        observations.points[1] = Some(0);
        observations.points[4] = Some(1);
        assert_eq!(observations.remove_unassigned(), 3);
        let mut features = observations.features.clone();
        features.sort_unstable();
        assert_eq!(features, vec![1, 4]);
        assert!(observations.points.iter().all(Option::is_some));
    }

    #[test]
    fn pruning_drops_the_worst_observation() {
        let mut structure = BundleStructure::default();
        let camera = structure.add_camera(CameraIntrinsics::new(100.0), false);
        let view = structure.add_view(camera, WorldToCamera::identity(), false);
        let mut observations = ViewObservations::from_pixels(vec![]);
        for i in 0..4 {
            let point = structure.add_point(Point3::new(0.0, 0.0, 1.0));
            structure.connect(point, view);
            observations.pixels.push(Point2::new(i as f64, 0.0));
            observations.points.push(Some(point));
            observations.features.push(i);
        }
        let mut observations = BundleObservations {
            views: vec![observations],
        };
        assert_eq!(observations.prune_worst(&mut structure, 0.75), 1);
        assert!(!observations.views[0].features.contains(&3));
        assert!(structure.points[3].views.is_empty());
    }
}
