use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use log::*;
use nalgebra::{
    dimension::{Dynamic, U1},
    DMatrix, DVector, Matrix2, Matrix2x3, Matrix2x6, Matrix3, Point2, Point3, Rotation3,
    VecStorage, Vector2, Vector3,
};

use crate::{
    BundleAdjuster, BundleCamera, BundleObservations, BundleStructure, BundleView,
    CameraIntrinsics, Pose, PoseExt, ReconstructionSettings, WorldToCamera,
};

/// Gauss-Newton iterations spent moving a point to its best position for the current poses.
const POINT_ITERATIONS: usize = 10;
/// A point stops moving once its step is this small relative to its distance from the origin.
const POINT_STEP_TOLERANCE: f64 = 1e-12;

/// A [`BundleAdjuster`] that minimizes the reprojection error of every observation with the
/// Levenberg-Marquardt algorithm.
///
/// Only unknown cameras (focal length and two radial distortion terms) and unknown views (a
/// rotation and translation applied on top of their starting pose) are parameters of the
/// solver. Every time they change, each point observed at least twice is moved to its best
/// position by a few Gauss-Newton steps, and its three degrees of freedom are projected out of
/// the Jacobian of its observations. The dense part of the problem therefore grows with the
/// number of views, not with the number of points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevenbergMarquardtAdjuster {
    patience: usize,
    ftol: f64,
    xtol: f64,
    gtol: f64,
}

impl LevenbergMarquardtAdjuster {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn from_settings(settings: &ReconstructionSettings) -> Self {
        Self {
            patience: settings.bundle_patience,
            ftol: settings.bundle_ftol,
            xtol: settings.bundle_xtol,
            gtol: settings.bundle_gtol,
        }
    }

    #[must_use]
    pub fn patience(self, patience: usize) -> Self {
        Self { patience, ..self }
    }
}

impl Default for LevenbergMarquardtAdjuster {
    fn default() -> Self {
        Self::from_settings(&ReconstructionSettings::default())
    }
}

impl BundleAdjuster for LevenbergMarquardtAdjuster {
    fn optimize(
        &mut self,
        structure: &mut BundleStructure,
        observations: &BundleObservations,
    ) -> bool {
        assert_eq!(
            structure.views.len(),
            observations.views.len(),
            "bundle adjustment needs one set of observations per view"
        );
        let tracks = tracks(structure, observations);
        let mut problem = MotionProblem::new(structure, &tracks);
        let num_refined = tracks.iter().filter(|track| track.refine).count();
        if problem.num_params == 0 && num_refined == 0 {
            debug!("bundle adjustment has nothing to optimize");
            return true;
        }
        if problem.num_residuals < problem.num_params + 3 * num_refined {
            info!(
                "bundle adjustment has {} residuals for {} parameters, refusing to optimize",
                problem.num_residuals,
                problem.num_params + 3 * num_refined
            );
            return false;
        }

        if problem.num_params == 0 {
            debug!("every view is known, only moving {} points", num_refined);
            problem.refine_points();
            if !problem.cost().is_finite() {
                warn!("points moved to a non-finite reprojection error");
                return false;
            }
            problem.commit(structure);
            return true;
        }

        info!(
            "performing Levenberg-Marquardt on {} cameras, {} views, {} points, and {} observations",
            structure.cameras.len(),
            structure.views.len(),
            structure.points.len(),
            problem.num_residuals / 2,
        );

        // The points start at their best position for the starting poses.
        problem.refine_points();
        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(self.patience)
            .with_ftol(self.ftol)
            .with_xtol(self.xtol)
            .with_gtol(self.gtol)
            .minimize(problem);

        info!(
            "Levenberg-Marquardt terminated with reason {:?} after {} evaluations and cost {}",
            report.termination, report.number_of_evaluations, report.objective_function
        );

        let accepted = report.termination.was_successful()
            || matches!(report.termination, TerminationReason::LostPatience);
        if !accepted || !report.objective_function.is_finite() {
            warn!(
                "bundle adjustment failed to converge: {:?}",
                report.termination
            );
            return false;
        }
        if !report.termination.was_successful() {
            warn!("bundle adjustment ran out of patience, keeping the improved estimate");
        }
        problem.commit(structure);
        true
    }
}

/// An observation of a point, by the index of the view and the centered pixel.
#[derive(Debug, Clone, Copy)]
struct TrackObservation {
    view: usize,
    pixel: Point2<f64>,
}

/// Every assigned observation of one point.
#[derive(Debug, Clone)]
struct Track {
    point: usize,
    observations: Vec<TrackObservation>,
    /// A point seen only once cannot be placed, so it stays where it is.
    refine: bool,
}

fn tracks(structure: &BundleStructure, observations: &BundleObservations) -> Vec<Track> {
    let mut tracks: Vec<Track> = (0..structure.points.len())
        .map(|point| Track {
            point,
            observations: vec![],
            refine: false,
        })
        .collect();
    for (view, observed) in observations.views.iter().enumerate() {
        for (point, pixel) in observed.assigned() {
            tracks[point]
                .observations
                .push(TrackObservation { view, pixel });
        }
    }
    tracks.retain(|track| !track.observations.is_empty());
    for track in &mut tracks {
        track.refine = track.observations.len() >= 2;
    }
    tracks
}

/// Projects a point in the frame of a view into a centered pixel.
///
/// Also returns the derivatives of the pixel with respect to the point in the frame of the view
/// and with respect to the focal length, `k1`, and `k2`, in that order.
fn project_with_jacobians(
    intrinsics: &CameraIntrinsics,
    point: Point3<f64>,
) -> (Point2<f64>, Matrix2x3<f64>, Matrix2x3<f64>) {
    let CameraIntrinsics { focal, k1, k2 } = *intrinsics;
    let inv_z = 1.0 / point.z;
    let normalized = Vector2::new(point.x * inv_z, point.y * inv_z);
    let r2 = normalized.norm_squared();
    let radial = 1.0 + (k1 + k2 * r2) * r2;

    let d_radial = normalized.transpose() * (2.0 * (k1 + 2.0 * k2 * r2));
    let d_pixel_d_normalized = (Matrix2::identity() * radial + normalized * d_radial) * focal;
    let d_normalized_d_point = Matrix2x3::new(
        inv_z,
        0.0,
        -normalized.x * inv_z,
        0.0,
        inv_z,
        -normalized.y * inv_z,
    );
    let d_pixel_d_intrinsics = Matrix2x3::from_columns(&[
        normalized * radial,
        normalized * (focal * r2),
        normalized * (focal * r2 * r2),
    ]);
    (
        Point2::from(normalized * (focal * radial)),
        d_pixel_d_normalized * d_normalized_d_point,
        d_pixel_d_intrinsics,
    )
}

/// The left Jacobian of the rotation group at `omega`.
///
/// `exp(omega + delta)` is `exp(J delta) exp(omega)` to first order.
fn left_jacobian(omega: Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let skew = omega.cross_matrix();
    if theta < 1e-8 {
        return Matrix3::identity() + skew * 0.5;
    }
    let theta2 = theta * theta;
    Matrix3::identity()
        + skew * ((1.0 - theta.cos()) / theta2)
        + skew * skew * ((theta - theta.sin()) / (theta2 * theta))
}

/// Derivatives of a pixel with respect to the six parameters of a view.
///
/// The view is `[R(omega) | v]` applied after its starting pose and `rotated` is the point after
/// the rotation but before the translation.
fn view_jacobian(
    d_pixel_d_point: &Matrix2x3<f64>,
    rotated: Vector3<f64>,
    omega: Vector3<f64>,
) -> Matrix2x6<f64> {
    let d_rotation = -rotated.cross_matrix() * left_jacobian(omega);
    let mut jacobian = Matrix2x6::zeros();
    jacobian
        .fixed_slice_mut::<2, 3>(0, 0)
        .copy_from(d_pixel_d_point);
    jacobian
        .fixed_slice_mut::<2, 3>(0, 3)
        .copy_from(&(d_pixel_d_point * d_rotation));
    jacobian
}

/// The reduced problem over unknown cameras and views. Points are kept at their best position
/// for the current parameters.
struct MotionProblem<'a> {
    cameras: Vec<BundleCamera>,
    views: Vec<BundleView>,
    start: Vec<WorldToCamera>,
    points: Vec<Point3<f64>>,
    tracks: &'a [Track],
    /// The first row of each track in the residual vector.
    rows: Vec<usize>,
    camera_offsets: Vec<Option<usize>>,
    view_offsets: Vec<Option<usize>>,
    params: DVector<f64>,
    num_params: usize,
    num_residuals: usize,
}

impl<'a> MotionProblem<'a> {
    fn new(structure: &BundleStructure, tracks: &'a [Track]) -> Self {
        let mut num_params = 0;
        let mut allocate = |len: usize| {
            let offset = num_params;
            num_params += len;
            offset
        };
        let camera_offsets: Vec<Option<usize>> = structure
            .cameras
            .iter()
            .map(|camera| (!camera.known).then(|| allocate(3)))
            .collect();
        let view_offsets: Vec<Option<usize>> = structure
            .views
            .iter()
            .map(|view| (!view.known).then(|| allocate(6)))
            .collect();

        let mut params = DVector::zeros(num_params);
        for (camera, offset) in structure.cameras.iter().zip(&camera_offsets) {
            if let &Some(offset) = offset {
                let CameraIntrinsics { focal, k1, k2 } = camera.intrinsics;
                params
                    .fixed_rows_mut::<3>(offset)
                    .copy_from(&Vector3::new(focal, k1, k2));
            }
        }

        let mut num_residuals = 0;
        let rows = tracks
            .iter()
            .map(|track| {
                let row = num_residuals;
                num_residuals += 2 * track.observations.len();
                row
            })
            .collect();

        Self {
            cameras: structure.cameras.clone(),
            views: structure.views.clone(),
            start: structure.views.iter().map(|view| view.world_to_view).collect(),
            points: structure.points.iter().map(|point| point.point).collect(),
            tracks,
            rows,
            camera_offsets,
            view_offsets,
            params,
            num_params,
            num_residuals,
        }
    }

    fn omega(&self, view: usize) -> Vector3<f64> {
        self.view_offsets[view]
            .map(|offset| self.params.fixed_rows::<3>(offset + 3).into_owned())
            .unwrap_or_else(Vector3::zeros)
    }

    fn project(&self, view: usize, point: Point3<f64>) -> Point2<f64> {
        let view = &self.views[view];
        self.cameras[view.camera]
            .intrinsics
            .project(view.world_to_view.transform_point(point))
    }

    fn track_cost(&self, track: &Track, point: Point3<f64>) -> f64 {
        track
            .observations
            .iter()
            .map(|observation| {
                (self.project(observation.view, point) - observation.pixel).norm_squared()
            })
            .sum()
    }

    fn cost(&self) -> f64 {
        self.tracks
            .iter()
            .map(|track| self.track_cost(track, self.points[track.point]))
            .sum()
    }

    /// Derivatives of the pixel of an observation with respect to the world point.
    fn point_jacobian(
        &self,
        observation: &TrackObservation,
        point: Point3<f64>,
    ) -> Matrix2x3<f64> {
        let view = &self.views[observation.view];
        let in_view = view.world_to_view.transform_point(point);
        let (_, d_pixel_d_point, _) =
            project_with_jacobians(&self.cameras[view.camera].intrinsics, in_view);
        d_pixel_d_point * view.world_to_view.rotation().matrix()
    }

    /// Moves a point to the position that minimizes its reprojection error for the current
    /// cameras and views.
    fn refine_point(&self, track: &Track) -> Point3<f64> {
        let mut point = self.points[track.point];
        let mut cost = self.track_cost(track, point);
        for _ in 0..POINT_ITERATIONS {
            let mut normal = Matrix3::zeros();
            let mut gradient = Vector3::zeros();
            for observation in &track.observations {
                let jacobian = self.point_jacobian(observation, point);
                let residual = self.project(observation.view, point) - observation.pixel;
                normal += jacobian.transpose() * jacobian;
                gradient += jacobian.transpose() * residual;
            }
            let step = match normal.try_inverse() {
                Some(inverse) => -(inverse * gradient),
                None => break,
            };
            let candidate = point + step;
            let candidate_cost = self.track_cost(track, candidate);
            if !(candidate_cost < cost) {
                break;
            }
            point = candidate;
            cost = candidate_cost;
            if step.norm() <= POINT_STEP_TOLERANCE * (1.0 + point.coords.norm()) {
                break;
            }
        }
        point
    }

    fn refine_points(&mut self) {
        for track in self.tracks.iter().filter(|track| track.refine) {
            self.points[track.point] = self.refine_point(track);
        }
    }

    fn commit(self, structure: &mut BundleStructure) {
        for (dst, src) in structure.cameras.iter_mut().zip(self.cameras) {
            dst.intrinsics = src.intrinsics;
        }
        for (dst, src) in structure.views.iter_mut().zip(self.views) {
            dst.world_to_view = src.world_to_view;
        }
        for (dst, src) in structure.points.iter_mut().zip(self.points) {
            dst.point = src;
        }
    }
}

impl<'a> LeastSquaresProblem<f64, Dynamic, Dynamic> for MotionProblem<'a> {
    type ResidualStorage = VecStorage<f64, Dynamic, U1>;
    type JacobianStorage = VecStorage<f64, Dynamic, Dynamic>;
    type ParameterStorage = VecStorage<f64, Dynamic, U1>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
        for (camera, offset) in self.cameras.iter_mut().zip(&self.camera_offsets) {
            if let &Some(offset) = offset {
                camera.intrinsics = CameraIntrinsics::new(params[offset])
                    .distortion(params[offset + 1], params[offset + 2]);
            }
        }
        for (ix, view) in self.views.iter_mut().enumerate() {
            if let Some(offset) = self.view_offsets[ix] {
                let update = WorldToCamera::from_parts(
                    params.fixed_rows::<3>(offset).into_owned(),
                    Rotation3::new(params.fixed_rows::<3>(offset + 3).into_owned()),
                );
                view.world_to_view = WorldToCamera(update.isometry() * self.start[ix].isometry());
            }
        }
        self.refine_points();
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut residuals = DVector::zeros(self.num_residuals);
        for (track, &row) in self.tracks.iter().zip(&self.rows) {
            let point = self.points[track.point];
            for (i, observation) in track.observations.iter().enumerate() {
                let error = self.project(observation.view, point) - observation.pixel;
                residuals
                    .fixed_rows_mut::<2>(row + 2 * i)
                    .copy_from(&error);
            }
        }
        residuals
            .iter()
            .all(|n| n.is_finite())
            .then(|| residuals)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(self.num_residuals, self.num_params);
        for (track, &row) in self.tracks.iter().zip(&self.rows) {
            let point = self.points[track.point];
            let len = 2 * track.observations.len();
            let mut rows = jacobian.rows_mut(row, len);
            let mut point_jacobian = DMatrix::zeros(len, 3);
            for (i, observation) in track.observations.iter().enumerate() {
                let view = &self.views[observation.view];
                let in_view = view.world_to_view.transform_point(point);
                let (_, d_pixel_d_point, d_pixel_d_intrinsics) =
                    project_with_jacobians(&self.cameras[view.camera].intrinsics, in_view);

                if let Some(offset) = self.camera_offsets[view.camera] {
                    let mut block = rows.fixed_slice_mut::<2, 3>(2 * i, offset);
                    block += d_pixel_d_intrinsics;
                }
                if let Some(offset) = self.view_offsets[observation.view] {
                    let rotated = in_view.coords - self.params.fixed_rows::<3>(offset);
                    rows.fixed_slice_mut::<2, 6>(2 * i, offset).copy_from(&view_jacobian(
                        &d_pixel_d_point,
                        rotated,
                        self.omega(observation.view),
                    ));
                }
                point_jacobian
                    .fixed_slice_mut::<2, 3>(2 * i, 0)
                    .copy_from(&(d_pixel_d_point * view.world_to_view.rotation().matrix()));
            }

            // The point sits at its optimum, so the directions it can absorb are removed.
            if track.refine {
                let normal = point_jacobian.transpose() * &point_jacobian;
                if let Some(inverse) = normal.try_inverse() {
                    let correction =
                        &point_jacobian * (inverse * (point_jacobian.transpose() * &rows));
                    rows -= correction;
                }
            }
        }
        jacobian
            .iter()
            .all(|n| n.is_finite())
            .then(|| jacobian)
    }
}
