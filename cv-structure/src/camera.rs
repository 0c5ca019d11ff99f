use nalgebra::{Matrix3, Point2, Point3, Unit, UnitVector3, Vector2, Vector3, Vector4};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The number of fixed-point iterations used to remove radial distortion.
const UNDISTORT_ITERATIONS: usize = 20;

/// The calibration an image database reports for a camera before any reconstruction is done.
///
/// The linear part is the pinhole model of `cv-pinhole`. Its principal point is considered known
/// and is subtracted from every pixel before it enters the reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPrior {
    pub linear: cv_pinhole::CameraIntrinsics,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
}

impl CameraPrior {
    pub fn new(linear: cv_pinhole::CameraIntrinsics, width: u32, height: u32) -> Self {
        Self {
            linear,
            width,
            height,
        }
    }

    /// Creates a prior with no skew where the principal point is the image center.
    pub fn from_shape(focal: f64, width: u32, height: u32) -> Self {
        let linear = cv_pinhole::CameraIntrinsics {
            focals: Vector2::new(focal, focal),
            principal_point: Point2::new(width as f64 / 2.0, height as f64 / 2.0),
            skew: 0.0,
        };
        Self::new(linear, width, height)
    }

    /// The mean of the two focal lengths.
    pub fn focal(&self) -> f64 {
        (self.linear.focals.x + self.linear.focals.y) / 2.0
    }

    /// Subtracts the principal point, giving the zero centered pixel the rest of the crate works with.
    pub fn center(&self, pixel: Point2<f64>) -> Point2<f64> {
        Point2::from(pixel - self.linear.principal_point)
    }

    /// Adds the principal point back to a zero centered pixel.
    pub fn uncenter(&self, centered: Point2<f64>) -> Point2<f64> {
        self.linear.principal_point + centered.coords
    }

    /// The bearing of a zero centered pixel using only the linear calibration.
    pub fn bearing(&self, centered: Point2<f64>) -> UnitVector3<f64> {
        let y = centered.y / self.linear.focals.y;
        let x = (centered.x - self.linear.skew * y) / self.linear.focals.x;
        Unit::new_normalize(Vector3::new(x, y, 1.0))
    }
}

/// The intrinsic parameters that are estimated during reconstruction and shared between
/// all the views that were taken by the same camera.
///
/// Pixels are zero centered, so the model is a single focal length followed by two radial
/// distortion terms applied in normalized image coordinates:
///
/// ```text
/// n = (x / z, y / z)
/// r² = |n|²
/// pixel = focal * (1 + k1 r² + k2 r⁴) * n
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraIntrinsics {
    pub focal: f64,
    pub k1: f64,
    pub k2: f64,
}

impl CameraIntrinsics {
    pub fn new(focal: f64) -> Self {
        Self {
            focal,
            k1: 0.0,
            k2: 0.0,
        }
    }

    /// Initial intrinsics from a database prior. Distortion starts at zero.
    pub fn from_prior(prior: &CameraPrior) -> Self {
        Self::new(prior.focal())
    }

    #[must_use]
    pub fn distortion(self, k1: f64, k2: f64) -> Self {
        Self { k1, k2, ..self }
    }

    /// The linear calibration matrix, ignoring distortion.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.focal, 0.0, 0.0, 0.0, self.focal, 0.0, 0.0, 0.0, 1.0)
    }

    /// Applies the radial distortion to a normalized image coordinate and scales it into pixels.
    pub fn distort(&self, normalized: Point2<f64>) -> Point2<f64> {
        let r2 = normalized.coords.norm_squared();
        let radial = 1.0 + (self.k1 + self.k2 * r2) * r2;
        Point2::from(normalized.coords * (self.focal * radial))
    }

    /// Projects a point in the frame of the camera into a zero centered pixel.
    pub fn project(&self, point: Point3<f64>) -> Point2<f64> {
        self.distort(Point2::new(point.x / point.z, point.y / point.z))
    }

    /// Projects a homogeneous point in the frame of the camera. The `w` component cancels.
    pub fn project_homogeneous(&self, point: Vector4<f64>) -> Point2<f64> {
        self.distort(Point2::new(point.x / point.z, point.y / point.z))
    }

    /// Converts a zero centered pixel into a normalized image coordinate, removing distortion.
    pub fn normalize(&self, pixel: Point2<f64>) -> Point2<f64> {
        let distorted = pixel.coords / self.focal;
        if self.k1 == 0.0 && self.k2 == 0.0 {
            return Point2::from(distorted);
        }
        let mut undistorted = distorted;
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = undistorted.norm_squared();
            let radial = 1.0 + (self.k1 + self.k2 * r2) * r2;
            undistorted = distorted / radial;
        }
        Point2::from(undistorted)
    }

    /// The bearing out of the optical center that a zero centered pixel was observed at.
    pub fn bearing(&self, pixel: Point2<f64>) -> UnitVector3<f64> {
        let normalized = self.normalize(pixel);
        Unit::new_normalize(Vector3::new(normalized.x, normalized.y, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn normalize_inverts_projection() {
        let intrinsics = CameraIntrinsics::new(500.0).distortion(-0.05, 0.01);
        let point = Point3::new(0.4, -0.3, 2.0);
        let pixel = intrinsics.project(point);
        let normalized = intrinsics.normalize(pixel);
        assert_relative_eq!(normalized.x, 0.2, epsilon = 1e-8);
        assert_relative_eq!(normalized.y, -0.15, epsilon = 1e-8);
    }

    #[test]
    fn prior_centering() {
        let prior = CameraPrior::from_shape(400.0, 640, 480);
        let centered = prior.center(Point2::new(330.0, 200.0));
        assert_relative_eq!(centered, Point2::new(10.0, -40.0));
        assert_relative_eq!(prior.uncenter(centered), Point2::new(330.0, 200.0));
    }

    #[test]
    fn prior_bearing_undoes_skew() {
        let mut prior = CameraPrior::from_shape(400.0, 640, 480);
        prior.linear.focals = Vector2::new(400.0, 500.0);
        prior.linear.skew = 2.0;
        let point = Point3::new(0.4, -0.3, 2.0);
        // The pixel the linear model of the prior maps the point to, relative to the principal point.
        let pixel = prior.linear.matrix() * point.coords / point.z;
        let centered = Point2::new(pixel.x, pixel.y) - prior.linear.principal_point.coords;
        let bearing = prior.bearing(centered);
        assert_relative_eq!(bearing.into_inner(), point.coords.normalize(), epsilon = 1e-10);
    }
}
