use cv_core::{Pose, Projective, TriangulatorObservations, WorldToCamera};
use nalgebra::{UnitVector3, Vector4};

use crate::{PoseExt, WorldToCameraExt};

/// A normalized homogeneous point with `|w|` at or below this is at infinity.
pub(crate) const INFINITY_TOLERANCE: f64 = 1e-12;

/// Triangulates a homogeneous world point that lies in front of every view that observed it.
///
/// Each observation is the pose of a view and the bearing the point was observed at in that view.
/// The returned point is normalized and has a non-negative `w`. It is `None` if fewer than two
/// observations were given, the triangulator failed, the result is not finite, or the point is
/// behind any of the views.
pub fn triangulate_in_front(
    triangulator: &impl TriangulatorObservations,
    observations: &[(WorldToCamera, UnitVector3<f64>)],
) -> Option<Vector4<f64>> {
    if observations.len() < 2 {
        return None;
    }
    let point = triangulator
        .triangulate_observations(observations.iter().copied())?
        .homogeneous();
    if !point.iter().all(|n| n.is_finite()) {
        return None;
    }
    let mut point = point.try_normalize(0.0)?;

    // The solution of a homogeneous system is only defined up to sign.
    if point.w < 0.0 {
        point = -point;
    } else if point.w == 0.0 {
        let &(pose, bearing) = observations.first()?;
        if bearing.dot(&pose.transform_homogeneous(point).xyz()) < 0.0 {
            point = -point;
        }
    }

    observations
        .iter()
        .all(|&(pose, bearing)| bearing.dot(&pose.transform_homogeneous(point).xyz()) > 0.0)
        .then(|| point)
}

/// Triangulates in the frame of the first observation and moves the point back into the world.
///
/// Keeps the numbers small when the views are far from the world origin.
pub fn triangulate_in_first_frame(
    triangulator: &impl TriangulatorObservations,
    observations: &[(WorldToCamera, UnitVector3<f64>)],
) -> Option<Vector4<f64>> {
    let &(first, _) = observations.first()?;
    let local: Vec<(WorldToCamera, UnitVector3<f64>)> = observations
        .iter()
        .map(|&(pose, bearing)| (WorldToCamera(first.relative_to(pose).0), bearing))
        .collect();
    let point = triangulate_in_front(triangulator, &local)?;
    Some(first.inverse().transform_homogeneous(point))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CameraToCamera, LinearEigenTriangulator};
    use approx::assert_relative_eq;
    use nalgebra::{Point3, Rotation3, Unit, Vector3};

    fn observe(pose: WorldToCamera, point: Point3<f64>) -> (WorldToCamera, UnitVector3<f64>) {
        (pose, Unit::new_normalize(pose.transform_point(point).coords))
    }

    #[test]
    fn triangulates_two_views() {
        let a = WorldToCamera::identity();
        let b = WorldToCamera::from_parts(
            Vector3::new(-0.5, 0.1, 0.0),
            Rotation3::from_euler_angles(0.0, 0.1, 0.02),
        );
        let point = Point3::new(0.3, -0.2, 4.0);
        let triangulated = triangulate_in_front(
            &LinearEigenTriangulator::new(),
            &[observe(a, point), observe(b, point)],
        )
        .unwrap();
        assert!(triangulated.w > 0.0);
        assert_relative_eq!(
            triangulated.xyz() / triangulated.w,
            point.coords,
            epsilon = 1e-8
        );
    }

    #[test]
    fn rejects_points_behind_a_view() {
        let a = WorldToCamera::identity();
        let b = WorldToCamera::from_parts(Vector3::new(-0.5, 0.0, 0.0), Rotation3::identity());
        let point = Point3::new(0.3, -0.2, 4.0);
        let (_, bearing_b) = observe(b, point);
        // Flip the bearing of the second view so the rays meet behind it.
        let flipped = Unit::new_unchecked(-bearing_b.into_inner());
        let result = triangulate_in_front(
            &LinearEigenTriangulator::new(),
            &[observe(a, point), (b, flipped)],
        );
        assert!(result.is_none());
    }

    #[test]
    fn rejects_points_behind_every_view() {
        let a = WorldToCamera::identity();
        let b = WorldToCamera::from_parts(Vector3::new(-0.5, 0.0, 0.0), Rotation3::identity());
        // Mirroring the rays through the optical centers keeps the lines but not the direction.
        let point = Point3::new(0.3, -0.2, -4.0);
        let mirror = |(pose, bearing): (WorldToCamera, UnitVector3<f64>)| {
            (pose, Unit::new_unchecked(-bearing.into_inner()))
        };
        let result = triangulate_in_front(
            &LinearEigenTriangulator::new(),
            &[mirror(observe(a, point)), mirror(observe(b, point))],
        );
        assert!(result.is_none());
    }

    #[test]
    fn first_frame_matches_world_frame() {
        let a = WorldToCamera::from_parts(
            Vector3::new(10.0, -20.0, 5.0),
            Rotation3::from_euler_angles(0.2, 0.0, 0.1),
        );
        let b = a.then(CameraToCamera::from_parts(
            Vector3::new(-0.5, 0.0, 0.1),
            Rotation3::from_euler_angles(0.0, 0.1, 0.0),
        ));
        let point = a.inverse().transform_point(Point3::new(0.2, 0.1, 3.0));
        let triangulated = triangulate_in_first_frame(
            &LinearEigenTriangulator::new(),
            &[observe(a, point), observe(b, point)],
        )
        .unwrap();
        assert_relative_eq!(
            triangulated.xyz() / triangulated.w,
            point.coords,
            epsilon = 1e-8
        );
    }

    #[test]
    fn needs_two_observations() {
        let a = WorldToCamera::identity();
        let result = triangulate_in_front(
            &LinearEigenTriangulator::new(),
            &[observe(a, Point3::new(0.0, 0.0, 1.0))],
        );
        assert!(result.is_none());
    }
}
