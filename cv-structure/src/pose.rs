//! Poses come from `cv-core`. This module adds the accessors the reconstruction leans on and the
//! similarity that carries one scene into the frame of another.

use cv_core::{CameraToCamera, Pose, WorldToCamera, WorldToWorld};
use nalgebra::{Point3, Rotation3, Vector3, Vector4};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Component access and euclidean transforms for every [`Pose`].
pub trait PoseExt: Pose {
    /// Retrieve the translation component.
    fn translation(self) -> Vector3<f64> {
        self.isometry().translation.vector
    }

    /// Retrieve the rotation component.
    fn rotation(self) -> Rotation3<f64> {
        self.isometry().rotation
    }

    /// Transform a euclidean point.
    fn transform_point(self, point: Point3<f64>) -> Point3<f64> {
        self.isometry() * point
    }

    /// Transform a homogeneous point `(x, y, z, w)`. The `w` component is preserved.
    fn transform_homogeneous(self, point: Vector4<f64>) -> Vector4<f64> {
        self.isometry().to_homogeneous() * point
    }
}

impl<P: Pose> PoseExt for P {}

/// Chains the world poses of views through the relative poses between them.
pub trait WorldToCameraExt {
    /// Computes the transform from the frame of this view into the frame of `other`.
    fn relative_to(self, other: WorldToCamera) -> CameraToCamera;

    /// Appends a relative transform, producing the world pose of the view `relative` leads to.
    fn then(self, relative: CameraToCamera) -> WorldToCamera;
}

impl WorldToCameraExt for WorldToCamera {
    fn relative_to(self, other: WorldToCamera) -> CameraToCamera {
        CameraToCamera(other.isometry() * self.isometry().inverse())
    }

    fn then(self, relative: CameraToCamera) -> WorldToCamera {
        WorldToCamera(relative.isometry() * self.isometry())
    }
}

/// If a view has a pose in two different scenes, this derives the [`WorldToWorld`] from the pose
/// of the view in scene `A` to its pose in scene `B`, in that order.
pub fn world_to_world_from_camera_poses(a_pose: WorldToCamera, b_pose: WorldToCamera) -> WorldToWorld {
    WorldToWorld(b_pose.isometry().inverse() * a_pose.isometry())
}

/// A similarity transform from the world of one scene into the world of another.
///
/// A point is first multiplied by `scale` and then moved by `transform`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ScaledWorldToWorld {
    pub scale: f64,
    pub transform: WorldToWorld,
}

impl ScaledWorldToWorld {
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            transform: WorldToWorld::identity(),
        }
    }

    /// Transforms a world point of the source scene into the destination scene.
    pub fn transform_point(&self, point: Point3<f64>) -> Point3<f64> {
        self.transform.transform_point(point * self.scale)
    }

    /// Converts the pose of a view in the source scene into the destination scene.
    pub fn transform_view(&self, world_to_camera: WorldToCamera) -> WorldToCamera {
        let scaled = world_to_camera.scale(self.scale);
        WorldToCamera(scaled.isometry() * self.transform.isometry().inverse())
    }

    /// The similarity going the other way.
    pub fn inverse(&self) -> Self {
        let mut isometry = self.transform.isometry().inverse();
        isometry.translation.vector /= self.scale;
        Self {
            scale: 1.0 / self.scale,
            transform: WorldToWorld(isometry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON_APPROX: f64 = 1e-9;

    fn sample_pose(tx: f64, angle: f64) -> WorldToCamera {
        WorldToCamera::from_parts(
            Vector3::new(tx, 0.2, -0.3),
            Rotation3::from_euler_angles(angle, 0.1, -0.2),
        )
    }

    #[test]
    fn relative_then_recovers_pose() {
        let a = sample_pose(0.5, 0.1);
        let b = sample_pose(-1.0, 0.3);
        let a_to_b = a.relative_to(b);
        let recovered = a.then(a_to_b);
        assert_relative_eq!(recovered.0, b.0, epsilon = EPSILON_APPROX);
    }

    #[test]
    fn camera_poses_give_the_same_world_to_world() {
        let a = sample_pose(0.5, 0.1);
        let b = sample_pose(-1.0, 0.3);
        let a_to_b = world_to_world_from_camera_poses(a, b);
        let point = Point3::new(0.3, -0.4, 4.0);
        assert_relative_eq!(
            b.transform_point(a_to_b.transform_point(point)),
            a.transform_point(point),
            epsilon = EPSILON_APPROX
        );
    }

    #[test]
    fn homogeneous_matches_euclidean() {
        let a = sample_pose(0.5, 0.4);
        let point = Point3::new(0.3, -0.4, 4.0);
        let homogeneous = a.transform_homogeneous(point.to_homogeneous() * 2.0);
        assert_relative_eq!(
            homogeneous.xyz() / homogeneous.w,
            a.transform_point(point).coords,
            epsilon = EPSILON_APPROX
        );
    }

    #[test]
    fn similarity_maps_views_consistently() {
        let similarity = ScaledWorldToWorld {
            scale: 2.0,
            transform: WorldToWorld::from_parts(
                Vector3::new(1.0, -2.0, 0.5),
                Rotation3::from_euler_angles(0.3, -0.1, 0.2),
            ),
        };
        let src_view = sample_pose(0.5, 0.2);
        let src_point = Point3::new(0.3, -0.4, 4.0);
        let dst_view = similarity.transform_view(src_view);
        let dst_point = similarity.transform_point(src_point);
        // The point seen from the view is the same up to the scale of the scene.
        let src_camera = src_view.transform_point(src_point);
        let dst_camera = dst_view.transform_point(dst_point);
        assert_relative_eq!(src_camera.coords * 2.0, dst_camera.coords, epsilon = EPSILON_APPROX);

        let back = similarity.inverse().transform_point(dst_point);
        assert_relative_eq!(back, src_point, epsilon = EPSILON_APPROX);
    }
}
