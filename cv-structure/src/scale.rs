//! Finds the similarity between two scenes from a view they have in common.
//!
//! Rotation and translation follow directly from the two poses of the common view. The scale is
//! found by triangulating the same features in both scenes, relative to the common view, and
//! comparing how deep they are.

use std::collections::HashMap;

use float_ord::FloatOrd;
use log::*;

use crate::{
    triangulate_in_front, triangulation::INFINITY_TOLERANCE, world_to_world_from_camera_poses,
    ImageDatabase, InlierInfo, PairwiseGraph, Pose, ScaledWorldToWorld, ScenePixels,
    SceneWorkingGraph, TriangulatorObservations, WorldToCamera, WorldToCameraExt,
};

/// Picks the most reliable scale from a list of noisy estimates.
///
/// The estimates are sorted and a window of `max(1, fraction × n)` estimates, made odd, slides
/// over them. The median of the window that spans the smallest range wins. Outliers spread out,
/// so they rarely fall into the tightest window. Returns `None` if there are no estimates.
pub fn select_scale_minimum_local_variance(scales: &mut [f64], fraction: f64) -> Option<f64> {
    if scales.is_empty() {
        return None;
    }
    scales.sort_unstable_by_key(|&scale| FloatOrd(scale));
    let n = scales.len();
    let mut window = ((n as f64 * fraction) as usize).max(1);
    if window % 2 == 0 {
        window += 1;
    }
    if window >= n {
        return Some(scales[n / 2]);
    }
    let mut best = scales[window / 2];
    let mut best_range = scales[window - 1] - scales[0];
    for i in window..n {
        let range = scales[i] - scales[i + 1 - window];
        if range < best_range {
            best_range = range;
            best = scales[i - window / 2];
        }
    }
    Some(best)
}

/// The inlier set of a view with the highest score. The last one wins ties.
pub fn best_inliers(scene: &SceneWorkingGraph, pview: usize) -> Option<&InlierInfo> {
    scene
        .expect_view(pview)
        .inliers
        .iter()
        .max_by_key(|info| FloatOrd(info.score_geometric))
}

/// Triangulates a feature of an inlier set in the frame of its first view.
///
/// Returns the depth of the feature, or `None` if it is at infinity or not in front.
fn depth_in_first_view(
    triangulator: &impl TriangulatorObservations,
    scene: &SceneWorkingGraph,
    pixels: &ScenePixels,
    info: &InlierInfo,
    position: usize,
) -> Option<f64> {
    let first = scene.expect_view(info.views[0]).world_to_view;
    let observations: Vec<(WorldToCamera, _)> = info
        .views
        .iter()
        .zip(&info.observations)
        .map(|(&pview, features)| {
            let view = scene.expect_view(pview);
            let intrinsics = &scene.cameras[view.camera].intrinsics;
            let pose = WorldToCamera(first.relative_to(view.world_to_view).0);
            (pose, intrinsics.bearing(pixels.get(pview, features[position])))
        })
        .collect();
    let point = triangulate_in_front(triangulator, &observations)?;
    if point.w.abs() <= INFINITY_TOLERANCE {
        return None;
    }
    let depth = point.z / point.w;
    (depth > 0.0).then(|| depth)
}

/// Estimates the similarity from the world of `src` to the world of `dst` using a view both of
/// them contain.
///
/// Returns `None` if the view shares no features that triangulate in front of it in both scenes.
pub fn resolve_scale<D>(
    pairwise: &PairwiseGraph,
    database: &D,
    triangulator: &impl TriangulatorObservations,
    src: &SceneWorkingGraph,
    dst: &SceneWorkingGraph,
    pview: usize,
    window_fraction: f64,
) -> Option<ScaledWorldToWorld>
where
    D: ImageDatabase + ?Sized,
{
    let id = pairwise.id(pview);
    let (src_info, dst_info) = match (best_inliers(src, pview), best_inliers(dst, pview)) {
        (Some(src_info), Some(dst_info)) => (src_info, dst_info),
        _ => {
            info!("view '{}' has no inliers in one of the scenes", id);
            return None;
        }
    };
    let pixels = ScenePixels::load(
        pairwise,
        database,
        src_info.views.iter().chain(&dst_info.views).copied(),
    )?;

    let dst_positions: HashMap<usize, usize> = dst_info.observations[0]
        .iter()
        .enumerate()
        .map(|(position, &feature)| (feature, position))
        .collect();
    let mut common = 0;
    let mut scales: Vec<f64> = src_info.observations[0]
        .iter()
        .enumerate()
        .filter_map(|(src_position, feature)| {
            let &dst_position = dst_positions.get(feature)?;
            common += 1;
            let src_depth = depth_in_first_view(triangulator, src, &pixels, src_info, src_position)?;
            let dst_depth = depth_in_first_view(triangulator, dst, &pixels, dst_info, dst_position)?;
            let scale = dst_depth / src_depth;
            scale.is_finite().then(|| scale)
        })
        .collect();
    debug!(
        "view '{}' has {} common features, {} triangulated in both scenes",
        id,
        common,
        scales.len()
    );
    let scale = match select_scale_minimum_local_variance(&mut scales, window_fraction) {
        Some(scale) => scale,
        None => {
            info!("view '{}' has no features to resolve the scale with", id);
            return None;
        }
    };

    let src_pose = src.expect_view(pview).world_to_view;
    let dst_pose = dst.expect_view(pview).world_to_view;
    Some(ScaledWorldToWorld {
        scale,
        transform: world_to_world_from_camera_poses(src_pose.scale(scale), dst_pose),
    })
}
