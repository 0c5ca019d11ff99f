//! Merges scenes that share views into one another.
//!
//! A merge never touches either scene until it is known to have worked. Everything is done on a
//! copy of the source scene that is moved into the frame of the destination, and only once that
//! copy is refined and verified is it folded into the destination.

use float_ord::FloatOrd;
use log::*;

use crate::{
    best_inliers, check_physical_constraints, remove_bad_features, resolve_scale, BundleAdjuster,
    CommonViewCounts, FailedMerges, ImageDatabase, KnownParameters, MetricReconstructor,
    PairwiseGraph, PhysicalConstraints, Reconstruction, ScaledWorldToWorld, ScenePixels,
    SceneWorkingGraph, ThreeViewSolver, TriangulatorObservations,
};

/// A view both scenes contain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommonView {
    pub pview: usize,
    /// The worse of the best inlier scores of the view in either scene.
    pub score: f64,
}

/// Finds every view of `src` that `dst` also contains, in the order of `src`.
pub fn find_common_views(src: &SceneWorkingGraph, dst: &SceneWorkingGraph) -> Vec<CommonView> {
    let best_score = |scene: &SceneWorkingGraph, pview: usize| {
        best_inliers(scene, pview)
            .map(|info| info.score_geometric)
            .unwrap_or(0.0)
    };
    src.pviews()
        .filter(|&pview| dst.is_known(pview))
        .map(|pview| CommonView {
            pview,
            score: best_score(src, pview).min(best_score(dst, pview)),
        })
        .collect()
}

/// A copy of `src` moved into the frame of `dst`, along with what refinement must leave alone.
struct WorkScene {
    scene: SceneWorkingGraph,
    known: KnownParameters,
    /// The number of inlier sets each view brought along from `src`. Sets after these came from `dst`.
    src_inliers: Vec<usize>,
}

impl WorkScene {
    fn new(
        src: &SceneWorkingGraph,
        dst: &SceneWorkingGraph,
        common: &[CommonView],
        src_to_dst: &ScaledWorldToWorld,
    ) -> Self {
        let mut scene = src.clone();
        let mut known = KnownParameters::none(&scene);
        let src_inliers = scene.views.iter().map(|view| view.inliers.len()).collect();

        // The cameras of `dst` are authoritative.
        for (ix, camera) in scene.cameras.iter_mut().enumerate() {
            if let Some(dst_camera) = dst.lookup_camera(camera.db_index) {
                camera.intrinsics = dst.cameras[dst_camera].intrinsics;
                camera.prior = dst.cameras[dst_camera].prior;
                known.cameras[ix] = true;
            }
        }
        for view in &mut scene.views {
            view.world_to_view = src_to_dst.transform_view(view.world_to_view);
        }

        let mut work = Self {
            scene,
            known,
            src_inliers,
        };
        for common in common {
            let dst_view = dst.expect_view(common.pview);
            let view = work.scene.expect_view(common.pview).index;
            work.scene.views[view].world_to_view = dst_view.world_to_view;
            work.known.views[view] = true;
            for info in &dst_view.inliers {
                for &pview in &info.views {
                    work.copy_view_state(dst, pview);
                }
                work.scene.views[view].inliers.push(info.clone());
            }
        }
        work
    }

    /// Adds a view of `dst` without any of its inlier sets, held fixed.
    fn copy_view_state(&mut self, dst: &SceneWorkingGraph, pview: usize) {
        if self.scene.is_known(pview) {
            return;
        }
        let dst_view = dst.expect_view(pview);
        let dst_camera = &dst.cameras[dst_view.camera];
        let created = self.scene.cameras.len();
        let camera = self.scene.add_camera(dst_camera.db_index, dst_camera.prior);
        if camera == created {
            self.scene.cameras[camera].intrinsics = dst_camera.intrinsics;
            self.known.cameras.push(true);
        }
        self.scene.add_view(pview, camera, dst_view.world_to_view);
        self.known.views.push(true);
        self.src_inliers.push(0);
    }

    /// Folds the work scene into `dst`. Views `dst` already has only gain the inlier sets of `src`.
    fn commit(self, dst: &mut SceneWorkingGraph) -> usize {
        let mut added = 0;
        for (view, &src_inliers) in self.scene.views.iter().zip(&self.src_inliers) {
            let inliers = view.inliers[..src_inliers].iter().cloned();
            if let Some(existing) = dst.lookup_view(view.pview) {
                dst.views[existing].inliers.extend(inliers);
                continue;
            }
            let work_camera = &self.scene.cameras[view.camera];
            let created = dst.cameras.len();
            let camera = dst.add_camera(work_camera.db_index, work_camera.prior);
            if camera == created {
                dst.cameras[camera].intrinsics = work_camera.intrinsics;
            }
            let index = dst.add_view(view.pview, camera, view.world_to_view);
            dst.views[index].inliers.extend(inliers);
            dst.explore(view.pview);
            added += 1;
        }
        added
    }
}

impl<D, S, B, T> MetricReconstructor<D, S, B, T>
where
    D: ImageDatabase,
    S: ThreeViewSolver,
    B: BundleAdjuster,
    T: TriangulatorObservations,
{
    /// Merges `src` into `dst`.
    ///
    /// Returns false if the merge failed, in which case `dst` is left exactly as it was.
    pub fn merge(
        &mut self,
        pairwise: &PairwiseGraph,
        src: &SceneWorkingGraph,
        dst: &mut SceneWorkingGraph,
    ) -> bool {
        let settings = self.settings;
        let common = find_common_views(src, dst);
        let best = match common
            .iter()
            .copied()
            .max_by_key(|common| FloatOrd(common.score))
        {
            Some(best) => best,
            None => {
                info!("merge failed because the scenes have no views in common");
                return false;
            }
        };
        let src_to_dst = match resolve_scale(
            pairwise,
            &self.database,
            &self.triangulator,
            src,
            dst,
            best.pview,
            settings.merge_scale_window_fraction,
        ) {
            Some(src_to_dst) => src_to_dst,
            None => {
                info!(
                    "merge failed because the scale could not be resolved with view '{}'",
                    pairwise.id(best.pview)
                );
                return false;
            }
        };
        debug!(
            "merging {} views into {} views with {} in common, scale {} from view '{}'",
            src.len(),
            dst.len(),
            common.len(),
            src_to_dst.scale,
            pairwise.id(best.pview)
        );

        let mut work = WorkScene::new(src, dst, &common, &src_to_dst);
        if !self.refine_scene_with(pairwise, &mut work.scene, &work.known) {
            info!("merge failed because the combined scene could not be refined");
            return false;
        }
        if !self.verify_merge(pairwise, &mut work, &common) {
            return false;
        }

        let added = work.commit(dst);
        info!(
            "merged a scene of {} views, {} of them new, now {} views",
            src.len(),
            added,
            dst.len()
        );
        true
    }

    /// Checks that the inlier features `src` brought to the common views are still in front of
    /// every view, removing the few that are not.
    fn verify_merge(
        &self,
        pairwise: &PairwiseGraph,
        work: &mut WorkScene,
        common: &[CommonView],
    ) -> bool {
        let constraints = PhysicalConstraints {
            minimum_depth: self.settings.merge_minimum_depth,
            maximum_reprojection_error: f64::INFINITY,
        };
        let pixels = match ScenePixels::for_scene(pairwise, &self.database, &work.scene) {
            Some(pixels) => pixels,
            None => return false,
        };
        for common in common {
            let view = work.scene.expect_view(common.pview).index;
            for ix in 0..work.src_inliers[view] {
                let info = &work.scene.views[view].inliers[ix];
                let bad =
                    check_physical_constraints(&self.triangulator, &work.scene, &pixels, info, &constraints);
                let count = bad.iter().filter(|&&bad| bad).count();
                if !remove_bad_features(
                    &mut work.scene.views[view].inliers[ix],
                    &bad,
                    self.settings.merge_fraction_bad_recover,
                ) {
                    info!(
                        "merge failed because {} of {} features of view '{}' are not physically possible",
                        count,
                        bad.len(),
                        pairwise.id(common.pview)
                    );
                    return false;
                }
                if count != 0 {
                    debug!(
                        "removed {} of {} features from view '{}' while merging",
                        count,
                        bad.len(),
                        pairwise.id(common.pview)
                    );
                }
            }
        }
        true
    }

    /// Merges scenes until no two scenes that share views are left, or every remaining merge
    /// failed.
    ///
    /// Scenes with the most views in common are merged first. The smaller scene is merged into
    /// the larger one, and a scene whose views are all part of the other is simply dropped.
    pub fn merge_scenes(&mut self, pairwise: &PairwiseGraph, reconstruction: &mut Reconstruction) {
        let mut counts = CommonViewCounts::from_viewed_by(reconstruction.all_viewed_by());
        let mut failed = FailedMerges::default();
        let len = |reconstruction: &Reconstruction, key| {
            reconstruction.scene(key).map(SceneWorkingGraph::len).unwrap_or(0)
        };
        let pviews = |reconstruction: &Reconstruction, key| -> Vec<usize> {
            reconstruction
                .scene(key)
                .map(|scene| scene.pviews().collect())
                .unwrap_or_default()
        };
        info!("merging {} scenes", reconstruction.len());

        while let Some((a, b)) = counts.select(|a, b| {
            failed.is_blocked(a, len(reconstruction, a), b, len(reconstruction, b))
        }) {
            let (src, dst) = if len(reconstruction, a) < len(reconstruction, b) {
                (a, b)
            } else {
                (b, a)
            };
            let (src_pviews, dst_pviews) = (pviews(reconstruction, src), pviews(reconstruction, dst));

            let is_subset = reconstruction
                .scene(dst)
                .map(|scene| src_pviews.iter().all(|&pview| scene.is_known(pview)))
                .unwrap_or(false);
            if is_subset {
                info!(
                    "dropping scene {:?} since its {} views are all in scene {:?}",
                    src,
                    src_pviews.len(),
                    dst
                );
                counts.disable(src, src_pviews, reconstruction.all_viewed_by());
                reconstruction.remove_scene(src);
                continue;
            }

            counts.disable(src, src_pviews.iter().copied(), reconstruction.all_viewed_by());
            counts.disable(dst, dst_pviews.iter().copied(), reconstruction.all_viewed_by());
            let merged = match reconstruction.scene_pair_mut(src, dst) {
                Some([src_scene, dst_scene]) => self.merge(pairwise, src_scene, dst_scene),
                None => panic!("scenes {:?} and {:?} selected for merging do not exist", src, dst),
            };

            if merged {
                let merged_pviews = pviews(reconstruction, dst);
                for &pview in &merged_pviews {
                    reconstruction.mark_viewed(dst, pview);
                }
                reconstruction.remove_scene(src);
                counts.enable(dst, merged_pviews.iter().copied(), reconstruction.all_viewed_by());
                if let Some(scene) = reconstruction.scene(dst) {
                    let changed = src_pviews.iter().copied().filter(|&pview| scene.is_known(pview));
                    self.sanity_check_scene(pairwise, scene, changed);
                }
            } else {
                info!("failed to merge scene {:?} into scene {:?}", src, dst);
                failed.mark(
                    src,
                    len(reconstruction, src),
                    dst,
                    len(reconstruction, dst),
                );
                counts.enable(src, src_pviews, reconstruction.all_viewed_by());
                counts.enable(dst, dst_pviews, reconstruction.all_viewed_by());
            }
            if self.settings.sanity_checks {
                counts.assert_consistent(reconstruction.all_viewed_by());
            }
        }

        info!("{} scenes left after merging", reconstruction.len());
    }
}
