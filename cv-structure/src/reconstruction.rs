use log::*;
use slotmap::{new_key_type, DenseSlotMap};

use crate::{
    inlier_triangulate_positive_depth, select_and_spawn, BundleAdjuster, CalibratedThreeView,
    CameraIntrinsics, ImageDatabase, LevenbergMarquardtAdjuster, LinearEigenTriangulator,
    PairwiseGraph, ReconstructionSettings, ScenePixels, SceneWorkingGraph, SeedReport,
    ThreeViewSolver, TriangulatorObservations, WorldToCamera,
};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The fraction of inlier features that may land behind a view before a sanity check complains.
const SANITY_FRACTION_BEHIND: f64 = 0.1;

new_key_type! {
    pub struct SceneKey;
}

/// Every scene of a reconstruction along with the bookkeeping that relates scenes to each other.
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    scenes: DenseSlotMap<SceneKey, SceneWorkingGraph>,
    /// For every pairwise view, the scenes that contain it, sorted.
    viewed_by: Vec<Vec<SceneKey>>,
    /// What happened during seed selection.
    pub seeds: SeedReport,
}

impl Reconstruction {
    /// Creates an empty reconstruction for a pairwise graph with `num_views` views.
    pub fn new(num_views: usize) -> Self {
        Self {
            scenes: DenseSlotMap::with_key(),
            viewed_by: vec![vec![]; num_views],
            seeds: SeedReport::default(),
        }
    }

    /// Adds a scene and records that it contains each of its views.
    pub fn add_scene(&mut self, scene: SceneWorkingGraph) -> SceneKey {
        let pviews: Vec<usize> = scene.pviews().collect();
        let key = self.scenes.insert(scene);
        for pview in pviews {
            self.mark_viewed(key, pview);
        }
        key
    }

    /// Removes a scene, forgetting every view it contained.
    pub fn remove_scene(&mut self, key: SceneKey) -> Option<SceneWorkingGraph> {
        let scene = self.scenes.remove(key)?;
        for pview in scene.pviews() {
            self.viewed_by[pview].retain(|&other| other != key);
        }
        Some(scene)
    }

    /// Records that the scene now contains a pairwise view.
    pub fn mark_viewed(&mut self, key: SceneKey, pview: usize) {
        let viewed_by = &mut self.viewed_by[pview];
        if let Err(position) = viewed_by.binary_search(&key) {
            viewed_by.insert(position, key);
        }
    }

    /// The scenes that contain a pairwise view.
    pub fn viewed_by(&self, pview: usize) -> &[SceneKey] {
        &self.viewed_by[pview]
    }

    pub fn all_viewed_by(&self) -> &[Vec<SceneKey>] {
        &self.viewed_by
    }

    pub fn scenes(&self) -> impl Iterator<Item = (SceneKey, &SceneWorkingGraph)> + '_ {
        self.scenes.iter()
    }

    pub fn keys(&self) -> Vec<SceneKey> {
        self.scenes.keys().collect()
    }

    pub fn scene(&self, key: SceneKey) -> Option<&SceneWorkingGraph> {
        self.scenes.get(key)
    }

    /// Scenes may only be modified through the reconstruction so views stay tracked.
    pub(crate) fn scene_mut(&mut self, key: SceneKey) -> Option<&mut SceneWorkingGraph> {
        self.scenes.get_mut(key)
    }

    pub(crate) fn scenes_mut(
        &mut self,
    ) -> impl Iterator<Item = (SceneKey, &mut SceneWorkingGraph)> + '_ {
        self.scenes.iter_mut()
    }

    /// Temporarily takes two different scenes at once.
    pub(crate) fn scene_pair_mut(
        &mut self,
        a: SceneKey,
        b: SceneKey,
    ) -> Option<[&mut SceneWorkingGraph; 2]> {
        self.scenes.get_disjoint_mut([a, b])
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    /// The scene with the most views. The first one wins ties.
    pub fn largest_scene(&self) -> Option<SceneKey> {
        let mut best: Option<(SceneKey, usize)> = None;
        for (key, scene) in self.scenes.iter() {
            if best.map(|(_, len)| scene.len() > len).unwrap_or(true) {
                best = Some((key, scene.len()));
            }
        }
        best.map(|(key, _)| key)
    }

    /// Describes a scene in terms of the image database ids.
    pub fn output(&self, pairwise: &PairwiseGraph, key: SceneKey) -> Option<SceneOutput> {
        let scene = self.scenes.get(key)?;
        let views = scene
            .views
            .iter()
            .map(|view| {
                let camera = &scene.cameras[view.camera];
                ViewOutput {
                    id: pairwise.id(view.pview).to_owned(),
                    camera: camera.db_index,
                    intrinsics: camera.intrinsics,
                    world_to_view: view.world_to_view,
                    inliers: view
                        .inliers
                        .iter()
                        .map(|info| InlierOutput {
                            views: info
                                .views
                                .iter()
                                .map(|&pview| pairwise.id(pview).to_owned())
                                .collect(),
                            observations: info.observations.clone(),
                            score: info.score_geometric,
                        })
                        .collect(),
                }
            })
            .collect();
        Some(SceneOutput { views })
    }

    /// Panics with context if the scene bookkeeping disagrees with the scenes.
    pub fn assert_consistent(&self, pairwise: &PairwiseGraph) {
        for (key, scene) in self.scenes.iter() {
            scene.assert_inliers_consistent(pairwise);
            for pview in scene.pviews() {
                assert!(
                    self.viewed_by[pview].contains(&key),
                    "scene {:?} contains view '{}' but is not listed as viewing it",
                    key,
                    pairwise.id(pview)
                );
            }
        }
        for (pview, keys) in self.viewed_by.iter().enumerate() {
            for &key in keys {
                let contains = self
                    .scenes
                    .get(key)
                    .map(|scene| scene.is_known(pview))
                    .unwrap_or(false);
                assert!(
                    contains,
                    "view '{}' is listed as viewed by {:?} which does not contain it",
                    pairwise.id(pview),
                    key
                );
            }
        }
    }
}

/// The provenance of one inlier set, by view id.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct InlierOutput {
    pub views: Vec<String>,
    pub observations: Vec<Vec<usize>>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct ViewOutput {
    pub id: String,
    /// The index of the camera in the image database.
    pub camera: usize,
    pub intrinsics: CameraIntrinsics,
    pub world_to_view: WorldToCamera,
    pub inliers: Vec<InlierOutput>,
}

/// A finished metric scene.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct SceneOutput {
    pub views: Vec<ViewOutput>,
}

/// Reconstructs metric scenes from a pairwise graph.
///
/// Scenes are spawned from the best seeds, each scene grows one view at a time, and scenes that
/// share views are merged. The geometry comes from the strategies given to [`MetricReconstructor::new`].
pub struct MetricReconstructor<D, S, B, T> {
    pub settings: ReconstructionSettings,
    pub database: D,
    pub solver: S,
    pub adjuster: B,
    pub triangulator: T,
}

impl<D> MetricReconstructor<D, CalibratedThreeView, LevenbergMarquardtAdjuster, LinearEigenTriangulator>
where
    D: ImageDatabase,
{
    /// Uses the camera priors of the database as calibration.
    pub fn calibrated(settings: ReconstructionSettings, database: D) -> Self {
        Self::new(
            settings,
            database,
            CalibratedThreeView::new(),
            LevenbergMarquardtAdjuster::from_settings(&settings),
            LinearEigenTriangulator::new(),
        )
    }
}

impl<D, S, B, T> MetricReconstructor<D, S, B, T>
where
    D: ImageDatabase,
    S: ThreeViewSolver,
    B: BundleAdjuster,
    T: TriangulatorObservations,
{
    pub fn new(
        settings: ReconstructionSettings,
        database: D,
        solver: S,
        adjuster: B,
        triangulator: T,
    ) -> Self {
        Self {
            settings,
            database,
            solver,
            adjuster,
            triangulator,
        }
    }

    /// Runs the whole reconstruction. Returns `None` if not a single scene could be spawned.
    pub fn reconstruct(&mut self, pairwise: &PairwiseGraph) -> Option<Reconstruction> {
        info!(
            "reconstructing a pairwise graph with {} views and {} motions",
            pairwise.len(),
            pairwise.motions().len()
        );
        let mut reconstruction = self.spawn_scenes(pairwise);
        if reconstruction.is_empty() {
            info!("failed to spawn a scene from any seed");
            return None;
        }
        self.sanity_check(pairwise, &reconstruction);

        self.expand_scenes(pairwise, &mut reconstruction);
        self.sanity_check(pairwise, &reconstruction);

        self.merge_scenes(pairwise, &mut reconstruction);
        self.sanity_check(pairwise, &reconstruction);

        for (key, scene) in reconstruction.scenes_mut() {
            if !self.refine_scene(pairwise, scene) {
                warn!("final refinement of scene {:?} failed", key);
            }
        }
        for (key, scene) in reconstruction.scenes() {
            info!("finished scene {:?} with {} views", key, scene.len());
        }
        Some(reconstruction)
    }

    /// Spawns a scene from every seed that the seed selection accepts.
    pub fn spawn_scenes(&mut self, pairwise: &PairwiseGraph) -> Reconstruction {
        let settings = self.settings;
        let mut reconstruction = Reconstruction::new(pairwise.len());
        let mut spawned = vec![];
        reconstruction.seeds = select_and_spawn(pairwise, &settings, |candidate| {
            match self.spawn_scene(pairwise, candidate) {
                Some(scene) => {
                    spawned.push(scene);
                    true
                }
                None => false,
            }
        });
        for scene in spawned {
            let key = reconstruction.add_scene(scene);
            debug!(
                "scene {:?} spawned with views {:?}",
                key,
                reconstruction
                    .scene(key)
                    .map(|scene| scene.pviews().map(|pview| pairwise.id(pview)).collect::<Vec<_>>())
            );
        }
        reconstruction
    }

    /// Logs views with too many inlier features behind a view and panics on broken bookkeeping.
    ///
    /// Does nothing unless `sanity_checks` is enabled.
    pub fn sanity_check(&self, pairwise: &PairwiseGraph, reconstruction: &Reconstruction) {
        if !self.settings.sanity_checks {
            return;
        }
        reconstruction.assert_consistent(pairwise);
        for (_, scene) in reconstruction.scenes() {
            self.sanity_check_scene(pairwise, scene, scene.pviews());
        }
    }

    /// Checks the inlier features of some views of a scene. Does nothing unless `sanity_checks`
    /// is enabled.
    pub fn sanity_check_scene(
        &self,
        pairwise: &PairwiseGraph,
        scene: &SceneWorkingGraph,
        pviews: impl IntoIterator<Item = usize>,
    ) {
        if !self.settings.sanity_checks {
            return;
        }
        let pixels = match ScenePixels::for_scene(pairwise, &self.database, scene) {
            Some(pixels) => pixels,
            None => {
                error!("sanity check could not load the features of a scene");
                return;
            }
        };
        for pview in pviews {
            inlier_triangulate_positive_depth(
                pairwise,
                &self.triangulator,
                scene,
                &pixels,
                pview,
                SANITY_FRACTION_BEHIND,
            );
        }
    }
}
