//! Incremental metric reconstruction of scenes from a pairwise image graph.
//!
//! The input is a [`PairwiseGraph`] describing which images were matched to each other and how
//! well, along with an [`ImageDatabase`] that holds the pixel features of every image. The
//! [`MetricReconstructor`] then:
//!
//! 1. selects well connected seed views and spawns a three view scene from each of them,
//! 2. expands every scene one view at a time, always picking the best connected open view,
//! 3. merges scenes that share views into one another.
//!
//! The geometry is reached through three traits so that strategies can be swapped:
//! [`ThreeViewSolver`] estimates triplets, [`BundleAdjuster`] refines scenes, and the
//! [`TriangulatorObservations`] of `cv-core` creates points. [`MetricReconstructor::calibrated`]
//! picks the defaults. Poses and triangulation come from `cv-core` and `cv-geom`, while the
//! default solver estimates relative poses with `eight-point` and resects with `lambda-twist`.

mod bundle;
mod calibrated;
mod camera;
mod checks;
mod database;
mod expand;
mod export;
mod levenberg;
mod merge;
mod overlap;
mod pairwise;
mod pose;
mod reconstruction;
mod refine;
mod scale;
mod scene;
mod seed;
mod settings;
mod solver;
mod spawn;
mod three_view;
mod triangulation;

pub use bundle::*;
pub use calibrated::*;
pub use camera::*;
pub use checks::*;
pub use database::*;
pub use expand::*;
pub use export::*;
pub use levenberg::*;
pub use merge::*;
pub use overlap::*;
pub use pairwise::*;
pub use pose::*;
pub use reconstruction::*;
pub use refine::*;
pub use scale::*;
pub use scene::*;
pub use seed::*;
pub use settings::*;
pub use solver::*;
pub use spawn::*;
pub use three_view::*;
pub use triangulation::*;

pub use cv_core::{
    self, CameraToCamera, CameraToWorld, FeatureMatch, FeatureWorldMatch, Pose, Projective,
    TriangulatorObservations, WorldPoint, WorldToCamera, WorldToWorld,
};
pub use cv_geom::triangulation::LinearEigenTriangulator;
pub use nalgebra;
