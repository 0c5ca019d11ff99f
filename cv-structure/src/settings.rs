#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// The settings for the reconstruction process.
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ReconstructionSettings {
    /// The number of highest scoring 3D motions of a view that make up its seed score
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_seed_motions"))]
    pub seed_motions: usize,
    /// Seeds scoring below this fraction of the best seed score are rejected
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_seed_minimum_relative_score")
    )]
    pub seed_minimum_relative_score: f64,
    /// The fraction of seed candidates that may fail to spawn before seed selection gives up
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_seed_maximum_failures_fraction")
    )]
    pub seed_maximum_failures_fraction: f64,
    /// The lower bound on the number of failed spawns permitted regardless of the fraction
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_seed_maximum_failures_minimum")
    )]
    pub seed_maximum_failures_minimum: usize,
    /// The minimum number of features visible in all three seed views needed to attempt a spawn
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_seed_minimum_common_features")
    )]
    pub seed_minimum_common_features: usize,
    /// The fraction of bad features after the spawn refinement that triggers a second refinement
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_spawn_fraction_bad_features_recover")
    )]
    pub spawn_fraction_bad_features_recover: f64,
    /// The maximum reprojection error in pixels a seed feature may have after the spawn refinement
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_spawn_maximum_reprojection_error")
    )]
    pub spawn_maximum_reprojection_error: f64,
    /// A new view is rejected if more than this fraction of its triplet features land behind a view
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_expand_maximum_fraction_behind")
    )]
    pub expand_maximum_fraction_behind: f64,
    /// If the local triplet is bundle adjusted before a new view is added to a scene
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_expand_bundle_adjust")
    )]
    pub expand_bundle_adjust: bool,
    /// Scenes are refined after every expansion until they contain this many views
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_refine_while_expanding_max_views")
    )]
    pub refine_while_expanding_max_views: usize,
    /// Maximum reprojection error in pixels for an observation to join an existing 3D feature
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_refine_maximum_reprojection_error")
    )]
    pub refine_maximum_reprojection_error: f64,
    /// The fraction of observations kept for the second bundle adjustment pass of a refinement
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_refine_keep_fraction")
    )]
    pub refine_keep_fraction: f64,
    /// A refinement with fewer 3D features than this is reported as a failure
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_refine_minimum_features")
    )]
    pub refine_minimum_features: usize,
    /// A merge is rolled back if more than this fraction of the checked features violate constraints
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_merge_fraction_bad_recover")
    )]
    pub merge_fraction_bad_recover: f64,
    /// The minimum depth a merged feature must have in front of every view that observes it
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_merge_minimum_depth")
    )]
    pub merge_minimum_depth: f64,
    /// The fraction of depth ratios in the window used to select the scale between two scenes
    #[cfg_attr(
        feature = "serde-serialize",
        serde(default = "default_merge_scale_window_fraction")
    )]
    pub merge_scale_window_fraction: f64,
    /// The maximum evaluations of the residual (times the number of parameters) in bundle adjustment
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_bundle_patience"))]
    pub bundle_patience: usize,
    /// The relative reduction of the cost that terminates bundle adjustment
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_bundle_ftol"))]
    pub bundle_ftol: f64,
    /// The relative change of the parameters that terminates bundle adjustment
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_bundle_xtol"))]
    pub bundle_xtol: f64,
    /// The orthogonality between residuals and the Jacobian that terminates bundle adjustment
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_bundle_gtol"))]
    pub bundle_gtol: f64,
    /// Run expensive consistency checks after every step and log failures.
    #[cfg_attr(feature = "serde-serialize", serde(default = "default_sanity_checks"))]
    pub sanity_checks: bool,
}

impl Default for ReconstructionSettings {
    fn default() -> Self {
        Self {
            seed_motions: default_seed_motions(),
            seed_minimum_relative_score: default_seed_minimum_relative_score(),
            seed_maximum_failures_fraction: default_seed_maximum_failures_fraction(),
            seed_maximum_failures_minimum: default_seed_maximum_failures_minimum(),
            seed_minimum_common_features: default_seed_minimum_common_features(),
            spawn_fraction_bad_features_recover: default_spawn_fraction_bad_features_recover(),
            spawn_maximum_reprojection_error: default_spawn_maximum_reprojection_error(),
            expand_maximum_fraction_behind: default_expand_maximum_fraction_behind(),
            expand_bundle_adjust: default_expand_bundle_adjust(),
            refine_while_expanding_max_views: default_refine_while_expanding_max_views(),
            refine_maximum_reprojection_error: default_refine_maximum_reprojection_error(),
            refine_keep_fraction: default_refine_keep_fraction(),
            refine_minimum_features: default_refine_minimum_features(),
            merge_fraction_bad_recover: default_merge_fraction_bad_recover(),
            merge_minimum_depth: default_merge_minimum_depth(),
            merge_scale_window_fraction: default_merge_scale_window_fraction(),
            bundle_patience: default_bundle_patience(),
            bundle_ftol: default_bundle_ftol(),
            bundle_xtol: default_bundle_xtol(),
            bundle_gtol: default_bundle_gtol(),
            sanity_checks: default_sanity_checks(),
        }
    }
}

impl ReconstructionSettings {
    /// The number of failed spawns after which seed selection stops.
    pub fn seed_maximum_failures(&self, candidates: usize) -> usize {
        let relative = (self.seed_maximum_failures_fraction * candidates as f64).round() as usize;
        relative.max(self.seed_maximum_failures_minimum)
    }
}

fn default_seed_motions() -> usize {
    3
}

fn default_seed_minimum_relative_score() -> f64 {
    0.2
}

fn default_seed_maximum_failures_fraction() -> f64 {
    0.1
}

fn default_seed_maximum_failures_minimum() -> usize {
    10
}

fn default_seed_minimum_common_features() -> usize {
    6
}

fn default_spawn_fraction_bad_features_recover() -> f64 {
    0.05
}

fn default_spawn_maximum_reprojection_error() -> f64 {
    5.0
}

fn default_expand_maximum_fraction_behind() -> f64 {
    0.15
}

fn default_expand_bundle_adjust() -> bool {
    true
}

fn default_refine_while_expanding_max_views() -> usize {
    10
}

fn default_refine_maximum_reprojection_error() -> f64 {
    5.0
}

fn default_refine_keep_fraction() -> f64 {
    0.95
}

fn default_refine_minimum_features() -> usize {
    6
}

fn default_merge_fraction_bad_recover() -> f64 {
    0.2
}

fn default_merge_minimum_depth() -> f64 {
    0.0
}

fn default_merge_scale_window_fraction() -> f64 {
    0.1
}

fn default_bundle_patience() -> usize {
    200
}

fn default_bundle_ftol() -> f64 {
    1e-10
}

fn default_bundle_xtol() -> f64 {
    1e-10
}

fn default_bundle_gtol() -> f64 {
    1e-10
}

fn default_sanity_checks() -> bool {
    false
}
