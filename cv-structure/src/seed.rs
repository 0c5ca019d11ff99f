//! Chooses the views that new scenes are spawned from.

use float_ord::FloatOrd;
use log::*;

use crate::{PairwiseGraph, ReconstructionSettings};

/// A view considered as the seed of a scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedCandidate {
    /// Pairwise index of the view.
    pub view: usize,
    /// The sum of the 3D scores of `motions`.
    pub score: f64,
    /// The highest scoring 3D motions of the view, best first.
    pub motions: Vec<usize>,
}

impl SeedCandidate {
    /// Scores a view by its best `max_motions` 3D motions.
    pub fn score(pairwise: &PairwiseGraph, view: usize, max_motions: usize) -> Self {
        let mut motions: Vec<(f64, usize)> = pairwise
            .connections(view)
            .filter(|motion| motion.is_3d)
            .map(|motion| (motion.score_3d, motion.index))
            .collect();
        motions.sort_by_key(|&(score, _)| std::cmp::Reverse(FloatOrd(score)));
        motions.truncate(max_motions);
        Self {
            view,
            score: motions.iter().map(|&(score, _)| score).sum(),
            motions: motions.into_iter().map(|(_, motion)| motion).collect(),
        }
    }
}

/// Scores every view of the graph, best first.
pub fn score_seeds(pairwise: &PairwiseGraph, max_motions: usize) -> Vec<SeedCandidate> {
    let mut candidates: Vec<SeedCandidate> = (0..pairwise.len())
        .map(|view| SeedCandidate::score(pairwise, view, max_motions))
        .collect();
    // Stable, so views with equal scores keep the order of the graph.
    candidates.sort_by_key(|candidate| std::cmp::Reverse(FloatOrd(candidate.score)));
    candidates
}

/// What happened to every seed candidate.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SeedReport {
    pub candidates: usize,
    /// Views that spawned a scene, in the order they were spawned.
    pub seeds: Vec<usize>,
    /// Neighbors of an accepted seed, or views without any 3D motion.
    pub rejected_neighbor: usize,
    /// Scored below the relative threshold.
    pub rejected_score: usize,
    /// Connected to a neighbor of an accepted seed.
    pub rejected_close: usize,
    /// Spawning a scene failed.
    pub rejected_spawn: usize,
}

/// Goes through the candidates from best to worst and tries to spawn a scene from each one
/// that is not suppressed by a previously accepted seed.
///
/// `spawn` returns true if it created a scene. Accepted seeds suppress their direct neighbors,
/// so no two seeds are ever connected by a motion. Selection stops early once too many spawns
/// have failed.
pub fn select_and_spawn(
    pairwise: &PairwiseGraph,
    settings: &ReconstructionSettings,
    mut spawn: impl FnMut(&SeedCandidate) -> bool,
) -> SeedReport {
    let candidates = score_seeds(pairwise, settings.seed_motions);
    let mut report = SeedReport {
        candidates: candidates.len(),
        ..Default::default()
    };
    let best = candidates.first().map(|c| c.score).unwrap_or(0.0);
    let threshold = best * settings.seed_minimum_relative_score;
    let max_failures = settings.seed_maximum_failures(candidates.len());
    let mut neighbor = vec![false; pairwise.len()];

    for candidate in &candidates {
        if report.rejected_spawn >= max_failures {
            info!(
                "stopping seed selection after {} failed spawns",
                report.rejected_spawn
            );
            break;
        }
        let id = pairwise.id(candidate.view);
        if neighbor[candidate.view] || candidate.motions.is_empty() {
            debug!("seed '{}' rejected as a neighbor", id);
            report.rejected_neighbor += 1;
            continue;
        }
        if candidate.score < threshold {
            debug!(
                "seed '{}' rejected with score {} below {}",
                id, candidate.score, threshold
            );
            report.rejected_score += 1;
            continue;
        }
        if pairwise
            .connections(candidate.view)
            .any(|motion| neighbor[motion.other(candidate.view)])
        {
            debug!("seed '{}' rejected as too close to another seed", id);
            report.rejected_close += 1;
            continue;
        }
        if !spawn(candidate) {
            info!("failed to spawn a scene from seed '{}'", id);
            report.rejected_spawn += 1;
            continue;
        }
        info!(
            "spawned a scene from seed '{}' with score {}",
            id, candidate.score
        );
        for motion in pairwise.connections(candidate.view) {
            neighbor[motion.other(candidate.view)] = true;
        }
        report.seeds.push(candidate.view);
    }

    info!(
        "seed summary: candidates {}, spawned {}, rejected neighbor {} score {} close {} spawn {}",
        report.candidates,
        report.seeds.len(),
        report.rejected_neighbor,
        report.rejected_score,
        report.rejected_close,
        report.rejected_spawn
    );
    report
}
