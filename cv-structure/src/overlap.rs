//! Keeps track of how many views every pair of scenes has in common.

use std::collections::{BTreeMap, BTreeSet};

use crate::SceneKey;

/// Orders a pair of scenes so the lower key owns the count.
fn pair(a: SceneKey, b: SceneKey) -> (SceneKey, SceneKey) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A sparse table of the number of views shared by each pair of enabled scenes.
///
/// Disabled scenes are left out of every count. A scene is disabled while it is being merged and
/// for good once it has been merged away.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonViewCounts {
    counts: BTreeMap<(SceneKey, SceneKey), usize>,
    disabled: BTreeSet<SceneKey>,
}

impl CommonViewCounts {
    /// Counts the common views of every pair of scenes from the scenes that contain each view.
    pub fn from_viewed_by(viewed_by: &[Vec<SceneKey>]) -> Self {
        let mut counts = BTreeMap::new();
        for keys in viewed_by {
            for (ix, &a) in keys.iter().enumerate() {
                for &b in &keys[ix + 1..] {
                    *counts.entry(pair(a, b)).or_insert(0) += 1;
                }
            }
        }
        Self {
            counts,
            disabled: BTreeSet::new(),
        }
    }

    /// The number of views two enabled scenes have in common.
    pub fn count(&self, a: SceneKey, b: SceneKey) -> usize {
        self.counts.get(&pair(a, b)).copied().unwrap_or(0)
    }

    pub fn is_enabled(&self, key: SceneKey) -> bool {
        !self.disabled.contains(&key)
    }

    /// Removes a scene from the counts. `pviews` are the views of the scene.
    ///
    /// Panics if the scene is already disabled.
    pub fn disable(
        &mut self,
        key: SceneKey,
        pviews: impl IntoIterator<Item = usize>,
        viewed_by: &[Vec<SceneKey>],
    ) {
        assert!(
            self.disabled.insert(key),
            "scene {:?} was disabled twice",
            key
        );
        for pview in pviews {
            for &other in &viewed_by[pview] {
                if other == key || !self.is_enabled(other) {
                    continue;
                }
                let pair = pair(key, other);
                match self.counts.get_mut(&pair) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        self.counts.remove(&pair);
                    }
                    None => panic!(
                        "scenes {:?} and {:?} share view {} but have no common count",
                        key, other, pview
                    ),
                }
            }
        }
    }

    /// Adds a disabled scene back into the counts. `pviews` are the current views of the scene.
    ///
    /// Panics if the scene is already enabled.
    pub fn enable(
        &mut self,
        key: SceneKey,
        pviews: impl IntoIterator<Item = usize>,
        viewed_by: &[Vec<SceneKey>],
    ) {
        assert!(
            self.disabled.remove(&key),
            "scene {:?} was enabled while it was already enabled",
            key
        );
        for pview in pviews {
            for &other in &viewed_by[pview] {
                if other == key || !self.is_enabled(other) {
                    continue;
                }
                *self.counts.entry(pair(key, other)).or_insert(0) += 1;
            }
        }
    }

    /// Finds the pair of scenes with the most views in common that is not blocked.
    ///
    /// The first pair wins ties. Returns `None` when no pair shares a view.
    pub fn select(
        &self,
        mut blocked: impl FnMut(SceneKey, SceneKey) -> bool,
    ) -> Option<(SceneKey, SceneKey)> {
        let mut best: Option<((SceneKey, SceneKey), usize)> = None;
        for (&(a, b), &count) in &self.counts {
            if !self.is_enabled(a) || !self.is_enabled(b) {
                continue;
            }
            if count <= best.map(|(_, best)| best).unwrap_or(0) {
                continue;
            }
            if blocked(a, b) {
                continue;
            }
            best = Some(((a, b), count));
        }
        best.map(|(pair, _)| pair)
    }

    /// Recomputes the counts of the enabled scenes from scratch and panics if they differ.
    pub fn assert_consistent(&self, viewed_by: &[Vec<SceneKey>]) {
        let enabled: Vec<Vec<SceneKey>> = viewed_by
            .iter()
            .map(|keys| {
                keys.iter()
                    .copied()
                    .filter(|&key| self.is_enabled(key))
                    .collect()
            })
            .collect();
        let expected = Self::from_viewed_by(&enabled).counts;
        let actual: BTreeMap<_, _> = self
            .counts
            .iter()
            .filter(|&(&(a, b), _)| self.is_enabled(a) && self.is_enabled(b))
            .map(|(&pair, &count)| (pair, count))
            .collect();
        assert_eq!(
            actual, expected,
            "common view counts drifted from the views of the scenes"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FailedMerge {
    scenes: (SceneKey, SceneKey),
    lens: (usize, usize),
}

/// Pairs of scenes that failed to merge. A pair stays blocked until either scene changes size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailedMerges {
    failed: Vec<FailedMerge>,
}

impl FailedMerges {
    /// Blocks a pair of scenes with their current number of views.
    pub fn mark(&mut self, a: SceneKey, a_len: usize, b: SceneKey, b_len: usize) {
        let (scenes, lens) = if a < b {
            ((a, b), (a_len, b_len))
        } else {
            ((b, a), (b_len, a_len))
        };
        self.failed.retain(|failed| failed.scenes != scenes);
        self.failed.push(FailedMerge { scenes, lens });
    }

    /// Returns true if the pair failed before and neither scene has changed size since. A block
    /// that no longer applies is forgotten.
    pub fn is_blocked(&mut self, a: SceneKey, a_len: usize, b: SceneKey, b_len: usize) -> bool {
        let (scenes, lens) = if a < b {
            ((a, b), (a_len, b_len))
        } else {
            ((b, a), (b_len, a_len))
        };
        match self.failed.iter().position(|failed| failed.scenes == scenes) {
            Some(position) if self.failed[position].lens == lens => true,
            Some(position) => {
                self.failed.swap_remove(position);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::DenseSlotMap;

    fn keys(n: usize) -> Vec<SceneKey> {
        let mut map = DenseSlotMap::<SceneKey, ()>::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn counts_follow_enabled_scenes() {
        let k = keys(3);
        // View 0 is in every scene, view 1 in the first two, view 2 in the last two.
        let viewed_by = vec![vec![k[0], k[1], k[2]], vec![k[0], k[1]], vec![k[1], k[2]]];
        let mut counts = CommonViewCounts::from_viewed_by(&viewed_by);
        assert_eq!(counts.count(k[0], k[1]), 2);
        assert_eq!(counts.count(k[2], k[1]), 2);
        assert_eq!(counts.count(k[0], k[2]), 1);
        assert_eq!(counts.select(|_, _| false), Some((k[0], k[1])));
        assert_eq!(counts.select(|a, _| a == k[0]), Some((k[1], k[2])));

        counts.disable(k[1], [0, 1, 2], &viewed_by);
        counts.assert_consistent(&viewed_by);
        assert_eq!(counts.count(k[0], k[1]), 0);
        assert_eq!(counts.select(|_, _| false), Some((k[0], k[2])));

        counts.enable(k[1], [0, 1, 2], &viewed_by);
        counts.assert_consistent(&viewed_by);
        assert_eq!(counts, CommonViewCounts::from_viewed_by(&viewed_by));
    }

    #[test]
    fn nothing_to_select_without_overlap() {
        let k = keys(2);
        let viewed_by = vec![vec![k[0]], vec![k[1]]];
        let counts = CommonViewCounts::from_viewed_by(&viewed_by);
        assert_eq!(counts.select(|_, _| false), None);
    }

    #[test]
    fn failed_merges_unblock_when_scenes_change() {
        let k = keys(2);
        let mut failed = FailedMerges::default();
        failed.mark(k[1], 4, k[0], 7);
        assert!(failed.is_blocked(k[0], 7, k[1], 4));
        assert!(failed.is_blocked(k[1], 4, k[0], 7));
        assert!(!failed.is_blocked(k[0], 8, k[1], 4));
        // The block was forgotten once it stopped applying.
        assert!(!failed.is_blocked(k[0], 7, k[1], 4));
    }
}
