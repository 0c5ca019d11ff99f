//! Gathers the features that three views of the pairwise graph have in common, so they can be
//! handed to a [`ThreeViewSolver`](crate::ThreeViewSolver).

use log::*;
use nalgebra::Point2;

use crate::{
    centered_features, AssociatedTriple, CameraPrior, ImageDatabase, InlierInfo, PairwiseGraph,
    TripletProblem,
};

/// Look up tables that walk features around the triangle formed by three views.
///
/// The views are called `A`, `B`, and `C`, in the order the triplet was given.
#[derive(Debug, Clone, PartialEq)]
pub struct TripletTables {
    pub a_to_b: Vec<Option<usize>>,
    pub a_to_c: Vec<Option<usize>>,
    pub b_to_c: Vec<Option<usize>>,
}

impl TripletTables {
    /// Returns `None` if any two of the views are not connected by a motion.
    pub fn new(pairwise: &PairwiseGraph, [a, b, c]: [usize; 3]) -> Option<Self> {
        let ab = pairwise.find_motion(a, b)?;
        let ac = pairwise.find_motion(a, c)?;
        let bc = pairwise.find_motion(b, c)?;
        Some(Self {
            a_to_b: pairwise.table_view_to_other(a, ab),
            a_to_c: pairwise.table_view_to_other(a, ac),
            b_to_c: pairwise.table_view_to_other(b, bc),
        })
    }

    /// Finds the features that go all the way around the triangle and come back to where they
    /// started, returning their indices in `A`, `B`, and `C`.
    pub fn fully_connected(&self) -> Vec<[usize; 3]> {
        self.a_to_b
            .iter()
            .enumerate()
            .filter_map(|(fa, &fb)| {
                let fb = fb?;
                let fc = self.b_to_c[fb]?;
                (self.a_to_c[fa] == Some(fc)).then(|| [fa, fb, fc])
            })
            .collect()
    }
}

/// The features shared by a triplet of views along with their centered pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct TripletMatches {
    /// Pairwise indices of the views.
    pub views: [usize; 3],
    /// Feature indices in each view, one entry per common feature.
    pub features: Vec<[usize; 3]>,
    pub priors: [CameraPrior; 3],
    /// The pixels of `features`, centered on the principal point.
    pub triples: Vec<AssociatedTriple>,
}

impl TripletMatches {
    /// Finds the fully connected features of the triplet and loads their pixels.
    ///
    /// Returns `None` if the views are not all connected to each other or the database does not
    /// know about one of them.
    pub fn gather<D>(pairwise: &PairwiseGraph, database: &D, views: [usize; 3]) -> Option<Self>
    where
        D: ImageDatabase + ?Sized,
    {
        let features = TripletTables::new(pairwise, views)?.fully_connected();
        let ids = views.map(|view| pairwise.id(view));

        let mut priors = Vec::with_capacity(3);
        let mut pixels: Vec<Vec<Point2<f64>>> = Vec::with_capacity(3);
        for (view, id) in views.into_iter().zip(ids) {
            let (prior, centered) = centered_features(database, id).or_else(|| {
                warn!("image database has no features or camera for view '{}'", id);
                None
            })?;
            let expected = pairwise.view(view).total_observations;
            if centered.len() != expected {
                warn!(
                    "image database has {} features for view '{}' but the pairwise graph has {}",
                    centered.len(),
                    id,
                    expected
                );
                return None;
            }
            priors.push(prior);
            pixels.push(centered);
        }
        let triples = features
            .iter()
            .map(|&[a, b, c]| AssociatedTriple(pixels[0][a], pixels[1][b], pixels[2][c]))
            .collect();
        debug!(
            "triplet {:?} has {} fully connected features",
            ids,
            features.len()
        );

        Some(Self {
            views,
            features,
            priors: [priors[0], priors[1], priors[2]],
            triples,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// The problem a [`ThreeViewSolver`](crate::ThreeViewSolver) solves for these matches.
    pub fn problem<'a>(&self, pairwise: &'a PairwiseGraph) -> TripletProblem<'a> {
        TripletProblem {
            views: self.views.map(|view| pairwise.id(view)),
            priors: self.priors,
            triples: self.triples.clone(),
        }
    }

    /// Records which features were inliers, from the point of view of one of the three views.
    ///
    /// The owner comes first, followed by the remaining views. The anchor `A` stays next to the
    /// owner so that each view's record starts with the pair it is most strongly tied to.
    pub fn inlier_info(&self, owner: usize, inliers: &[usize]) -> InlierInfo {
        let order = match owner {
            0 => [0, 1, 2],
            1 => [1, 0, 2],
            2 => [2, 1, 0],
            _ => panic!("a triplet has no view {}", owner),
        };
        let mut info = InlierInfo::new(order.iter().map(|&i| self.views[i]).collect());
        for &inlier in inliers {
            let features = self.features[inlier];
            info.push(&order.map(|i| features[i]));
        }
        info.score_geometric = inliers.len() as f64;
        info
    }
}
