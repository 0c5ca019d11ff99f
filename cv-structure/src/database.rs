use std::collections::BTreeMap;

use nalgebra::Point2;

use crate::{AssociatedIndex, CameraPrior};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Everything the reconstruction needs to know about the images.
///
/// Pixels are reported in image coordinates. They are centered on the principal point of the
/// camera prior before they are used. Views are identified by the same ids as the pairwise graph.
pub trait ImageDatabase {
    /// The ids of every image in the database.
    fn image_ids(&self) -> Vec<String>;

    /// Images that share features with `id`, limited to those `filter` accepts.
    fn find_similar(&self, id: &str, filter: &dyn Fn(&str) -> bool) -> Vec<String>;

    /// The pixel coordinate of every feature in the image.
    fn pixel_features(&self, id: &str) -> Option<Vec<Point2<f64>>>;

    /// Features in `a` that were associated with features in `b`, as `src` in `a` and `dst` in `b`.
    fn associated_features(&self, a: &str, b: &str) -> Option<Vec<AssociatedIndex>>;

    /// The calibration of the camera that took the image.
    fn camera_prior(&self, id: &str) -> Option<CameraPrior>;

    /// The `(width, height)` of the image.
    fn image_shape(&self, id: &str) -> Option<(u32, u32)>;

    /// The index of the physical camera that took the image. Views with the same camera share
    /// intrinsics in a scene.
    fn view_to_camera(&self, id: &str) -> Option<usize>;
}

/// Looks up the camera prior of an image along with its features centered on the principal point.
pub fn centered_features<D>(database: &D, id: &str) -> Option<(CameraPrior, Vec<Point2<f64>>)>
where
    D: ImageDatabase + ?Sized,
{
    let prior = database.camera_prior(id)?;
    let pixels = database.pixel_features(id)?;
    Some((
        prior,
        pixels.into_iter().map(|pixel| prior.center(pixel)).collect(),
    ))
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct MemoryImage {
    pub camera: usize,
    pub features: Vec<Point2<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Association {
    pub a: String,
    pub b: String,
    pub pairs: Vec<AssociatedIndex>,
}

/// An [`ImageDatabase`] that holds everything in memory.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct MemoryDatabase {
    pub images: BTreeMap<String, MemoryImage>,
    pub cameras: Vec<CameraPrior>,
    pub associations: Vec<Association>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a camera and returns its index.
    pub fn add_camera(&mut self, prior: CameraPrior) -> usize {
        self.cameras.push(prior);
        self.cameras.len() - 1
    }

    pub fn add_image(&mut self, id: impl Into<String>, camera: usize, features: Vec<Point2<f64>>) {
        assert!(
            camera < self.cameras.len(),
            "image added with camera {} but only {} cameras exist",
            camera,
            self.cameras.len()
        );
        self.images
            .insert(id.into(), MemoryImage { camera, features });
    }

    pub fn add_association(
        &mut self,
        a: impl Into<String>,
        b: impl Into<String>,
        pairs: Vec<AssociatedIndex>,
    ) {
        self.associations.push(Association {
            a: a.into(),
            b: b.into(),
            pairs,
        });
    }
}

impl ImageDatabase for MemoryDatabase {
    fn image_ids(&self) -> Vec<String> {
        self.images.keys().cloned().collect()
    }

    fn find_similar(&self, id: &str, filter: &dyn Fn(&str) -> bool) -> Vec<String> {
        self.associations
            .iter()
            .filter_map(|association| {
                if association.a == id {
                    Some(association.b.as_str())
                } else if association.b == id {
                    Some(association.a.as_str())
                } else {
                    None
                }
            })
            .filter(|other| filter(other))
            .map(str::to_owned)
            .collect()
    }

    fn pixel_features(&self, id: &str) -> Option<Vec<Point2<f64>>> {
        self.images.get(id).map(|image| image.features.clone())
    }

    fn associated_features(&self, a: &str, b: &str) -> Option<Vec<AssociatedIndex>> {
        self.associations.iter().find_map(|association| {
            if association.a == a && association.b == b {
                Some(association.pairs.clone())
            } else if association.a == b && association.b == a {
                Some(
                    association
                        .pairs
                        .iter()
                        .map(|pair| AssociatedIndex::new(pair.dst, pair.src))
                        .collect(),
                )
            } else {
                None
            }
        })
    }

    fn camera_prior(&self, id: &str) -> Option<CameraPrior> {
        let image = self.images.get(id)?;
        self.cameras.get(image.camera).copied()
    }

    fn image_shape(&self, id: &str) -> Option<(u32, u32)> {
        self.camera_prior(id).map(|prior| (prior.width, prior.height))
    }

    fn view_to_camera(&self, id: &str) -> Option<usize> {
        self.images.get(id).map(|image| image.camera)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> MemoryDatabase {
        let mut db = MemoryDatabase::new();
        let camera = db.add_camera(CameraPrior::from_shape(300.0, 320, 240));
        db.add_image("a", camera, vec![Point2::new(1.0, 2.0); 3]);
        db.add_image("b", camera, vec![Point2::new(3.0, 4.0); 2]);
        db.add_image("c", camera, vec![]);
        db.add_association("a", "b", vec![AssociatedIndex::new(2, 1)]);
        db.add_association("c", "a", vec![]);
        db
    }

    #[test]
    fn associations_are_oriented() {
        let db = database();
        assert_eq!(
            db.associated_features("b", "a"),
            Some(vec![AssociatedIndex::new(1, 2)])
        );
        assert_eq!(db.associated_features("b", "c"), None);
    }

    #[test]
    fn similar_images_are_filtered() {
        let db = database();
        let mut similar = db.find_similar("a", &|_| true);
        similar.sort();
        assert_eq!(similar, vec!["b".to_owned(), "c".to_owned()]);
        assert_eq!(db.find_similar("a", &|id| id != "b"), vec!["c".to_owned()]);
    }

    #[test]
    fn shape_comes_from_the_camera() {
        let db = database();
        assert_eq!(db.image_shape("b"), Some((320, 240)));
        assert_eq!(db.view_to_camera("c"), Some(0));
        assert_eq!(db.image_ids().len(), 3);
    }
}
