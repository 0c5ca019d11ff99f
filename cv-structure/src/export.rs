//! Writes a scene as an ASCII PLY point cloud.

use std::io::{self, Write};

use log::*;
use nalgebra::{Point3, Vector3};
use ply_rs::{
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};

use crate::{
    BundleAdjuster, ImageDatabase, KnownParameters, MetricReconstructor, PairwiseGraph, Pose,
    PoseExt, SceneBundle, SceneWorkingGraph, ThreeViewSolver, TriangulatorObservations,
    WorldToCamera, WorldToCameraExt,
};

const CAMERA_COLOR: [u8; 3] = [255, 0, 255];
const POINT_COLOR: [u8; 3] = [255, 255, 255];

/// A view drawn as a small pyramid pointing where the camera looks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportCamera {
    pub optical_center: Point3<f64>,
    pub up_direction: Vector3<f64>,
    pub forward_direction: Vector3<f64>,
    /// The depth of the pyramid in world units.
    pub size: f64,
}

impl ExportCamera {
    pub fn from_pose(world_to_view: WorldToCamera, size: f64) -> Self {
        let view_to_world = world_to_view.inverse();
        let rotation = view_to_world.rotation();
        Self {
            optical_center: view_to_world.transform_point(Point3::origin()),
            // Image y points down.
            up_direction: rotation * -Vector3::y(),
            forward_direction: rotation * Vector3::z(),
            size,
        }
    }
}

/// Writes points and cameras as vertices, and optionally the sides of the camera pyramids as faces.
pub fn export(
    mut writer: impl Write,
    points: &[Point3<f64>],
    cameras: &[ExportCamera],
    camera_faces: bool,
) -> io::Result<()> {
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;
    ply.header
        .comments
        .push("Exported from rust-cv/structure-sandbox".to_string());

    let mut point_element = ElementDef::new("vertex".to_string());
    for axis in ["x", "y", "z"] {
        let p = PropertyDef::new(axis.to_string(), PropertyType::Scalar(ScalarType::Double));
        point_element.properties.add(p);
    }
    for channel in ["red", "green", "blue"] {
        let p = PropertyDef::new(channel.to_string(), PropertyType::Scalar(ScalarType::UChar));
        point_element.properties.add(p);
    }
    ply.header.elements.add(point_element);

    if camera_faces {
        let mut face_element = ElementDef::new("face".to_string());
        let vertex_list = PropertyDef::new(
            "vertex_index".to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        );
        face_element.properties.add(vertex_list);
        ply.header.elements.add(face_element);
    }

    let mut faces: Vec<DefaultElement> = vec![];
    let mut vertices: Vec<DefaultElement> = vec![];

    let mut add_vertex = |p: Point3<f64>, [r, g, b]: [u8; 3]| -> usize {
        let pos = vertices.len();
        let mut point = DefaultElement::new();
        point.insert("x".to_string(), Property::Double(p.x));
        point.insert("y".to_string(), Property::Double(p.y));
        point.insert("z".to_string(), Property::Double(p.z));
        point.insert("red".to_string(), Property::UChar(r));
        point.insert("green".to_string(), Property::UChar(g));
        point.insert("blue".to_string(), Property::UChar(b));
        vertices.push(point);
        pos
    };

    let mut add_triangle = |a: usize, b: usize, c: usize| {
        let mut face = DefaultElement::new();
        face.insert(
            "vertex_index".to_string(),
            Property::ListInt(vec![a as i32, b as i32, c as i32]),
        );
        faces.push(face);
    };

    for camera in cameras {
        let right_direction = camera.forward_direction.cross(&camera.up_direction);
        let center = add_vertex(camera.optical_center, CAMERA_COLOR);
        let [up_right, up_left, down_left, down_right] =
            [(1, 1), (1, -1), (-1, -1), (-1, 1)].map(|(up, right)| {
                add_vertex(
                    camera.optical_center
                        + camera.size
                            * (camera.forward_direction
                                + 0.5 * up as f64 * camera.up_direction
                                + 0.5 * right as f64 * right_direction),
                    CAMERA_COLOR,
                )
            });
        if camera_faces {
            add_triangle(center, down_right, up_right);
            add_triangle(center, up_right, up_left);
            add_triangle(center, up_left, down_left);
            add_triangle(center, down_left, down_right);
        }
    }

    for &point in points {
        add_vertex(point, POINT_COLOR);
    }

    ply.payload.insert("vertex".to_string(), vertices);
    if camera_faces {
        ply.payload.insert("face".to_string(), faces);
    }

    Writer::new().write_ply(&mut writer, &mut ply)?;
    Ok(())
}

impl<D, S, B, T> MetricReconstructor<D, S, B, T>
where
    D: ImageDatabase,
    S: ThreeViewSolver,
    B: BundleAdjuster,
    T: TriangulatorObservations,
{
    /// Triangulates the inlier features of a scene the same way refinement does.
    ///
    /// Returns `None` if the image database is missing features of the scene.
    pub fn scene_points(
        &self,
        pairwise: &PairwiseGraph,
        scene: &SceneWorkingGraph,
    ) -> Option<Vec<Point3<f64>>> {
        let bundle = SceneBundle::build(
            pairwise,
            &self.database,
            &self.triangulator,
            scene,
            &KnownParameters::none(scene),
            self.settings.refine_maximum_reprojection_error,
        )?;
        Some(
            bundle
                .structure
                .points
                .into_iter()
                .map(|point| point.point)
                .collect(),
        )
    }

    /// Writes the triangulated features and the views of a scene as a PLY file.
    ///
    /// Cameras are sized relative to the distance between the first two views.
    pub fn export_scene(
        &self,
        pairwise: &PairwiseGraph,
        scene: &SceneWorkingGraph,
        writer: impl Write,
        camera_faces: bool,
    ) -> io::Result<()> {
        let points = self.scene_points(pairwise, scene).unwrap_or_else(|| {
            warn!("exporting only the cameras since features of the scene are missing");
            vec![]
        });
        let size = match scene.views.as_slice() {
            [a, b, ..] => 0.1 * a.world_to_view.relative_to(b.world_to_view).translation().norm(),
            _ => 0.1,
        };
        let cameras: Vec<ExportCamera> = scene
            .views
            .iter()
            .map(|view| ExportCamera::from_pose(view.world_to_view, size))
            .collect();
        info!(
            "exporting {} points and {} cameras",
            points.len(),
            cameras.len()
        );
        export(writer, &points, &cameras, camera_faces)
    }
}
