mod common;

use std::collections::HashSet;

use common::{settings, World};
use cv_structure::{KnownParameters, SceneBundle};

#[test]
fn chain_of_views_becomes_one_scene() {
    let _ = pretty_env_logger::try_init();
    let world = World::new(6, 30, 8);
    let pairwise = world.pairwise(&world.chain(2, 0.5));
    let mut reconstructor = world.reconstructor(settings());

    let reconstruction = reconstructor.reconstruct(&pairwise).unwrap();
    reconstruction.assert_consistent(&pairwise);

    // Every other view is a neighbor of the first seed or connected to one.
    assert_eq!(reconstruction.seeds.seeds.len(), 1);
    assert_eq!(reconstruction.len(), 1);
    let key = reconstruction.largest_scene().unwrap();
    let scene = reconstruction.scene(key).unwrap();
    assert_eq!(scene.len(), 6);
    common::assert_similar(scene, &world.poses, 1e-5);

    let output = reconstruction.output(&pairwise, key).unwrap();
    let ids: HashSet<String> = output.views.iter().map(|view| view.id.clone()).collect();
    assert_eq!(ids, (0..6).map(World::id).collect());
}

#[test]
fn observations_belong_to_one_point() {
    let world = World::new(6, 30, 9);
    let pairwise = world.pairwise(&world.chain(2, 0.5));
    let mut reconstructor = world.reconstructor(settings());
    let reconstruction = reconstructor.reconstruct(&pairwise).unwrap();
    let key = reconstruction.largest_scene().unwrap();
    let scene = reconstruction.scene(key).unwrap();

    let bundle = SceneBundle::build(
        &pairwise,
        &reconstructor.database,
        &reconstructor.triangulator,
        scene,
        &KnownParameters::none(scene),
        reconstructor.settings.refine_maximum_reprojection_error,
    )
    .unwrap();
    // Every point is seen at most once by any view, so no view has two observations of it.
    for point in &bundle.structure.points {
        let unique: HashSet<usize> = point.views.iter().copied().collect();
        assert_eq!(unique.len(), point.views.len());
    }
    // Every real feature of the world ends up as exactly one point.
    assert_eq!(bundle.structure.points.len(), world.points.len());
}

#[test]
fn separate_graphs_spawn_separate_scenes() {
    let world = World::new(6, 30, 10);
    let edges = [
        (0, 1, 0.9),
        (0, 2, 0.9),
        (1, 2, 0.9),
        (3, 4, 0.5),
        (3, 5, 0.5),
        (4, 5, 0.5),
    ];
    let pairwise = world.pairwise(&edges);
    let mut reconstructor = world.reconstructor(settings());

    let reconstruction = reconstructor.reconstruct(&pairwise).unwrap();

    assert_eq!(reconstruction.seeds.seeds, vec![0, 3]);
    assert_eq!(reconstruction.len(), 2);
    // Seeds never connect to each other.
    for &a in &reconstruction.seeds.seeds {
        for &b in &reconstruction.seeds.seeds {
            assert!(pairwise.find_motion(a, b).is_none());
        }
    }
    for (_, scene) in reconstruction.scenes() {
        assert_eq!(scene.len(), 3);
        common::assert_similar(scene, &world.poses, 1e-5);
    }
}

#[test]
fn nothing_to_reconstruct_without_triangles() {
    let world = World::new(4, 30, 11);
    let pairwise = world.pairwise(&[(0, 1, 0.9), (1, 2, 0.9), (2, 3, 0.9)]);
    let mut reconstructor = world.reconstructor(settings());
    assert!(reconstructor.reconstruct(&pairwise).is_none());
}
