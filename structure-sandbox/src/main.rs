mod synthetic;

use anyhow::{bail, Context, Result};
use cv_structure::{
    CalibratedThreeView, ImageDatabase, LevenbergMarquardtAdjuster, LinearEigenTriangulator,
    MemoryDatabase, MetricReconstructor, PairwiseGraph, ReconstructionSettings, SceneOutput,
};
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};
use structopt::StructOpt;
use synthetic::SyntheticWorld;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "structure-sandbox",
    about = "A tool for testing incremental metric reconstruction"
)]
struct Opt {
    /// The pairwise graph in JSON, in the format of `cv_structure::PairwiseGraph`.
    #[structopt(short, long, required_unless = "synthetic")]
    pairwise: Option<PathBuf>,
    /// The image database in JSON, in the format of `cv_structure::MemoryDatabase`.
    #[structopt(short, long, required_unless = "synthetic")]
    database: Option<PathBuf>,
    /// The file where settings are specified.
    ///
    /// This is in the format of `cv_structure::ReconstructionSettings`.
    #[structopt(short, long, default_value = "structure-settings.json")]
    settings: PathBuf,
    /// Generate a random world with this many views instead of loading the inputs.
    #[structopt(long)]
    synthetic: Option<usize>,
    /// The number of points in the random world.
    #[structopt(long, default_value = "400")]
    synthetic_points: usize,
    /// Views of the random world this far apart are matched.
    #[structopt(long, default_value = "3")]
    synthetic_reach: usize,
    /// Standard deviation of the pixel noise in the random world.
    #[structopt(long, default_value = "0.5")]
    synthetic_noise: f64,
    /// Write the inputs of the random world into this directory.
    #[structopt(long)]
    save_inputs: Option<PathBuf>,
    /// The seed of every random number generator.
    #[structopt(long, default_value = "5")]
    seed: u64,
    /// The cosine distance below which a feature agrees with a three view model.
    #[structopt(long, default_value = "0.00001")]
    consensus_threshold: f64,
    /// Output every scene instead of only the largest one.
    #[structopt(long)]
    all_scenes: bool,
    /// Output JSON file to deposit the scenes
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Output PLY file to deposit the point cloud of the largest scene
    #[structopt(long)]
    ply: Option<PathBuf>,
    /// Draw the cameras in the PLY file with faces
    #[structopt(long)]
    camera_faces: bool,
}

fn main() -> Result<()> {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let settings: ReconstructionSettings = settings.unwrap_or_default();

    let (pairwise, database) = load_inputs(&opt)?;
    info!(
        "reconstructing {} views from a database of {} images",
        pairwise.len(),
        database.image_ids().len()
    );

    let solver = CalibratedThreeView::new()
        .threshold(opt.consensus_threshold)
        .seed(opt.seed);
    let mut reconstructor = MetricReconstructor::new(
        settings,
        database,
        solver,
        LevenbergMarquardtAdjuster::from_settings(&settings),
        LinearEigenTriangulator::new(),
    );
    let reconstruction = match reconstructor.reconstruct(&pairwise) {
        Some(reconstruction) => reconstruction,
        None => bail!("no scene could be spawned from the pairwise graph"),
    };
    let largest = reconstruction
        .largest_scene()
        .context("reconstruction has no scenes")?;

    if let Some(path) = &opt.output {
        let keys = if opt.all_scenes {
            reconstruction.keys()
        } else {
            vec![largest]
        };
        let scenes: Vec<SceneOutput> = keys
            .into_iter()
            .filter_map(|key| reconstruction.output(&pairwise, key))
            .collect();
        info!("writing {} scenes to {}", scenes.len(), path.display());
        write_json(path, &scenes)?;
    }

    if let Some(path) = &opt.ply {
        info!("exporting the largest scene to {}", path.display());
        let scene = reconstruction
            .scene(largest)
            .context("largest scene disappeared")?;
        let file = File::create(path)
            .with_context(|| format!("unable to create PLY file {}", path.display()))?;
        reconstructor
            .export_scene(&pairwise, scene, BufWriter::new(file), opt.camera_faces)
            .context("unable to write PLY file")?;
    }
    Ok(())
}

fn load_inputs(opt: &Opt) -> Result<(PairwiseGraph, MemoryDatabase)> {
    if let Some(views) = opt.synthetic {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(opt.seed);
        let world = SyntheticWorld {
            views,
            points: opt.synthetic_points,
            reach: opt.synthetic_reach,
            noise: opt.synthetic_noise,
        };
        let (pairwise, database) = world.generate(&mut rng);
        if let Some(dir) = &opt.save_inputs {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("unable to create {}", dir.display()))?;
            write_json(&dir.join("pairwise.json"), &pairwise)?;
            write_json(&dir.join("database.json"), &database)?;
        }
        return Ok((pairwise, database));
    }

    let (pairwise_path, database_path) = match (&opt.pairwise, &opt.database) {
        (Some(pairwise), Some(database)) => (pairwise, database),
        _ => bail!("both a pairwise graph and an image database are needed"),
    };
    let mut pairwise: PairwiseGraph = read_json(pairwise_path)?;
    pairwise.rebuild_lookup();
    let database: MemoryDatabase = read_json(database_path)?;
    info!("loaded the pairwise graph and the image database");
    Ok((pairwise, database))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("unable to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("unable to parse {}", path.display()))
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("unable to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .with_context(|| format!("unable to write {}", path.display()))
}
