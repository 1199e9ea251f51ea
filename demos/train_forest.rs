/// Train a hand classification forest from labelled depth frames.
///
/// Expects a data directory with numbered frame pairs: `depth_0001.bin`
/// (two u32 LE dimensions, then width*height i16 LE depth values) and
/// `labels_0001.png` (8 bit, any non-zero pixel counts as hand).

extern crate handforest;
extern crate clap;
#[macro_use]
extern crate log;
extern crate env_logger;
extern crate byteorder;
extern crate image;
#[macro_use]
extern crate error_chain;

use byteorder::{LittleEndian, ReadBytesExt};
use clap::{App, Arg};
use handforest::forest::builder::{ForestBuilder, TrainingData};
use handforest::forest::eval::ForestEvaluator;
use handforest::forest::io::save_forest;
use handforest::forest::settings::{TrainingConfig, TrainingSettings, WeakLearnerPool};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::process::exit;
use std::str::FromStr;

error_chain! {
    foreign_links {
        IO(std::io::Error);
        Image(image::ImageError);
        Train(handforest::forest::builder::TrainError);
        Settings(handforest::forest::settings::SettingsError);
        ForestIo(handforest::forest::io::ForestIoError);
    }
}

macro_rules! try_or_exit {
    ($x: expr) => (
        match $x {
            Ok(x) => x,
            Err(r) => {warn!("Error: {}", r); exit(-1)}
        }
        )
}

macro_rules! TREES_DEFAULT { () => (10u32) }
macro_rules! HEIGHT_DEFAULT { () => (25u32) }
macro_rules! SAMPLES_DEFAULT { () => (2000u32) }
macro_rules! MAX_PIX_DEFAULT { () => (1000u32) }
macro_rules! GAIN_DEFAULT { () => (0.01f32) }

pub fn main() {
    if let Err(e) = main_() {
        eprintln!("Error: {}", e);
        exit(-1);
    }
}

fn load_depth_frame(path: &Path) -> Result<(usize, usize, Vec<i16>)> {
    let mut reader = BufReader::new(File::open(path)?);
    let width = reader.read_u32::<LittleEndian>()? as usize;
    let height = reader.read_u32::<LittleEndian>()? as usize;
    let mut depth = vec![0i16; width * height];
    for d in depth.iter_mut() {
        *d = reader.read_i16::<LittleEndian>()?;
    }
    Ok((width, height, depth))
}

fn load_label_frame(path: &Path) -> Result<Vec<u8>> {
    let img = image::open(path)?.to_luma();
    Ok(img.pixels().map(|p| if p.data[0] != 0 { 1u8 } else { 0u8 }).collect())
}

fn load_training_data(dir: &str) -> Result<TrainingData> {
    let mut width = 0;
    let mut height = 0;
    let mut depth = Vec::new();
    let mut labels = Vec::new();
    let mut index = 1;
    loop {
        let depth_path = format!("{}/depth_{:04}.bin", dir, index);
        let label_path = format!("{}/labels_{:04}.png", dir, index);
        if !Path::new(&depth_path).exists() {
            break;
        }
        let (w, h, frame) = load_depth_frame(Path::new(&depth_path))?;
        if index == 1 {
            width = w;
            height = h;
        } else if w != width || h != height {
            bail!("Frame {} has size {}x{}, expected {}x{}", index, w, h, width, height);
        }
        let frame_labels = load_label_frame(Path::new(&label_path))?;
        if frame_labels.len() != frame.len() {
            bail!("Label frame {} does not match its depth frame", index);
        }
        depth.extend_from_slice(&frame);
        labels.extend_from_slice(&frame_labels);
        index += 1;
    }
    if depth.is_empty() {
        bail!("No frame pairs found in {}", dir);
    }
    info!("loaded {} frames of {}x{}", index - 1, width, height);
    Ok(TrainingData::new(width, height, depth, labels)?)
}

pub fn main_() -> Result<()> {
    env_logger::init();
    let args = App::new("Hand forest trainer")
        .arg(Arg::with_name("datadir")
            .short("d")
            .long("datadir")
            .required(true)
            .takes_value(true)
            .help("Directory with depth_NNNN.bin / labels_NNNN.png pairs"))
        .arg(Arg::with_name("out_filename")
            .short("o")
            .long("out")
            .required(true)
            .takes_value(true)
            .help("Filename for the trained forest"))
        .arg(Arg::with_name("settings")
            .short("s")
            .long("settings")
            .takes_value(true)
            .help("Training settings as JSON; overrides all other training flags"))
        .arg(Arg::with_name("trees")
            .long("trees")
            .takes_value(true)
            .help(concat!("Number of trees - Default ", TREES_DEFAULT!())))
        .arg(Arg::with_name("height")
            .long("height")
            .takes_value(true)
            .help(concat!("Max height a tree may be grown - Default ", HEIGHT_DEFAULT!())))
        .arg(Arg::with_name("samples")
            .long("samples")
            .takes_value(true)
            .help(concat!("Weak learner candidates per node - Default ", SAMPLES_DEFAULT!())))
        .arg(Arg::with_name("maxpix")
            .long("maxpix")
            .takes_value(true)
            .help(concat!("Max pixels per image and label - Default ", MAX_PIX_DEFAULT!())))
        .arg(Arg::with_name("gain")
            .long("gain")
            .takes_value(true)
            .help(concat!("Early-stop information gain - Default ", GAIN_DEFAULT!())))
        .arg(Arg::with_name("seed")
            .long("seed")
            .takes_value(true)
            .help("Base RNG seed - Default 0"))
        .arg(Arg::with_name("sequential")
            .long("sequential")
            .help("Train trees one after another instead of in parallel"))
        .get_matches();

    let datadir = args.value_of("datadir").ok_or("Data dir parameter is invalid")?;
    let filename = args.value_of("out_filename").ok_or("No valid output filename")?;

    let config = match args.value_of("settings") {
        Some(path) => TrainingConfig::from_json_file(path)?,
        None => {
            let trees = args.value_of("trees")
                .map(|x| try_or_exit!(u32::from_str(x)))
                .unwrap_or(TREES_DEFAULT!());
            let height = args.value_of("height")
                .map(|x| try_or_exit!(u32::from_str(x)))
                .unwrap_or(HEIGHT_DEFAULT!());
            let samples = args.value_of("samples")
                .map(|x| try_or_exit!(u32::from_str(x)))
                .unwrap_or(SAMPLES_DEFAULT!());
            let maxpix = args.value_of("maxpix")
                .map(|x| try_or_exit!(u32::from_str(x)))
                .unwrap_or(MAX_PIX_DEFAULT!());
            let gain = args.value_of("gain")
                .map(|x| try_or_exit!(f32::from_str(x)))
                .unwrap_or(GAIN_DEFAULT!());
            let seed = args.value_of("seed")
                .map(|x| try_or_exit!(u64::from_str(x)))
                .unwrap_or(0);
            TrainingConfig {
                num_trees: trees,
                settings: TrainingSettings {
                    tree_height: height,
                    min_info_gain: gain,
                    max_pix_per_im_per_label: maxpix,
                    num_samples_per_node: samples,
                    seed: seed,
                },
                pool: WeakLearnerPool::default_kinect_pool(),
            }
        }
    };

    info!("Reading training data");
    let data = load_training_data(datadir)?;

    info!("Starting training: {} trees of height {}",
          config.num_trees,
          config.settings.tree_height);
    let builder = ForestBuilder::new(config.pool.clone());
    let forest = if args.is_present("sequential") {
        builder.build_forest(&data, &config)?
    } else {
        builder.build_forest_parallel(&data, &config)?
    };

    let evaluator = ForestEvaluator::new(forest);
    let im_size = data.im_width * data.im_height;
    let mut error = 0f32;
    for i in 0..data.num_images {
        error += evaluator.evaluate_error(data.im_width,
                                          data.im_height,
                                          &data.depth[i * im_size..(i + 1) * im_size],
                                          &data.labels[i * im_size..(i + 1) * im_size]);
    }
    info!("Training set pixel error: {:.4}", error / data.num_images as f32);

    save_forest(evaluator.forest(), filename)?;
    info!("Forest written to {}", filename);
    Ok(())
}
