/// Run the hand detector over recorded depth frames and print where the
/// hands are. Optionally writes the label grid of each frame as a PNG.
///
/// Frames use the same format the trainer reads: two u32 LE dimensions,
/// then width*height i16 LE depth values.

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
use handforest::pipeline::{HandDetector, LabelMethod};
use handforest::types::label_image_from_grid;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::process::exit;
use std::str::FromStr;

error_chain! {
    foreign_links {
        IO(std::io::Error);
        Image(image::ImageError);
        Detector(handforest::pipeline::DetectorError);
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

pub fn main() {
    if let Err(e) = main_() {
        eprintln!("Error: {}", e);
        exit(-1);
    }
}

fn load_depth_frame(path: &str) -> Result<(usize, usize, Vec<i16>)> {
    let mut reader = BufReader::new(File::open(path)?);
    let width = reader.read_u32::<LittleEndian>()? as usize;
    let height = reader.read_u32::<LittleEndian>()? as usize;
    let mut depth = vec![0i16; width * height];
    for d in depth.iter_mut() {
        *d = reader.read_i16::<LittleEndian>()?;
    }
    Ok((width, height, depth))
}

fn format_hand(uvd: Option<[f32; 3]>) -> String {
    match uvd {
        Some(uvd) => format!("({:.1}, {:.1}) at {:.0}mm", uvd[0], uvd[1], uvd[2]),
        None => "not found".to_string(),
    }
}

pub fn main_() -> Result<()> {
    env_logger::init();
    let args = App::new("Hand finder")
        .arg(Arg::with_name("forest")
            .short("f")
            .long("forest")
            .required(true)
            .takes_value(true)
            .help("Trained forest file"))
        .arg(Arg::with_name("frames")
            .required(true)
            .multiple(true)
            .help("Depth frames to process"))
        .arg(Arg::with_name("labels_out")
            .short("l")
            .long("labels")
            .takes_value(true)
            .help("Directory to write per-frame label PNGs into"))
        .arg(Arg::with_name("trees")
            .long("trees")
            .takes_value(true)
            .help("Evaluate only the first N trees"))
        .arg(Arg::with_name("height")
            .long("height")
            .takes_value(true)
            .help("Descend at most this deep into each tree"))
        .get_matches();

    let forest_path = args.value_of("forest").ok_or("No valid forest filename")?;
    let frames: Vec<&str> = args.values_of("frames").ok_or("No frames given")?.collect();

    // All frames must share the first frame's dimensions; the detector
    // is sized once.
    let (width, height, first_depth) = load_depth_frame(frames[0])?;
    let mut detector = HandDetector::new(width, height, forest_path)?;
    if let Some(trees) = args.value_of("trees") {
        detector.set_num_trees_to_evaluate(try_or_exit!(usize::from_str(trees)));
    }
    if let Some(max_height) = args.value_of("height") {
        detector.set_max_height_to_evaluate(try_or_exit!(u32::from_str(max_height)));
    }

    let mut labels = vec![0u8; width * height];
    for (i, frame_path) in frames.iter().enumerate() {
        let depth = if i == 0 {
            first_depth.clone()
        } else {
            let (w, h, depth) = load_depth_frame(frame_path)?;
            if w != width || h != height {
                bail!("{} has size {}x{}, expected {}x{}", frame_path, w, h, width, height);
            }
            depth
        };

        let hands = detector.find_hands(&depth)?;
        println!("{}: left {}, right {}",
                 frame_path,
                 format_hand(hands.left),
                 format_hand(hands.right));

        if let Some(out_dir) = args.value_of("labels_out") {
            detector.find_hand_labels(&depth, &[], LabelMethod::UpconvertFilter, &mut labels)?;
            // Spread the two labels over the full 8 bit range so the
            // output is visible in an image viewer.
            let visible: Vec<u8> = labels.iter().map(|&l| l * 255).collect();
            let img = label_image_from_grid(&visible, width as u32, height as u32)
                .ok_or("Label grid does not match the frame size")?;
            let stem = Path::new(frame_path)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("frame");
            img.save(format!("{}/{}_labels.png", out_dir, stem))?;
        }
    }
    Ok(())
}
