/// Binary serialization of trained forests.
///
/// The on-disk layout is little-endian without padding: an i32 tree
/// count, then per tree a u32 height, a u32 node count and that many
/// fixed size node records of
/// `{i32 u_offset, i32 v_offset, i16 threshold, u8 test_id,
///   f32 probs[NUM_LABELS], i32 left_child, i32 right_child}`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::tree::{DecisionTree, Forest, TreeNode, WeakLearner, WeakLearnerCoeffs, LEAF};
use types::NUM_LABELS;

/// Upper bound on speculative preallocation from header counts. The
/// counts are untrusted until the records behind them actually parse.
const MAX_PREALLOC: usize = 1 << 12;

pub fn save_forest<P: AsRef<Path>>(forest: &Forest, path: P) -> Result<(), ForestIoError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    write_forest(forest, &mut writer)?;
    writer.flush()?;
    Ok(())
}

pub fn load_forest<P: AsRef<Path>>(path: P) -> Result<Forest, ForestIoError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let forest = read_forest(&mut reader)?;
    // Anything after the last tree means the file was not written by us.
    let mut scratch = [0u8; 1];
    if reader.read(&mut scratch)? != 0 {
        return Err(ForestIoError::TrailingData);
    }
    Ok(forest)
}

pub fn write_forest<W: Write>(forest: &Forest, writer: &mut W) -> Result<(), ForestIoError> {
    writer.write_i32::<LittleEndian>(forest.num_trees() as i32)?;
    for tree in forest.trees.iter() {
        writer.write_u32::<LittleEndian>(tree.height)?;
        writer.write_u32::<LittleEndian>(tree.num_nodes())?;
        for node in tree.nodes.iter() {
            writer.write_i32::<LittleEndian>(node.coeffs.u_offset)?;
            writer.write_i32::<LittleEndian>(node.coeffs.v_offset)?;
            writer.write_i16::<LittleEndian>(node.coeffs.threshold)?;
            writer.write_u8(node.coeffs.test.id())?;
            for &p in node.probs.iter() {
                writer.write_f32::<LittleEndian>(p)?;
            }
            writer.write_i32::<LittleEndian>(node.left_child)?;
            writer.write_i32::<LittleEndian>(node.right_child)?;
        }
    }
    Ok(())
}

pub fn read_forest<R: Read>(reader: &mut R) -> Result<Forest, ForestIoError> {
    let num_trees = reader.read_i32::<LittleEndian>()?;
    if num_trees < 0 {
        return Err(ForestIoError::Corrupt("negative tree count"));
    }
    let mut trees = Vec::with_capacity(cmp::min(num_trees as usize, MAX_PREALLOC));
    for _ in 0..num_trees {
        trees.push(read_tree(reader)?);
    }
    Ok(Forest::new(trees))
}

fn read_tree<R: Read>(reader: &mut R) -> Result<DecisionTree, ForestIoError> {
    let height = reader.read_u32::<LittleEndian>()?;
    let num_nodes = reader.read_u32::<LittleEndian>()?;
    if num_nodes == 0 {
        return Err(ForestIoError::Corrupt("tree without nodes"));
    }
    let mut nodes = Vec::with_capacity(cmp::min(num_nodes as usize, MAX_PREALLOC));
    for _ in 0..num_nodes {
        let u_offset = reader.read_i32::<LittleEndian>()?;
        let v_offset = reader.read_i32::<LittleEndian>()?;
        let threshold = reader.read_i16::<LittleEndian>()?;
        let test_id = reader.read_u8()?;
        let test = WeakLearner::from_id(test_id)
            .ok_or(ForestIoError::BadTestId(test_id))?;
        let mut probs = [0f32; NUM_LABELS];
        for p in probs.iter_mut() {
            *p = reader.read_f32::<LittleEndian>()?;
        }
        let left_child = reader.read_i32::<LittleEndian>()?;
        let right_child = reader.read_i32::<LittleEndian>()?;
        nodes.push(TreeNode {
            coeffs: WeakLearnerCoeffs {
                u_offset: u_offset,
                v_offset: v_offset,
                threshold: threshold,
                test: test,
            },
            probs: probs,
            left_child: left_child,
            right_child: right_child,
        });
    }
    // Child indices must stay inside the node array, and a leaf must be
    // a leaf on both sides.
    for node in nodes.iter() {
        if node.left_child == LEAF {
            if node.right_child != LEAF {
                return Err(ForestIoError::Corrupt("half leaf node"));
            }
        } else if node.left_child < 0 || node.left_child as u32 >= num_nodes ||
                  node.right_child < 0 || node.right_child as u32 >= num_nodes {
            return Err(ForestIoError::Corrupt("child index out of range"));
        }
    }
    Ok(DecisionTree {
        nodes: nodes,
        height: height,
    })
}

// Error Definitions

#[derive(Debug)]
pub enum ForestIoError {
    Io(io::Error),
    /// A weak learner id the current code does not know.
    BadTestId(u8),
    /// Structurally invalid content, e.g. child indices out of range.
    Corrupt(&'static str),
    /// Bytes left over after the declared number of trees.
    TrailingData,
}

impl From<io::Error> for ForestIoError {
    fn from(err: io::Error) -> Self {
        ForestIoError::Io(err)
    }
}

impl fmt::Display for ForestIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ForestIoError::Io(ref err) => err.fmt(f),
            ForestIoError::BadTestId(id) => write!(f, "Unknown weak learner id {}", id),
            ForestIoError::Corrupt(what) => write!(f, "Corrupt forest file: {}", what),
            ForestIoError::TrailingData => {
                write!(f, "Trailing bytes after the last tree of the forest file")
            }
        }
    }
}

impl Error for ForestIoError {
    fn description(&self) -> &str {
        match *self {
            ForestIoError::Io(ref err) => err.description(),
            ForestIoError::BadTestId(_) => "unknown weak learner id",
            ForestIoError::Corrupt(_) => "corrupt forest file",
            ForestIoError::TrailingData => "trailing bytes in forest file",
        }
    }
}
