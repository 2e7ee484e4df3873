//! Pixel-buffer loading behind the [`StackLoader`] contract.
//!
//! The reassembly pipeline decides *which* files form a stack and in what
//! order; actually decoding pixel buffers is delegated here so tests and
//! alternative I/O backends can substitute their own loader.
//! [`DicomStackLoader`] is the default, backed by the dicom-rs pixel decoder.

use std::path::PathBuf;

use dicom::object::open_file;
use dicom::pixeldata::PixelDecoder;
use ndarray::{Array2, Array3, s};

use crate::error::ConvertError;
use crate::volume::stack_slices;

/// Loads an ordered slice list into a single voxel grid.
pub trait StackLoader {
    /// Load the given files, in order, as an `(slices, rows, columns)` array.
    ///
    /// # Errors
    ///
    /// Implementations return [`ConvertError::UnreadableInstance`] for files
    /// that cannot be decoded and [`ConvertError::ShapeMismatch`] for
    /// inconsistent slice extents.
    fn load_stack(&self, ordered_paths: &[PathBuf]) -> Result<Array3<f32>, ConvertError>;
}

/// Stack loader over the dicom-rs decoding pipeline.
///
/// Pixel data is decoded with the modality rescale applied and converted to
/// `f32`; multi-frame objects contribute their first frame.
#[derive(Debug, Default)]
pub struct DicomStackLoader;

impl DicomStackLoader {
    fn decode_slice(path: &PathBuf) -> Result<Array2<f32>, ConvertError> {
        let unreadable = |reason: String| ConvertError::UnreadableInstance {
            path: path.clone(),
            reason,
        };
        let object = open_file(path).map_err(|source| unreadable(source.to_string()))?;
        let decoded = object
            .decode_pixel_data()
            .map_err(|error| unreadable(format!("undecodable pixel data: {error}")))
            .and_then(|pixel_data| {
                pixel_data
                    .to_ndarray::<f32>()
                    .map_err(|error| unreadable(format!("pixel conversion failed: {error}")))
            })?;
        Ok(decoded.slice_move(s![0, .., .., 0]))
    }
}

impl StackLoader for DicomStackLoader {
    fn load_stack(&self, ordered_paths: &[PathBuf]) -> Result<Array3<f32>, ConvertError> {
        let slices: Vec<Array2<f32>> = ordered_paths
            .iter()
            .map(Self::decode_slice)
            .collect::<Result<_, _>>()?;
        stack_slices(&slices)
    }
}
