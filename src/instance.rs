//! Per-instance metadata extraction.
//!
//! One [`InstanceRecord`] is read per DICOM file. Absent tags become `None`
//! rather than errors; only an unreadable file fails, and batch extraction
//! drops the failing instance with a recorded warning so the remaining
//! instances still convert.

use std::path::{Path, PathBuf};

use dicom::object::open_file;
use dicom_dictionary_std::tags;
use log::warn;
use rayon::prelude::*;

use crate::error::ConvertError;

/// Metadata of a single image instance (one slice).
///
/// Immutable once extracted. The originating file path is kept so the pixel
/// buffer can be loaded lazily after the batch has been demultiplexed and
/// sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceRecord {
    pub path: PathBuf,
    /// Echo time in ms.
    pub echo_time: Option<f64>,
    pub instance_number: Option<i32>,
    pub echo_number: Option<i32>,
    pub acquisition_number: Option<i32>,
    pub series_number: Option<i32>,
    /// Image orientation as two row/column direction vectors.
    pub orientation: Option<[[f64; 3]; 2]>,
    /// Image position (origin of the slice) in patient coordinates.
    pub position: Option<[f64; 3]>,
    /// In-plane pixel spacing in mm.
    pub pixel_spacing: Option<[f64; 2]>,
    /// Nominal slice thickness in mm.
    pub slice_thickness: Option<f64>,
    /// Center-to-center slice distance in mm, when present.
    pub spacing_between_slices: Option<f64>,
    /// Imaging (center) frequency in MHz.
    pub imaging_frequency: Option<f64>,
}

impl InstanceRecord {
    /// Extract the attribute record of one instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::UnreadableInstance`] if the file cannot be
    /// opened as a DICOM object. Absent attributes are `None`, never errors.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConvertError> {
        let path = path.as_ref();
        let object = open_file(path).map_err(|source| ConvertError::UnreadableInstance {
            path: path.to_path_buf(),
            reason: source.to_string(),
        })?;

        let float = |tag| {
            object
                .element(tag)
                .ok()
                .and_then(|element| element.to_float64().ok())
        };
        let int = |tag| {
            object
                .element(tag)
                .ok()
                .and_then(|element| element.to_int::<i32>().ok())
        };
        let floats = |tag| {
            object
                .element(tag)
                .ok()
                .and_then(|element| element.to_multi_float64().ok())
        };

        let orientation = floats(tags::IMAGE_ORIENTATION_PATIENT).and_then(|values| {
            if values.len() < 6 {
                return None;
            }
            Some([
                [values[0], values[1], values[2]],
                [values[3], values[4], values[5]],
            ])
        });
        let position = floats(tags::IMAGE_POSITION_PATIENT).and_then(|values| {
            if values.len() < 3 {
                return None;
            }
            Some([values[0], values[1], values[2]])
        });
        let pixel_spacing = floats(tags::PIXEL_SPACING).and_then(|values| {
            if values.len() < 2 {
                return None;
            }
            Some([values[0], values[1]])
        });

        Ok(InstanceRecord {
            path: path.to_path_buf(),
            echo_time: float(tags::ECHO_TIME),
            instance_number: int(tags::INSTANCE_NUMBER),
            echo_number: int(tags::ECHO_NUMBERS),
            acquisition_number: int(tags::ACQUISITION_NUMBER),
            series_number: int(tags::SERIES_NUMBER),
            orientation,
            position,
            pixel_spacing,
            slice_thickness: float(tags::SLICE_THICKNESS),
            spacing_between_slices: float(tags::SPACING_BETWEEN_SLICES),
            imaging_frequency: float(tags::IMAGING_FREQUENCY),
        })
    }

    /// Whether the record carries enough geometry for spatial sorting.
    pub fn has_spatial_info(&self) -> bool {
        self.orientation.is_some() && self.position.is_some()
    }
}

/// Extract records for a whole batch, skipping unreadable instances.
///
/// Extraction runs in parallel but the output preserves input file order,
/// which downstream demultiplexing relies on. Each dropped instance produces
/// one warning string; the caller decides whether the surviving batch is
/// still structurally sufficient.
pub fn collect_records(paths: &[PathBuf]) -> (Vec<InstanceRecord>, Vec<String>) {
    let results: Vec<Result<InstanceRecord, ConvertError>> = paths
        .par_iter()
        .map(InstanceRecord::from_path)
        .collect();

    let mut records = Vec::with_capacity(results.len());
    let mut warnings = Vec::new();
    for result in results {
        match result {
            Ok(record) => records.push(record),
            Err(error) => {
                warn!("skipping instance: {error}");
                warnings.push(error.to_string());
            }
        }
    }
    (records, warnings)
}
