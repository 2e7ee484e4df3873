//! Assembled volumes and their geometry.
//!
//! A [`Volume`] is one echo/component stack as an `(slice, row, column)`
//! voxel grid with physical-space metadata. Through-plane spacing is never
//! trusted from the raw spacing tag: in-plane acquisition gaps are otherwise
//! misreported as slice distance, so the slice-thickness chain overrides it.
//! A [`Volume4`] joins same-shape echo volumes along a trailing echo axis.

use log::warn;
use ndarray::{Array3, Array4, Axis, s, stack};

use crate::error::ConvertError;
use crate::instance::InstanceRecord;

/// Physical-space metadata of a 3D voxel grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// Physical coordinate of the first voxel.
    pub origin: [f64; 3],
    /// Voxel spacing in mm: row, column, through-plane.
    pub spacing: [f64; 3],
    /// Direction cosines; columns are the row, column and normal axes.
    pub direction: [[f64; 3]; 3],
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            origin: [0.0; 3],
            spacing: [1.0; 3],
            direction: identity3(),
        }
    }
}

/// One assembled 3D volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Voxel grid, shape `(slices, rows, columns)`.
    pub data: Array3<f32>,
    pub geometry: Geometry,
}

impl Volume {
    pub fn new(data: Array3<f32>, geometry: Geometry) -> Self {
        Volume { data, geometry }
    }

    /// Get the dimensions of the volume (slices, rows, columns).
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Overwrite this volume's geometry with a reference volume's.
    ///
    /// Used after registration so every volume of a registered series is
    /// voxel-to-voxel aligned with the reference, free of resampler drift.
    pub fn conform_to(&mut self, reference: &Geometry) {
        self.geometry = reference.clone();
    }
}

/// A 4D composite: per-echo volumes joined along a trailing axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume4 {
    /// Voxel grid, shape `(slices, rows, columns, echoes)`.
    pub data: Array4<f32>,
    pub geometry: Geometry,
    /// The 3D direction cosines embedded in an identity 4x4; the echo axis
    /// carries no spatial direction.
    pub direction: [[f64; 4]; 4],
}

fn identity3() -> [[f64; 3]; 3] {
    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
}

/// Embed a 3x3 direction matrix into the top-left block of an identity 4x4.
pub fn extend_direction(direction: &[[f64; 3]; 3]) -> [[f64; 4]; 4] {
    let mut extended = [[0.0; 4]; 4];
    extended[3][3] = 1.0;
    for (row, source) in extended.iter_mut().zip(direction) {
        row[..3].copy_from_slice(source);
    }
    extended
}

/// Through-plane spacing of a stack with the correction chain:
/// slice thickness, then spacing between slices, then 1.0 mm.
///
/// Each fallback step emits a warning; the result is also appended to
/// `warnings` so conversion results carry it.
pub fn through_plane_spacing(record: &InstanceRecord, warnings: &mut Vec<String>) -> f64 {
    if let Some(thickness) = record.slice_thickness {
        return thickness;
    }
    if let Some(spacing) = record.spacing_between_slices {
        let message = format!(
            "no slice thickness in {}, using spacing between slices",
            record.path.display()
        );
        warn!("{message}");
        warnings.push(message);
        return spacing;
    }
    let message = format!(
        "no slice thickness in {}, using default value of 1.0 mm",
        record.path.display()
    );
    warn!("{message}");
    warnings.push(message);
    1.0
}

/// Geometry of a spatially sorted stack, from its first slice's metadata.
///
/// When a reference geometry is supplied (the registration case) its origin
/// and direction override the native ones so registered volumes stay aligned.
pub fn stack_geometry(
    records: &[&InstanceRecord],
    reference: Option<&Geometry>,
    warnings: &mut Vec<String>,
) -> Geometry {
    let first = records.first().copied();

    let in_plane = first
        .and_then(|record| record.pixel_spacing)
        .unwrap_or_else(|| {
            warnings.push("no pixel spacing in stack, using 1.0 mm".into());
            [1.0, 1.0]
        });
    let through_plane = match first {
        Some(record) => through_plane_spacing(record, warnings),
        None => 1.0,
    };
    let spacing = [in_plane[0], in_plane[1], through_plane];

    if let Some(reference) = reference {
        return Geometry {
            origin: reference.origin,
            spacing,
            direction: reference.direction,
        };
    }

    let origin = first.and_then(|record| record.position).unwrap_or([0.0; 3]);
    let direction = first
        .and_then(|record| record.orientation)
        .map(|[row, column]| {
            let normal = [
                row[1] * column[2] - row[2] * column[1],
                row[2] * column[0] - row[0] * column[2],
                row[0] * column[1] - row[1] * column[0],
            ];
            // Columns are the axis directions.
            [
                [row[0], column[0], normal[0]],
                [row[1], column[1], normal[1]],
                [row[2], column[2], normal[2]],
            ]
        })
        .unwrap_or_else(|| {
            warnings.push("no orientation in stack, using identity direction".into());
            identity3()
        });

    Geometry {
        origin,
        spacing,
        direction,
    }
}

/// Build a volume array from per-slice arrays in slice-ascending order.
///
/// # Errors
///
/// Returns [`ConvertError::ShapeMismatch`] when slice extents differ and
/// [`ConvertError::InsufficientData`] for an empty stack.
pub fn stack_slices(slices: &[ndarray::Array2<f32>]) -> Result<Array3<f32>, ConvertError> {
    let first = slices.first().ok_or(ConvertError::InsufficientData)?;
    let (rows, columns) = first.dim();
    let mut volume = Array3::<f32>::zeros((slices.len(), rows, columns));
    for (index, slice) in slices.iter().enumerate() {
        if slice.dim() != (rows, columns) {
            return Err(ConvertError::shapes(
                &[rows, columns],
                &[slice.dim().0, slice.dim().1],
            ));
        }
        volume.slice_mut(s![index, .., ..]).assign(slice);
    }
    Ok(volume)
}

/// Join same-shape echo volumes, ascending by echo time, into a 4D volume.
///
/// Geometry is inherited from the first volume; the direction matrix is
/// extended to 4x4.
///
/// # Errors
///
/// Returns [`ConvertError::ShapeMismatch`] when extents differ and
/// [`ConvertError::InsufficientData`] for an empty input.
pub fn join_echoes(volumes: &[Volume]) -> Result<Volume4, ConvertError> {
    let first = volumes.first().ok_or(ConvertError::InsufficientData)?;
    for volume in volumes {
        if volume.data.dim() != first.data.dim() {
            return Err(ConvertError::shapes(
                first.data.shape(),
                volume.data.shape(),
            ));
        }
    }

    let views: Vec<_> = volumes.iter().map(|volume| volume.data.view()).collect();
    let data = stack(Axis(3), &views)
        .map_err(|_| ConvertError::shapes(first.data.shape(), first.data.shape()))?;

    Ok(Volume4 {
        data,
        geometry: first.geometry.clone(),
        direction: extend_direction(&first.geometry.direction),
    })
}
