//! Spatial slice ordering.
//!
//! Slices are ordered by projecting each image position onto the slice-plane
//! normal (the cross product of the two orientation vectors). The sort is
//! stable so instances with identical depth keep their relative file order,
//! and a batch with any missing geometry falls back to file order as a whole
//! rather than producing a partially sorted list.

use log::warn;

use crate::instance::InstanceRecord;

/// Scalar depth of one slice along the stack normal.
fn slice_depth(record: &InstanceRecord) -> Option<f64> {
    let [row, column] = record.orientation?;
    let position = record.position?;
    let normal = [
        row[1] * column[2] - row[2] * column[1],
        row[2] * column[0] - row[0] * column[2],
        row[0] * column[1] - row[1] * column[0],
    ];
    Some(position[0] * normal[0] + position[1] * normal[1] + position[2] * normal[2])
}

/// Compute the spatial ordering of a slice group as an index permutation.
///
/// The input records must share one echo/component identity. No record is
/// copied or mutated; the caller applies the permutation. When any record
/// lacks orientation or position, the identity permutation (file order) is
/// returned for the entire group.
pub fn position_order(records: &[&InstanceRecord]) -> Vec<usize> {
    let depths: Option<Vec<f64>> = records.iter().map(|record| slice_depth(record)).collect();

    let mut order: Vec<usize> = (0..records.len()).collect();
    match depths {
        Some(depths) => {
            // Stable: equal depths keep file order.
            order.sort_by(|&a, &b| depths[a].total_cmp(&depths[b]));
        }
        None => {
            if !records.is_empty() {
                warn!(
                    "orientation/position missing in slice group of {}, keeping file order",
                    records.len()
                );
            }
        }
    }
    order
}
