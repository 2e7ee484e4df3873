//! Derived per-voxel maps.
//!
//! Pure elementwise functions over same-shape volumes. All three share one
//! division policy: a division by zero or any other non-finite result reads
//! as 0 before clipping. Background and air voxels are commonly zero-valued,
//! and clinical reading assumes they stay zero instead of jumping to a clip
//! boundary.

use ndarray::{Array, Dimension, Zip};

use crate::error::ConvertError;

fn check_shapes<D: Dimension>(
    left: &Array<f32, D>,
    right: &Array<f32, D>,
) -> Result<(), ConvertError> {
    if left.shape() != right.shape() {
        return Err(ConvertError::shapes(left.shape(), right.shape()));
    }
    Ok(())
}

/// Zero out non-finite values, then clip.
fn sanitize_and_clip(value: f32, clip: (f32, f32)) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(clip.0, clip.1)
}

/// Porosity-type index: `(late / early) * 100`, clipped to [0, 100].
///
/// # Errors
///
/// Returns [`ConvertError::ShapeMismatch`] when extents differ.
pub fn porosity_index<D: Dimension>(
    early: &Array<f32, D>,
    late: &Array<f32, D>,
) -> Result<Array<f32, D>, ConvertError> {
    check_shapes(early, late)?;
    let mut index = Array::zeros(early.raw_dim());
    Zip::from(&mut index)
        .and(early)
        .and(late)
        .for_each(|out, &early, &late| {
            *out = sanitize_and_clip(late / early * 100.0, (0.0, 100.0));
        });
    Ok(index)
}

/// Generic ratio `numerator / denominator`, clipped to the given range.
///
/// Used for suppression-ratio maps with the default clip range [0, 1000].
///
/// # Errors
///
/// Returns [`ConvertError::ShapeMismatch`] when extents differ.
pub fn suppression_ratio<D: Dimension>(
    numerator: &Array<f32, D>,
    denominator: &Array<f32, D>,
    clip: (f32, f32),
) -> Result<Array<f32, D>, ConvertError> {
    check_shapes(numerator, denominator)?;
    let mut ratio = Array::zeros(numerator.raw_dim());
    Zip::from(&mut ratio)
        .and(numerator)
        .and(denominator)
        .for_each(|out, &numerator, &denominator| {
            *out = sanitize_and_clip(numerator / denominator, clip);
        });
    Ok(ratio)
}

/// Magnitude reconstruction `sqrt(real^2 + imag^2)`, unclipped.
///
/// # Errors
///
/// Returns [`ConvertError::ShapeMismatch`] when extents differ.
pub fn complex_magnitude<D: Dimension>(
    real: &Array<f32, D>,
    imag: &Array<f32, D>,
) -> Result<Array<f32, D>, ConvertError> {
    check_shapes(real, imag)?;
    let mut magnitude = Array::zeros(real.raw_dim());
    Zip::from(&mut magnitude)
        .and(real)
        .and(imag)
        .for_each(|out, &real, &imag| {
            let value = (real * real + imag * imag).sqrt();
            *out = if value.is_finite() { value } else { 0.0 };
        });
    Ok(magnitude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, arr3};

    #[test]
    fn porosity_index_scales_and_clips() {
        let early = arr3(&[[[100.0_f32, 50.0], [200.0, 10.0]]]);
        let late = arr3(&[[[50.0_f32, 50.0], [400.0, -5.0]]]);
        let index = porosity_index(&early, &late).unwrap();
        assert_eq!(index[[0, 0, 0]], 50.0);
        assert_eq!(index[[0, 0, 1]], 100.0);
        // 200% clips to the upper bound, negative clips to 0.
        assert_eq!(index[[0, 1, 0]], 100.0);
        assert_eq!(index[[0, 1, 1]], 0.0);
    }

    #[test]
    fn zero_denominator_reads_as_zero_not_clip_bound() {
        let early = arr3(&[[[0.0_f32, 0.0]]]);
        let late = arr3(&[[[100.0_f32, 0.0]]]);
        let index = porosity_index(&early, &late).unwrap();
        // 100/0 -> inf -> 0, and 0/0 -> NaN -> 0.
        assert_eq!(index[[0, 0, 0]], 0.0);
        assert_eq!(index[[0, 0, 1]], 0.0);

        let ratio = suppression_ratio(&late, &early, (0.0, 1000.0)).unwrap();
        assert_eq!(ratio[[0, 0, 0]], 0.0);
        assert_eq!(ratio[[0, 0, 1]], 0.0);
    }

    #[test]
    fn suppression_ratio_honors_caller_clip() {
        let numerator = arr3(&[[[30.0_f32, 2.0]]]);
        let denominator = arr3(&[[[2.0_f32, 4.0]]]);
        let ratio = suppression_ratio(&numerator, &denominator, (0.0, 10.0)).unwrap();
        assert_eq!(ratio[[0, 0, 0]], 10.0);
        assert_eq!(ratio[[0, 0, 1]], 0.5);
    }

    #[test]
    fn magnitude_is_unclipped_and_zeroes_nonfinite() {
        let real = arr3(&[[[3.0_f32, f32::INFINITY]]]);
        let imag = arr3(&[[[4.0_f32, 1.0]]]);
        let magnitude = complex_magnitude(&real, &imag).unwrap();
        assert_eq!(magnitude[[0, 0, 0]], 5.0);
        assert_eq!(magnitude[[0, 0, 1]], 0.0);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let a = Array3::<f32>::zeros((2, 2, 2));
        let b = Array3::<f32>::zeros((2, 2, 3));
        assert!(matches!(
            porosity_index(&a, &b),
            Err(ConvertError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            complex_magnitude(&a, &b),
            Err(ConvertError::ShapeMismatch { .. })
        ));
    }
}
