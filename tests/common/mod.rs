//! Common test utilities for reassembly integration tests.

use std::path::PathBuf;

use dicom_multiecho::{ConvertError, InstanceRecord, StackLoader};
use ndarray::{Array3, s};

/// Initialize logging once per test binary; repeated calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Loader that fills each slice with the value encoded in its file name
/// (`v<value>_<counter>.dcm`), so volume contents reveal which instance
/// landed where.
pub struct SyntheticLoader {
    pub rows: usize,
    pub columns: usize,
}

impl Default for SyntheticLoader {
    fn default() -> Self {
        SyntheticLoader { rows: 4, columns: 4 }
    }
}

impl StackLoader for SyntheticLoader {
    fn load_stack(&self, ordered_paths: &[PathBuf]) -> Result<Array3<f32>, ConvertError> {
        let mut volume = Array3::zeros((ordered_paths.len(), self.rows, self.columns));
        for (index, path) in ordered_paths.iter().enumerate() {
            let stem = path.file_stem().unwrap().to_string_lossy();
            let value: f32 = stem
                .trim_start_matches('v')
                .split('_')
                .next()
                .unwrap()
                .parse()
                .unwrap();
            volume.slice_mut(s![index, .., ..]).fill(value);
        }
        Ok(volume)
    }
}

/// One synthetic instance with full geometry.
pub fn record(value: f64, counter: usize, echo_time: f64, z: f64) -> InstanceRecord {
    InstanceRecord {
        path: PathBuf::from(format!("v{value}_{counter:03}.dcm")),
        echo_time: Some(echo_time),
        instance_number: Some(counter as i32 + 1),
        series_number: Some(300),
        orientation: Some([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]),
        position: Some([-100.0, -80.0, z]),
        pixel_spacing: Some([0.5, 0.5]),
        slice_thickness: Some(3.0),
        imaging_frequency: Some(127.74),
        ..InstanceRecord::default()
    }
}

/// Echo-interleaved batch in acquisition file order: echo varies fastest,
/// slice slowest, one instance per (slice, echo). Voxels carry
/// `100 * echo + slice`.
pub fn strided_batch(echoes: usize, slices: usize) -> Vec<InstanceRecord> {
    let mut batch = Vec::new();
    let mut counter = 0;
    for slice in 0..slices {
        for echo in 0..echoes {
            batch.push(record(
                (echo * 100 + slice) as f64,
                counter,
                5.0 * (echo + 1) as f64,
                slice as f64,
            ));
            counter += 1;
        }
    }
    batch
}

/// Component-and-echo interleaved batch: component fastest, then echo, then
/// slice. Voxels carry `1000 * component + 100 * echo + slice`.
pub fn complex_batch(components: usize, echoes: usize, slices: usize) -> Vec<InstanceRecord> {
    let mut batch = Vec::new();
    let mut counter = 0;
    for slice in 0..slices {
        for echo in 0..echoes {
            for component in 0..components {
                batch.push(record(
                    (component * 1000 + echo * 100 + slice) as f64,
                    counter,
                    5.0 * (echo + 1) as f64,
                    slice as f64,
                ));
                counter += 1;
            }
        }
    }
    batch
}

/// Contiguous-block batch (one echo after another), with the given echo
/// times in ms. Voxels carry `value_base + 100 * echo + slice`.
pub fn blocked_batch(echo_times: &[f64], slices: usize, value_base: usize) -> Vec<InstanceRecord> {
    let mut batch = Vec::new();
    let mut counter = 0;
    for (echo, &echo_time) in echo_times.iter().enumerate() {
        for slice in 0..slices {
            batch.push(record(
                (value_base + echo * 100 + slice) as f64,
                counter,
                echo_time,
                slice as f64,
            ));
            counter += 1;
        }
    }
    batch
}
