//! Acquisition structure inference.
//!
//! A flat instance list encodes its echo/slice layout only in per-instance
//! metadata. [`AcquisitionStructure::analyze`] recovers that layout from a
//! batch of records without assuming anything sequence-specific; policy
//! checks (minimum echo counts, component layouts) are applied afterwards by
//! the caller so the analysis stays usable for every plan.

use log::info;

use crate::error::ConvertError;
use crate::instance::InstanceRecord;

/// Inferred layout of one acquisition batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionStructure {
    /// Number of distinct echo times (1 when no echo metadata exists).
    pub echo_count: usize,
    /// Unique instance numbers divided by the echo count.
    pub slices_per_echo: usize,
    /// 1 for magnitude-only, 2 for real/imaginary, 3 for mag/real/imag.
    pub component_count: usize,
    /// Unique echo times in ms, ascending.
    pub echo_times: Vec<f64>,
    /// Non-fatal consistency findings.
    pub warnings: Vec<String>,
}

impl AcquisitionStructure {
    /// Infer the acquisition structure of a batch.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::InsufficientData`] only when the batch is
    /// empty. Inconsistencies (uneven slice counts, mixed series, missing
    /// geometry) are recorded as warnings, not errors.
    pub fn analyze(records: &[InstanceRecord]) -> Result<Self, ConvertError> {
        if records.is_empty() {
            return Err(ConvertError::InsufficientData);
        }

        let mut warnings = Vec::new();

        let mut echo_times: Vec<f64> = records.iter().filter_map(|r| r.echo_time).collect();
        echo_times.sort_by(f64::total_cmp);
        echo_times.dedup();
        let echo_count = echo_times.len().max(1);
        if echo_count > 1 {
            info!("detected multi-echo acquisition with {echo_count} echo times");
        }

        let mut instance_numbers: Vec<i32> =
            records.iter().filter_map(|r| r.instance_number).collect();
        instance_numbers.sort_unstable();
        instance_numbers.dedup();
        let instance_count = if instance_numbers.is_empty() {
            records.len()
        } else {
            instance_numbers.len()
        };

        let slices_per_echo = (instance_count / echo_count).max(1);
        if instance_count % echo_count != 0 {
            warnings.push(format!(
                "{instance_count} unique instance numbers do not divide evenly into \
                 {echo_count} echoes"
            ));
        }

        let mut series_numbers: Vec<i32> =
            records.iter().filter_map(|r| r.series_number).collect();
        series_numbers.sort_unstable();
        series_numbers.dedup();
        if series_numbers.len() > 1 {
            warnings.push(format!(
                "multiple series numbers found in one batch: {series_numbers:?}"
            ));
        }

        let missing_geometry = records.iter().filter(|r| !r.has_spatial_info()).count();
        if missing_geometry > 0 {
            warnings.push(format!(
                "{missing_geometry} instance(s) missing orientation/position, spatial \
                 sorting falls back to file order"
            ));
        }

        Ok(AcquisitionStructure {
            echo_count,
            slices_per_echo,
            component_count: 1,
            echo_times,
            warnings,
        })
    }

    /// Overlay the component layout a sequence plan declares.
    ///
    /// The per-instance metadata cannot distinguish components, so the count
    /// comes from policy. An uneven component split is recorded as a warning
    /// here; the demultiplexer turns it into a fatal mismatch.
    pub fn with_component_count(mut self, component_count: usize) -> Self {
        if component_count > 1 && self.slices_per_echo % component_count != 0 {
            self.warnings.push(format!(
                "{} slices per echo do not divide evenly into {component_count} components",
                self.slices_per_echo
            ));
        }
        self.component_count = component_count.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(echo_time: f64, instance_number: i32) -> InstanceRecord {
        InstanceRecord {
            echo_time: Some(echo_time),
            instance_number: Some(instance_number),
            orientation: Some([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]),
            position: Some([0.0, 0.0, instance_number as f64]),
            series_number: Some(7),
            ..InstanceRecord::default()
        }
    }

    #[test]
    fn empty_batch_is_insufficient() {
        let result = AcquisitionStructure::analyze(&[]);
        assert!(matches!(result, Err(ConvertError::InsufficientData)));
    }

    #[test]
    fn infers_echo_and_slice_counts() {
        // 3 echoes x 4 slices, echo-interleaved file order.
        let mut records = Vec::new();
        let mut instance = 1;
        for _slice in 0..4 {
            for echo in 0..3 {
                records.push(record(5.0 + echo as f64 * 5.0, instance));
                instance += 1;
            }
        }
        let structure = AcquisitionStructure::analyze(&records).unwrap();
        assert_eq!(structure.echo_count, 3);
        assert_eq!(structure.slices_per_echo, 4);
        assert_eq!(structure.echo_times, vec![5.0, 10.0, 15.0]);
        assert!(structure.warnings.is_empty());
    }

    #[test]
    fn no_echo_metadata_means_single_echo() {
        let records: Vec<InstanceRecord> = (1..=5)
            .map(|i| InstanceRecord {
                instance_number: Some(i),
                ..InstanceRecord::default()
            })
            .collect();
        let structure = AcquisitionStructure::analyze(&records).unwrap();
        assert_eq!(structure.echo_count, 1);
        assert_eq!(structure.slices_per_echo, 5);
        assert!(structure.echo_times.is_empty());
    }

    #[test]
    fn uneven_division_warns_instead_of_failing() {
        let mut records: Vec<InstanceRecord> = Vec::new();
        for i in 0..7 {
            records.push(record(if i % 2 == 0 { 5.0 } else { 10.0 }, i));
        }
        let structure = AcquisitionStructure::analyze(&records).unwrap();
        assert_eq!(structure.echo_count, 2);
        assert_eq!(structure.slices_per_echo, 3);
        assert!(
            structure
                .warnings
                .iter()
                .any(|w| w.contains("do not divide evenly"))
        );
    }

    #[test]
    fn mixed_series_and_missing_geometry_warn() {
        let mut a = record(5.0, 1);
        let mut b = record(5.0, 2);
        b.series_number = Some(8);
        b.orientation = None;
        a.series_number = Some(7);
        let structure = AcquisitionStructure::analyze(&[a, b]).unwrap();
        assert!(
            structure
                .warnings
                .iter()
                .any(|w| w.contains("multiple series numbers"))
        );
        assert!(
            structure
                .warnings
                .iter()
                .any(|w| w.contains("missing orientation/position"))
        );
    }

    #[test]
    fn component_overlay_checks_divisibility() {
        let records: Vec<InstanceRecord> = (1..=12).map(|i| record(5.0, i)).collect();
        let structure = AcquisitionStructure::analyze(&records)
            .unwrap()
            .with_component_count(3);
        assert_eq!(structure.component_count, 3);
        assert!(structure.warnings.is_empty());

        let records: Vec<InstanceRecord> = (1..=10).map(|i| record(5.0, i)).collect();
        let structure = AcquisitionStructure::analyze(&records)
            .unwrap()
            .with_component_count(3);
        assert!(
            structure
                .warnings
                .iter()
                .any(|w| w.contains("components"))
        );
    }
}
