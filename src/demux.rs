//! Echo/component demultiplexing.
//!
//! A flat, file-order instance stream is split into per-component and
//! per-echo groups according to the sequence plan's interleave convention.
//! Component striding always runs first: acquisition hardware nests the echo
//! loop inside the component loop for every supported family. Stride
//! arithmetic that does not partition the batch exactly is fatal; partial
//! volumes are never produced silently.

use crate::error::ConvertError;
use crate::instance::InstanceRecord;
use crate::plan::{Component, EchoLayout, SequencePlan};
use crate::sort::position_order;
use crate::structure::AcquisitionStructure;

/// One component's echo groups, as indices into the original batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentGroup {
    pub component: Component,
    /// One index list per echo, ascending by echo.
    pub echoes: Vec<Vec<usize>>,
}

/// Result of demultiplexing one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoGroups {
    pub components: Vec<ComponentGroup>,
    /// Whether the index lists already carry spatial order (the
    /// position-interleaved convention sorts before splitting); when false
    /// each group still needs the spatial sorter.
    pub spatially_ordered: bool,
}

/// Split a batch into per-component, per-echo index groups.
///
/// # Errors
///
/// Returns [`ConvertError::DemuxMismatch`] when the component or echo stride
/// does not divide the batch evenly.
pub fn split_batch(
    records: &[InstanceRecord],
    structure: &AcquisitionStructure,
    plan: &SequencePlan,
) -> Result<EchoGroups, ConvertError> {
    let total = records.len();
    if total == 0 {
        return Err(ConvertError::InsufficientData);
    }
    let component_count = plan.components.len().max(1);
    let echo_count = structure.echo_count;

    if total % component_count != 0 {
        return Err(ConvertError::DemuxMismatch(format!(
            "{total} instances do not split into {component_count} components"
        )));
    }

    if plan.echo_layout == EchoLayout::ByEchoTime {
        return Ok(EchoGroups {
            components: vec![ComponentGroup {
                component: *plan.components.first().unwrap_or(&Component::Magnitude),
                echoes: group_by_echo_time(records),
            }],
            spatially_ordered: false,
        });
    }

    let mut components = Vec::with_capacity(component_count);
    let mut spatially_ordered = false;

    for (offset, &component) in plan.components.iter().enumerate() {
        let member_indices: Vec<usize> = (offset..total).step_by(component_count).collect();
        if member_indices.len() % echo_count != 0 {
            return Err(ConvertError::DemuxMismatch(format!(
                "component '{}' has {} instances, not divisible into {echo_count} echoes",
                component.label(),
                member_indices.len()
            )));
        }

        let echoes = match plan.echo_layout {
            EchoLayout::Strided => echo_stride(&member_indices, echo_count),
            EchoLayout::Contiguous => echo_blocks(&member_indices, echo_count),
            EchoLayout::PositionInterleaved => {
                spatially_ordered = true;
                let member_refs: Vec<&InstanceRecord> =
                    member_indices.iter().map(|&i| &records[i]).collect();
                let sorted: Vec<usize> = position_order(&member_refs)
                    .into_iter()
                    .map(|i| member_indices[i])
                    .collect();
                echo_stride(&sorted, echo_count)
            }
            EchoLayout::ByEchoTime => unreachable!("handled above"),
        };
        components.push(ComponentGroup { component, echoes });
    }

    Ok(EchoGroups {
        components,
        spatially_ordered,
    })
}

/// Echo e is every `echo_count`-th member starting at offset e.
fn echo_stride(members: &[usize], echo_count: usize) -> Vec<Vec<usize>> {
    (0..echo_count)
        .map(|echo| {
            members
                .iter()
                .skip(echo)
                .step_by(echo_count)
                .copied()
                .collect()
        })
        .collect()
}

/// Echo e is the e-th contiguous block of members.
fn echo_blocks(members: &[usize], echo_count: usize) -> Vec<Vec<usize>> {
    let block = members.len() / echo_count;
    members.chunks(block).map(<[usize]>::to_vec).collect()
}

/// Group instances by exact echo time, groups ascending by time.
///
/// Instances without an echo time gather under 0.0, matching the attribute
/// default used throughout extraction.
fn group_by_echo_time(records: &[InstanceRecord]) -> Vec<Vec<usize>> {
    let mut unique: Vec<f64> = records
        .iter()
        .map(|record| record.echo_time.unwrap_or(0.0))
        .collect();
    unique.sort_by(f64::total_cmp);
    unique.dedup();

    unique
        .iter()
        .map(|&time| {
            records
                .iter()
                .enumerate()
                .filter(|(_, record)| record.echo_time.unwrap_or(0.0) == time)
                .map(|(index, _)| index)
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{MinEchoes, PlanRegistry, SeriesArity};

    fn structure(echo_count: usize, slices_per_echo: usize) -> AcquisitionStructure {
        AcquisitionStructure {
            echo_count,
            slices_per_echo,
            component_count: 1,
            echo_times: (0..echo_count).map(|e| 5.0 * (e + 1) as f64).collect(),
            warnings: vec![],
        }
    }

    fn flat_records(n: usize) -> Vec<InstanceRecord> {
        (0..n)
            .map(|i| InstanceRecord {
                instance_number: Some(i as i32 + 1),
                ..InstanceRecord::default()
            })
            .collect()
    }

    #[test]
    fn strided_round_trip_recovers_all_groups_disjointly() {
        // 3 components x 2 echoes x 4 slices interleaved in the documented
        // nesting order: component varies fastest, then echo, then slice.
        let components = 3;
        let echoes = 2;
        let slices = 4;
        let records = flat_records(components * echoes * slices);
        let registry = PlanRegistry::standard();
        let plan = registry.get("megre").unwrap();

        let groups = split_batch(&records, &structure(echoes, slices), plan).unwrap();
        assert_eq!(groups.components.len(), components);
        assert!(!groups.spatially_ordered);

        let mut seen = vec![false; records.len()];
        for group in &groups.components {
            assert_eq!(group.echoes.len(), echoes);
            for echo in &group.echoes {
                assert_eq!(echo.len(), slices);
                for &index in echo {
                    assert!(!seen[index], "index {index} appeared twice");
                    seen[index] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));

        // Component c's members are exactly the indices congruent to c.
        for (c, group) in groups.components.iter().enumerate() {
            for echo in &group.echoes {
                assert!(echo.iter().all(|&index| index % components == c));
            }
        }
        // Echo e of component 0 starts at 3*e and steps by 6.
        assert_eq!(groups.components[0].echoes[1], vec![3, 9, 15, 21]);
    }

    #[test]
    fn contiguous_layout_splits_into_blocks() {
        let records = flat_records(6);
        let registry = PlanRegistry::standard();
        let plan = registry.get("ute").unwrap();

        let groups = split_batch(&records, &structure(2, 3), plan).unwrap();
        assert_eq!(groups.components[0].echoes[0], vec![0, 1, 2]);
        assert_eq!(groups.components[0].echoes[1], vec![3, 4, 5]);
    }

    #[test]
    fn position_interleaved_sorts_then_alternates() {
        // Descending positions, echo pairs adjacent per location.
        let mut records = Vec::new();
        for slice in 0..3 {
            for _echo in 0..2 {
                records.push(InstanceRecord {
                    orientation: Some([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]),
                    position: Some([0.0, 0.0, (10 - slice) as f64]),
                    ..InstanceRecord::default()
                });
            }
        }
        let registry = PlanRegistry::standard();
        let plan = registry.get("dess").unwrap();

        let groups = split_batch(&records, &structure(2, 3), plan).unwrap();
        assert!(groups.spatially_ordered);
        // Sorted ascending by z: indices 4,5 (z=8), 2,3 (z=9), 0,1 (z=10);
        // the stable tie rule keeps the first echo of each pair first.
        assert_eq!(groups.components[0].echoes[0], vec![4, 2, 0]);
        assert_eq!(groups.components[0].echoes[1], vec![5, 3, 1]);
    }

    #[test]
    fn uneven_stride_is_fatal() {
        let records = flat_records(7);
        let registry = PlanRegistry::standard();
        let megre = registry.get("megre").unwrap();
        assert!(matches!(
            split_batch(&records, &structure(2, 1), megre),
            Err(ConvertError::DemuxMismatch(_))
        ));

        let mese = registry.get("mese").unwrap();
        assert!(matches!(
            split_batch(&records, &structure(2, 3), mese),
            Err(ConvertError::DemuxMismatch(_))
        ));
    }

    #[test]
    fn by_echo_time_groups_ascending() {
        let mut records = flat_records(6);
        for (i, record) in records.iter_mut().enumerate() {
            record.echo_time = Some(if i < 2 { 12.0 } else { 4.0 });
        }
        let plan = SequencePlan {
            tag: "grouped".into(),
            components: vec![Component::Magnitude],
            echo_layout: EchoLayout::ByEchoTime,
            min_echoes: MinEchoes::Any,
            invert_slices: false,
            four_d: true,
            composite_name: "4d_multiecho".into(),
            save_echo_volumes: false,
            registration: None,
            derived: vec![],
            series_arity: SeriesArity::One,
        };
        let groups = split_batch(&records, &structure(2, 3), &plan).unwrap();
        let echoes = &groups.components[0].echoes;
        assert_eq!(echoes.len(), 2);
        assert_eq!(echoes[0], vec![2, 3, 4, 5]);
        assert_eq!(echoes[1], vec![0, 1]);
    }
}
