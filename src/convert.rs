//! The conversion pipeline.
//!
//! One [`Converter`] call runs the stages strictly in order: plan lookup,
//! per-instance extraction, structure inference, policy validation,
//! demultiplexing, spatial sorting, stack loading, geometry-corrected
//! assembly, then the optional cross-series registration, derived maps and
//! 4D composition the plan asks for. Stages never overlap and share no
//! mutable state across calls, so independent conversions can run
//! concurrently as long as they use their own sink and work directory.

use std::mem;
use std::path::PathBuf;

use log::{info, warn};

use crate::demux::split_batch;
use crate::derived::{complex_magnitude, porosity_index, suppression_ratio};
use crate::error::ConvertError;
use crate::instance::{InstanceRecord, collect_records};
use crate::loader::StackLoader;
use crate::plan::{Component, DerivedMap, EchoLayout, PlanRegistry, SequencePlan, SeriesArity};
use crate::registration::{RegistrationEngine, coregister_series};
use crate::sort::position_order;
use crate::structure::AcquisitionStructure;
use crate::volume::{Volume, Volume4, join_echoes, stack_geometry};

/// Input of one conversion call: one file list per acquisition series.
#[derive(Debug, Clone, Default)]
pub struct ConversionRequest {
    pub series: Vec<Vec<PathBuf>>,
    pub options: ConversionOptions,
}

impl ConversionRequest {
    /// Request over a single series.
    pub fn single(paths: Vec<PathBuf>) -> Self {
        ConversionRequest {
            series: vec![paths],
            options: ConversionOptions::default(),
        }
    }

    /// Request over multiple series, in acquisition order.
    pub fn multi(series: Vec<Vec<PathBuf>>) -> Self {
        ConversionRequest {
            series,
            options: ConversionOptions::default(),
        }
    }
}

/// Caller-selected behavior knobs.
#[derive(Debug, Clone)]
pub struct ConversionOptions {
    /// Co-register series when the plan supports it and an engine is set.
    pub coregister: bool,
    /// Root for registration work directories; unique subdirectories are
    /// derived per moving series.
    pub work_dir: PathBuf,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        ConversionOptions {
            coregister: false,
            work_dir: std::env::temp_dir(),
        }
    }
}

/// Assembled volumes of one component: per-echo 3D volumes ascending by echo
/// time, plus the 4D composite when the plan produces one.
#[derive(Debug, Clone)]
pub struct ComponentSet {
    pub component: Component,
    pub echo_times: Vec<f64>,
    pub echoes: Vec<Volume>,
    pub four_d: Option<Volume4>,
}

/// A derived per-voxel map with its observed value range.
#[derive(Debug, Clone)]
pub struct DerivedVolume {
    pub name: String,
    pub volume: Volume,
    pub value_range: (f32, f32),
}

/// Metadata record of one conversion.
#[derive(Debug, Clone)]
pub struct ConversionMeta {
    pub sequence: String,
    pub echo_times: Vec<f64>,
    /// Corrected spacing (through-plane from the slice-thickness chain).
    pub spacing: [f64; 3],
    pub component_labels: Vec<&'static str>,
    pub imaging_frequency: Option<f64>,
}

/// The assembled outputs of one conversion.
#[derive(Debug, Clone)]
pub struct VolumeSet {
    pub components: Vec<ComponentSet>,
    pub derived: Vec<DerivedVolume>,
    pub meta: ConversionMeta,
}

/// Successful conversion: the volume set, every written artifact, and the
/// warnings accumulated across all stages.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub volumes: VolumeSet,
    pub artifacts: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Persistence contract for volumes and plain-text metadata sidecars.
///
/// The engine decides what gets written and under which name; encoding
/// (NIfTI, compression) is entirely the sink's concern.
pub trait VolumeSink {
    fn write_volume(&mut self, name: &str, volume: &Volume) -> Result<PathBuf, ConvertError>;
    fn write_volume_4d(&mut self, name: &str, volume: &Volume4) -> Result<PathBuf, ConvertError>;
    fn write_values(&mut self, name: &str, values: &[f64]) -> Result<PathBuf, ConvertError>;
}

/// Sink that records artifact names and sidecar values without writing
/// anything, for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub root: PathBuf,
    pub volume_names: Vec<String>,
    pub value_files: Vec<(String, Vec<f64>)>,
}

impl VolumeSink for RecordingSink {
    fn write_volume(&mut self, name: &str, _volume: &Volume) -> Result<PathBuf, ConvertError> {
        self.volume_names.push(name.to_string());
        Ok(self.root.join(name))
    }

    fn write_volume_4d(&mut self, name: &str, _volume: &Volume4) -> Result<PathBuf, ConvertError> {
        self.volume_names.push(name.to_string());
        Ok(self.root.join(name))
    }

    fn write_values(&mut self, name: &str, values: &[f64]) -> Result<PathBuf, ConvertError> {
        self.value_files.push((name.to_string(), values.to_vec()));
        Ok(self.root.join(name))
    }
}

/// One component's reassembled series before cross-series steps.
struct SeriesComponent {
    component: Component,
    echo_times: Vec<f64>,
    volumes: Vec<Volume>,
}

struct SeriesVolumes {
    components: Vec<SeriesComponent>,
    imaging_frequency: Option<f64>,
    warnings: Vec<String>,
}

/// Sequence-aware DICOM-to-volume converter.
///
/// Holds the plan registry and the external collaborators; carries no
/// per-conversion state, so one converter can serve many calls.
pub struct Converter<'a> {
    registry: PlanRegistry,
    loader: &'a dyn StackLoader,
    engine: Option<&'a dyn RegistrationEngine>,
}

impl<'a> Converter<'a> {
    pub fn new(loader: &'a dyn StackLoader) -> Self {
        Converter {
            registry: PlanRegistry::standard(),
            loader,
            engine: None,
        }
    }

    /// Replace the plan registry.
    pub fn with_registry(mut self, registry: PlanRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Attach the external registration engine.
    pub fn with_registration_engine(mut self, engine: &'a dyn RegistrationEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Tags of the supported sequence plans.
    pub fn supported_sequences(&self) -> Vec<&str> {
        self.registry.tags()
    }

    /// Convert instance files into the plan's volume set.
    ///
    /// Unreadable instances are dropped with warnings before structural
    /// validation; every structural violation aborts with a typed error and
    /// no further artifacts are written.
    pub fn convert(
        &self,
        tag: &str,
        request: &ConversionRequest,
        sink: &mut dyn VolumeSink,
    ) -> Result<Conversion, ConvertError> {
        let mut warnings = Vec::new();
        let mut batches = Vec::with_capacity(request.series.len());
        for paths in &request.series {
            let (records, extraction_warnings) = collect_records(paths);
            warnings.extend(extraction_warnings);
            batches.push(records);
        }
        self.convert_batches(tag, batches, &request.options, sink, warnings)
    }

    /// Convert pre-extracted record batches (one per series).
    pub fn convert_batches(
        &self,
        tag: &str,
        batches: Vec<Vec<InstanceRecord>>,
        options: &ConversionOptions,
        sink: &mut dyn VolumeSink,
        mut warnings: Vec<String>,
    ) -> Result<Conversion, ConvertError> {
        let plan = self.registry.get(tag)?;
        info!(
            "starting '{}' conversion of {} series",
            plan.tag,
            batches.len()
        );
        check_series_arity(plan, batches.len())?;

        let mut series_results = Vec::with_capacity(batches.len());
        for batch in &batches {
            let result = self.reassemble_series(plan, batch)?;
            warnings.extend(result.warnings.clone());
            series_results.push(result);
        }

        if matches!(plan.series_arity, SeriesArity::ExactlyTwo) {
            return self.finish_paired(plan, series_results, sink, warnings);
        }

        if options.coregister {
            warnings.extend(self.run_registration(plan, &mut series_results, options));
        }

        let imaging_frequency = series_results
            .iter()
            .find_map(|series| series.imaging_frequency);
        let components = pool_series(plan, series_results);
        self.finish_single(plan, components, imaging_frequency, sink, warnings)
    }

    /// Reassemble one series: infer structure, demultiplex, sort, load and
    /// build per-echo volumes with corrected geometry.
    fn reassemble_series(
        &self,
        plan: &SequencePlan,
        records: &[InstanceRecord],
    ) -> Result<SeriesVolumes, ConvertError> {
        if records.is_empty() {
            return Err(ConvertError::InsufficientData);
        }
        let structure =
            AcquisitionStructure::analyze(records)?.with_component_count(plan.components.len());
        plan.check_structure(&structure)?;
        let mut warnings = structure.warnings.clone();
        info!(
            "series layout: {} echo(es), {} slice(s) per echo, {} component(s)",
            structure.echo_count, structure.slices_per_echo, structure.component_count
        );

        let groups = split_batch(records, &structure, plan)?;

        let mut components = Vec::with_capacity(groups.components.len());
        for group in &groups.components {
            let mut pairs: Vec<(f64, Volume)> = Vec::with_capacity(group.echoes.len());
            for echo_indices in &group.echoes {
                let members: Vec<&InstanceRecord> =
                    echo_indices.iter().map(|&index| &records[index]).collect();
                let mut ordered: Vec<&InstanceRecord> = if groups.spatially_ordered {
                    members
                } else {
                    let order = position_order(&members);
                    order.into_iter().map(|index| members[index]).collect()
                };
                if plan.invert_slices {
                    ordered.reverse();
                }

                let echo_time = ordered
                    .first()
                    .and_then(|record| record.echo_time)
                    .unwrap_or(0.0);
                let paths: Vec<PathBuf> =
                    ordered.iter().map(|record| record.path.clone()).collect();
                let data = self.loader.load_stack(&paths)?;
                let geometry = stack_geometry(&ordered, None, &mut warnings);
                pairs.push((echo_time, Volume::new(data, geometry)));
            }
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

            let (echo_times, volumes): (Vec<f64>, Vec<Volume>) = pairs.into_iter().unzip();
            components.push(SeriesComponent {
                component: group.component,
                echo_times,
                volumes,
            });
        }

        let imaging_frequency = records.iter().find_map(|record| record.imaging_frequency);
        Ok(SeriesVolumes {
            components,
            imaging_frequency,
            warnings,
        })
    }

    /// Cross-series registration step; recoverable failures become warnings.
    fn run_registration(
        &self,
        plan: &SequencePlan,
        series_results: &mut [SeriesVolumes],
        options: &ConversionOptions,
    ) -> Vec<String> {
        let Some(kind) = plan.registration else {
            let message = format!("plan '{}' defines no registration, ignoring", plan.tag);
            warn!("{message}");
            return vec![message];
        };
        if series_results.len() < 2 {
            return Vec::new();
        }
        let Some(engine) = self.engine else {
            let message = "no registration engine configured, skipping co-registration".to_string();
            warn!("{message}");
            return vec![message];
        };

        let mut echo_sets: Vec<Vec<Volume>> = series_results
            .iter_mut()
            .map(|series| mem::take(&mut series.components[0].volumes))
            .collect();
        let warnings = coregister_series(engine, &mut echo_sets, kind, &options.work_dir);
        for (series, echoes) in series_results.iter_mut().zip(echo_sets) {
            series.components[0].volumes = echoes;
        }
        warnings
    }

    /// Derived maps, 4D composition and artifact writing for the single-set
    /// sequence families.
    fn finish_single(
        &self,
        plan: &SequencePlan,
        components: Vec<SeriesComponent>,
        imaging_frequency: Option<f64>,
        sink: &mut dyn VolumeSink,
        warnings: Vec<String>,
    ) -> Result<Conversion, ConvertError> {
        let mut sets = compose_components(plan, components)?;
        let mut derived = Vec::new();

        for map in &plan.derived {
            match *map {
                DerivedMap::PorosityIndex { target_echo_ms } => {
                    if let Some(volume) = porosity_map(&sets[0], target_echo_ms)? {
                        derived.push(volume);
                    }
                }
                DerivedMap::ComplexMagnitude => {
                    let magnitude = magnitude_set(plan, &sets)?;
                    sets.push(magnitude);
                }
                DerivedMap::SuppressionRatio { .. } => {
                    // Paired-series plans take the finish_paired path.
                }
            }
        }

        let mut artifacts = Vec::new();
        for set in &sets {
            write_component_set(sink, plan, set, sets.len() > 1, "", &mut artifacts)?;
        }
        for map in &derived {
            artifacts.push(sink.write_volume(&format!("{}.nii.gz", map.name), &map.volume)?);
            artifacts.push(sink.write_values(
                &format!("{}_range.txt", map.name),
                &[f64::from(map.value_range.0), f64::from(map.value_range.1)],
            )?);
            info!(
                "{} range: [{:.2}, {:.2}]",
                map.name, map.value_range.0, map.value_range.1
            );
        }

        let meta = build_meta(plan, &sets, imaging_frequency);
        artifacts.push(sink.write_values("echo_times.txt", &meta.echo_times)?);
        artifacts.push(sink.write_values("spacing_wo_gap.txt", &meta.spacing)?);
        if let Some(frequency) = meta.imaging_frequency {
            artifacts.push(sink.write_values("center_freq.txt", &[frequency])?);
        }

        info!(
            "'{}' conversion complete, {} artifact(s)",
            plan.tag,
            artifacts.len()
        );
        Ok(Conversion {
            volumes: VolumeSet {
                components: sets,
                derived,
                meta,
            },
            artifacts,
            warnings,
        })
    }

    /// The paired-series flow: both series are converted independently and
    /// combined into a suppression-ratio map.
    fn finish_paired(
        &self,
        plan: &SequencePlan,
        mut series_results: Vec<SeriesVolumes>,
        sink: &mut dyn VolumeSink,
        warnings: Vec<String>,
    ) -> Result<Conversion, ConvertError> {
        let second = series_results.pop().ok_or(ConvertError::InsufficientData)?;
        let first = series_results.pop().ok_or(ConvertError::InsufficientData)?;

        let first_sets = compose_components(plan, first.components)?;
        let second_sets = compose_components(plan, second.components)?;

        let mut artifacts = Vec::new();
        for (prefix, sets, frequency) in [
            ("uTE", &first_sets, first.imaging_frequency),
            ("IRuTE", &second_sets, second.imaging_frequency),
        ] {
            for set in sets {
                write_component_set(sink, plan, set, false, &format!("{prefix}/"), &mut artifacts)?;
            }
            let times = sets.first().map(|set| set.echo_times.clone()).unwrap_or_default();
            artifacts.push(sink.write_values(&format!("{prefix}/echo_times.txt"), &times)?);
            if let Some(frequency) = frequency {
                artifacts.push(sink.write_values(&format!("{prefix}/center_freq.txt"), &[frequency])?);
            }
        }

        let clip = plan
            .derived
            .iter()
            .find_map(|map| match *map {
                DerivedMap::SuppressionRatio { clip } => Some(clip),
                _ => None,
            })
            .unwrap_or((0.0, 1000.0));

        let numerator = first_sets
            .first()
            .and_then(|set| set.echoes.first())
            .ok_or(ConvertError::InsufficientData)?;
        let denominator = second_sets
            .first()
            .and_then(|set| set.echoes.first())
            .ok_or(ConvertError::InsufficientData)?;

        let ratio = suppression_ratio(&numerator.data, &denominator.data, clip)?;
        let map = DerivedVolume {
            name: "SR_index".into(),
            value_range: value_range(ratio.iter().copied()),
            volume: Volume::new(ratio, numerator.geometry.clone()),
        };
        artifacts.push(sink.write_volume("SR_index.nii.gz", &map.volume)?);
        artifacts.push(sink.write_values(
            "SR_index_range.txt",
            &[f64::from(map.value_range.0), f64::from(map.value_range.1)],
        )?);
        info!(
            "SR index range: [{:.2}, {:.2}]",
            map.value_range.0, map.value_range.1
        );

        let meta = build_meta(plan, &first_sets, first.imaging_frequency);
        let mut components = first_sets;
        components.extend(second_sets);
        Ok(Conversion {
            volumes: VolumeSet {
                components,
                derived: vec![map],
                meta,
            },
            artifacts,
            warnings,
        })
    }
}

fn check_series_arity(plan: &SequencePlan, count: usize) -> Result<(), ConvertError> {
    let expectation = match plan.series_arity {
        SeriesArity::One if count != 1 => Some("exactly one series"),
        SeriesArity::AtLeastOne if count == 0 => Some("at least one series"),
        SeriesArity::ExactlyTwo if count != 2 => Some("exactly two series"),
        _ => None,
    };
    match expectation {
        None => Ok(()),
        Some(expected) => Err(ConvertError::StructureMismatch {
            plan: plan.tag.clone(),
            reason: format!("expected {expected}, got {count}"),
        }),
    }
}

/// Merge per-series components into one component list. Multi-series inputs
/// pool their echoes, ascending by echo time across series.
fn pool_series(plan: &SequencePlan, mut series_results: Vec<SeriesVolumes>) -> Vec<SeriesComponent> {
    if series_results.len() == 1 || matches!(plan.series_arity, SeriesArity::One) {
        return series_results.remove(0).components;
    }

    let component = series_results[0].components[0].component;
    let mut pairs: Vec<(f64, Volume)> = Vec::new();
    for series in series_results {
        for component_set in series.components {
            pairs.extend(
                component_set
                    .echo_times
                    .into_iter()
                    .zip(component_set.volumes),
            );
        }
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let (echo_times, volumes): (Vec<f64>, Vec<Volume>) = pairs.into_iter().unzip();
    vec![SeriesComponent {
        component,
        echo_times,
        volumes,
    }]
}

/// Turn reassembled components into their final sets, joining the 4D
/// composite where the plan produces one.
fn compose_components(
    plan: &SequencePlan,
    components: Vec<SeriesComponent>,
) -> Result<Vec<ComponentSet>, ConvertError> {
    components
        .into_iter()
        .map(|component| {
            let four_d = if plan.four_d && component.volumes.len() > 1 {
                Some(join_echoes(&component.volumes)?)
            } else {
                None
            };
            Ok(ComponentSet {
                component: component.component,
                echo_times: component.echo_times,
                echoes: component.volumes,
                four_d,
            })
        })
        .collect()
}

/// Porosity index over the first component set: first echo against the echo
/// closest to the target echo time.
fn porosity_map(
    set: &ComponentSet,
    target_echo_ms: f64,
) -> Result<Option<DerivedVolume>, ConvertError> {
    if set.echoes.len() < 2 {
        return Ok(None);
    }
    let late_index = set
        .echo_times
        .iter()
        .enumerate()
        .min_by(|a, b| {
            (a.1 - target_echo_ms)
                .abs()
                .total_cmp(&(b.1 - target_echo_ms).abs())
        })
        .map(|(index, _)| index)
        .unwrap_or(set.echoes.len() - 1);
    info!(
        "porosity index from echo at {:.2} ms against the first echo",
        set.echo_times[late_index]
    );

    let early = &set.echoes[0];
    let late = &set.echoes[late_index];
    let index = porosity_index(&early.data, &late.data)?;
    Ok(Some(DerivedVolume {
        name: "PI".into(),
        value_range: value_range(index.iter().copied()),
        volume: Volume::new(index, early.geometry.clone()),
    }))
}

/// In-memory magnitude reconstruction from the real/imaginary components.
fn magnitude_set(
    plan: &SequencePlan,
    sets: &[ComponentSet],
) -> Result<ComponentSet, ConvertError> {
    let real = sets
        .iter()
        .find(|set| set.component == Component::Real)
        .ok_or(ConvertError::InsufficientData)?;
    let imag = sets
        .iter()
        .find(|set| set.component == Component::Imaginary)
        .ok_or(ConvertError::InsufficientData)?;

    let mut volumes = Vec::with_capacity(real.echoes.len());
    for (real_echo, imag_echo) in real.echoes.iter().zip(&imag.echoes) {
        let magnitude = complex_magnitude(&real_echo.data, &imag_echo.data)?;
        volumes.push(Volume::new(magnitude, real_echo.geometry.clone()));
    }

    let four_d = if plan.four_d && volumes.len() > 1 {
        Some(join_echoes(&volumes)?)
    } else {
        None
    };
    Ok(ComponentSet {
        component: Component::Magnitude,
        echo_times: real.echo_times.clone(),
        echoes: volumes,
        four_d,
    })
}

fn write_component_set(
    sink: &mut dyn VolumeSink,
    plan: &SequencePlan,
    set: &ComponentSet,
    multi_component: bool,
    prefix: &str,
    artifacts: &mut Vec<PathBuf>,
) -> Result<(), ConvertError> {
    if let Some(four_d) = &set.four_d {
        let name = if multi_component {
            format!(
                "{prefix}{}_{}.nii.gz",
                plan.composite_name,
                set.component.label()
            )
        } else {
            format!("{prefix}{}.nii.gz", plan.composite_name)
        };
        artifacts.push(sink.write_volume_4d(&name, four_d)?);
    }
    // Echo volumes are persisted individually when the plan says so, and as
    // a fallback whenever no composite exists to carry them.
    if plan.save_echo_volumes || set.four_d.is_none() {
        for (index, (volume, echo_time)) in set.echoes.iter().zip(&set.echo_times).enumerate() {
            let name = if matches!(plan.echo_layout, EchoLayout::ByEchoTime) {
                format!("{prefix}echo_{:02}_TE_{:.2}ms.nii.gz", index + 1, echo_time)
            } else {
                format!("{prefix}echo_{}.nii.gz", index + 1)
            };
            artifacts.push(sink.write_volume(&name, volume)?);
        }
    }
    Ok(())
}

fn build_meta(
    plan: &SequencePlan,
    sets: &[ComponentSet],
    imaging_frequency: Option<f64>,
) -> ConversionMeta {
    let first = sets.first();
    ConversionMeta {
        sequence: plan.tag.clone(),
        echo_times: first.map(|set| set.echo_times.clone()).unwrap_or_default(),
        spacing: first
            .and_then(|set| set.echoes.first())
            .map(|volume| volume.geometry.spacing)
            .unwrap_or([1.0; 3]),
        component_labels: sets.iter().map(|set| set.component.label()).collect(),
        imaging_frequency,
    }
}

fn value_range(values: impl Iterator<Item = f32>) -> (f32, f32) {
    values.fold((f32::INFINITY, f32::NEG_INFINITY), |(low, high), value| {
        (low.min(value), high.max(value))
    })
}
