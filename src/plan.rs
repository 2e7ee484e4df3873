//! Sequence plans and their registry.
//!
//! Every sequence family differs only in declarative policy: how components
//! and echoes are interleaved in the flat instance stream, how many echoes
//! are required, whether a 4D composite is produced, and which derived maps
//! and cross-series steps apply. Encoding those choices as a [`SequencePlan`]
//! keeps the demultiplexer, assembler and analyzer generic; supporting a new
//! sequence is a new registry row, not a new type.

use crate::error::ConvertError;
use crate::structure::AcquisitionStructure;

/// Signal component of a complex-capable acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Magnitude,
    Real,
    Imaginary,
}

impl Component {
    /// Short label used for artifact naming and metadata.
    pub fn label(self) -> &'static str {
        match self {
            Component::Magnitude => "mag",
            Component::Real => "real",
            Component::Imaginary => "imag",
        }
    }
}

/// How echoes of one component are laid out in the flat instance stream.
///
/// Acquisition hardware nests echo loops inside component loops for all
/// supported families, so component striding is always applied before echo
/// grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoLayout {
    /// Echo e is every `echo_count`-th instance starting at offset e.
    Strided,
    /// Echo e is the e-th contiguous block of `slices_per_echo` instances.
    Contiguous,
    /// The series is position-sorted first; echoes then alternate slice by
    /// slice in the sorted order.
    PositionInterleaved,
    /// Instances are grouped by their exact echo time, groups ascending.
    ByEchoTime,
}

/// Echo-count requirement a plan imposes on the inferred structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinEchoes {
    Any,
    AtLeast(usize),
    Exactly(usize),
}

/// How many instance series one conversion call consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesArity {
    One,
    AtLeastOne,
    ExactlyTwo,
}

/// Registration model requested from the external engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    Rigid,
    Affine,
}

/// Per-voxel map derived from assembled volumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DerivedMap {
    /// Late-echo / early-echo ratio x 100, clipped to [0, 100]. The late
    /// echo is the one whose echo time is closest to `target_echo_ms`.
    PorosityIndex { target_echo_ms: f64 },
    /// First-series / second-series first-echo ratio, clipped to `clip`.
    SuppressionRatio { clip: (f32, f32) },
    /// sqrt(real^2 + imag^2) over the real/imaginary components, unclipped.
    ComplexMagnitude,
}

/// Immutable conversion policy for one sequence family.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencePlan {
    pub tag: String,
    /// Component order in the instance stream; the stride is the length.
    pub components: Vec<Component>,
    pub echo_layout: EchoLayout,
    pub min_echoes: MinEchoes,
    /// Reverse each echo's final sorted slice order before assembly.
    pub invert_slices: bool,
    /// Join per-echo volumes along a trailing echo axis.
    pub four_d: bool,
    /// File stem of the 4D composite artifact.
    pub composite_name: String,
    /// Persist each echo volume individually in addition to any composite.
    pub save_echo_volumes: bool,
    /// Cross-series registration support; applied when the input carries
    /// multiple series and an engine is available.
    pub registration: Option<RegistrationKind>,
    pub derived: Vec<DerivedMap>,
    pub series_arity: SeriesArity,
}

impl SequencePlan {
    /// Derive a plan whose per-echo slice order is inverted, for hardware
    /// that writes slices in descending spatial order.
    pub fn with_inverted_slices(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self.invert_slices = true;
        self
    }

    /// Enforce this plan's echo-count requirement on an inferred structure.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::StructureMismatch`] when the requirement is
    /// violated.
    pub fn check_structure(&self, structure: &AcquisitionStructure) -> Result<(), ConvertError> {
        let found = structure.echo_count;
        let reason = match self.min_echoes {
            MinEchoes::Any => return Ok(()),
            MinEchoes::AtLeast(n) if found >= n => return Ok(()),
            MinEchoes::Exactly(n) if found == n => return Ok(()),
            MinEchoes::AtLeast(n) => format!("requires at least {n} echoes, found {found}"),
            MinEchoes::Exactly(n) => format!("requires exactly {n} echoes, found {found}"),
        };
        Err(ConvertError::StructureMismatch {
            plan: self.tag.clone(),
            reason,
        })
    }
}

/// Explicit, constructed table of sequence plans.
///
/// Call sites receive the registry as a value; there is no process-wide
/// mutable table, which keeps concurrent conversion calls isolated.
#[derive(Debug, Clone)]
pub struct PlanRegistry {
    plans: Vec<SequencePlan>,
}

impl PlanRegistry {
    /// Registry with the built-in sequence families.
    pub fn standard() -> Self {
        let magnitude_only = vec![Component::Magnitude];
        let plans = vec![
            SequencePlan {
                tag: "mese".into(),
                components: magnitude_only.clone(),
                echo_layout: EchoLayout::Strided,
                min_echoes: MinEchoes::AtLeast(2),
                invert_slices: false,
                four_d: true,
                composite_name: "4d_array".into(),
                save_echo_volumes: false,
                registration: None,
                derived: vec![],
                series_arity: SeriesArity::One,
            },
            SequencePlan {
                tag: "dess".into(),
                components: magnitude_only.clone(),
                echo_layout: EchoLayout::PositionInterleaved,
                min_echoes: MinEchoes::Exactly(2),
                invert_slices: false,
                four_d: false,
                composite_name: "4d_array".into(),
                save_echo_volumes: true,
                registration: None,
                derived: vec![],
                series_arity: SeriesArity::One,
            },
            SequencePlan {
                tag: "megre".into(),
                components: vec![Component::Magnitude, Component::Real, Component::Imaginary],
                echo_layout: EchoLayout::Strided,
                min_echoes: MinEchoes::AtLeast(2),
                invert_slices: false,
                four_d: true,
                composite_name: "4d_array".into(),
                save_echo_volumes: false,
                registration: None,
                derived: vec![],
                series_arity: SeriesArity::One,
            },
            SequencePlan {
                tag: "ideal".into(),
                components: vec![Component::Real, Component::Imaginary],
                echo_layout: EchoLayout::Strided,
                min_echoes: MinEchoes::AtLeast(2),
                invert_slices: false,
                four_d: true,
                composite_name: "4d_array".into(),
                save_echo_volumes: false,
                registration: None,
                derived: vec![DerivedMap::ComplexMagnitude],
                series_arity: SeriesArity::One,
            },
            SequencePlan {
                tag: "ute".into(),
                components: magnitude_only.clone(),
                echo_layout: EchoLayout::Contiguous,
                min_echoes: MinEchoes::Any,
                invert_slices: false,
                four_d: true,
                composite_name: "4d_array".into(),
                save_echo_volumes: false,
                registration: Some(RegistrationKind::Rigid),
                derived: vec![DerivedMap::PorosityIndex { target_echo_ms: 2.2 }],
                series_arity: SeriesArity::AtLeastOne,
            },
            SequencePlan {
                tag: "ute_sr".into(),
                components: magnitude_only.clone(),
                echo_layout: EchoLayout::Contiguous,
                min_echoes: MinEchoes::Any,
                invert_slices: false,
                four_d: true,
                composite_name: "4d_array".into(),
                save_echo_volumes: false,
                registration: None,
                derived: vec![DerivedMap::SuppressionRatio { clip: (0.0, 1000.0) }],
                series_arity: SeriesArity::ExactlyTwo,
            },
            SequencePlan {
                tag: "general_echo".into(),
                components: magnitude_only,
                echo_layout: EchoLayout::ByEchoTime,
                min_echoes: MinEchoes::Any,
                invert_slices: false,
                four_d: true,
                composite_name: "4d_multiecho".into(),
                save_echo_volumes: true,
                registration: None,
                derived: vec![],
                series_arity: SeriesArity::One,
            },
        ];
        PlanRegistry { plans }
    }

    /// Registry without any plans, for callers that only use custom rows.
    pub fn empty() -> Self {
        PlanRegistry { plans: Vec::new() }
    }

    /// Add or replace a plan; tags compare case-insensitively.
    pub fn register(&mut self, plan: SequencePlan) {
        self.plans
            .retain(|existing| !existing.tag.eq_ignore_ascii_case(&plan.tag));
        self.plans.push(plan);
    }

    /// Case-insensitive plan lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::UnsupportedSequence`] enumerating the known
    /// tags when no plan matches.
    pub fn get(&self, tag: &str) -> Result<&SequencePlan, ConvertError> {
        self.plans
            .iter()
            .find(|plan| plan.tag.eq_ignore_ascii_case(tag))
            .ok_or_else(|| ConvertError::UnsupportedSequence {
                tag: tag.to_string(),
                supported: self.tags().join(", "),
            })
    }

    /// Tags of every registered plan, in registration order.
    pub fn tags(&self) -> Vec<&str> {
        self.plans.iter().map(|plan| plan.tag.as_str()).collect()
    }
}
