//! # DICOM multi-echo reassembly library
//!
//! This crate reassembles flat streams of individually stored DICOM image
//! instances into multi-echo 3D and 4D volumes.
//!
//! This library is part of the dicom-rs ecosystem and leverages its
//! components for metadata and pixel access. A scanner writes one file per
//! slice; how many echoes, complex components and slices that stream
//! represents is encoded only in per-instance metadata, and the interleave
//! convention differs per sequence family. The crate infers the acquisition
//! structure from the metadata, demultiplexes the stream according to a
//! declarative [`SequencePlan`], sorts each group spatially, assembles
//! geometry-corrected volumes and computes the derived per-voxel maps and
//! cross-series alignment the plan calls for. Supported sequence families:
//!  - MESE (multi-echo spin echo)
//!  - DESS (dual echo steady state)
//!  - MEGRE and IDEAL complex acquisitions
//!  - UTE, including multi-series co-registration and porosity mapping
//!  - UTE/IR-UTE suppression-ratio pairs
//!  - a general converter grouping any multi-echo series by echo time
//!
//! Byte-level DICOM parsing, pixel decoding, NIfTI encoding and the
//! registration optimizer are external collaborators: the first two come
//! from dicom-rs, the last two sit behind the [`VolumeSink`] and
//! [`RegistrationEngine`] traits.
//!
//! # Examples
//!
//! ## Converting a multi-echo spin-echo series
//!
//! Reassemble all instances of a MESE acquisition into per-echo volumes and
//! a 4D composite, recording artifact names without writing files.
//!
//! ```no_run
//! # use dicom_multiecho::{Converter, ConversionRequest, DicomStackLoader, RecordingSink};
//! # use std::path::PathBuf;
//! let paths: Vec<PathBuf> = (1..=40)
//!     .map(|i| PathBuf::from(format!("dicom/IM-{i:04}.dcm")))
//!     .collect();
//! let loader = DicomStackLoader;
//! let converter = Converter::new(&loader);
//! let mut sink = RecordingSink::default();
//! let conversion = converter
//!     .convert("mese", &ConversionRequest::single(paths), &mut sink)
//!     .expect("should have reassembled the series");
//! println!(
//!     "{} echoes at {:?} ms",
//!     conversion.volumes.meta.echo_times.len(),
//!     conversion.volumes.meta.echo_times
//! );
//! ```

pub mod convert;
pub mod demux;
pub mod derived;
pub mod error;
pub mod instance;
pub mod loader;
pub mod plan;
pub mod registration;
pub mod sort;
pub mod structure;
pub mod volume;

pub use convert::{
    ComponentSet, Conversion, ConversionMeta, ConversionOptions, ConversionRequest, Converter,
    DerivedVolume, RecordingSink, VolumeSet, VolumeSink,
};
pub use error::ConvertError;
pub use instance::{InstanceRecord, collect_records};
pub use loader::{DicomStackLoader, StackLoader};
pub use plan::{
    Component, DerivedMap, EchoLayout, MinEchoes, PlanRegistry, RegistrationKind, SequencePlan,
    SeriesArity,
};
pub use registration::{RegistrationEngine, SpatialTransform};
pub use structure::AcquisitionStructure;
pub use volume::{Geometry, Volume, Volume4};
