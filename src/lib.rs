//! COCO to Supervisely converter
//!
//! This library converts COCO datasets (instances and optional captions) into a
//! Supervisely project: a shared `meta.json` plus per-dataset `img/` and `ann/`.

pub mod coco;
pub mod config;
pub mod conversion;
pub mod dataset;
pub mod error;
pub mod geometry;
pub mod io;
pub mod rle;
pub mod schema;
pub mod types;
pub mod utils;

// Re-export commonly used types and functions
pub use config::{Args, ConvertOptions, DatasetMode};
pub use dataset::{run_conversion, DatasetReport, JobSummary};
pub use error::{ConvertError, GeometryError};
pub use schema::Schema;
pub use types::{Geometry, Label, ObjectClass, ShapeKind, TargetAnnotation};
