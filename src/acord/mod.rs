//! ACORD certificate hybrid extraction: deterministic mapping for coverage
//! sections, one LLM call for the entity data left over.

pub mod detector;
pub mod fields;
pub mod formatter;
pub mod mapping;
pub mod organizer;
pub mod pipeline;

pub use detector::{detect_acord_form, Confidence, DetectionResult};
pub use fields::{extract_form_fields, FieldExtraction, RawFieldMap};
pub use formatter::{CoverageFormatter, FormattedOutput, OrganizedResult};
pub use mapping::{CoverageSchema, DirectMapper, FieldMappingTable, MappingError, UnmappedFieldSet};
pub use organizer::{AcordOrganizer, OrganizerOutcome};
pub use pipeline::{AcordPipeline, PipelineOutcome, PipelineStage, PipelineState};
