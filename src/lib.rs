pub mod acord;
pub mod config;
pub mod llm;
pub mod ops;
pub mod pdf;
pub mod rag;
pub mod rules;
pub mod universal;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which path produced an extraction result.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    AcordHybrid,
    UniversalAi,
    FormFieldsOnly,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtractionMethod::AcordHybrid => "acord_hybrid",
            ExtractionMethod::UniversalAi => "universal_ai",
            ExtractionMethod::FormFieldsOnly => "form_fields_only",
        })
    }
}
