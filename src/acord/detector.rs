use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::pdf::{PdfDocument, PdfError};

/// Field-name fragments that ACORD certificate templates use.
pub const ACORD_PATTERNS: [&str; 13] = [
    "NamedInsured",
    "Producer_",
    "Policy_GeneralLiability",
    "Policy_AutomobileLiability",
    "Policy_WorkersCompensation",
    "Policy_ExcessLiability",
    "Insurer_FullName",
    "Insurer_NAICCode",
    "CertificateHolder",
    "Vehicle_",
    "WorkersCompensation",
    "GeneralAggregateLimitAmount",
    "EachOccurrenceLimitAmount",
];

const ACORD_25_INDICATORS: [&str; 6] = [
    "certificateholder",
    "generalliability",
    "automobileliability",
    "workerscompensation",
    "excessliability",
    "namedinsured",
];

pub const ACORD_25_LABEL: &str = "ACORD 25 - Certificate of Liability Insurance";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn from_matches(matches: usize) -> Self {
        match matches {
            m if m >= 8 => Confidence::High,
            m if m >= 5 => Confidence::Medium,
            m if m >= 3 => Confidence::Low,
            _ => Confidence::None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub is_fillable: bool,
    pub is_acord: bool,
    pub field_count: usize,
    pub acord_pattern_matches: usize,
    pub confidence: Confidence,
    pub detected_form_type: String,
    pub matched_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResult {
    pub(crate) fn failed(label: &str, error: Option<String>) -> Self {
        Self {
            is_fillable: false,
            is_acord: false,
            field_count: 0,
            acord_pattern_matches: 0,
            confidence: Confidence::None,
            detected_form_type: label.to_string(),
            matched_patterns: Vec::new(),
            error,
        }
    }

    /// Fillable ACORD form detected with medium or high confidence.
    pub fn is_fillable_acord(&self) -> bool {
        self.is_fillable && self.is_acord && self.confidence >= Confidence::Medium
    }
}

pub fn detect_acord_form(path: &Path) -> DetectionResult {
    match PdfDocument::load(path) {
        Ok(doc) => detect_in_document(&doc),
        Err(PdfError::NotFound(_)) => DetectionResult::failed("File not found", Some(format!("File not found: {}", path.display()))),
        Err(e) => DetectionResult::failed("Error reading PDF", Some(e.to_string())),
    }
}

/// Never fails: unreadable documents come back as not fillable with `error` set.
pub fn detect_in_document(doc: &PdfDocument) -> DetectionResult {
    match doc.form_fields() {
        Ok(fields) => {
            let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
            classify_field_names(&names)
        }
        Err(PdfError::NoAcroForm) => DetectionResult::failed("Not a fillable PDF", None),
        Err(e) => DetectionResult::failed("Error reading PDF", Some(e.to_string())),
    }
}

/// Scores a set of field names. Each pattern counts at most once.
pub fn classify_field_names<S: AsRef<str>>(names: &[S]) -> DetectionResult {
    if names.is_empty() {
        return DetectionResult::failed("Not a fillable PDF", None);
    }

    let lowered: Vec<String> = names.iter().map(|n| n.as_ref().to_lowercase()).collect();
    let matched_patterns: Vec<String> = ACORD_PATTERNS
        .iter()
        .filter(|pattern| {
            let needle = pattern.to_lowercase();
            lowered.iter().any(|name| name.contains(&needle))
        })
        .map(|p| p.to_string())
        .collect();

    let matches = matched_patterns.len();
    let confidence = Confidence::from_matches(matches);
    let detected_form_type = match confidence {
        Confidence::High | Confidence::Medium => acord_form_type(&lowered).to_string(),
        Confidence::Low => "Possible ACORD form".to_string(),
        Confidence::None => "Not an ACORD form".to_string(),
    };

    tracing::info!(
        field_count = names.len(),
        matches,
        confidence = ?confidence,
        form_type = %detected_form_type,
        "ACORD detection finished"
    );

    DetectionResult {
        is_fillable: true,
        is_acord: confidence != Confidence::None,
        field_count: names.len(),
        acord_pattern_matches: matches,
        confidence,
        detected_form_type,
        matched_patterns,
        error: None,
    }
}

fn acord_form_type(lowered_names: &[String]) -> &'static str {
    let hits = ACORD_25_INDICATORS
        .iter()
        .filter(|ind| lowered_names.iter().any(|name| name.contains(*ind)))
        .count();
    if hits >= 4 {
        ACORD_25_LABEL
    } else {
        "ACORD Form (type undetermined)"
    }
}
