use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::detector::{detect_in_document, DetectionResult};
use super::fields::{extract_form_fields, FieldExtraction};
use super::formatter::{CoverageFormatter, OrganizedResult};
use super::mapping::{DirectMapper, FieldMappingTable};
use super::organizer::AcordOrganizer;
use crate::llm::{CompletionService, Usage};
use crate::pdf::PdfDocument;
use crate::ExtractionMethod;

pub const NOT_FILLABLE: &str = "PDF is not a fillable form. Use universal extraction instead.";
pub const NO_FIELDS: &str = "No fields extracted from PDF";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Detecting,
    Extracting,
    Mapping,
    Organizing,
    Formatting,
    Done,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    NotFillable,
    ExtractionFailed(String),
    NoFields,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NotFillable => f.write_str(NOT_FILLABLE),
            AbortReason::ExtractionFailed(e) => f.write_str(e),
            AbortReason::NoFields => f.write_str(NO_FIELDS),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Done,
    Aborted { at: PipelineStage, reason: AbortReason },
}

#[derive(Serialize, Debug, Clone)]
pub struct PipelineOutcome {
    pub success: bool,
    pub pdf_file: String,
    pub extraction_method: ExtractionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organizer_error: Option<String>,
    pub state: PipelineState,
    #[serde(skip)]
    pub detection: Option<DetectionResult>,
    #[serde(skip)]
    pub page_count: usize,
}

impl PipelineOutcome {
    fn aborted(pdf_file: &str, at: PipelineStage, reason: AbortReason, detection: Option<DetectionResult>) -> Self {
        tracing::warn!(file = %pdf_file, stage = ?at, "ACORD pipeline aborted: {}", reason);
        Self {
            success: false,
            pdf_file: pdf_file.to_string(),
            extraction_method: ExtractionMethod::AcordHybrid,
            formatted_data: None,
            tokens_used: None,
            error: Some(reason.to_string()),
            organizer_error: None,
            state: PipelineState::Aborted { at, reason },
            detection,
            page_count: 0,
        }
    }
}

/// Detect, extract, direct-map, organize and format a fillable ACORD form.
pub struct AcordPipeline {
    mapper: DirectMapper,
    organizer: AcordOrganizer,
    formatter: CoverageFormatter,
}

impl AcordPipeline {
    pub fn new(table: Arc<FieldMappingTable>, llm: Arc<dyn CompletionService>) -> Self {
        Self {
            mapper: DirectMapper::new(table),
            organizer: AcordOrganizer::new(llm),
            formatter: CoverageFormatter,
        }
    }

    pub fn mapper(&self) -> &DirectMapper {
        &self.mapper
    }

    pub async fn process(&self, pdf_path: &Path) -> PipelineOutcome {
        let pdf_file = pdf_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = pdf_path.to_path_buf();

        tracing::info!(file = %pdf_file, stage = ?PipelineStage::Detecting, "ACORD pipeline started");
        let parsed = tokio::task::spawn_blocking(move || -> Result<(DetectionResult, FieldExtraction, usize), DetectionResult> {
            let doc = match PdfDocument::load(&path) {
                Ok(doc) => doc,
                Err(_) => return Err(super::detector::detect_acord_form(&path)),
            };
            let detection = detect_in_document(&doc);
            let extraction = if detection.is_fillable {
                extract_form_fields(&doc)
            } else {
                FieldExtraction::default()
            };
            Ok((detection, extraction, doc.page_count()))
        })
        .await;

        let (detection, extraction, page_count) = match parsed {
            Ok(Ok(parts)) => parts,
            Ok(Err(detection)) => {
                return PipelineOutcome::aborted(&pdf_file, PipelineStage::Detecting, AbortReason::NotFillable, Some(detection))
            }
            Err(e) => {
                return PipelineOutcome::aborted(
                    &pdf_file,
                    PipelineStage::Extracting,
                    AbortReason::ExtractionFailed(format!("PDF parsing task failed: {}", e)),
                    None,
                )
            }
        };

        let mut outcome = self.run_stages(&pdf_file, detection, extraction).await;
        outcome.page_count = page_count;
        outcome
    }

    /// Runs everything after PDF parsing. Split out so callers holding a
    /// parsed document (or tests) can drive the stages directly.
    pub async fn run_stages(
        &self,
        pdf_file: &str,
        detection: DetectionResult,
        extraction: FieldExtraction,
    ) -> PipelineOutcome {
        if !detection.is_fillable {
            return PipelineOutcome::aborted(pdf_file, PipelineStage::Detecting, AbortReason::NotFillable, Some(detection));
        }

        tracing::info!(file = %pdf_file, stage = ?PipelineStage::Extracting, fields = extraction.field_count);
        if !extraction.success {
            let reason = extraction.error.unwrap_or_else(|| "Failed to extract form fields".to_string());
            return PipelineOutcome::aborted(
                pdf_file,
                PipelineStage::Extracting,
                AbortReason::ExtractionFailed(reason),
                Some(detection),
            );
        }
        let raw_fields = extraction.to_raw_field_map();
        if raw_fields.is_empty() {
            return PipelineOutcome::aborted(pdf_file, PipelineStage::Extracting, AbortReason::NoFields, Some(detection));
        }

        tracing::info!(file = %pdf_file, stage = ?PipelineStage::Mapping, fields = raw_fields.len());
        let mapped = self.mapper.map(&raw_fields);

        tracing::info!(file = %pdf_file, stage = ?PipelineStage::Organizing, unmapped = mapped.unmapped.len());
        let organized = self.organizer.organize_unformatted(&mapped.unmapped).await;

        tracing::info!(file = %pdf_file, stage = ?PipelineStage::Formatting);
        let merged = OrganizedResult {
            coverage: mapped.coverage,
            unformatted_data: organized.unformatted_data,
        };
        let formatted = self.formatter.format(&merged);

        tracing::info!(file = %pdf_file, stage = ?PipelineStage::Done, "ACORD pipeline finished");
        PipelineOutcome {
            success: true,
            pdf_file: pdf_file.to_string(),
            extraction_method: ExtractionMethod::AcordHybrid,
            formatted_data: Some(formatted.into_value()),
            tokens_used: organized.tokens_used,
            error: None,
            organizer_error: organized.error,
            state: PipelineState::Done,
            detection: Some(detection),
            page_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acord::detector::classify_field_names;
    use crate::llm::{Completion, CompletionRequest, LlmError};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedLlm(Option<&'static str>);

    #[async_trait]
    impl CompletionService for FixedLlm {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
            match self.0 {
                Some(content) => Ok(Completion { content: content.to_string(), usage: None, model: "fixed".into() }),
                None => Err(LlmError::Server { status: 500, body: "boom".into() }),
            }
        }

        fn model_name(&self) -> String {
            "fixed".into()
        }
    }

    fn pipeline(llm: FixedLlm) -> AcordPipeline {
        let table = FieldMappingTable::from_pairs(vec![
            ("GeneralLiability_EachOccurrence_LimitAmount_A".to_string(), "general_liability.each_occurrence".to_string()),
            ("GeneralLiability_OccurrenceIndicator_A".to_string(), "general_liability.occurrence".to_string()),
            ("NamedInsured_FullName_A".to_string(), "insured.name".to_string()),
        ])
        .unwrap();
        AcordPipeline::new(Arc::new(table), Arc::new(llm))
    }

    fn extraction() -> FieldExtraction {
        let mut e = FieldExtraction { success: true, ..Default::default() };
        e.fields.insert("GeneralLiability_EachOccurrence_LimitAmount_A".into(), Some("1,000,000".into()));
        e.fields.insert("NamedInsured_FullName_A".into(), Some("Acme LLC".into()));
        e.checkboxes.insert("GeneralLiability_OccurrenceIndicator_A".into(), true);
        e.field_count = 3;
        e
    }

    fn fillable() -> DetectionResult {
        classify_field_names(&["NamedInsured", "Producer_", "CertificateHolder", "Insurer_FullName", "Vehicle_"])
    }

    #[tokio::test]
    async fn organizer_failure_still_succeeds() {
        let outcome = pipeline(FixedLlm(None)).run_stages("cert.pdf", fillable(), extraction()).await;
        assert!(outcome.success);
        assert_eq!(outcome.state, PipelineState::Done);
        assert!(outcome.organizer_error.is_some());
        let data = outcome.formatted_data.unwrap();
        assert_eq!(data["unformatted_data"], json!({}));
        assert_eq!(data["general_liability"]["policy_limits"]["each_occurrence"], "1,000,000");
        assert_eq!(data["general_liability"]["policy_options"]["occurrence"], "Yes");
    }

    #[tokio::test]
    async fn organizer_entities_reach_other_data() {
        let llm = FixedLlm(Some(r#"{"insured": {"name": "Acme LLC", "address": "1 Main St"}}"#));
        let outcome = pipeline(llm).run_stages("cert.pdf", fillable(), extraction()).await;
        let data = outcome.formatted_data.unwrap();
        assert_eq!(data["other_data"]["insured"]["name"], "Acme LLC");
        assert_eq!(outcome.extraction_method, ExtractionMethod::AcordHybrid);
    }

    #[tokio::test]
    async fn not_fillable_aborts_at_detection() {
        let outcome = pipeline(FixedLlm(None))
            .run_stages("scan.pdf", classify_field_names::<&str>(&[]), FieldExtraction::default())
            .await;
        assert!(!outcome.success);
        assert!(outcome.formatted_data.is_none());
        assert_eq!(outcome.error.as_deref(), Some(NOT_FILLABLE));
        assert!(matches!(outcome.state, PipelineState::Aborted { at: PipelineStage::Detecting, .. }));
    }

    #[tokio::test]
    async fn empty_extraction_aborts_with_no_fields() {
        let mut empty = FieldExtraction { success: true, ..Default::default() };
        empty.fields.insert("Blank".into(), None);
        let outcome = pipeline(FixedLlm(None)).run_stages("blank.pdf", fillable(), empty).await;
        assert_eq!(outcome.error.as_deref(), Some(NO_FIELDS));
        assert!(matches!(
            outcome.state,
            PipelineState::Aborted { at: PipelineStage::Extracting, reason: AbortReason::NoFields }
        ));
    }

    #[tokio::test]
    async fn missing_file_aborts() {
        let outcome = pipeline(FixedLlm(None)).process(Path::new("/no/such/cert.pdf")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some(NOT_FILLABLE));
        assert_eq!(outcome.detection.unwrap().detected_form_type, "File not found");
    }
}
