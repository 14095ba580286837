//! Extraction for PDFs that are not fillable ACORD forms: direct text and
//! OCR race each other, then one LLM call structures the result.

pub mod ocr;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::acord::fields::{extract_form_fields_from_path, FieldExtraction};
use crate::llm::{parse_json_object, CompletionRequest, CompletionService, Usage};
use crate::pdf::{extract_text_fallback, PdfDocument, PdfError};
use crate::ExtractionMethod;

pub use ocr::{OcrError, TesseractOcr};

/// Direct text shorter than this (trimmed, in chars) falls through to OCR.
pub const MIN_DIRECT_TEXT_CHARS: usize = 50;

pub const NOT_FOUND: &str = "PDF file not found";
pub const NO_EXTRACTABLE_DATA: &str =
    "No text could be extracted. Document may be image-only without readable text.";

const SYSTEM_PROMPT: &str =
    "You are an expert document analyst. You extract every meaningful piece of data from documents and return ONLY valid JSON.";

#[derive(Debug, Error)]
pub enum UniversalError {
    #[error("{}", NOT_FOUND)]
    NotFound(PathBuf),

    #[error("{}", NO_EXTRACTABLE_DATA)]
    NoExtractableData,

    #[error("AI extraction failed: {0}")]
    Llm(String),
}

#[derive(Debug, Error)]
pub enum TextSourceError {
    #[error(transparent)]
    Pdf(#[from] PdfError),

    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error("text extraction task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageText {
    pub text: String,
    pub page_count: usize,
}

/// One way of turning a PDF into page-labelled text.
#[async_trait]
pub trait TextSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, pdf_path: &Path, dpi: u32, max_pages: usize) -> Result<PageText, TextSourceError>;
}

/// `--- PAGE n ---` blocks for every non-empty page, numbered by position.
pub fn label_pages<S: AsRef<str>>(pages: &[S]) -> String {
    pages
        .iter()
        .enumerate()
        .filter(|(_, text)| !text.as_ref().trim().is_empty())
        .map(|(i, text)| format!("--- PAGE {} ---\n{}\n", i + 1, text.as_ref().trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Text layer of the PDF via lopdf, falling back to pdf-extract when no page
/// yields anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfTextSource;

#[async_trait]
impl TextSource for PdfTextSource {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn extract(&self, pdf_path: &Path, _dpi: u32, max_pages: usize) -> Result<PageText, TextSourceError> {
        let path = pdf_path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<PageText, TextSourceError> {
            let bytes = std::fs::read(&path).map_err(PdfError::from)?;
            let doc = PdfDocument::load_mem(&bytes)?;
            let page_count = doc.page_count();
            let text = label_pages(&doc.page_texts(max_pages));
            if !text.trim().is_empty() {
                return Ok(PageText { text, page_count });
            }
            let fallback = extract_text_fallback(&bytes)?;
            Ok(PageText { text: fallback, page_count })
        })
        .await
        .map_err(|e| TextSourceError::Task(e.to_string()))?
    }
}

/// Aborts the task when dropped, so an early return never leaves the
/// losing branch running.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct UniversalExtraction {
    pub formatted_data: Value,
    pub document_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub extraction_method: ExtractionMethod,
    pub page_count: usize,
}

pub struct UniversalExtractor {
    llm: Arc<dyn CompletionService>,
    direct: Arc<dyn TextSource>,
    ocr: Arc<dyn TextSource>,
    max_pages: usize,
}

impl UniversalExtractor {
    pub fn new(llm: Arc<dyn CompletionService>, max_pages: usize) -> Self {
        Self::with_sources(llm, Arc::new(PdfTextSource), Arc::new(TesseractOcr::default()), max_pages)
    }

    pub fn with_sources(
        llm: Arc<dyn CompletionService>,
        direct: Arc<dyn TextSource>,
        ocr: Arc<dyn TextSource>,
        max_pages: usize,
    ) -> Self {
        Self { llm, direct, ocr, max_pages: max_pages.max(1) }
    }

    pub async fn extract(&self, pdf_path: &Path, dpi: u32) -> Result<UniversalExtraction, UniversalError> {
        if !pdf_path.exists() {
            return Err(UniversalError::NotFound(pdf_path.to_path_buf()));
        }
        tracing::info!(file = %pdf_path.display(), dpi, "Universal extraction started");

        let path = pdf_path.to_path_buf();
        let form_fields = tokio::task::spawn_blocking(move || extract_form_fields_from_path(&path))
            .await
            .unwrap_or_default();
        let has_form_fields = form_fields.success && form_fields.field_count > 0;

        let PageText { text, page_count } = self.race_text(pdf_path, dpi).await;

        if text.trim().is_empty() && !has_form_fields {
            tracing::warn!(file = %pdf_path.display(), "Nothing extractable by any method");
            return Err(UniversalError::NoExtractableData);
        }

        let context = build_context(&text, has_form_fields.then_some(&form_fields));
        match self.structure(&context).await {
            Ok(structured) => Ok(UniversalExtraction { page_count, ..structured }),
            Err(e) if has_form_fields => {
                tracing::warn!("AI structuring failed, returning raw form fields: {}", e);
                Ok(UniversalExtraction {
                    formatted_data: form_fields_value(&form_fields),
                    document_type: "Unknown".to_string(),
                    certificate_type: None,
                    tokens_used: None,
                    model: None,
                    extraction_method: ExtractionMethod::FormFieldsOnly,
                    page_count,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Runs direct extraction and OCR concurrently. Direct text wins when it
    /// clears [`MIN_DIRECT_TEXT_CHARS`]; the OCR task is then aborted.
    async fn race_text(&self, pdf_path: &Path, dpi: u32) -> PageText {
        let mut direct_task = self.spawn_source(self.direct.clone(), pdf_path, dpi);
        let mut ocr_task = self.spawn_source(self.ocr.clone(), pdf_path, dpi);

        let direct = settle(self.direct.name(), (&mut direct_task.0).await);
        if direct.text.trim().chars().count() > MIN_DIRECT_TEXT_CHARS {
            ocr_task.0.abort();
            tracing::info!(branch = self.direct.name(), chars = direct.text.len(), "Direct text sufficient, OCR cancelled");
            return direct;
        }

        tracing::info!(branch = self.ocr.name(), "Direct text insufficient, waiting for OCR");
        let ocr = settle(self.ocr.name(), (&mut ocr_task.0).await);
        PageText {
            page_count: ocr.page_count.max(direct.page_count),
            text: ocr.text,
        }
    }

    fn spawn_source(&self, source: Arc<dyn TextSource>, pdf_path: &Path, dpi: u32) -> AbortOnDrop<Result<PageText, TextSourceError>> {
        let path = pdf_path.to_path_buf();
        let max_pages = self.max_pages;
        AbortOnDrop(tokio::spawn(async move { source.extract(&path, dpi, max_pages).await }))
    }

    async fn structure(&self, context: &str) -> Result<UniversalExtraction, UniversalError> {
        let request = CompletionRequest::new(SYSTEM_PROMPT, build_extraction_prompt(context))
            .temperature(0.0)
            .json();
        let completion = self
            .llm
            .complete(request)
            .await
            .map_err(|e| UniversalError::Llm(e.to_string()))?;
        let parsed = parse_json_object(&completion.content)
            .ok_or_else(|| UniversalError::Llm("response did not contain a JSON object".to_string()))?;
        let (document_type, certificate_type, formatted_data) = split_structured(parsed);

        Ok(UniversalExtraction {
            formatted_data,
            document_type,
            certificate_type,
            tokens_used: completion.usage,
            model: Some(completion.model),
            extraction_method: ExtractionMethod::UniversalAi,
            page_count: 0,
        })
    }
}

fn settle(branch: &str, joined: Result<Result<PageText, TextSourceError>, tokio::task::JoinError>) -> PageText {
    match joined {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            tracing::warn!(branch, "Text extraction failed: {}", e);
            PageText::default()
        }
        Err(e) => {
            tracing::warn!(branch, "Text extraction task did not finish: {}", e);
            PageText::default()
        }
    }
}

/// Splits the model reply into document type, certificate type and data.
fn split_structured(mut parsed: Map<String, Value>) -> (String, Option<String>, Value) {
    let document_type = match parsed.shift_remove("document_type") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => "Document".to_string(),
    };
    let certificate_type = match parsed.shift_remove("certificate_type") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    };

    let data = match parsed.shift_remove("sections") {
        Some(sections @ Value::Object(_)) => sections,
        _ => {
            parsed.shift_remove("success");
            parsed.shift_remove("error");
            Value::Object(parsed)
        }
    };
    (document_type, certificate_type, data)
}

fn form_fields_value(fields: &FieldExtraction) -> Value {
    let mut text_fields = Map::new();
    for (name, value) in &fields.fields {
        text_fields.insert(name.clone(), value.clone().map(Value::String).unwrap_or(Value::Null));
    }
    let mut checkboxes = Map::new();
    for (name, checked) in &fields.checkboxes {
        checkboxes.insert(name.clone(), Value::Bool(*checked));
    }
    let mut radio_buttons = Map::new();
    for (name, value) in &fields.radio_buttons {
        radio_buttons.insert(name.clone(), value.clone().map(Value::String).unwrap_or(Value::Null));
    }

    let mut out = Map::new();
    out.insert("text_fields".to_string(), Value::Object(text_fields));
    out.insert("checkboxes".to_string(), Value::Object(checkboxes));
    out.insert("radio_buttons".to_string(), Value::Object(radio_buttons));
    Value::Object(out)
}

fn readable_field_name(name: &str) -> String {
    name.replace(['[', ']'], "").replace('.', " ")
}

/// Document text followed by form field and checkbox sections.
pub fn build_context(text: &str, form_fields: Option<&FieldExtraction>) -> String {
    let mut parts = Vec::new();
    if !text.trim().is_empty() {
        parts.push(format!("=== DOCUMENT TEXT ===\n{}", text.trim()));
    }

    if let Some(fields) = form_fields {
        let values: Vec<String> = fields
            .fields
            .iter()
            .map(|(name, value)| format!("{}: {}", readable_field_name(name), value.as_deref().unwrap_or("")))
            .collect();
        if !values.is_empty() {
            parts.push(format!("=== FORM FIELD VALUES ===\n{}", values.join("\n")));
        }

        let boxes: Vec<String> = fields
            .checkboxes
            .iter()
            .map(|(name, checked)| {
                format!("{}: {}", readable_field_name(name), if *checked { "CHECKED" } else { "UNCHECKED" })
            })
            .collect();
        if !boxes.is_empty() {
            parts.push(format!("=== CHECKBOX VALUES ===\n{}", boxes.join("\n")));
        }
    }

    parts.join("\n\n")
}

fn build_extraction_prompt(context: &str) -> String {
    format!(
        r#"Analyze the document below and extract all of its data as structured JSON.

RETURN FORMAT:
{{
  "document_type": "Certificate | Invoice | Contract | Report | ...",
  "certificate_type": "specific certificate name if the document is a certificate, otherwise null",
  "sections": {{
    "<section name>": {{"<field>": "<value>"}}
  }}
}}

RULES:
1. Group related values into named sections that follow the document's own layout.
2. Keep tables as arrays of objects. List products or items under a "products" key.
3. Copy values exactly as written. Use null for empty values and never invent data.
4. Checked boxes are selected options; unchecked boxes are not.

DOCUMENT:
{context}"#
    )
}
