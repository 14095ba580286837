use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::acord::detector::detect_acord_form;
use crate::acord::{AcordPipeline, DetectionResult, FieldMappingTable};
use crate::config::Config;
use crate::llm::{CompletionService, LlmClient, Usage};
use crate::rules::RuleError;
use crate::universal::UniversalExtractor;
use crate::validation::{ValidationOutcome, ValidationService};
use crate::ExtractionMethod;

pub const ACORD_DOCUMENT_TYPE: &str = "ACORD Form";

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub filename: String,
    pub file_size: u64,
}

impl FileInfo {
    fn from_path(path: &Path) -> Self {
        Self {
            filename: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            file_size: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct ExtractionReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_method: Option<ExtractionMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<Usage>,
    pub page_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionReport {
    fn failed(error: impl Into<String>, file_info: Option<FileInfo>) -> Self {
        Self { success: false, file_info, error: Some(error.into()), ..Default::default() }
    }
}

/// Routes a PDF to the ACORD pipeline or the universal extractor.
pub struct ExtractionService {
    config: Config,
    pipeline: AcordPipeline,
    universal: UniversalExtractor,
    output_dir: PathBuf,
}

impl ExtractionService {
    pub fn new(config: Config, table: Arc<FieldMappingTable>, llm: Arc<dyn CompletionService>) -> Self {
        let universal = UniversalExtractor::new(llm.clone(), config.max_pages);
        Self {
            pipeline: AcordPipeline::new(table, llm),
            universal,
            output_dir: Config::get_output_dir(),
            config,
        }
    }

    /// Builds the HTTP LLM client and the field mapping table from `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let table = FieldMappingTable::load_or_embedded(config.field_mappings_path.as_deref())
            .context("loading ACORD field mappings")?;
        let llm: Arc<dyn CompletionService> = Arc::new(LlmClient::from_config(&config));
        Ok(Self::new(config, Arc::new(table), llm))
    }

    pub fn with_universal(mut self, universal: UniversalExtractor) -> Self {
        self.universal = universal;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub async fn detect(&self, path: &Path) -> DetectionResult {
        let path = path.to_path_buf();
        match tokio::task::spawn_blocking(move || detect_acord_form(&path)).await {
            Ok(detection) => detection,
            Err(e) => {
                tracing::error!("Detection task failed: {}", e);
                DetectionResult::failed("Error reading PDF", Some(format!("Detection task failed: {}", e)))
            }
        }
    }

    pub async fn extract_path(&self, path: &Path, force_acord: bool) -> ExtractionReport {
        self.extract_with_info(path, FileInfo::from_path(path), force_acord).await
    }

    async fn extract_with_info(&self, path: &Path, file_info: FileInfo, force_acord: bool) -> ExtractionReport {
        let detection = self.detect(path).await;
        tracing::info!(
            file = %file_info.filename,
            is_acord = detection.is_acord,
            is_fillable = detection.is_fillable,
            force_acord,
            "Routing extraction"
        );

        let mut report = if force_acord || (detection.is_acord && detection.is_fillable) {
            let outcome = self.pipeline.process(path).await;
            if !outcome.success {
                let error = outcome.error.unwrap_or_else(|| "Extraction failed".to_string());
                return ExtractionReport::failed(error, Some(file_info));
            }
            ExtractionReport {
                success: true,
                document_type: Some(ACORD_DOCUMENT_TYPE.to_string()),
                certificate_type: None,
                formatted_data: outcome.formatted_data,
                extraction_method: Some(outcome.extraction_method),
                tokens_used: outcome.tokens_used,
                page_count: outcome.page_count,
                file_info: Some(file_info),
                ..Default::default()
            }
        } else {
            match self.universal.extract(path, self.config.pdf_dpi).await {
                Ok(result) => ExtractionReport {
                    success: true,
                    document_type: Some(result.document_type),
                    certificate_type: result.certificate_type,
                    formatted_data: Some(result.formatted_data),
                    extraction_method: Some(result.extraction_method),
                    tokens_used: result.tokens_used,
                    page_count: result.page_count,
                    file_info: Some(file_info),
                    ..Default::default()
                },
                Err(e) => return ExtractionReport::failed(e.to_string(), Some(file_info)),
            }
        };

        if self.config.save_outputs {
            match save_json_output(&self.output_dir, &report) {
                Ok(name) => report.json_file = Some(name),
                Err(e) => tracing::warn!("Failed to save extraction output: {:#}", e),
            }
        }
        report
    }

    /// Writes `bytes` to a temp file that is removed when this returns.
    pub async fn extract_bytes(&self, filename: &str, bytes: &[u8], force_acord: bool) -> ExtractionReport {
        let path = match self.stage_upload(filename, bytes) {
            Ok(path) => path,
            Err(e) => return ExtractionReport::failed(e, None),
        };
        let file_info = FileInfo { filename: filename.to_string(), file_size: bytes.len() as u64 };
        self.extract_with_info(&path, file_info, force_acord).await
    }

    fn stage_upload(&self, filename: &str, bytes: &[u8]) -> Result<tempfile::TempPath, String> {
        if !filename.to_lowercase().ends_with(".pdf") {
            return Err("Invalid file type. Only PDF files are allowed.".to_string());
        }
        if bytes.len() as u64 > self.config.max_upload_bytes {
            return Err(format!(
                "File too large. Maximum size is {} MB.",
                self.config.max_upload_bytes / (1024 * 1024)
            ));
        }
        let staged = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(".pdf")
            .tempfile()
            .and_then(|mut file| {
                use std::io::Write;
                file.write_all(bytes)?;
                file.flush()?;
                Ok(file.into_temp_path())
            });
        staged.map_err(|e| format!("Failed to save uploaded file: {}", e))
    }
}

/// Saves `report` as `<stem>_<timestamp>.json` under `dir` and returns the file name.
pub fn save_json_output(dir: &Path, report: &ExtractionReport) -> anyhow::Result<String> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let stem = report
        .file_info
        .as_ref()
        .and_then(|info| Path::new(&info.filename).file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "extraction".to_string());
    let name = format!("{}_{}.json", stem, chrono::Local::now().format("%Y%m%d_%H%M%S%3f"));
    let path = dir.join(&name);
    std::fs::write(&path, serde_json::to_string_pretty(report)?)
        .with_context(|| format!("writing {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Saved extraction output");
    Ok(name)
}

/// Extracts then validates in one step; the validation only runs when the
/// extraction succeeded.
pub async fn extract_and_validate(
    extraction: &ExtractionService,
    validation: &ValidationService,
    path: &Path,
) -> Result<(ExtractionReport, Option<ValidationOutcome>), RuleError> {
    let report = extraction.extract_path(path, false).await;
    if !report.success {
        return Ok((report, None));
    }
    let outcome = validation
        .validate(
            report.document_type.as_deref().unwrap_or_default(),
            report.certificate_type.as_deref(),
            report.formatted_data.as_ref().unwrap_or(&Value::Null),
        )
        .await?;
    Ok((report, Some(outcome)))
}
