mod common;

use serde_json::Value;
use std::sync::Arc;

use certex::acord::detector::{detect_acord_form, ACORD_25_LABEL};
use certex::acord::fields::extract_form_fields_from_path;
use certex::acord::{AcordPipeline, Confidence, FieldMappingTable, PipelineState};
use certex::config::Config;
use certex::ops::{ExtractionService, ACORD_DOCUMENT_TYPE};
use certex::universal::UniversalExtractor;
use certex::ExtractionMethod;

use common::{acord_fields, build_pdf, write_pdf, FixedText, ScriptedLlm};

const ORGANIZER_REPLY: &str = r#"```json
{"insured": {"name": "Acme Foods LLC", "address": "1 Main St"},
 "producer": {"name": "Shield Brokers"},
 "additional_fields": {"loss_payee": "First Bank"}}
```"#;

fn table() -> Arc<FieldMappingTable> {
    Arc::new(FieldMappingTable::embedded().unwrap())
}

#[test]
fn detects_generated_acord_form() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), "cert.pdf", &build_pdf(&acord_fields(), "CERTIFICATE OF LIABILITY INSURANCE"));

    let detection = detect_acord_form(&path);
    assert!(detection.is_fillable);
    assert!(detection.is_acord);
    assert_eq!(detection.confidence, Confidence::High);
    assert_eq!(detection.detected_form_type, ACORD_25_LABEL);
    assert_eq!(detection.field_count, acord_fields().len());
    assert!(detection.is_fillable_acord());
}

#[test]
fn plain_pdf_is_not_fillable() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), "letter.pdf", &build_pdf(&[], "Dear customer"));

    let detection = detect_acord_form(&path);
    assert!(!detection.is_fillable);
    assert_eq!(detection.detected_form_type, "Not a fillable PDF");
    assert!(detection.error.is_none());
}

#[test]
fn extracts_cleaned_fields_and_checkboxes() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), "cert.pdf", &build_pdf(&acord_fields(), "ACORD 25"));

    let extraction = extract_form_fields_from_path(&path);
    assert!(extraction.success);
    assert_eq!(
        extraction.fields.get("NamedInsured_FullName_A"),
        Some(&Some("Acme Foods LLC".to_string()))
    );
    assert_eq!(extraction.checkboxes.get("GeneralLiability_OccurrenceIndicator_A"), Some(&true));
    assert_eq!(extraction.checkboxes.get("Vehicle_AnyAutoSymbolIndicator_A"), Some(&false));

    let raw = extraction.to_raw_field_map();
    assert_eq!(raw["GeneralLiability_OccurrenceIndicator_A"], "Yes");
    assert_eq!(raw["Vehicle_AnyAutoSymbolIndicator_A"], "No");
}

#[tokio::test]
async fn pipeline_maps_coverage_and_organizes_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), "cert.pdf", &build_pdf(&acord_fields(), "ACORD 25"));

    let pipeline = AcordPipeline::new(table(), Arc::new(ScriptedLlm::new(&[ORGANIZER_REPLY])));
    let outcome = pipeline.process(&path).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.state, PipelineState::Done);
    assert_eq!(outcome.page_count, 1);
    assert!(outcome.organizer_error.is_none());

    let data = outcome.formatted_data.unwrap();
    assert_eq!(data["general_liability"]["policy_limits"]["each_occurrence"], "$1,000,000");
    assert_eq!(data["general_liability"]["policy_options"]["occurrence"], "Yes");
    assert_eq!(data["other_data"]["insured"]["name"], "Acme Foods LLC");
    assert_eq!(data["other_coverage"]["policy_limits"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn service_routes_acord_and_saves_output() {
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("outputs");
    let bytes = build_pdf(&acord_fields(), "ACORD 25");

    let service = ExtractionService::new(Config::default(), table(), Arc::new(ScriptedLlm::new(&[ORGANIZER_REPLY])))
        .with_output_dir(&out_dir);
    let report = service.extract_bytes("acme-cert.pdf", &bytes, false).await;

    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.document_type.as_deref(), Some(ACORD_DOCUMENT_TYPE));
    assert_eq!(report.extraction_method, Some(ExtractionMethod::AcordHybrid));
    assert_eq!(report.file_info.as_ref().unwrap().filename, "acme-cert.pdf");
    assert_eq!(report.file_info.as_ref().unwrap().file_size, bytes.len() as u64);

    let json_file = report.json_file.expect("output saved");
    assert!(json_file.starts_with("acme-cert_"));
    let saved: Value = serde_json::from_str(&std::fs::read_to_string(out_dir.join(json_file)).unwrap()).unwrap();
    assert_eq!(saved["extraction_method"], "acord_hybrid");
    assert_eq!(saved["document_type"], "ACORD Form");
}

#[tokio::test]
async fn service_routes_plain_pdfs_to_universal() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), "invoice.pdf", &build_pdf(&[], "Invoice"));

    let reply = r#"{"document_type": "Invoice", "sections": {"totals": {"amount": "$42.00"}}}"#;
    let llm = Arc::new(ScriptedLlm::new(&[reply]));
    let universal = UniversalExtractor::with_sources(
        llm.clone(),
        Arc::new(FixedText("--- PAGE 1 ---\nInvoice 7781 issued to Acme Foods LLC, total due $42.00 by March 1\n")),
        Arc::new(FixedText("")),
        10,
    );
    let config = Config { save_outputs: false, ..Config::default() };
    let service = ExtractionService::new(config, table(), llm).with_universal(universal);

    let report = service.extract_path(&path, false).await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.extraction_method, Some(ExtractionMethod::UniversalAi));
    assert_eq!(report.document_type.as_deref(), Some("Invoice"));
    assert_eq!(report.formatted_data.unwrap()["totals"]["amount"], "$42.00");
    assert!(report.json_file.is_none());
}

#[tokio::test]
async fn forcing_acord_on_a_plain_pdf_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), "letter.pdf", &build_pdf(&[], "Dear customer"));

    let config = Config { save_outputs: false, ..Config::default() };
    let service = ExtractionService::new(config, table(), Arc::new(ScriptedLlm::new(&[])));
    let report = service.extract_path(&path, true).await;

    assert!(!report.success);
    assert_eq!(report.error.as_deref(), Some(certex::acord::pipeline::NOT_FILLABLE));
}

#[tokio::test]
async fn universal_falls_back_to_form_fields_when_ai_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pdf(dir.path(), "cert.pdf", &build_pdf(&acord_fields(), "ACORD 25"));

    let universal = UniversalExtractor::with_sources(
        Arc::new(ScriptedLlm::new(&[])),
        Arc::new(FixedText("")),
        Arc::new(FixedText("")),
        10,
    );
    let result = universal.extract(&path, 150).await.unwrap();

    assert_eq!(result.extraction_method, ExtractionMethod::FormFieldsOnly);
    assert_eq!(result.document_type, "Unknown");
    assert_eq!(result.formatted_data["text_fields"]["Producer_FullName_A"], "Shield Brokers");
    assert_eq!(result.formatted_data["checkboxes"]["GeneralLiability_OccurrenceIndicator_A"], true);
}
