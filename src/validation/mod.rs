//! Certificate validation: pull product names out of extracted data and
//! match them against the active rules for the certificate type.

pub mod matcher;
pub mod stemmer;
pub mod text;

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::llm::{parse_json_object, ChatMessage, CompletionRequest, CompletionService};
use crate::rules::{RuleError, RuleStore, ValidationRule};
pub use matcher::{expand_rules, match_products, ExpandedRule, MatchType, RuleMatch, ValidationStatus};
use text::normalize_text;

/// Key fragments that mark a value as a product name in the fallback walk.
const PRODUCT_KEY_HINTS: [&str; 8] =
    ["product", "products", "product_name", "item", "items", "commodity", "commodities", "sku"];

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub document_type: String,
    pub certificate_type: Option<String>,
    pub validation_status: ValidationStatus,
    pub validation_message: String,
    pub extracted_product_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub normalized_extracted_product_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub normalized_rule_product_names: Vec<String>,
    pub matched_rule_product_name: Option<String>,
    pub matched_rule: Option<ValidationRule>,
    pub match_type: Option<MatchType>,
    pub match_score: Option<f64>,
    pub rules_checked_count: usize,
}

impl ValidationOutcome {
    fn rejected(document_type: &str, certificate_type: Option<&str>, message: String) -> Self {
        Self {
            document_type: document_type.to_string(),
            certificate_type: certificate_type.map(str::to_string),
            validation_status: ValidationStatus::Rejected,
            validation_message: message,
            extracted_product_names: Vec::new(),
            normalized_extracted_product_names: Vec::new(),
            normalized_rule_product_names: Vec::new(),
            matched_rule_product_name: None,
            matched_rule: None,
            match_type: None,
            match_score: None,
            rules_checked_count: 0,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.validation_status == ValidationStatus::Approved
    }
}

pub struct ValidationService {
    llm: Arc<dyn CompletionService>,
    rules: Arc<dyn RuleStore>,
}

impl ValidationService {
    pub fn new(llm: Arc<dyn CompletionService>, rules: Arc<dyn RuleStore>) -> Self {
        Self { llm, rules }
    }

    /// Validates one extraction. "No rule" and "no match" are rejections,
    /// not errors; only a failing rule store is an `Err`.
    pub async fn validate(
        &self,
        document_type: &str,
        certificate_type: Option<&str>,
        formatted_data: &Value,
    ) -> Result<ValidationOutcome, RuleError> {
        let document_type = document_type.trim();
        if !document_type.eq_ignore_ascii_case("certificate") {
            let shown = if document_type.is_empty() { "Document" } else { document_type };
            tracing::info!(document_type = shown, "Rejected: not a certificate");
            return Ok(ValidationOutcome::rejected(
                shown,
                certificate_type,
                format!("There's no validation rule for \"{}\".", shown),
            ));
        }

        let certificate_type = match certificate_type.filter(|c| !normalize_text(c).is_empty()) {
            Some(c) => c.trim(),
            None => {
                return Ok(ValidationOutcome::rejected(
                    document_type,
                    certificate_type,
                    "No certificate type was extracted from the document.".to_string(),
                ))
            }
        };

        let extracted = self.extract_product_names(formatted_data).await;
        let normalized_products: Vec<String> =
            extracted.iter().map(|p| normalize_text(p)).filter(|p| !p.is_empty()).collect();

        let rules = self.rules.active_for_certificate_type(certificate_type)?;
        let expanded = expand_rules(&rules);
        if expanded.is_empty() {
            let mut outcome = ValidationOutcome::rejected(
                document_type,
                Some(certificate_type),
                format!("No active validation rules found for certificate type '{}'.", certificate_type),
            );
            outcome.extracted_product_names = extracted;
            return Ok(outcome);
        }
        let rule_products: Vec<String> = expanded.iter().flat_map(|r| r.candidates.iter().cloned()).collect();

        let found = match_products(&normalized_products, &expanded);
        tracing::info!(
            certificate_type,
            products = normalized_products.len(),
            rules = rules.len(),
            match_type = ?found.as_ref().map(|m| m.match_type),
            score = ?found.as_ref().map(|m| m.score),
            "Validation matched"
        );

        let (status, message) = match &found {
            Some(m) => (
                ValidationStatus::Approved,
                format!(
                    "Certificate type '{}' matched. Product name '{}' matched an active validation rule.",
                    certificate_type, m.rule_product
                ),
            ),
            None => (
                ValidationStatus::Rejected,
                format!(
                    "Certificate type '{}' matched, but none of the extracted product names matched an active validation rule.",
                    certificate_type
                ),
            ),
        };

        Ok(ValidationOutcome {
            document_type: document_type.to_string(),
            certificate_type: Some(certificate_type.to_string()),
            validation_status: status,
            validation_message: message,
            extracted_product_names: extracted,
            normalized_extracted_product_names: normalized_products,
            normalized_rule_product_names: rule_products,
            matched_rule_product_name: found.as_ref().map(|m| m.rule_product.clone()),
            match_score: found.as_ref().map(|m| m.score),
            match_type: found.as_ref().map(|m| m.match_type),
            matched_rule: found.map(|m| m.rule),
            rules_checked_count: rules.len(),
        })
    }

    /// Asks the LLM for product names; falls back to walking the data when
    /// the call fails or names nothing.
    pub async fn extract_product_names(&self, formatted_data: &Value) -> Vec<String> {
        let data_text = serde_json::to_string_pretty(formatted_data).unwrap_or_else(|_| formatted_data.to_string());
        let request = CompletionRequest {
            messages: vec![ChatMessage::user(product_prompt(&data_text))],
            temperature: Some(0.0),
            max_tokens: None,
            json_response: true,
        };

        let names = match self.llm.complete(request).await {
            Ok(completion) => parse_json_object(&completion.content)
                .and_then(|mut obj| obj.shift_remove("product_names"))
                .map(|names| match names {
                    Value::Array(items) => items
                        .into_iter()
                        .map(|v| match v {
                            Value::String(s) => s,
                            other => other.to_string(),
                        })
                        .collect(),
                    _ => Vec::new(),
                })
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!("AI product-name extraction failed: {}", e);
                Vec::new()
            }
        };

        let names = dedupe_case_insensitive(names);
        if names.is_empty() {
            tracing::debug!("Falling back to structural product-name extraction");
            return product_names_from_structure(formatted_data);
        }
        names
    }
}

fn product_prompt(data_text: &str) -> String {
    format!(
        r#"You are given the structured extracted data from a certificate document.
Your task is to identify ALL actual product names or item names that the certificate covers or pertains to.

RULES:
1. Return ONLY real product names (e.g. "Organic Sugar", "Cocoa Powder", "Wheat Flour").
2. Do NOT return section headers, field labels, dates, addresses, or generic words like "Products", "product list", "production dates".
3. If you cannot find any actual product names, return an empty list.
4. Return valid JSON: {{"product_names": ["Name1", "Name2"]}}

EXTRACTED DATA:
{data_text}"#
    )
}

/// Trims, drops empties and keeps the first spelling of each name.
fn dedupe_case_insensitive(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(n.to_lowercase()))
        .collect()
}

/// Collects string leaves whose nearest key looks like a product field.
/// Array elements inherit the key of the array.
pub fn product_names_from_structure(data: &Value) -> Vec<String> {
    fn walk(value: &Value, parent_key: &str, out: &mut Vec<String>) {
        match value {
            Value::Object(map) => {
                for (key, inner) in map {
                    walk(inner, key, out);
                }
            }
            Value::Array(items) => {
                for inner in items {
                    walk(inner, parent_key, out);
                }
            }
            Value::String(s) if !s.trim().is_empty() => {
                let key = normalize_text(parent_key);
                if PRODUCT_KEY_HINTS.iter().any(|hint| key.contains(hint)) {
                    out.push(s.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let mut found = Vec::new();
    walk(data, "", &mut found);
    dedupe_case_insensitive(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, LlmError};
    use crate::rules::{JsonRuleStore, NewRule};
    use async_trait::async_trait;
    use serde_json::json;

    struct ProductLlm(Option<&'static str>);

    #[async_trait]
    impl CompletionService for ProductLlm {
        async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
            assert!(request.json_response);
            match self.0 {
                Some(content) => Ok(Completion { content: content.into(), usage: None, model: "p".into() }),
                None => Err(LlmError::EmptyResponse),
            }
        }

        fn model_name(&self) -> String {
            "p".into()
        }
    }

    fn service(llm: ProductLlm, rules: &[NewRule]) -> (tempfile::TempDir, ValidationService) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRuleStore::open(&dir.path().join("rules.json")).unwrap();
        if !rules.is_empty() {
            store.create_many(rules.to_vec()).unwrap();
        }
        (dir, ValidationService::new(Arc::new(llm), Arc::new(store)))
    }

    #[test]
    fn structural_walk_uses_key_hints() {
        let data = json!({
            "Certificate": {"holder": "Green Farms", "Product Name": "Organic Sugar"},
            "products": ["Cocoa Powder", "organic sugar", {"sku": "SKU-1"}],
            "line_items": [{"item": "Vanilla"}],
            "production_dates": ["2024-01-01"]
        });
        assert_eq!(
            product_names_from_structure(&data),
            vec!["Organic Sugar", "Cocoa Powder", "SKU-1", "Vanilla", "2024-01-01"]
        );
    }

    #[tokio::test]
    async fn non_certificates_are_rejected() {
        let (_dir, svc) = service(ProductLlm(None), &[]);
        let out = svc.validate("Invoice", None, &json!({})).await.unwrap();
        assert_eq!(out.validation_status, ValidationStatus::Rejected);
        assert_eq!(out.validation_message, "There's no validation rule for \"Invoice\".");

        let out = svc.validate("", None, &json!({})).await.unwrap();
        assert_eq!(out.document_type, "Document");
    }

    #[tokio::test]
    async fn missing_certificate_type_is_rejected() {
        let (_dir, svc) = service(ProductLlm(None), &[]);
        let out = svc.validate("Certificate", Some("  "), &json!({})).await.unwrap();
        assert_eq!(out.validation_message, "No certificate type was extracted from the document.");
    }

    #[tokio::test]
    async fn no_rules_is_rejected_with_products_listed() {
        let (_dir, svc) = service(ProductLlm(Some(r#"{"product_names": ["Sugar"]}"#)), &[]);
        let out = svc.validate("certificate", Some("Organic"), &json!({})).await.unwrap();
        assert_eq!(out.validation_status, ValidationStatus::Rejected);
        assert_eq!(out.extracted_product_names, vec!["Sugar"]);
        assert_eq!(out.rules_checked_count, 0);
    }

    #[tokio::test]
    async fn llm_names_are_matched() {
        let rules = [NewRule::new("Organic Certificate", "Organic Sugar"), NewRule::new("Organic Certificate", "Cocoa")];
        let (_dir, svc) = service(
            ProductLlm(Some(r#"{"product_names": ["Organic Sugar", "organic sugar ", ""]}"#)),
            &rules,
        );
        let out = svc
            .validate("Certificate", Some("organic certificate"), &json!({"sections": {}}))
            .await
            .unwrap();
        assert!(out.is_approved());
        assert_eq!(out.extracted_product_names, vec!["Organic Sugar"]);
        assert_eq!(out.match_type, Some(MatchType::Exact));
        assert_eq!(out.matched_rule_product_name.as_deref(), Some("organic sugar"));
        assert_eq!(out.rules_checked_count, 2);
        assert_eq!(out.normalized_rule_product_names, vec!["cocoa", "organic sugar"]);
    }

    #[tokio::test]
    async fn llm_failure_falls_back_to_structure() {
        let rules = [NewRule::new("Organic", "Roasted Almonds")];
        let (_dir, svc) = service(ProductLlm(None), &rules);
        let data = json!({"products": [{"product_name": "roasting almond"}]});
        let out = svc.validate("Certificate", Some("Organic"), &data).await.unwrap();
        assert_eq!(out.extracted_product_names, vec!["roasting almond"]);
        assert_eq!(out.match_type, Some(MatchType::StemOverlap));
    }

    #[tokio::test]
    async fn unmatched_products_are_rejected() {
        let rules = [NewRule::new("Organic", "Cocoa Powder")];
        let (_dir, svc) = service(ProductLlm(Some(r#"{"product_names": ["Wheat Flour"]}"#)), &rules);
        let out = svc.validate("Certificate", Some("Organic"), &json!({})).await.unwrap();
        assert_eq!(out.validation_status, ValidationStatus::Rejected);
        assert!(out.matched_rule.is_none());
        assert_eq!(out.rules_checked_count, 1);
    }
}
