use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::pdf::{FieldKind, PdfDocument, PdfError};

/// Field name to scalar value, as fed to the direct mapper.
pub type RawFieldMap = Map<String, Value>;

const CHECKED_TOKENS: [&str; 10] = ["/1", "/yes", "/on", "1", "yes", "on", "true", "y", "x", "checked"];
const UNCHECKED_TOKENS: [&str; 9] = ["/0", "/no", "/off", "0", "no", "off", "false", "n", "unchecked"];

/// Interprets a checkbox token. `None` means the token is not a recognized
/// on/off spelling.
pub fn checkbox_token(token: &str) -> Option<bool> {
    let lowered = token.trim().to_lowercase();
    if CHECKED_TOKENS.contains(&lowered.as_str()) {
        Some(true)
    } else if UNCHECKED_TOKENS.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Button state from `/V` (falling back to `/AS`). Unrecognized non-empty
/// tokens are export values of a selected state.
pub fn is_checkbox_checked(value: Option<&str>, appearance_state: Option<&str>) -> bool {
    let token = value
        .filter(|v| !v.trim().is_empty())
        .or(appearance_state)
        .map(str::trim)
        .unwrap_or("");
    match checkbox_token(token) {
        Some(state) => state,
        None => !matches!(token, "" | "None" | "null"),
    }
}

/// Strips the `F[0].P1[0].` / `F[0].` template prefix and one trailing `[n]`.
pub fn clean_field_name(name: &str) -> String {
    let name = name
        .strip_prefix("F[0].P1[0].")
        .or_else(|| name.strip_prefix("F[0]."))
        .unwrap_or(name);
    strip_index_suffix(name).to_string()
}

pub(crate) fn strip_index_suffix(name: &str) -> &str {
    if let Some(open) = name.rfind('[') {
        let inner = &name[open + 1..];
        if let Some(digits) = inner.strip_suffix(']') {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return &name[..open];
            }
        }
    }
    name
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FieldExtraction {
    pub success: bool,
    pub field_count: usize,
    pub fields: BTreeMap<String, Option<String>>,
    pub checkboxes: BTreeMap<String, bool>,
    /// Selected export value per radio group (also present in `checkboxes`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub radio_buttons: BTreeMap<String, Option<String>>,
    pub raw_field_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FieldExtraction {
    fn failure(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), ..Default::default() }
    }

    /// Non-null text values, then checkboxes rendered as `"Yes"` / `"No"`.
    pub fn to_raw_field_map(&self) -> RawFieldMap {
        let mut raw = RawFieldMap::new();
        for (name, value) in &self.fields {
            if let Some(v) = value {
                raw.insert(name.clone(), Value::String(v.clone()));
            }
        }
        for (name, checked) in &self.checkboxes {
            let rendered = if *checked { "Yes" } else { "No" };
            raw.insert(name.clone(), Value::String(rendered.to_string()));
        }
        raw
    }
}

pub fn extract_form_fields_from_path(path: &Path) -> FieldExtraction {
    match PdfDocument::load(path) {
        Ok(doc) => extract_form_fields(&doc),
        Err(e) => FieldExtraction::failure(e.to_string()),
    }
}

pub fn extract_form_fields(doc: &PdfDocument) -> FieldExtraction {
    let raw_fields = match doc.form_fields() {
        Ok(fields) => fields,
        Err(PdfError::NoAcroForm) => {
            return FieldExtraction::failure("PDF has no form fields or fields could not be extracted")
        }
        Err(e) => return FieldExtraction::failure(e.to_string()),
    };

    let mut result = FieldExtraction { success: true, ..Default::default() };
    for field in raw_fields {
        result.raw_field_names.push(field.name.clone());
        let name = clean_field_name(&field.name);

        match field.kind {
            FieldKind::Button if field.is_pushbutton() => {
                tracing::debug!("Skipping push button {}", field.name);
            }
            FieldKind::Button => {
                let checked = is_checkbox_checked(field.value.as_deref(), field.appearance_state.as_deref());
                if field.is_radio() {
                    let selected = field
                        .value
                        .clone()
                        .or(field.appearance_state.clone())
                        .filter(|_| checked)
                        .map(|v| v.trim_start_matches('/').to_string());
                    result.radio_buttons.insert(name.clone(), selected);
                }
                result.checkboxes.insert(name, checked);
            }
            FieldKind::Text | FieldKind::Choice => {
                let value = field
                    .value
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                result.fields.insert(name, value);
            }
            FieldKind::Signature | FieldKind::Unknown => {
                tracing::debug!("Skipping field {} of kind {:?}", field.name, field.kind);
            }
        }
    }

    result.field_count = result.fields.len() + result.checkboxes.len();
    tracing::info!(
        text_fields = result.fields.len(),
        checkboxes = result.checkboxes.len(),
        "Form fields extracted"
    );
    result
}
