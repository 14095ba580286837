//! Deterministic PDF-field to coverage-schema mapping.
//!
//! The [`FieldMappingTable`] decides where each known PDF field lands. Paths
//! under one of [`COVERAGE_PREFIXES`] are written into the [`CoverageSchema`];
//! every other field (mapped or not) is routed to the unmapped set for the
//! organizer. Every input key ends up in exactly one of the two outputs.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::fields::{checkbox_token, strip_index_suffix, RawFieldMap};

/// Field mappings shipped with the binary.
pub const EMBEDDED_FIELD_MAPPINGS: &str = include_str!("../../constants/acord_field_mappings.json");

/// Schema-path prefixes owned by the direct mapper.
pub const COVERAGE_PREFIXES: [&str; 10] = [
    "issue_date",
    "certificate_number",
    "certificate_holder",
    "general_liability.",
    "auto_liability.",
    "umbrella.",
    "workers_comp.",
    "other.",
    "remarks",
    "authorized_representative",
];

/// Leaf keys whose values are normalized to `"Yes"` / `"No"`.
pub const CHECKBOX_KEYS: [&str; 24] = [
    "claims_made",
    "occurrence",
    "custom_option_1",
    "custom_option_2",
    "general_aggregate_limit_applies_per_policy",
    "general_aggregate_limit_applies_per_project",
    "general_aggregate_limit_applies_per_location",
    "general_aggregate_limit_applies_per_other",
    "additional_insured",
    "subrogation_waived",
    "any_auto",
    "owned_autos_only",
    "hired_autos_only",
    "scheduled_autos_only",
    "non_owned_autos_only",
    "umbrella_liab",
    "excess_liab",
    "deductible",
    "retention",
    "per_statute",
    "other",
    "any_excluded",
    "addl",
    "subr",
];

const GENERAL_LIABILITY_FIELDS: [&str; 24] = [
    "insurer_letter",
    "general_liability_coverage_indicator",
    "claims_made",
    "occurrence",
    "custom_option_1",
    "custom_option_1_description",
    "custom_option_2",
    "custom_option_2_description",
    "general_aggregate_limit_applies_per_policy",
    "general_aggregate_limit_applies_per_project",
    "general_aggregate_limit_applies_per_location",
    "general_aggregate_limit_applies_per_other",
    "general_aggregate_limit_applies_per_other_description",
    "additional_insured",
    "subrogation_waived",
    "policy_number",
    "effective_date",
    "expiration_date",
    "each_occurrence",
    "damage_to_rented_premises",
    "medical_expense",
    "personal_adv_injury",
    "general_aggregate",
    "products_comp_op_agg",
];

const AUTO_LIABILITY_FIELDS: [&str; 19] = [
    "insurer_letter",
    "any_auto",
    "owned_autos_only",
    "hired_autos_only",
    "scheduled_autos_only",
    "non_owned_autos_only",
    "custom_option_1",
    "custom_option_1_description",
    "custom_option_2",
    "custom_option_2_description",
    "additional_insured",
    "subrogation_waived",
    "policy_number",
    "effective_date",
    "expiration_date",
    "combined_single_limit",
    "bodily_injury_per_person",
    "bodily_injury_per_accident",
    "property_damage",
];

const UMBRELLA_FIELDS: [&str; 15] = [
    "insurer_letter",
    "umbrella_liab",
    "excess_liab",
    "occurrence",
    "claims_made",
    "deductible",
    "retention",
    "retention_amount",
    "additional_insured",
    "subrogation_waived",
    "policy_number",
    "effective_date",
    "expiration_date",
    "each_occurrence",
    "aggregate",
];

const WORKERS_COMP_FIELDS: [&str; 13] = [
    "insurer_letter",
    "per_statute",
    "other",
    "any_excluded",
    "subrogation_waived",
    "policy_number",
    "effective_date",
    "expiration_date",
    "per_statute_other_limit",
    "each_accident",
    "disease_each_employee",
    "disease_policy_limit",
    "description",
];

const OTHER_FIELDS: [&str; 14] = [
    "insurer_letter",
    "type_of_insurance",
    "addl",
    "subr",
    "policy_number",
    "effective_date",
    "expiration_date",
    "description",
    "first_policy_option",
    "first_policy_limit",
    "second_policy_option",
    "second_policy_limit",
    "third_policy_option",
    "third_policy_limit",
];

fn null_section(keys: &[&str]) -> Value {
    Value::Object(keys.iter().map(|k| (k.to_string(), Value::Null)).collect())
}

/// Mapped keys that did not land in the coverage schema, with their values.
pub type UnmappedFieldSet = Map<String, Value>;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Failed to read field mappings {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid field mappings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Field {field:?} maps to invalid schema path {path:?}")]
    InvalidPath { field: String, path: String },
}

pub fn is_coverage_path(path: &str) -> bool {
    COVERAGE_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix) || path == prefix.trim_end_matches('.'))
}

/// A coverage path must end at a leaf: it may not name a whole section, run
/// through a template leaf, or nest under (or above) another table path.
fn breaks_coverage_shape(template: &CoverageSchema, entries: &[(String, String)], path: &str) -> bool {
    if template.get(path).is_some_and(Value::is_object) {
        return true;
    }
    let segments: Vec<&str> = path.split('.').collect();
    let through_leaf = (1..segments.len())
        .any(|n| template.get(&segments[..n].join(".")).is_some_and(|v| !v.is_object()));
    if through_leaf {
        return true;
    }
    entries.iter().any(|(_, other)| {
        is_coverage_path(other)
            && (other.starts_with(&format!("{}.", path)) || path.starts_with(&format!("{}.", other)))
    })
}

/// Drops one trailing `[n]` so `Field[0]` and `Field` share a table entry.
pub fn normalize_field_key(key: &str) -> &str {
    strip_index_suffix(key)
}

/// Ordered PDF field name to dotted schema path.
#[derive(Debug, Clone, Default)]
pub struct FieldMappingTable {
    entries: Vec<(String, String)>,
}

impl FieldMappingTable {
    /// Accepts `{"fieldMappings": {...}}` or a bare object of field to path.
    pub fn from_json_str(text: &str) -> Result<Self, MappingError> {
        let root: Value = serde_json::from_str(text)?;
        let object = match root {
            Value::Object(mut map) => match map.remove("fieldMappings") {
                Some(Value::Object(inner)) => inner,
                Some(other) => {
                    return Err(MappingError::InvalidPath {
                        field: "fieldMappings".to_string(),
                        path: other.to_string(),
                    })
                }
                None => map,
            },
            other => {
                return Err(MappingError::InvalidPath {
                    field: String::new(),
                    path: other.to_string(),
                })
            }
        };

        let pairs = object.into_iter().map(|(field, path)| match path {
            Value::String(p) => Ok((field, p)),
            other => Err(MappingError::InvalidPath { field, path: other.to_string() }),
        });
        pairs.collect::<Result<Vec<_>, _>>().and_then(Self::from_pairs)
    }

    pub fn from_pairs<I>(pairs: I) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let template = CoverageSchema::empty();
        let mut entries: Vec<(String, String)> = Vec::new();
        for (field, path) in pairs {
            let path = path.trim().to_string();
            if path.is_empty() || path.split('.').any(|segment| segment.trim().is_empty()) {
                return Err(MappingError::InvalidPath { field, path });
            }
            let field = normalize_field_key(field.trim()).to_string();
            entries.retain(|(f, _)| f != &field);
            if is_coverage_path(&path) && breaks_coverage_shape(&template, &entries, &path) {
                return Err(MappingError::InvalidPath { field, path });
            }
            entries.push((field, path));
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, MappingError> {
        let text = std::fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn embedded() -> Result<Self, MappingError> {
        Self::from_json_str(EMBEDDED_FIELD_MAPPINGS)
    }

    /// Loads `path` when given, otherwise the embedded table.
    pub fn load_or_embedded(path: Option<&Path>) -> Result<Self, MappingError> {
        let table = match path {
            Some(p) => Self::load(p)?,
            None => Self::embedded()?,
        };
        tracing::info!(entries = table.len(), "Field mapping table loaded");
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        let field = normalize_field_key(field);
        self.entries.iter().find(|(f, _)| f == field).map(|(_, p)| p.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(f, p)| (f.as_str(), p.as_str()))
    }
}

/// Nested coverage data with a fixed shape: every key of the template is
/// present, null when the document did not supply it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CoverageSchema(Value);

impl CoverageSchema {
    pub fn empty() -> Self {
        let mut root = Map::new();
        root.insert("issue_date".to_string(), Value::Null);
        root.insert("certificate_number".to_string(), Value::Null);
        root.insert("certificate_holder".to_string(), null_section(&["name", "address"]));
        root.insert("general_liability".to_string(), null_section(&GENERAL_LIABILITY_FIELDS));
        root.insert("auto_liability".to_string(), null_section(&AUTO_LIABILITY_FIELDS));
        root.insert("umbrella".to_string(), null_section(&UMBRELLA_FIELDS));
        root.insert("workers_comp".to_string(), null_section(&WORKERS_COMP_FIELDS));
        root.insert("other".to_string(), null_section(&OTHER_FIELDS));
        root.insert("remarks".to_string(), Value::Null);
        root.insert("authorized_representative".to_string(), Value::Null);
        CoverageSchema(Value::Object(root))
    }

    /// Looks up a dotted path such as `general_liability.each_occurrence`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.0, |node, key| node.get(key))
    }

    pub fn section(&self, key: &str) -> Option<&Map<String, Value>> {
        self.0.get(key).and_then(Value::as_object)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_value(value: Value) -> Self {
        CoverageSchema(value)
    }

    /// Sets `path`, creating (or replacing non-object) intermediates. A
    /// non-null value arriving at an `address` leaf that already holds a
    /// value is appended with ", ".
    fn set(&mut self, path: &str, value: Value) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let Some(leaf) = segments.pop() else { return };

        let mut node = &mut self.0;
        for segment in segments {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return,
            };
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else { return };

        let existing = map
            .get(leaf)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if let (true, Some(existing)) = (leaf == "address", existing) {
            match &value {
                Value::String(new) if !new.is_empty() => {
                    map.insert(leaf.to_string(), Value::String(format!("{}, {}", existing, new)));
                }
                _ => {}
            }
            return;
        }
        map.insert(leaf.to_string(), value);
    }
}

/// Output of [`DirectMapper::map`].
#[derive(Debug, Clone, PartialEq)]
pub struct MappingOutcome {
    pub coverage: CoverageSchema,
    pub unmapped: UnmappedFieldSet,
    /// Normalized keys consumed by the coverage schema.
    pub mapped_keys: BTreeSet<String>,
}

pub struct DirectMapper {
    table: Arc<FieldMappingTable>,
    template: CoverageSchema,
}

impl DirectMapper {
    pub fn new(table: Arc<FieldMappingTable>) -> Self {
        let mut template = CoverageSchema::empty();
        for (_, path) in table.iter() {
            if is_coverage_path(path) && template.get(path).is_none() {
                template.set(path, Value::Null);
            }
        }
        Self { table, template }
    }

    pub fn table(&self) -> &FieldMappingTable {
        &self.table
    }

    /// A copy of the coverage schema with every leaf null.
    pub fn empty_schema(&self) -> CoverageSchema {
        self.template.clone()
    }

    pub fn map(&self, raw: &RawFieldMap) -> MappingOutcome {
        let mut normalized = Map::new();
        for (key, value) in raw {
            normalized.insert(normalize_field_key(key).to_string(), value.clone());
        }

        let mut coverage = self.template.clone();
        let mut unmapped = UnmappedFieldSet::new();
        let mut mapped_keys = BTreeSet::new();

        for (field, path) in self.table.iter() {
            let Some(value) = normalized.get(field) else { continue };
            if is_coverage_path(path) {
                coverage.set(path, clean_value(value));
                mapped_keys.insert(field.to_string());
            } else {
                unmapped.insert(field.to_string(), value.clone());
            }
        }

        for (key, value) in &normalized {
            if !mapped_keys.contains(key) && !unmapped.contains_key(key) {
                unmapped.insert(key.clone(), value.clone());
            }
        }

        normalize_checkboxes(&mut coverage.0);

        tracing::info!(
            input = normalized.len(),
            mapped = mapped_keys.len(),
            unmapped = unmapped.len(),
            "Direct mapping finished"
        );
        MappingOutcome { coverage, unmapped, mapped_keys }
    }
}

fn clean_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

fn normalize_checkbox_value(value: &Value) -> Value {
    match value {
        Value::Bool(true) => Value::String("Yes".to_string()),
        Value::Bool(false) => Value::String("No".to_string()),
        Value::String(s) => match checkbox_token(s) {
            Some(true) => Value::String("Yes".to_string()),
            Some(false) => Value::String("No".to_string()),
            None => value.clone(),
        },
        Value::Number(n) => match checkbox_token(&n.to_string()) {
            Some(true) => Value::String("Yes".to_string()),
            Some(false) => Value::String("No".to_string()),
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Rewrites every checkbox-named leaf in the tree to `"Yes"` / `"No"`.
pub fn normalize_checkboxes(node: &mut Value) {
    match node {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if child.is_object() || child.is_array() {
                    normalize_checkboxes(child);
                } else if CHECKBOX_KEYS.contains(&key.as_str()) {
                    *child = normalize_checkbox_value(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_checkboxes),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapper(pairs: &[(&str, &str)]) -> DirectMapper {
        let table = FieldMappingTable::from_pairs(
            pairs.iter().map(|(f, p)| (f.to_string(), p.to_string())),
        )
        .unwrap();
        DirectMapper::new(Arc::new(table))
    }

    fn raw(pairs: &[(&str, Value)]) -> RawFieldMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn coverage_limit_is_trimmed_into_schema() {
        let m = mapper(&[("GeneralLiability_EachOccurrence_LimitAmount_A", "general_liability.each_occurrence")]);
        let out = m.map(&raw(&[("GeneralLiability_EachOccurrence_LimitAmount_A[0]", json!(" 1,000,000 "))]));
        assert_eq!(out.coverage.get("general_liability.each_occurrence"), Some(&json!("1,000,000")));
        assert!(out.unmapped.is_empty());
    }

    #[test]
    fn non_coverage_paths_are_routed_to_unmapped() {
        let m = mapper(&[("NamedInsured_FullName_A", "insured.name")]);
        let out = m.map(&raw(&[("NamedInsured_FullName_A", json!("Acme LLC"))]));
        assert_eq!(out.unmapped.get("NamedInsured_FullName_A"), Some(&json!("Acme LLC")));
        assert!(out.coverage.get("insured").is_none());
    }

    #[test]
    fn address_parts_concatenate_in_table_order() {
        let m = mapper(&[
            ("CertificateHolder_LineOne_A", "certificate_holder.address"),
            ("CertificateHolder_City_A", "certificate_holder.address"),
        ]);
        let out = m.map(&raw(&[
            ("CertificateHolder_City_A", json!("Springfield")),
            ("CertificateHolder_LineOne_A", json!("1 Main St")),
        ]));
        assert_eq!(out.coverage.get("certificate_holder.address"), Some(&json!("1 Main St, Springfield")));
    }

    #[test]
    fn checkbox_leaves_are_normalized() {
        let m = mapper(&[
            ("GL_Occurrence", "general_liability.occurrence"),
            ("GL_ClaimsMade", "general_liability.claims_made"),
            ("WC_Excluded", "workers_comp.any_excluded"),
            ("GL_Custom", "general_liability.custom_option_1"),
        ]);
        let out = m.map(&raw(&[
            ("GL_Occurrence", json!("/1")),
            ("GL_ClaimsMade", json!(false)),
            ("WC_Excluded", json!("N")),
            ("GL_Custom", json!("maybe")),
        ]));
        assert_eq!(out.coverage.get("general_liability.occurrence"), Some(&json!("Yes")));
        assert_eq!(out.coverage.get("general_liability.claims_made"), Some(&json!("No")));
        assert_eq!(out.coverage.get("workers_comp.any_excluded"), Some(&json!("No")));
        assert_eq!(out.coverage.get("general_liability.custom_option_1"), Some(&json!("maybe")));
        assert_eq!(out.coverage.get("umbrella.retention"), Some(&Value::Null));
    }

    #[test]
    fn every_key_lands_in_exactly_one_output() {
        let m = mapper(&[
            ("GL_Policy", "general_liability.policy_number"),
            ("Producer_Name", "producer.name"),
        ]);
        let input = raw(&[
            ("GL_Policy", json!("GL-1")),
            ("Producer_Name", json!("Broker Co")),
            ("Mystery_Field", json!("?")),
            ("Blank_Field", Value::Null),
        ]);
        let out = m.map(&input);
        for key in input.keys() {
            let in_coverage = out.mapped_keys.contains(key);
            let in_unmapped = out.unmapped.contains_key(key);
            assert!(in_coverage ^ in_unmapped, "{} must land exactly once", key);
        }
        assert!(out.unmapped.contains_key("Blank_Field"));
    }

    #[test]
    fn shape_is_identical_across_inputs() {
        let m = mapper(&[("GL_Policy", "general_liability.policy_number")]);
        let empty = m.map(&RawFieldMap::new());
        let full = m.map(&raw(&[("GL_Policy", json!("GL-1")), ("Other", json!("x"))]));

        fn shape(v: &Value) -> Value {
            match v {
                Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), shape(v))).collect()),
                _ => Value::Null,
            }
        }
        assert_eq!(shape(empty.coverage.as_value()), shape(full.coverage.as_value()));
        assert_eq!(empty.coverage, m.empty_schema());
    }

    #[test]
    fn table_extends_schema_with_extra_coverage_paths() {
        let m = mapper(&[("GL_Extra", "general_liability.deductible_amount")]);
        assert_eq!(m.empty_schema().get("general_liability.deductible_amount"), Some(&Value::Null));
    }

    #[test]
    fn wrapped_and_bare_tables_load() {
        let wrapped = FieldMappingTable::from_json_str(r#"{"fieldMappings": {"A[0]": "remarks", "B": "insured.name"}}"#).unwrap();
        assert_eq!(wrapped.len(), 2);
        assert_eq!(wrapped.get("A"), Some("remarks"));
        assert_eq!(wrapped.get("A[0]"), Some("remarks"));

        let bare = FieldMappingTable::from_json_str(r#"{"B": "insured.name"}"#).unwrap();
        assert_eq!(bare.get("B"), Some("insured.name"));
    }

    #[test]
    fn invalid_paths_are_rejected() {
        let err = FieldMappingTable::from_json_str(r#"{"A": "general_liability..x"}"#).unwrap_err();
        assert!(matches!(err, MappingError::InvalidPath { .. }));
        assert!(FieldMappingTable::from_json_str(r#"{"A": 5}"#).is_err());
    }

    #[test]
    fn coverage_paths_must_end_at_a_leaf() {
        let pairs = |p: &[(&str, &str)]| {
            FieldMappingTable::from_pairs(p.iter().map(|(f, p)| (f.to_string(), p.to_string())))
        };
        for path in ["general_liability", "certificate_holder", "general_liability.occurrence.x", "remarks.text"] {
            let err = pairs(&[("X", path)]).unwrap_err();
            assert!(matches!(err, MappingError::InvalidPath { .. }), "{}", path);
        }
        assert!(pairs(&[("A", "other.extra"), ("B", "other.extra.detail")]).is_err());
        assert!(pairs(&[("A", "other.extra.detail"), ("B", "other.extra")]).is_err());

        // leaves, new coverage leaves and non-coverage nesting still load
        let table = pairs(&[
            ("A", "issue_date"),
            ("B", "general_liability.deductible_amount"),
            ("C", "insured.name"),
            ("D", "insured.name.first"),
        ])
        .unwrap();
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn embedded_table_parses() {
        let table = FieldMappingTable::embedded().unwrap();
        assert!(table.len() > 50);
        assert_eq!(table.get("NamedInsured_FullName_A"), Some("insured.name"));
    }

    #[test]
    fn coverage_prefix_matching() {
        assert!(is_coverage_path("certificate_holder.name"));
        assert!(is_coverage_path("remarks"));
        assert!(is_coverage_path("other.policy_number"));
        assert!(!is_coverage_path("insured.name"));
        assert!(!is_coverage_path("insurers.A.name"));
        assert!(!is_coverage_path("otherwise"));
    }
}
