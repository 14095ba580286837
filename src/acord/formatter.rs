use serde::Serialize;
use serde_json::{json, Map, Value};

use super::mapping::CoverageSchema;

const CHECKED: [&str; 8] = ["yes", "y", "true", "1", "/1", "/yes", "x", "checked"];
const BOOLEAN_LIKE: [&str; 6] = ["yes", "no", "true", "false", "y", "n"];

/// Coverage schema plus the organizer's free-form entity data.
#[derive(Debug, Clone, PartialEq)]
pub struct OrganizedResult {
    pub coverage: CoverageSchema,
    pub unformatted_data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FormattedOutput(Value);

impl FormattedOutput {
    pub fn tab(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

pub fn format_checkbox(value: Option<&Value>) -> &'static str {
    match value {
        Some(Value::Bool(true)) => "Yes",
        Some(Value::String(s)) if CHECKED.contains(&s.trim().to_lowercase().as_str()) => "Yes",
        Some(Value::Number(n)) if n.as_i64() == Some(1) => "Yes",
        _ => "No",
    }
}

/// Limits render as strings; null and stray checkbox values render empty.
pub fn format_limit(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(_)) => String::new(),
        Some(Value::String(s)) if BOOLEAN_LIKE.contains(&s.trim().to_lowercase().as_str()) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn has_digit(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit())
}

fn non_blank(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty() && !s.eq_ignore_ascii_case("null"))
}

/// Name of an entity object. A bare string counts as a name unless it has digits.
fn name_only(entity: Option<&Value>) -> String {
    match entity {
        Some(Value::String(s)) if !has_digit(s) => s.clone(),
        Some(Value::Object(map)) => non_blank(map.get("name")).unwrap_or_default().to_string(),
        _ => String::new(),
    }
}

/// Address of an entity object. A bare string counts as an address if it has digits.
fn address_only(entity: Option<&Value>) -> String {
    match entity {
        Some(Value::String(s)) if has_digit(s) => s.clone(),
        Some(Value::Object(map)) => non_blank(map.get("address")).unwrap_or_default().to_string(),
        _ => String::new(),
    }
}

type Section = Map<String, Value>;

fn raw(map: &Section, key: &str) -> Value {
    map.get(key).cloned().unwrap_or(Value::Null)
}

fn cb(map: &Section, key: &str) -> Value {
    Value::String(format_checkbox(map.get(key)).to_string())
}

fn limit(map: &Section, key: &str) -> Value {
    Value::String(format_limit(map.get(key)))
}

/// Builds an object from `(output_key, value)` pairs in order.
fn object<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Object(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

fn policy_information(section: &Section, extra: Vec<(&str, Value)>) -> Value {
    let mut info = Map::new();
    info.insert("insurer_letter".to_string(), raw(section, "insurer_letter"));
    for (key, value) in extra {
        info.insert(key.to_string(), value);
    }
    for key in ["policy_number", "effective_date", "expiration_date"] {
        info.insert(key.to_string(), raw(section, key));
    }
    info.insert("additional_insured".to_string(), cb(section, "additional_insured"));
    info.insert("subrogation_waived".to_string(), cb(section, "subrogation_waived"));
    Value::Object(info)
}

fn general_liability_tab(gl: &Section) -> Value {
    object([
        (
            "policy_information",
            policy_information(gl, vec![("commercial_general_liability", cb(gl, "general_liability_coverage_indicator"))]),
        ),
        (
            "policy_options",
            object([
                ("claims_made", cb(gl, "claims_made")),
                ("occurrence", cb(gl, "occurrence")),
                ("custom_option_1", cb(gl, "custom_option_1")),
                ("custom_option_1_value", raw(gl, "custom_option_1_description")),
                ("custom_option_2", cb(gl, "custom_option_2")),
                ("custom_option_2_value", raw(gl, "custom_option_2_description")),
                ("aggregate_applies_policy", cb(gl, "general_aggregate_limit_applies_per_policy")),
                ("aggregate_applies_project", cb(gl, "general_aggregate_limit_applies_per_project")),
                ("aggregate_applies_location", cb(gl, "general_aggregate_limit_applies_per_location")),
                ("aggregate_applies_other", cb(gl, "general_aggregate_limit_applies_per_other")),
                ("aggregate_applies_other_value", raw(gl, "general_aggregate_limit_applies_per_other_description")),
            ]),
        ),
        (
            "policy_limits",
            object([
                ("each_occurrence", limit(gl, "each_occurrence")),
                ("damage_to_rented_premises", limit(gl, "damage_to_rented_premises")),
                ("med_exp", limit(gl, "medical_expense")),
                ("personal_adv_injury", limit(gl, "personal_adv_injury")),
                ("general_aggregate", limit(gl, "general_aggregate")),
                ("products_comp_op_agg", limit(gl, "products_comp_op_agg")),
            ]),
        ),
    ])
}

fn automobile_liability_tab(auto: &Section) -> Value {
    object([
        ("policy_information", policy_information(auto, Vec::new())),
        (
            "policy_options",
            object([
                ("any_auto", cb(auto, "any_auto")),
                ("owned_autos_only", cb(auto, "owned_autos_only")),
                ("hired_autos_only", cb(auto, "hired_autos_only")),
                ("scheduled_autos_only", cb(auto, "scheduled_autos_only")),
                ("non_owned_autos_only", cb(auto, "non_owned_autos_only")),
                ("custom_option_1", cb(auto, "custom_option_1")),
                ("custom_option_1_value", raw(auto, "custom_option_1_description")),
                ("custom_option_2", cb(auto, "custom_option_2")),
                ("custom_option_2_value", raw(auto, "custom_option_2_description")),
            ]),
        ),
        (
            "policy_limits",
            object([
                ("combined_single_limit", limit(auto, "combined_single_limit")),
                ("combined_single_limit_ea_accident", limit(auto, "combined_single_limit")),
                ("bodily_injury_person", limit(auto, "bodily_injury_per_person")),
                ("bodily_injury_accident", limit(auto, "bodily_injury_per_accident")),
                ("property_damage", limit(auto, "property_damage")),
            ]),
        ),
    ])
}

fn umbrella_liability_tab(umbrella: &Section) -> Value {
    object([
        ("policy_information", policy_information(umbrella, Vec::new())),
        (
            "policy_options",
            object([
                ("umbrella_liability", cb(umbrella, "umbrella_liab")),
                ("excess_liability", cb(umbrella, "excess_liab")),
                ("occurrence", cb(umbrella, "occurrence")),
                ("claims_made", cb(umbrella, "claims_made")),
                ("deductible", cb(umbrella, "deductible")),
                ("retention_checkbox", cb(umbrella, "retention")),
                ("retention", limit(umbrella, "retention_amount")),
            ]),
        ),
        (
            "policy_limits",
            object([
                ("each_occurrence", limit(umbrella, "each_occurrence")),
                ("aggregate", limit(umbrella, "aggregate")),
            ]),
        ),
    ])
}

fn workers_comp_tab(wc: &Section) -> Value {
    object([
        ("policy_information", policy_information(wc, vec![("description", raw(wc, "description"))])),
        (
            "policy_options",
            object([
                ("per_statute", cb(wc, "per_statute")),
                ("other", cb(wc, "other")),
                ("any_officers_excluded", cb(wc, "any_excluded")),
            ]),
        ),
        (
            "policy_limits",
            object([
                ("per_statute_other_limit", limit(wc, "per_statute_other_limit")),
                ("each_accident", limit(wc, "each_accident")),
                ("each_employee", limit(wc, "disease_each_employee")),
                ("disease_policy_limit", limit(wc, "disease_policy_limit")),
            ]),
        ),
    ])
}

fn other_coverage_tab(other: &Section) -> Value {
    let type_of_insurance = match other.get("type_of_insurance") {
        Some(v) if non_blank(Some(v)).is_some() => v.clone(),
        _ => json!("Other"),
    };
    let limits: Vec<Value> = ["first", "second", "third"]
        .iter()
        .map(|ordinal| {
            json!({
                "policy_option": raw(other, &format!("{}_policy_option", ordinal)),
                "policy_limit": limit(other, &format!("{}_policy_limit", ordinal))
            })
        })
        .collect();

    object([
        (
            "policy_information",
            object([
                ("insurer_letter", raw(other, "insurer_letter")),
                ("type_of_insurance", type_of_insurance),
                ("policy_number", raw(other, "policy_number")),
                ("effective_date", raw(other, "effective_date")),
                ("expiration_date", raw(other, "expiration_date")),
                ("additional_insured", cb(other, "addl")),
                ("subrogation_waived", cb(other, "subr")),
                ("description", raw(other, "description")),
            ]),
        ),
        ("policy_limits", Value::Array(limits)),
    ])
}

pub struct CoverageFormatter;

impl CoverageFormatter {
    pub fn format(&self, organized: &OrganizedResult) -> FormattedOutput {
        let root = organized.coverage.as_value();
        let empty = Section::new();
        let section = |key: &str| root.get(key).and_then(Value::as_object).unwrap_or(&empty);
        let top = |key: &str| root.get(key).cloned().unwrap_or(Value::Null);
        let remarks = top("remarks");

        // Entity data comes from the organizer, falling back to top-level keys.
        let unformatted = &organized.unformatted_data;
        let entity = |key: &str| unformatted.get(key).or_else(|| root.get(key));
        let mapped_holder = root.get("certificate_holder");
        let holder = if name_only(mapped_holder).is_empty() && address_only(mapped_holder).is_empty() {
            entity("certificate_holder")
        } else {
            mapped_holder
        };
        let producer = entity("producer").and_then(Value::as_object).unwrap_or(&empty);
        let producer_contact = producer
            .get("contact_person")
            .or_else(|| producer.get("contact"))
            .cloned()
            .unwrap_or(Value::Null);
        let insurers = match entity("insurers") {
            Some(Value::Array(list)) => Value::Array(list.clone()),
            _ => json!([]),
        };
        let notes = if non_blank(Some(&remarks)).is_some() { remarks.clone() } else { Value::Null };

        let information = object([
            ("certificate_date", top("issue_date")),
            ("description_of_operations", remarks),
            ("certificate_holder", Value::String(name_only(holder))),
        ]);
        let other_data = object([
            (
                "insured",
                json!({
                    "name": name_only(entity("insured")),
                    "address": address_only(entity("insured"))
                }),
            ),
            (
                "producer",
                object([
                    ("name", Value::String(name_only(entity("producer")))),
                    ("address", Value::String(address_only(entity("producer")))),
                    ("contact", producer_contact),
                    ("phone", raw(producer, "phone")),
                    ("fax", raw(producer, "fax")),
                    ("email", raw(producer, "email")),
                ]),
            ),
            (
                "certificate_holder",
                json!({
                    "name": name_only(holder),
                    "address": address_only(holder)
                }),
            ),
            ("certificate_number", top("certificate_number")),
            ("authorized_representative", top("authorized_representative")),
            ("insurers", insurers),
        ]);

        FormattedOutput(object([
            ("information", information),
            ("general_liability", general_liability_tab(section("general_liability"))),
            ("automobile_liability", automobile_liability_tab(section("auto_liability"))),
            ("umbrella_liability", umbrella_liability_tab(section("umbrella"))),
            ("workers_comp", workers_comp_tab(section("workers_comp"))),
            ("other_coverage", other_coverage_tab(section("other"))),
            ("notes", notes),
            ("other_data", other_data),
            ("unformatted_data", Value::Object(unformatted.clone())),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn organized(coverage_patch: Value, unformatted: Value) -> OrganizedResult {
        let mut coverage = CoverageSchema::empty().into_value();
        if let (Value::Object(base), Value::Object(patch)) = (&mut coverage, coverage_patch) {
            for (section, fields) in patch {
                match (base.get_mut(&section), fields) {
                    (Some(Value::Object(target)), Value::Object(fields)) => target.extend(fields),
                    (_, value) => {
                        base.insert(section, value);
                    }
                }
            }
        }
        let coverage = CoverageSchema::from_value(coverage);
        OrganizedResult {
            coverage,
            unformatted_data: unformatted.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn checkbox_closure() {
        for v in ["Yes", "y", "TRUE", "1", "/1", "/Yes", "X", "checked"] {
            assert_eq!(format_checkbox(Some(&json!(v))), "Yes", "{}", v);
        }
        assert_eq!(format_checkbox(Some(&json!(true))), "Yes");
        for v in [json!("No"), json!("/Off"), json!(false), Value::Null, json!("maybe")] {
            assert_eq!(format_checkbox(Some(&v)), "No");
        }
        assert_eq!(format_checkbox(None), "No");
        assert_eq!(format_checkbox(Some(&json!(format_checkbox(Some(&json!("/1")))))), "Yes");
    }

    #[test]
    fn limits_drop_boolean_like_values() {
        assert_eq!(format_limit(Some(&json!("1,000,000"))), "1,000,000");
        assert_eq!(format_limit(Some(&json!(2000000))), "2000000");
        assert_eq!(format_limit(Some(&json!("Yes"))), "");
        assert_eq!(format_limit(Some(&json!(" n "))), "");
        assert_eq!(format_limit(Some(&json!(true))), "");
        assert_eq!(format_limit(Some(&Value::Null)), "");
        assert_eq!(format_limit(None), "");
    }

    #[test]
    fn empty_schema_formats_to_full_tab_set() {
        let out = CoverageFormatter.format(&organized(json!({}), json!({})));
        for tab in [
            "information",
            "general_liability",
            "automobile_liability",
            "umbrella_liability",
            "workers_comp",
            "other_coverage",
            "notes",
            "other_data",
            "unformatted_data",
        ] {
            assert!(out.tab(tab).is_some(), "missing tab {}", tab);
        }
        assert_eq!(out.tab("unformatted_data"), Some(&json!({})));
        assert_eq!(out.as_value()["other_coverage"]["policy_limits"].as_array().unwrap().len(), 3);
        assert_eq!(out.as_value()["other_coverage"]["policy_information"]["type_of_insurance"], "Other");
        assert_eq!(out.as_value()["general_liability"]["policy_limits"]["each_occurrence"], "");
        assert_eq!(out.as_value()["notes"], Value::Null);
    }

    #[test]
    fn coverage_values_flow_into_tabs() {
        let out = CoverageFormatter.format(&organized(
            json!({
                "general_liability": {"each_occurrence": "1,000,000", "occurrence": "Yes", "medical_expense": "5,000"},
                "auto_liability": {"combined_single_limit": "1,000,000"},
                "umbrella": {"retention": "Yes", "retention_amount": "10,000"},
                "certificate_holder": {"name": "City of Springfield", "address": "1 Main St, Springfield"},
                "remarks": "Job 42"
            }),
            json!({}),
        ));
        let v = out.as_value();
        assert_eq!(v["general_liability"]["policy_limits"]["each_occurrence"], "1,000,000");
        assert_eq!(v["general_liability"]["policy_limits"]["med_exp"], "5,000");
        assert_eq!(v["general_liability"]["policy_options"]["occurrence"], "Yes");
        assert_eq!(v["automobile_liability"]["policy_limits"]["combined_single_limit_ea_accident"], "1,000,000");
        assert_eq!(v["umbrella_liability"]["policy_options"]["retention_checkbox"], "Yes");
        assert_eq!(v["umbrella_liability"]["policy_options"]["retention"], "10,000");
        assert_eq!(v["information"]["certificate_holder"], "City of Springfield");
        assert_eq!(v["information"]["description_of_operations"], "Job 42");
        assert_eq!(v["notes"], "Job 42");
        assert_eq!(v["other_data"]["certificate_holder"]["address"], "1 Main St, Springfield");
    }

    #[test]
    fn other_data_reads_organizer_entities() {
        let out = CoverageFormatter.format(&organized(
            json!({}),
            json!({
                "insured": {"name": "Acme LLC", "address": "9 Elm St"},
                "producer": {"name": "Broker Co", "contact_person": "Jo Smith", "phone": "555-0100"},
                "insurers": [{"letter": "A", "name": "Big Insurance", "naic": "12345"}]
            }),
        ));
        let v = out.as_value();
        assert_eq!(v["other_data"]["insured"]["name"], "Acme LLC");
        assert_eq!(v["other_data"]["insured"]["address"], "9 Elm St");
        assert_eq!(v["other_data"]["producer"]["contact"], "Jo Smith");
        assert_eq!(v["other_data"]["producer"]["phone"], "555-0100");
        assert_eq!(v["other_data"]["producer"]["fax"], Value::Null);
        assert_eq!(v["other_data"]["insurers"][0]["naic"], "12345");
        assert_eq!(v["unformatted_data"]["insured"]["name"], "Acme LLC");
    }

    #[test]
    fn formatting_is_deterministic() {
        let input = organized(json!({"general_liability": {"claims_made": "/1"}}), json!({"x": 1}));
        assert_eq!(CoverageFormatter.format(&input), CoverageFormatter.format(&input));
    }

    #[test]
    fn name_and_address_heuristics_for_strings() {
        assert_eq!(name_only(Some(&json!("Acme LLC"))), "Acme LLC");
        assert_eq!(name_only(Some(&json!("12 Main St"))), "");
        assert_eq!(address_only(Some(&json!("12 Main St"))), "12 Main St");
        assert_eq!(address_only(Some(&json!("Acme LLC"))), "");
        assert_eq!(name_only(Some(&json!({"name": "null"}))), "");
    }
}
