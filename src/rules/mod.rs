//! Validation rules: which products are acceptable for a certificate type.
//!
//! Rules live in a JSON file in the app data dir. Every mutation, single or
//! bulk, is validated in full and written atomically, so a batch either
//! applies completely or not at all.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const MAX_CERTIFICATE_TYPE_LEN: usize = 100;
pub const MAX_PRODUCT_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{0}")]
    Invalid(String),

    #[error("Rule not found for id(s): {0:?}")]
    NotFound(Vec<i64>),

    #[error("A rule with the same certificate_type and product_name already exists: '{certificate_type}' / '{product_name}'")]
    Duplicate { certificate_type: String, product_name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidationRule {
    pub id: i64,
    pub certificate_type: String,
    pub product_name: String,
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewRule {
    pub certificate_type: String,
    pub product_name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl NewRule {
    pub fn new(certificate_type: impl Into<String>, product_name: impl Into<String>) -> Self {
        Self { certificate_type: certificate_type.into(), product_name: product_name.into(), is_active: true }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RuleUpdate {
    pub id: i64,
    pub certificate_type: String,
    pub product_name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

/// Storage for validation rules. Bulk operations are all-or-nothing.
pub trait RuleStore: Send + Sync {
    /// All rules, newest first.
    fn list(&self) -> Result<Vec<ValidationRule>, RuleError>;

    fn get(&self, id: i64) -> Result<ValidationRule, RuleError>;

    /// Active rules whose certificate type matches case-insensitively after
    /// trimming, newest first.
    fn active_for_certificate_type(&self, certificate_type: &str) -> Result<Vec<ValidationRule>, RuleError>;

    fn create_many(&self, rules: Vec<NewRule>) -> Result<Vec<ValidationRule>, RuleError>;

    fn update_many(&self, rules: Vec<RuleUpdate>) -> Result<Vec<ValidationRule>, RuleError>;

    /// Returns the deleted rules in request order.
    fn delete_many(&self, ids: &[i64]) -> Result<Vec<ValidationRule>, RuleError>;

    fn create(&self, rule: NewRule) -> Result<ValidationRule, RuleError> {
        single(self.create_many(vec![rule])?)
    }

    fn update(&self, rule: RuleUpdate) -> Result<ValidationRule, RuleError> {
        single(self.update_many(vec![rule])?)
    }

    fn delete(&self, id: i64) -> Result<ValidationRule, RuleError> {
        single(self.delete_many(&[id])?)
    }
}

fn single(mut rules: Vec<ValidationRule>) -> Result<ValidationRule, RuleError> {
    rules.pop().ok_or_else(|| RuleError::Invalid("Rule operation returned no rows".to_string()))
}

fn pair_key(certificate_type: &str, product_name: &str) -> (String, String) {
    (certificate_type.to_lowercase(), product_name.to_lowercase())
}

fn check_fields(certificate_type: &str, product_name: &str) -> Result<(String, String), RuleError> {
    let certificate_type = certificate_type.trim();
    let product_name = product_name.trim();
    if certificate_type.is_empty() {
        return Err(RuleError::Invalid("certificate_type is required".to_string()));
    }
    if product_name.is_empty() {
        return Err(RuleError::Invalid("product_name is required".to_string()));
    }
    if certificate_type.chars().count() > MAX_CERTIFICATE_TYPE_LEN {
        return Err(RuleError::Invalid(format!(
            "certificate_type must be at most {} characters",
            MAX_CERTIFICATE_TYPE_LEN
        )));
    }
    if product_name.chars().count() > MAX_PRODUCT_NAME_LEN {
        return Err(RuleError::Invalid(format!("product_name must be at most {} characters", MAX_PRODUCT_NAME_LEN)));
    }
    Ok((certificate_type.to_string(), product_name.to_string()))
}

fn check_id(id: i64, seen: &mut HashSet<i64>) -> Result<(), RuleError> {
    if id <= 0 {
        return Err(RuleError::Invalid("All rule ids must be positive integers".to_string()));
    }
    if !seen.insert(id) {
        return Err(RuleError::Invalid(format!("Duplicate rule id in request: {}", id)));
    }
    Ok(())
}

fn check_batch_pair(
    seen: &mut HashSet<(String, String)>,
    certificate_type: &str,
    product_name: &str,
) -> Result<(), RuleError> {
    if !seen.insert(pair_key(certificate_type, product_name)) {
        return Err(RuleError::Invalid(format!(
            "Duplicate rule in request: certificate_type='{}', product_name='{}'",
            certificate_type, product_name
        )));
    }
    Ok(())
}

/// Trims and validates a create batch.
pub fn normalize_new_rules(rules: Vec<NewRule>) -> Result<Vec<NewRule>, RuleError> {
    if rules.is_empty() {
        return Err(RuleError::Invalid("At least one rule is required".to_string()));
    }
    let mut pairs = HashSet::new();
    rules
        .into_iter()
        .map(|rule| {
            let (certificate_type, product_name) = check_fields(&rule.certificate_type, &rule.product_name)?;
            check_batch_pair(&mut pairs, &certificate_type, &product_name)?;
            Ok(NewRule { certificate_type, product_name, is_active: rule.is_active })
        })
        .collect()
}

/// Trims and validates an update batch.
pub fn normalize_rule_updates(rules: Vec<RuleUpdate>) -> Result<Vec<RuleUpdate>, RuleError> {
    if rules.is_empty() {
        return Err(RuleError::Invalid("At least one rule is required".to_string()));
    }
    let mut ids = HashSet::new();
    let mut pairs = HashSet::new();
    rules
        .into_iter()
        .map(|rule| {
            check_id(rule.id, &mut ids)?;
            let (certificate_type, product_name) = check_fields(&rule.certificate_type, &rule.product_name)?;
            check_batch_pair(&mut pairs, &certificate_type, &product_name)?;
            Ok(RuleUpdate { id: rule.id, certificate_type, product_name, is_active: rule.is_active })
        })
        .collect()
}

pub fn normalize_rule_ids(ids: &[i64]) -> Result<Vec<i64>, RuleError> {
    if ids.is_empty() {
        return Err(RuleError::Invalid("At least one rule id is required".to_string()));
    }
    let mut seen = HashSet::new();
    for id in ids {
        check_id(*id, &mut seen)?;
    }
    Ok(ids.to_vec())
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct RuleFile {
    next_id: i64,
    rules: Vec<ValidationRule>,
}

impl RuleFile {
    fn duplicate_of(&self, certificate_type: &str, product_name: &str, except: Option<i64>) -> bool {
        let key = pair_key(certificate_type, product_name);
        self.rules
            .iter()
            .any(|r| Some(r.id) != except && pair_key(&r.certificate_type, &r.product_name) == key)
    }

    fn missing(&self, ids: impl IntoIterator<Item = i64>) -> Vec<i64> {
        ids.into_iter().filter(|id| !self.rules.iter().any(|r| r.id == *id)).collect()
    }
}

/// JSON-file backed rule store.
pub struct JsonRuleStore {
    path: PathBuf,
    state: Mutex<RuleFile>,
}

impl JsonRuleStore {
    pub fn open(path: &Path) -> Result<Self, RuleError> {
        let state = if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            serde_json::from_reader(reader)?
        } else {
            RuleFile::default()
        };
        Ok(Self { path: path.to_path_buf(), state: Mutex::new(state) })
    }

    pub fn storage_path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, RuleFile>, RuleError> {
        self.state
            .lock()
            .map_err(|_| RuleError::Io(std::io::Error::other("rule store lock poisoned")))
    }

    /// Writes next to the target and renames over it.
    fn persist(&self, file: &RuleFile) -> Result<(), RuleError> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, file)?;
            writer.flush()?;
        }
        tmp.persist(&self.path).map_err(|e| RuleError::Io(e.error))?;
        Ok(())
    }

    /// Applies `change` to a copy of the state; commits only if it and the
    /// write both succeed.
    fn transact<T>(&self, change: impl FnOnce(&mut RuleFile) -> Result<T, RuleError>) -> Result<T, RuleError> {
        let mut guard = self.lock()?;
        let mut working = guard.clone();
        let out = change(&mut working)?;
        self.persist(&working)?;
        *guard = working;
        Ok(out)
    }
}

impl RuleStore for JsonRuleStore {
    fn list(&self) -> Result<Vec<ValidationRule>, RuleError> {
        let guard = self.lock()?;
        let mut rules = guard.rules.clone();
        rules.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rules)
    }

    fn get(&self, id: i64) -> Result<ValidationRule, RuleError> {
        let guard = self.lock()?;
        guard
            .rules
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(RuleError::NotFound(vec![id]))
    }

    fn active_for_certificate_type(&self, certificate_type: &str) -> Result<Vec<ValidationRule>, RuleError> {
        let wanted = certificate_type.trim().to_lowercase();
        let mut rules: Vec<ValidationRule> = self
            .list()?
            .into_iter()
            .filter(|r| r.is_active && r.certificate_type.trim().to_lowercase() == wanted)
            .collect();
        rules.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rules)
    }

    fn create_many(&self, rules: Vec<NewRule>) -> Result<Vec<ValidationRule>, RuleError> {
        let rules = normalize_new_rules(rules)?;
        let created = self.transact(|file| {
            let mut created = Vec::with_capacity(rules.len());
            for rule in rules {
                if file.duplicate_of(&rule.certificate_type, &rule.product_name, None) {
                    return Err(RuleError::Duplicate {
                        certificate_type: rule.certificate_type,
                        product_name: rule.product_name,
                    });
                }
                let next = file.next_id.max(file.rules.iter().map(|r| r.id).max().unwrap_or(0)) + 1;
                file.next_id = next;
                let stored = ValidationRule {
                    id: next,
                    certificate_type: rule.certificate_type,
                    product_name: rule.product_name,
                    is_active: rule.is_active,
                };
                file.rules.push(stored.clone());
                created.push(stored);
            }
            Ok(created)
        })?;
        tracing::info!(count = created.len(), "Created validation rules");
        Ok(created)
    }

    fn update_many(&self, rules: Vec<RuleUpdate>) -> Result<Vec<ValidationRule>, RuleError> {
        let rules = normalize_rule_updates(rules)?;
        let updated = self.transact(|file| {
            let missing = file.missing(rules.iter().map(|r| r.id));
            if !missing.is_empty() {
                return Err(RuleError::NotFound(missing));
            }

            let mut updated = Vec::with_capacity(rules.len());
            for rule in rules {
                if file.duplicate_of(&rule.certificate_type, &rule.product_name, Some(rule.id)) {
                    return Err(RuleError::Duplicate {
                        certificate_type: rule.certificate_type,
                        product_name: rule.product_name,
                    });
                }
                let stored = ValidationRule {
                    id: rule.id,
                    certificate_type: rule.certificate_type,
                    product_name: rule.product_name,
                    is_active: rule.is_active,
                };
                if let Some(slot) = file.rules.iter_mut().find(|r| r.id == stored.id) {
                    *slot = stored.clone();
                }
                updated.push(stored);
            }
            Ok(updated)
        })?;
        tracing::info!(count = updated.len(), "Updated validation rules");
        Ok(updated)
    }

    fn delete_many(&self, ids: &[i64]) -> Result<Vec<ValidationRule>, RuleError> {
        let ids = normalize_rule_ids(ids)?;
        let deleted = self.transact(|file| {
            let missing = file.missing(ids.iter().copied());
            if !missing.is_empty() {
                return Err(RuleError::NotFound(missing));
            }
            let deleted: Vec<ValidationRule> = ids
                .iter()
                .filter_map(|id| file.rules.iter().find(|r| r.id == *id).cloned())
                .collect();
            file.rules.retain(|r| !ids.contains(&r.id));
            Ok(deleted)
        })?;
        tracing::info!(count = deleted.len(), "Deleted validation rules");
        Ok(deleted)
    }
}

/// Reads a JSON array of rules (`certificate_type`, `product_name`,
/// optional `is_active`) for bulk import.
pub fn read_rules_file(path: &Path) -> Result<Vec<NewRule>, RuleError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
