use serde::Serialize;
use std::collections::HashSet;

use super::text::{
    fuzzy_similarity, round3, rule_product_candidates, stem_overlap_score, token_overlap_score,
};
use crate::rules::ValidationRule;

pub const TOKEN_OVERLAP_THRESHOLD: f64 = 0.6;
pub const STEM_OVERLAP_THRESHOLD: f64 = 0.5;
pub const CONTAINS_SCORE: f64 = 0.9;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Contains,
    TokenOverlap,
    StemOverlap,
    Fuzzy,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Approved,
    Rejected,
}

/// A rule together with its normalized product candidates.
#[derive(Debug, Clone)]
pub struct ExpandedRule {
    pub rule: ValidationRule,
    pub candidates: Vec<String>,
}

/// Rules whose product field yields no candidates are dropped.
pub fn expand_rules(rules: &[ValidationRule]) -> Vec<ExpandedRule> {
    rules
        .iter()
        .filter_map(|rule| {
            let candidates = rule_product_candidates(&rule.product_name);
            (!candidates.is_empty()).then(|| ExpandedRule { rule: rule.clone(), candidates })
        })
        .collect()
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule: ValidationRule,
    /// The normalized rule candidate that matched.
    pub rule_product: String,
    pub match_type: MatchType,
    pub score: f64,
}

impl RuleMatch {
    fn new(expanded: &ExpandedRule, candidate: &str, match_type: MatchType, score: f64) -> Self {
        Self {
            rule: expanded.rule.clone(),
            rule_product: candidate.to_string(),
            match_type,
            score,
        }
    }
}

/// Every (rule, candidate, product) triple in rule, then candidate, then
/// product order.
fn triples<'a>(
    rules: &'a [ExpandedRule],
    products: &'a [String],
) -> impl Iterator<Item = (&'a ExpandedRule, &'a str, &'a str)> + 'a {
    rules.iter().flat_map(move |rule| {
        rule.candidates
            .iter()
            .flat_map(move |candidate| products.iter().map(move |p| (rule, candidate.as_str(), p.as_str())))
    })
}

fn first_above(
    rules: &[ExpandedRule],
    products: &[String],
    threshold: f64,
    match_type: MatchType,
    score: impl Fn(&str, &str) -> f64,
) -> Option<RuleMatch> {
    triples(rules, products).find_map(|(rule, candidate, product)| {
        let s = score(candidate, product);
        (s >= threshold).then(|| RuleMatch::new(rule, candidate, match_type, round3(s)))
    })
}

/// Runs the tiers in order; the first tier that produces a match wins.
///
/// Exact, contains, token and stem overlap take the first eligible pair in
/// iteration order. The fuzzy tier takes the best-scoring pair, earliest on
/// ties. `products` must already be normalized and non-empty.
pub fn match_products(products: &[String], rules: &[ExpandedRule]) -> Option<RuleMatch> {
    let product_set: HashSet<&str> = products.iter().map(String::as_str).collect();

    let exact = rules.iter().find_map(|rule| {
        rule.candidates
            .iter()
            .find(|c| product_set.contains(c.as_str()))
            .map(|c| RuleMatch::new(rule, c, MatchType::Exact, 1.0))
    });
    if exact.is_some() {
        return exact;
    }

    let contains = triples(rules, products).find_map(|(rule, candidate, product)| {
        (product.contains(candidate) || candidate.contains(product))
            .then(|| RuleMatch::new(rule, candidate, MatchType::Contains, CONTAINS_SCORE))
    });
    if contains.is_some() {
        return contains;
    }

    if let Some(m) = first_above(rules, products, TOKEN_OVERLAP_THRESHOLD, MatchType::TokenOverlap, token_overlap_score) {
        return Some(m);
    }
    if let Some(m) = first_above(rules, products, STEM_OVERLAP_THRESHOLD, MatchType::StemOverlap, stem_overlap_score) {
        return Some(m);
    }

    let mut best: Option<(f64, &ExpandedRule, &str)> = None;
    for (rule, candidate, product) in triples(rules, products) {
        let score = fuzzy_similarity(candidate, product);
        if score > 0.0 && best.map_or(true, |(b, _, _)| score > b) {
            best = Some((score, rule, candidate));
        }
    }
    best.map(|(score, rule, candidate)| RuleMatch::new(rule, candidate, MatchType::Fuzzy, round3(score)))
}
