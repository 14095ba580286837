//! Normalization and similarity scores shared by the matcher tiers.

use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use super::stemmer::stem;

/// Long-string fuzzy threshold; shorter strings use a more lenient one.
pub const FUZZY_THRESHOLD: f64 = 0.80;
pub const FUZZY_MEDIUM_THRESHOLD: f64 = 0.75;
pub const FUZZY_SHORT_THRESHOLD: f64 = 0.70;
pub const MIN_TOKEN_INTERSECTION: usize = 1;

static RULE_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,;\n|]+").expect("valid rule separator regex"));

/// Lowercase, spell out `&`/`+`, turn `/ _ -` into spaces, collapse
/// whitespace and drop everything that is not `[a-z0-9 ]`.
pub fn normalize_text(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let mut spaced = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        match ch {
            '&' | '+' => spaced.push_str(" and "),
            '/' | '_' | '-' => spaced.push(' '),
            c => spaced.push(c),
        }
    }
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Splits a rule's product field on `, ; | newline` into distinct
/// normalized candidates, in order.
pub fn rule_product_candidates(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    let candidates: Vec<String> = RULE_SEPARATOR
        .split(raw)
        .map(normalize_text)
        .filter(|c| !c.is_empty() && seen.insert(c.clone()))
        .collect();
    if !candidates.is_empty() {
        return candidates;
    }

    let whole = normalize_text(raw);
    if whole.is_empty() {
        Vec::new()
    } else {
        vec![whole]
    }
}

fn jaccard<T: Ord>(left: &BTreeSet<T>, right: &BTreeSet<T>, min_common: usize) -> f64 {
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let common = left.intersection(right).count();
    if common < min_common.max(1) {
        return 0.0;
    }
    let union = left.union(right).count();
    common as f64 / union as f64
}

fn tokens(text: &str) -> BTreeSet<&str> {
    text.split(' ').filter(|t| !t.is_empty()).collect()
}

/// Jaccard index of the whitespace tokens.
pub fn token_overlap_score(left: &str, right: &str) -> f64 {
    jaccard(&tokens(left), &tokens(right), MIN_TOKEN_INTERSECTION)
}

/// Jaccard index of the Porter-stemmed tokens.
pub fn stem_overlap_score(left: &str, right: &str) -> f64 {
    let stems = |text: &str| -> BTreeSet<String> { text.split_whitespace().map(stem).collect() };
    jaccard(&stems(left), &stems(right), 1)
}

fn longest_match(a: &[char], b: &[char], alo: usize, ahi: usize, blo: usize, bhi: usize) -> (usize, usize, usize) {
    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0);
    // run[j - blo + 1]: length of the match ending at a[i - 1], b[j]
    let mut run = vec![0usize; bhi - blo + 1];
    for i in alo..ahi {
        let mut next = vec![0usize; bhi - blo + 1];
        for j in blo..bhi {
            if a[i] != b[j] {
                continue;
            }
            let k = run[j - blo] + 1;
            next[j - blo + 1] = k;
            if k > best_size {
                best_i = i + 1 - k;
                best_j = j + 1 - k;
                best_size = k;
            }
        }
        run = next;
    }
    (best_i, best_j, best_size)
}

/// `2 * M / T` where `M` counts characters in the recursively found
/// longest common blocks and `T` is the total length. Two empty strings
/// score 1.0.
pub fn sequence_ratio(left: &str, right: &str) -> f64 {
    let a: Vec<char> = left.chars().collect();
    let b: Vec<char> = right.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, size) = longest_match(&a, &b, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }
        matched += size;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            pending.push((i + size, ahi, j + size, bhi));
        }
    }
    2.0 * matched as f64 / total as f64
}

/// Sequence ratio if it clears the length-dependent threshold, else 0.0.
pub fn fuzzy_similarity(left: &str, right: &str) -> f64 {
    let ratio = sequence_ratio(left, right);
    let shortest = left.chars().count().min(right.chars().count());
    let threshold = match shortest {
        0..=4 => FUZZY_SHORT_THRESHOLD,
        5..=10 => FUZZY_MEDIUM_THRESHOLD,
        _ => FUZZY_THRESHOLD,
    };
    if ratio >= threshold {
        ratio
    } else {
        0.0
    }
}

pub fn round3(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}
