//! Ranked patient search.
//!
//! Matching runs in tiers: a prefix of any searchable field beats a substring,
//! which beats an approximate name match. Approximate matches are bounded by
//! edit distance so unrelated names never surface.

use std::cmp::Ordering;

use strsim::{jaro_winkler, levenshtein, normalized_levenshtein};

use crate::models::PatientRecord;

/// Match quality tiers, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    /// Within the edit-distance bound of a name
    Approximate,
    Contains,
    Prefix,
}

/// One search result with its score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: PatientRecord,
    pub tier: MatchTier,
    /// Tier base plus, for approximate matches, similarity in [0, 1)
    pub score: f64,
}

/// Queries shorter than this never use approximate matching.
const MIN_FUZZY_LEN: usize = 3;

/// Score `records` against `query` and return matches best first.
///
/// An empty query matches everything, most recently updated first.
pub fn rank(records: Vec<PatientRecord>, query: &str) -> Vec<SearchHit> {
    let query = normalize(query);

    let mut hits: Vec<SearchHit> = records
        .into_iter()
        .filter_map(|record| {
            if query.is_empty() {
                return Some(SearchHit {
                    record,
                    tier: MatchTier::Prefix,
                    score: tier_base(MatchTier::Prefix),
                });
            }
            score_record(&record, &query).map(|(tier, score)| SearchHit {
                record,
                tier,
                score,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
    });
    hits
}

fn score_record(record: &PatientRecord, query: &str) -> Option<(MatchTier, f64)> {
    let names = name_fields(record);
    let others = other_fields(record);

    if names.iter().chain(others.iter()).any(|field| field.starts_with(query)) {
        return Some((MatchTier::Prefix, tier_base(MatchTier::Prefix)));
    }
    if names.iter().chain(others.iter()).any(|field| field.contains(query)) {
        return Some((MatchTier::Contains, tier_base(MatchTier::Contains)));
    }

    let query_len = query.chars().count();
    if query_len < MIN_FUZZY_LEN {
        return None;
    }
    let bound = max_edits(query_len);

    names
        .iter()
        .filter(|name| levenshtein(query, name) <= bound)
        .map(|name| fuzzy_match(query, name))
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|similarity| {
            // Keep approximate scores strictly below the next tier.
            let similarity = similarity.clamp(0.0, 0.999);
            (MatchTier::Approximate, tier_base(MatchTier::Approximate) + similarity)
        })
}

fn tier_base(tier: MatchTier) -> f64 {
    match tier {
        MatchTier::Approximate => 1.0,
        MatchTier::Contains => 2.0,
        MatchTier::Prefix => 3.0,
    }
}

/// Edits tolerated for a query of `len` characters.
fn max_edits(len: usize) -> usize {
    (len / 4).clamp(1, 3)
}

/// Name variants compared against the query.
fn name_fields(record: &PatientRecord) -> Vec<String> {
    let first = normalize(&record.data.first_name);
    let last = normalize(&record.data.last_name);
    vec![
        format!("{first} {last}").trim().to_string(),
        format!("{last} {first}").trim().to_string(),
        first,
        last,
    ]
}

/// Non-name fields that take part in substring matching only.
fn other_fields(record: &PatientRecord) -> Vec<String> {
    let data = &record.data;
    [
        data.email.as_deref(),
        data.phone.as_deref(),
        data.medical_record_number.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(normalize)
    .chain(data.tags.iter().map(|tag| normalize(tag)))
    .filter(|field| !field.is_empty())
    .collect()
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Calculate fuzzy match score between two strings.
fn fuzzy_match(a: &str, b: &str) -> f64 {
    // Combine Jaro-Winkler (good for typos) and Levenshtein (good for overall similarity)
    let jw = jaro_winkler(a, b);
    let lev = normalized_levenshtein(a, b);

    // Weight Jaro-Winkler more heavily as it's better for prefix matching
    jw * 0.6 + lev * 0.4
}
