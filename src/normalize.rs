//! Input sanitation and canonicalization.
//!
//! Everything that reaches the cache or the provider goes through here first,
//! so two requests that mean the same thing always produce the same
//! [`CacheKey`].

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

use crate::error::{ResolutionError, ResolutionResult};
use crate::types::{InvalidKeyword, KeywordRequest, TaskInput, TaskKind};

pub const MAX_PHRASE_CHARS: usize = 80;
pub const MAX_PHRASE_WORDS: usize = 10;
/// Upper bound for a caller-supplied result limit.
pub const MAX_LIMIT: u32 = 1000;

static ALLOWED_PHRASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[\p{L}\p{N} \-.,&'"+?!]+$"#).unwrap());

/// Region code -> (provider location code, language code).
const LOCATIONS: &[(&str, u32, &str)] = &[
    ("us", 2840, "en"),
    ("gb", 2826, "en"),
    ("ca", 2124, "en"),
    ("au", 2036, "en"),
    ("ie", 2372, "en"),
    ("nz", 2554, "en"),
    ("in", 2356, "en"),
    ("de", 2276, "de"),
    ("at", 2040, "de"),
    ("fr", 2250, "fr"),
    ("es", 2724, "es"),
    ("mx", 2484, "es"),
    ("it", 2380, "it"),
    ("nl", 2528, "nl"),
    ("br", 2076, "pt"),
    ("pt", 2620, "pt"),
    ("se", 2752, "sv"),
    ("pl", 2616, "pl"),
    ("jp", 2392, "ja"),
];

const LOCATION_ALIASES: &[(&str, &str)] = &[("uk", "gb"), ("usa", "us")];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub region: String,
    pub location_code: u32,
    pub language_code: String,
}

/// Result of validating a list of phrases without failing the whole batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPartition {
    pub valid: Vec<String>,
    pub invalid: Vec<InvalidKeyword>,
}

/// Stable content hash of a canonical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options that change what the provider returns, and so belong in the key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyOptions {
    pub limit: Option<u32>,
    pub search_partners: bool,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_pictographic(c: char) -> bool {
    matches!(
        u32::from(c),
        0x1F000..=0x1FAFF
            | 0x2300..=0x23FF
            | 0x2600..=0x27BF
            | 0x2B00..=0x2BFF
            | 0x3030
            | 0x303D
            | 0x3297
            | 0x3299
            | 0x200D
            | 0xFE0F
            | 0xE0020..=0xE007F
    )
}

/// Clean a single keyword phrase into its canonical lowercase form.
pub fn normalize_phrase(raw: &str) -> ResolutionResult<String> {
    let phrase = collapse_whitespace(raw);
    if phrase.is_empty() {
        return Err(ResolutionError::Validation("keyword is empty".into()));
    }
    if phrase.chars().any(is_pictographic) {
        return Err(ResolutionError::Validation(
            "keyword contains emoji or pictographic characters".into(),
        ));
    }
    if phrase.chars().count() > MAX_PHRASE_CHARS {
        return Err(ResolutionError::Validation(format!(
            "keyword exceeds {MAX_PHRASE_CHARS} characters"
        )));
    }
    if phrase.split(' ').count() > MAX_PHRASE_WORDS {
        return Err(ResolutionError::Validation(format!(
            "keyword exceeds {MAX_PHRASE_WORDS} words"
        )));
    }
    if !ALLOWED_PHRASE.is_match(&phrase) {
        return Err(ResolutionError::Validation(
            "keyword contains unsupported characters".into(),
        ));
    }
    Ok(phrase.to_lowercase())
}

/// Validate every phrase, keeping the good ones (deduplicated, first
/// occurrence wins) and recording why the others were refused.
pub fn normalize_batch<S: AsRef<str>>(raw: &[S]) -> BatchPartition {
    let mut partition = BatchPartition::default();
    let mut seen = HashSet::new();
    for input in raw {
        let input = input.as_ref();
        match normalize_phrase(input) {
            Ok(phrase) => {
                if seen.insert(phrase.clone()) {
                    partition.valid.push(phrase);
                }
            }
            Err(ResolutionError::Validation(reason)) => partition.invalid.push(InvalidKeyword {
                input: input.to_string(),
                reason,
            }),
            Err(other) => partition.invalid.push(InvalidKeyword {
                input: input.to_string(),
                reason: other.to_string(),
            }),
        }
    }
    partition
}

/// Map a short region code (case-insensitive) to provider location codes.
pub fn normalize_location(raw: &str) -> ResolutionResult<Location> {
    let code = raw.trim().to_lowercase();
    let code = LOCATION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == code)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(code);
    LOCATIONS
        .iter()
        .find(|(region, _, _)| *region == code)
        .map(|(region, location_code, language_code)| Location {
            region: region.to_string(),
            location_code: *location_code,
            language_code: language_code.to_string(),
        })
        .ok_or_else(|| ResolutionError::Validation(format!("unknown location '{}'", raw.trim())))
}

/// Hash the canonical form of a request. Terms are re-canonicalized here so
/// ordering, casing and whitespace never leak into the key.
pub fn generate_cache_key<S: AsRef<str>>(
    kind: TaskKind,
    keywords: &[S],
    location: &Location,
    options: &KeyOptions,
) -> CacheKey {
    let mut terms: Vec<String> = keywords
        .iter()
        .map(|k| collapse_whitespace(k.as_ref()).to_lowercase())
        .collect();
    terms.sort();
    terms.dedup();

    // serde_json::Map keeps keys sorted, which fixes the field order.
    let canonical = serde_json::json!({
        "requestKind": kind.as_str(),
        "keywords": terms,
        "locationCode": location.location_code,
        "limit": options.limit,
        "searchPartners": options.search_partners,
        "dateFrom": options.date_from.map(|d| d.to_string()),
        "dateTo": options.date_to.map(|d| d.to_string()),
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    CacheKey(format!("{:x}", digest))
}

/// Longest ticket id accepted for out-of-band resumes.
pub const MAX_TICKET_ID_CHARS: usize = 64;

/// Provider ticket ids are hex groups joined by dashes.
pub fn normalize_ticket_id(raw: &str) -> ResolutionResult<String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(ResolutionError::Validation("ticket id is empty".into()));
    }
    if id.chars().count() > MAX_TICKET_ID_CHARS
        || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ResolutionError::Validation(format!(
            "malformed ticket id '{id}'"
        )));
    }
    Ok(id.to_ascii_lowercase())
}

/// Key under which resumes of one ticket are coalesced and cached.
pub fn ticket_cache_key(kind: TaskKind, ticket_id: &str) -> CacheKey {
    let canonical = serde_json::json!({
        "requestKind": kind.as_str(),
        "ticketId": ticket_id,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    CacheKey(format!("{:x}", digest))
}

/// A fully validated request, ready for hashing and submission.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub kind: TaskKind,
    /// Sorted and deduplicated.
    pub keywords: Vec<String>,
    pub location: Location,
    pub options: KeyOptions,
    pub rejected: Vec<InvalidKeyword>,
}

impl NormalizedRequest {
    pub fn cache_key(&self) -> CacheKey {
        generate_cache_key(self.kind, &self.keywords, &self.location, &self.options)
    }

    pub fn task_input(&self) -> TaskInput {
        TaskInput {
            keywords: self.keywords.clone(),
            location_code: self.location.location_code,
            language_code: self.location.language_code.clone(),
            limit: self.options.limit,
            search_partners: self.options.search_partners,
            date_from: self.options.date_from,
            date_to: self.options.date_to,
        }
    }
}

/// Validate a raw request. Partially invalid keyword lists are accepted and
/// the refused terms reported; a request with no usable keyword is not.
pub fn normalize_request(request: &KeywordRequest) -> ResolutionResult<NormalizedRequest> {
    let location = normalize_location(&request.location)?;

    let partition = normalize_batch(&request.keywords);
    if partition.valid.is_empty() {
        let reason = partition
            .invalid
            .first()
            .map(|i| i.reason.clone())
            .unwrap_or_else(|| "keyword is empty".to_string());
        return Err(ResolutionError::Validation(reason));
    }
    let max = request.kind.max_batch();
    if partition.valid.len() > max {
        return Err(ResolutionError::Validation(format!(
            "{} accepts at most {max} keywords, got {}",
            request.kind,
            partition.valid.len()
        )));
    }

    if let Some(limit) = request.limit {
        if limit == 0 || limit > MAX_LIMIT {
            return Err(ResolutionError::Validation(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            )));
        }
    }
    if let (Some(from), Some(to)) = (request.date_from, request.date_to) {
        if from > to {
            return Err(ResolutionError::Validation(
                "dateFrom must not be after dateTo".into(),
            ));
        }
    }

    let mut keywords = partition.valid;
    keywords.sort();

    Ok(NormalizedRequest {
        kind: request.kind,
        keywords,
        location,
        options: KeyOptions {
            limit: request.limit,
            search_partners: request.search_partners,
            date_from: request.date_from,
            date_to: request.date_to,
        },
        rejected: partition.invalid,
    })
}
