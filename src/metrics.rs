//! Turns completed provider payloads into [`ResolvedMetric`] rows.

use std::collections::HashSet;

use crate::error::{ResolutionError, ResolutionResult};
use crate::types::{
    CompetitionLevel, MonthlyVolume, ProviderKeywordItem, ProviderTrendItem, ResolvedMetric,
    TaskKind,
};

/// Longest monthly series / trend kept per term.
pub const MAX_SERIES_POINTS: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPayload {
    pub metrics: Vec<ResolvedMetric>,
    /// Requested terms with no row in the payload.
    pub unresolved: Vec<String>,
}

/// Rough keyword difficulty on a 0..=100 scale, from advertiser competition
/// and demand. Always reported as an estimate.
pub fn estimate_difficulty(search_volume: u64, competition_index: u8) -> u8 {
    let demand = ((search_volume as f64 + 1.0).log10() * 20.0).min(100.0);
    let score = 0.6 * f64::from(competition_index) + 0.4 * demand;
    score.round().clamp(0.0, 100.0) as u8
}

pub fn competition_level(label: Option<&str>, index: Option<u8>) -> CompetitionLevel {
    match label.map(|l| l.trim().to_ascii_uppercase()).as_deref() {
        Some("LOW") => CompetitionLevel::Low,
        Some("MEDIUM") => CompetitionLevel::Medium,
        Some("HIGH") => CompetitionLevel::High,
        _ => match index {
            Some(0..=33) => CompetitionLevel::Low,
            Some(34..=66) => CompetitionLevel::Medium,
            Some(_) => CompetitionLevel::High,
            None => CompetitionLevel::Unknown,
        },
    }
}

/// Last twelve months, oldest first.
fn monthly_series(item: &ProviderKeywordItem) -> Vec<MonthlyVolume> {
    let mut series: Vec<MonthlyVolume> = item
        .monthly_searches
        .iter()
        .flatten()
        .filter(|m| (1..=12).contains(&m.month))
        .map(|m| MonthlyVolume {
            year: m.year,
            month: m.month,
            volume: m.search_volume.unwrap_or(0),
        })
        .collect();
    series.sort_by_key(|m| (m.year, m.month));
    series.dedup_by_key(|m| (m.year, m.month));
    let skip = series.len().saturating_sub(MAX_SERIES_POINTS);
    series.split_off(skip)
}

/// Series scaled so its peak is 100.
fn relative_trend(series: &[MonthlyVolume]) -> Vec<f64> {
    let peak = series.iter().map(|m| m.volume).max().unwrap_or(0);
    series
        .iter()
        .map(|m| {
            if peak == 0 {
                0.0
            } else {
                (m.volume as f64 * 100.0 / peak as f64).round()
            }
        })
        .collect()
}

fn keyword_metric(item: ProviderKeywordItem) -> ResolvedMetric {
    let search_volume = item.search_volume.unwrap_or(0);
    let competition_index = item.competition_index.map(|c| c.min(100) as u8);
    let series = monthly_series(&item);
    let trend = relative_trend(&series);
    let (term, spelling_corrected_from) = match item.spell {
        Some(corrected) if !corrected.trim().is_empty() && corrected != item.keyword => {
            (corrected, Some(item.keyword))
        }
        _ => (item.keyword, None),
    };
    ResolvedMetric {
        term,
        search_volume,
        difficulty_estimate: estimate_difficulty(search_volume, competition_index.unwrap_or(0)),
        difficulty_is_estimate: true,
        cpc: item.cpc.unwrap_or(0.0),
        competition_index: competition_index.unwrap_or(0),
        competition_level: competition_level(item.competition.as_deref(), competition_index),
        low_bid: item.low_top_of_page_bid.unwrap_or(0.0),
        high_bid: item.high_top_of_page_bid.unwrap_or(0.0),
        monthly_series: series,
        trend,
        spelling_corrected_from,
    }
}

fn trend_metric(item: ProviderTrendItem) -> ResolvedMetric {
    let values: Vec<f64> = item.values.into_iter().flatten().collect();
    let skip = values.len().saturating_sub(MAX_SERIES_POINTS);
    ResolvedMetric {
        term: item.keyword,
        search_volume: 0,
        difficulty_estimate: 0,
        difficulty_is_estimate: true,
        cpc: 0.0,
        competition_index: 0,
        competition_level: CompetitionLevel::Unknown,
        low_bid: 0.0,
        high_bid: 0.0,
        monthly_series: Vec::new(),
        trend: values[skip..].to_vec(),
        spelling_corrected_from: None,
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> ResolutionResult<Vec<T>> {
    if payload.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(payload.clone())
        .map_err(|e| ResolutionError::upstream(format!("Malformed task result: {}", e)))
}

/// Parse a completed task payload. `requested` are the submitted terms; for
/// direct lookups any of them missing from the payload is reported as
/// unresolved.
pub fn parse_payload(
    kind: TaskKind,
    payload: &serde_json::Value,
    requested: &[String],
    limit: Option<u32>,
) -> ResolutionResult<ParsedPayload> {
    let mut metrics: Vec<ResolvedMetric> = match kind {
        TaskKind::SearchVolume | TaskKind::RelatedKeywords => decode::<ProviderKeywordItem>(payload)?
            .into_iter()
            .map(keyword_metric)
            .collect(),
        TaskKind::Trends => decode::<ProviderTrendItem>(payload)?
            .into_iter()
            .map(trend_metric)
            .collect(),
    };

    if kind == TaskKind::RelatedKeywords {
        metrics.sort_by(|a, b| b.search_volume.cmp(&a.search_volume));
        if let Some(limit) = limit {
            metrics.truncate(limit as usize);
        }
        return Ok(ParsedPayload {
            metrics,
            unresolved: Vec::new(),
        });
    }

    let returned: HashSet<String> = metrics
        .iter()
        .flat_map(|m| std::iter::once(&m.term).chain(m.spelling_corrected_from.iter()))
        .map(|t| t.to_lowercase())
        .collect();
    let unresolved = requested
        .iter()
        .filter(|t| !returned.contains(&t.to_lowercase()))
        .cloned()
        .collect();
    Ok(ParsedPayload {
        metrics,
        unresolved,
    })
}
