//! Run summary aggregation: per-tier counts, fallback accounting, cost
//! bookkeeping and profitability means for one completed scan, plus a
//! pure comparator for run-over-run deltas.

use crate::gateway::LOOKUP_CHUNK;
use crate::models::{MatchSource, MatchedProduct};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunSummary {
    pub total_rows: usize,
    pub qualified_rows: usize,
    pub csv_asin_matches: usize,
    pub csv_barcode_matches: usize,
    pub live_matches: usize,
    pub unmatched_rows: usize,
    pub duplicate_rows: usize,
    pub fallback_attempted: usize,
    pub fallback_capped: usize,
    pub fallback_deferred: usize,
    /// Upper bound quoted before any network traffic: one batched call
    /// per hundred rows for each identifier field.
    pub estimated_api_calls: u32,
    pub actual_api_calls: u32,
    pub guard_blocked: bool,
    #[serde(default)]
    pub tokens_remaining: Option<i64>,
    pub duration_ms: u128,
    pub mean_roi: f64,
    pub mean_profit: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub scan_error: Option<String>,
}

/// Worst-case call count for a run over `rows` fallback rows: every row
/// could need an ASIN pass and a barcode pass.
pub fn estimate_api_calls(rows: usize) -> u32 {
    (rows.div_ceil(LOOKUP_CHUNK) * 2) as u32
}

pub struct SummaryInput<'a> {
    pub products: &'a [MatchedProduct],
    pub fallback_attempted: usize,
    pub fallback_capped: usize,
    pub fallback_deferred: usize,
    pub estimated_api_calls: u32,
    pub actual_api_calls: u32,
    pub guard_blocked: bool,
    pub tokens_remaining: Option<i64>,
    pub duration_ms: u128,
    pub scan_error: Option<String>,
}

pub fn summarize(input: SummaryInput<'_>) -> RunSummary {
    let products = input.products;
    let mut csv_asin = 0;
    let mut csv_barcode = 0;
    let mut live = 0;
    let mut unmatched = 0;
    let mut duplicates = 0;
    let mut qualified = 0;
    let mut roi_sum = 0.0;
    let mut profit_sum = 0.0;
    let mut priced = 0usize;

    for product in products {
        match product.match_source {
            MatchSource::CsvAsin => csv_asin += 1,
            MatchSource::CsvBarcode => csv_barcode += 1,
            MatchSource::Live => live += 1,
            MatchSource::Unmatched => unmatched += 1,
        }
        if product.is_duplicate {
            duplicates += 1;
        }
        if product.matches_criteria {
            qualified += 1;
        }
        if product.match_source != MatchSource::Unmatched {
            roi_sum += product.roi;
            profit_sum += product.profit;
            priced += 1;
        }
    }

    let (mean_roi, mean_profit) = if priced > 0 {
        (roi_sum / priced as f64, profit_sum / priced as f64)
    } else {
        (0.0, 0.0)
    };

    RunSummary {
        total_rows: products.len(),
        qualified_rows: qualified,
        csv_asin_matches: csv_asin,
        csv_barcode_matches: csv_barcode,
        live_matches: live,
        unmatched_rows: unmatched,
        duplicate_rows: duplicates,
        fallback_attempted: input.fallback_attempted,
        fallback_capped: input.fallback_capped,
        fallback_deferred: input.fallback_deferred,
        estimated_api_calls: input.estimated_api_calls,
        actual_api_calls: input.actual_api_calls,
        guard_blocked: input.guard_blocked,
        tokens_remaining: input.tokens_remaining,
        duration_ms: input.duration_ms,
        mean_roi,
        mean_profit,
        timestamp: Utc::now(),
        scan_error: input.scan_error,
    }
}

/// Signed run-over-run movement. Positive values mean the second run
/// improved on the first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SummaryDelta {
    pub rows: i64,
    pub qualified_rows: i64,
    pub mean_roi: f64,
    pub mean_profit: f64,
}

pub fn compare(earlier: &RunSummary, later: &RunSummary) -> SummaryDelta {
    SummaryDelta {
        rows: later.total_rows as i64 - earlier.total_rows as i64,
        qualified_rows: later.qualified_rows as i64 - earlier.qualified_rows as i64,
        mean_roi: later.mean_roi - earlier.mean_roi,
        mean_profit: later.mean_profit - earlier.mean_profit,
    }
}
