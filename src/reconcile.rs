//! Multi-tier identifier reconciliation: merges supplier rows with the
//! bulk export and live lookup results in strict tier order, then flags
//! duplicates on the effective identifier.

use crate::ident::{barcode_variants, normalize_asin, normalize_barcode};
use crate::models::{
    BulkExportRow, LiveLookupResult, LiveMatchField, MatchSource, MatchedProduct, SupplierRow,
};
use std::collections::HashMap;

/// A supplier row with canonicalized identifiers. Immutable once built.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub title: String,
    pub barcode_raw: String,
    pub barcode: String,
    pub asin: String,
    pub cost: f64,
}

impl Candidate {
    pub fn from_supplier(row: &SupplierRow, ordinal: usize) -> Self {
        Self {
            id: row
                .id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("row-{}", ordinal + 1)),
            title: row.title.trim().to_string(),
            barcode_raw: row.barcode.trim().to_string(),
            barcode: normalize_barcode(&row.barcode).unwrap_or_default(),
            asin: normalize_asin(&row.asin).unwrap_or_default(),
            cost: row.cost.max(0.0),
        }
    }

    pub fn has_identifier(&self) -> bool {
        !self.asin.is_empty() || !self.barcode.is_empty()
    }
}

/// Bulk export rows indexed by ASIN and by every canonical-barcode
/// variant. Built once per run, read-only afterwards.
pub struct ExportIndex {
    rows: Vec<BulkExportRow>,
    by_asin: HashMap<String, usize>,
    by_code: HashMap<String, usize>,
}

impl ExportIndex {
    pub fn build(rows: Vec<BulkExportRow>) -> Self {
        let mut by_asin = HashMap::new();
        let mut by_code = HashMap::new();
        for (idx, row) in rows.iter().enumerate() {
            if let Some(asin) = normalize_asin(&row.asin) {
                by_asin.entry(asin).or_insert(idx);
            }
            for ean in &row.eans {
                let Some(code) = normalize_barcode(ean) else {
                    continue;
                };
                for variant in barcode_variants(&code) {
                    by_code.entry(variant).or_insert(idx);
                }
            }
        }
        Self {
            rows,
            by_asin,
            by_code,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn by_asin(&self, asin: &str) -> Option<&BulkExportRow> {
        self.by_asin.get(asin).map(|idx| &self.rows[*idx])
    }

    fn by_code_variants(&self, code: &str) -> Option<&BulkExportRow> {
        barcode_variants(code)
            .iter()
            .find_map(|variant| self.by_code.get(variant))
            .map(|idx| &self.rows[*idx])
    }
}

/// Run-scoped map of live lookup results, keyed by ASIN and by every
/// barcode variant present on each returned record.
#[derive(Default)]
pub struct LiveResultMap {
    by_asin: HashMap<String, LiveLookupResult>,
    by_code: HashMap<String, LiveLookupResult>,
}

impl LiveResultMap {
    pub fn insert(&mut self, record: LiveLookupResult) {
        if let Some(asin) = normalize_asin(&record.asin) {
            self.by_asin.insert(asin, record.clone());
        }
        for ean in &record.eans {
            let Some(code) = normalize_barcode(ean) else {
                continue;
            };
            for variant in barcode_variants(&code) {
                self.by_code.insert(variant, record.clone());
            }
        }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = LiveLookupResult>) {
        for record in records {
            self.insert(record);
        }
    }

    pub fn len(&self) -> usize {
        self.by_asin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_asin.is_empty() && self.by_code.is_empty()
    }

    /// ASIN lookup strictly precedes barcode-variant lookup.
    pub fn lookup(&self, candidate: &Candidate) -> Option<(&LiveLookupResult, LiveMatchField)> {
        if !candidate.asin.is_empty()
            && let Some(record) = self.by_asin.get(&candidate.asin)
        {
            return Some((record, LiveMatchField::Asin));
        }
        if !candidate.barcode.is_empty() {
            for variant in barcode_variants(&candidate.barcode) {
                if let Some(record) = self.by_code.get(&variant) {
                    return Some((record, LiveMatchField::Barcode));
                }
            }
        }
        None
    }
}

/// The outcome of tier matching for one candidate. First match wins; no
/// backtracking.
pub struct Resolution<'a> {
    pub source: MatchSource,
    pub confidence: f64,
    pub export: Option<&'a BulkExportRow>,
    pub live: Option<&'a LiveLookupResult>,
}

pub fn resolve<'a>(
    candidate: &Candidate,
    index: &'a ExportIndex,
    live: &'a LiveResultMap,
) -> Resolution<'a> {
    if !candidate.asin.is_empty()
        && let Some(row) = index.by_asin(&candidate.asin)
    {
        return Resolution {
            source: MatchSource::CsvAsin,
            confidence: MatchSource::CsvAsin.confidence(None),
            export: Some(row),
            live: None,
        };
    }
    if !candidate.barcode.is_empty()
        && let Some(row) = index.by_code_variants(&candidate.barcode)
    {
        return Resolution {
            source: MatchSource::CsvBarcode,
            confidence: MatchSource::CsvBarcode.confidence(None),
            export: Some(row),
            live: None,
        };
    }
    if let Some((record, field)) = live.lookup(candidate) {
        return Resolution {
            source: MatchSource::Live,
            confidence: MatchSource::Live.confidence(Some(field)),
            export: None,
            live: Some(record),
        };
    }
    Resolution {
        source: MatchSource::Unmatched,
        confidence: MatchSource::Unmatched.confidence(None),
        export: None,
        live: None,
    }
}

/// Merges a candidate with its resolved sources into a `MatchedProduct`
/// shell. Financials and fail reasons are filled in by the scoring step.
pub fn merge(candidate: &Candidate, resolution: &Resolution<'_>) -> MatchedProduct {
    let export = resolution.export;
    let live = resolution.live;

    let title = first_non_empty(&[
        candidate.title.as_str(),
        export.map(|row| row.title.as_str()).unwrap_or(""),
        live.map(|rec| rec.title.as_str()).unwrap_or(""),
    ])
    .unwrap_or("Untitled")
    .to_string();

    let sell_price = first_positive(&[
        export.map(|row| row.sell_price).unwrap_or(0.0),
        export.map(|row| row.buy_box_current).unwrap_or(0.0),
        live.map(|rec| rec.sell_price).unwrap_or(0.0),
    ]);

    let bsr = if export.map(|row| row.bsr).unwrap_or(0) > 0 {
        export.map(|row| row.bsr).unwrap_or(0)
    } else {
        live.map(|rec| rec.bsr).unwrap_or(0)
    };

    // The effective ASIN may be acquired from the export or live record
    // when the supplier row only carried a barcode.
    let asin = first_non_empty(&[
        candidate.asin.as_str(),
        export.map(|row| row.asin.as_str()).unwrap_or(""),
        live.map(|rec| rec.asin.as_str()).unwrap_or(""),
    ])
    .map(|value| normalize_asin(value).unwrap_or_else(|| value.to_string()))
    .unwrap_or_default();

    let duplicate_key = if !asin.is_empty() {
        asin.clone()
    } else {
        candidate.barcode.clone()
    };

    MatchedProduct {
        id: candidate.id.clone(),
        title,
        asin,
        barcode: candidate.barcode.clone(),
        barcode_raw: candidate.barcode_raw.clone(),
        bsr,
        sell_price,
        buy_box_90d_avg: export.map(|row| row.buy_box_90d_avg).unwrap_or(0.0),
        new_offer_count: export.map(|row| row.new_offer_count).unwrap_or(0),
        amazon_in_stock_percent: export.map(|row| row.amazon_in_stock_percent).unwrap_or(0.0),
        cost: candidate.cost,
        referral_fee: 0.0,
        fba_fee: 0.0,
        max_buy_cost: 0.0,
        profit: 0.0,
        roi: 0.0,
        match_source: resolution.source,
        match_confidence: resolution.confidence,
        status: String::new(),
        fail_reasons: Vec::new(),
        duplicate_key,
        is_duplicate: false,
        matches_criteria: false,
    }
}

/// Flags duplicate groups on the effective (possibly live-enriched)
/// identifier. Runs only after all matching and live merging so that a
/// row which acquired an ASIN from the export still collides with a row
/// that carried it from the start. Returns the number of flagged rows.
pub fn detect_duplicates(products: &mut [MatchedProduct]) -> usize {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, product) in products.iter().enumerate() {
        if product.duplicate_key.is_empty() {
            continue;
        }
        groups
            .entry(product.duplicate_key.clone())
            .or_default()
            .push(idx);
    }

    let mut flagged = 0;
    for indices in groups.values() {
        if indices.len() < 2 {
            continue;
        }
        for &idx in indices {
            let product = &mut products[idx];
            product.is_duplicate = true;
            product
                .fail_reasons
                .push(crate::scoring::REASON_DUPLICATE.to_string());
            product.status = crate::scoring::status_from(&product.fail_reasons);
            product.matches_criteria = false;
            flagged += 1;
        }
    }
    flagged
}

fn first_non_empty<'a>(values: &[&'a str]) -> Option<&'a str> {
    values
        .iter()
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

fn first_positive(values: &[f64]) -> f64 {
    values.iter().copied().find(|value| *value > 0.0).unwrap_or(0.0)
}
