use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One candidate row from the seller's supplier file, as handed over by
/// ingestion. Identifiers arrive raw; the scan normalizes them before
/// matching.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SupplierRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub barcode: String,
    #[serde(default)]
    pub asin: String,
    #[serde(default)]
    pub cost: f64,
}

/// One row from the locally supplied bulk pricing/rank export. Read-only
/// during a run; indexed by ASIN and by every canonical barcode variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BulkExportRow {
    pub asin: String,
    #[serde(default)]
    pub eans: Vec<String>,
    #[serde(default)]
    pub sell_price: f64,
    #[serde(default)]
    pub buy_box_current: f64,
    #[serde(default)]
    pub buy_box_90d_avg: f64,
    #[serde(default)]
    pub bsr: u64,
    #[serde(default)]
    pub bsr_drops_90d: u64,
    #[serde(default)]
    pub new_offer_count: u32,
    #[serde(default)]
    pub amazon_in_stock_percent: f64,
    #[serde(default)]
    pub fba_fee: f64,
    #[serde(default)]
    pub referral_fee_absolute: f64,
    #[serde(default)]
    pub referral_fee_percent: f64,
    #[serde(default)]
    pub title: String,
}

/// One record returned by the remote lookup service. Run-scoped and
/// ephemeral; keyed into the live-result map by ASIN and by every
/// barcode variant seen on the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LiveLookupResult {
    pub asin: String,
    #[serde(default)]
    pub sell_price: f64,
    #[serde(default)]
    pub bsr: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub eans: Vec<String>,
}

/// Which tier resolved a row. Declaration order is the strict matching
/// order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    CsvAsin,
    CsvBarcode,
    Live,
    Unmatched,
}

/// For live matches, which identifier field resolved the remote record.
/// Drives the live-tier confidence split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMatchField {
    Asin,
    Barcode,
}

impl MatchSource {
    /// Confidence is a fixed function of the source (and, for live
    /// matches, of the field that resolved the record).
    pub fn confidence(self, live_field: Option<LiveMatchField>) -> f64 {
        match self {
            MatchSource::CsvAsin => 0.99,
            MatchSource::CsvBarcode => 0.92,
            MatchSource::Live => match live_field {
                Some(LiveMatchField::Barcode) => 0.70,
                _ => 0.80,
            },
            MatchSource::Unmatched => 0.0,
        }
    }
}

/// The reconciled, scored unit handed back per supplier row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MatchedProduct {
    pub id: String,
    pub title: String,
    pub asin: String,
    pub barcode: String,
    pub barcode_raw: String,
    pub bsr: u64,
    pub sell_price: f64,
    pub buy_box_90d_avg: f64,
    pub new_offer_count: u32,
    pub amazon_in_stock_percent: f64,
    pub cost: f64,
    pub referral_fee: f64,
    pub fba_fee: f64,
    pub max_buy_cost: f64,
    pub profit: f64,
    pub roi: f64,
    pub match_source: MatchSource,
    pub match_confidence: f64,
    pub status: String,
    pub fail_reasons: Vec<String>,
    pub duplicate_key: String,
    pub is_duplicate: bool,
    pub matches_criteria: bool,
}

/// Fee, VAT, threshold and queue configuration for one scan. Supplied by
/// the caller; every field has a workable default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ScanConfig {
    pub referral_fee_percent: f64,
    pub per_item_fee: f64,
    pub variable_closing_fee: f64,
    pub default_fulfilment_fee: f64,
    pub digital_services_percent: f64,
    pub vat_registered: bool,
    pub vat_rate: f64,
    pub use_vat_due_model: bool,
    pub include_estimated_vat_on_sale: bool,
    pub prep_fee: f64,
    pub inbound_fee: f64,
    pub misc_fee: f64,
    pub storage_fee: f64,
    pub discount: f64,
    pub min_roi_percent: f64,
    pub min_profit: f64,
    pub max_bsr: u64,
    pub batch_size: usize,
    pub max_fallback_rows: usize,
    pub token_guard_mode: TokenGuardMode,
    pub token_guard_floor: i64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            referral_fee_percent: 15.0,
            per_item_fee: 0.0,
            variable_closing_fee: 0.0,
            default_fulfilment_fee: 0.0,
            digital_services_percent: 2.0,
            vat_registered: false,
            vat_rate: 20.0,
            use_vat_due_model: false,
            include_estimated_vat_on_sale: true,
            prep_fee: 0.0,
            inbound_fee: 0.0,
            misc_fee: 0.0,
            storage_fee: 0.0,
            discount: 0.0,
            min_roi_percent: 25.0,
            min_profit: 2.0,
            max_bsr: 150_000,
            batch_size: 100,
            max_fallback_rows: 1000,
            token_guard_mode: TokenGuardMode::Off,
            token_guard_floor: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenGuardMode {
    #[default]
    Off,
    HardStop,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScanRequest {
    pub supplier_rows: Vec<SupplierRow>,
    #[serde(default)]
    pub export_rows: Vec<BulkExportRow>,
    #[serde(default)]
    pub config: ScanConfig,
    #[serde(default)]
    pub marketplace: MarketplaceId,
    /// Identifier-only scans carry no usable cost column; profit, ROI
    /// and max buy cost are forced to zero rather than computed.
    #[serde(default)]
    pub identifier_only: bool,
    #[serde(default)]
    pub gateway_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResponse {
    pub scan_id: String,
    pub products: Vec<MatchedProduct>,
    pub summary: crate::summary::RunSummary,
    pub stages: Vec<StageReport>,
}

/// Per-row identifier override used by the retry-unmatched entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RowOverride {
    pub id: String,
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryRequest {
    pub products: Vec<MatchedProduct>,
    #[serde(default)]
    pub overrides: Vec<RowOverride>,
    #[serde(default)]
    pub export_rows: Vec<BulkExportRow>,
    #[serde(default)]
    pub config: ScanConfig,
    #[serde(default)]
    pub marketplace: MarketplaceId,
    #[serde(default)]
    pub identifier_only: bool,
    #[serde(default)]
    pub gateway_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketplaceId {
    #[default]
    AmazonUk,
    AmazonUs,
    AmazonDe,
}

impl MarketplaceId {
    pub fn code(&self) -> &'static str {
        match self {
            MarketplaceId::AmazonUk => "UK",
            MarketplaceId::AmazonUs => "US",
            MarketplaceId::AmazonDe => "DE",
        }
    }
}
