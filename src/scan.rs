//! Scan orchestration: normalizes supplier rows, reconciles them against
//! the bulk export and the live fallback queue, scores every row and
//! aggregates the run summary. Each stage is timed and recorded in the
//! response transcript.

use crate::amazon::lookup::{BulkLookupClient, LookupTransport};
use crate::fallback::{self, FallbackOutcome, FallbackParams};
use crate::gateway::{ClientIdentity, Gateway, GatewayConfig, GatewayState, TokenGuard};
use crate::models::{
    RetryRequest, ScanConfig, ScanRequest, ScanResponse, StageReport, SupplierRow,
};
use crate::reconcile::{self, Candidate, ExportIndex, LiveResultMap};
use crate::scoring::{self, ReasonInput, ScoreInput};
use crate::security::OrgContext;
use crate::summary::{self, SummaryInput};
use serde_json::json;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub struct Scanner<T: LookupTransport> {
    gateway: Arc<Gateway<T>>,
}

impl<T: LookupTransport> Clone for Scanner<T> {
    fn clone(&self) -> Self {
        Self {
            gateway: self.gateway.clone(),
        }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct ScanError {
    stage: &'static str,
    message: String,
    kind: ScanErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanErrorKind {
    InvalidInput,
    Internal,
}

impl ScanError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: ScanErrorKind::InvalidInput,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: ScanErrorKind::Internal,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> ScanErrorKind {
        self.kind
    }
}

struct StageOutcome<T> {
    value: T,
    output: serde_json::Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: serde_json::Value) -> Self {
        Self { value, output }
    }
}

impl Scanner<BulkLookupClient> {
    /// Scanner wired to the HTTP lookup client, configured from env.
    pub fn from_env() -> Self {
        let transport = Arc::new(BulkLookupClient::new());
        let gateway = Gateway::new(
            transport,
            Arc::new(GatewayState::new()),
            GatewayConfig::from_env(),
        );
        Self::new(Arc::new(gateway))
    }
}

impl<T: LookupTransport> Scanner<T> {
    pub fn new(gateway: Arc<Gateway<T>>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Gateway<T> {
        &self.gateway
    }

    pub async fn run(
        &self,
        request: ScanRequest,
        auth: Option<OrgContext>,
    ) -> Result<ScanResponse, ScanError> {
        let run_started = Instant::now();
        let scan_id = Uuid::new_v4().to_string();
        let mut stages = Vec::new();

        if let Some(context) = &auth {
            info!(
                target = "sourcer.scan",
                scan_id = %scan_id,
                org_id = %context.org_id,
                rows = request.supplier_rows.len(),
                "scan invoked",
            );
        }

        let candidates = self
            .capture_stage("normalize_rows", &mut stages, async {
                normalize_rows(&request.supplier_rows)
            })
            .await?;

        let index = self
            .capture_stage("index_export", &mut stages, {
                let rows = request.export_rows.clone();
                async move {
                    let index = ExportIndex::build(rows);
                    let output = json!({ "rows": index.len() });
                    Ok(StageOutcome::new(index, output))
                }
            })
            .await?;

        let fallback_set = self
            .capture_stage("match_csv", &mut stages, async {
                Ok(match_csv(&candidates, &index))
            })
            .await?;

        let mut live = LiveResultMap::default();
        let fallback_outcome = self
            .capture_stage("fallback_live", &mut stages, async {
                let params = fallback_params(&request.config, &request, auth.as_ref());
                let scan_id = scan_id.as_str();
                let outcome = fallback::drain(
                    self.gateway.as_ref(),
                    &params,
                    &fallback_set,
                    &mut live,
                    |progress| {
                        info!(
                            target = "sourcer.scan",
                            scan_id = %scan_id,
                            batch = progress.batch,
                            batches = progress.batches,
                            processed = progress.processed,
                            matched = progress.matched,
                            "fallback_batch_complete",
                        );
                    },
                )
                .await;
                let output = json!({
                    "attempted": fallback_set.len(),
                    "processed": outcome.processed,
                    "deferred": outcome.deferred,
                    "capped": outcome.capped,
                    "matched": outcome.matched,
                    "api_calls": outcome.api_calls,
                    "live_records": live.len(),
                    "stopped": outcome.stop.as_ref().map(|stop| stop.detail()),
                });
                Ok(StageOutcome::new(outcome, output))
            })
            .await?;

        let mut products = self
            .capture_stage("score_rows", &mut stages, async {
                Ok(score_rows(
                    &candidates,
                    &index,
                    &live,
                    &request.config,
                    request.identifier_only,
                ))
            })
            .await?;

        self.capture_stage("detect_duplicates", &mut stages, async {
            let flagged = reconcile::detect_duplicates(&mut products);
            Ok(StageOutcome::new((), json!({ "flagged": flagged })))
        })
        .await?;

        let summary = self
            .capture_stage("summarize", &mut stages, async {
                let estimated =
                    summary::estimate_api_calls(fallback_set.len().min(request.config.max_fallback_rows));
                let tokens_remaining = match fallback_outcome.tokens_remaining {
                    Some(remaining) => Some(remaining),
                    None => {
                        self.gateway
                            .state()
                            .tokens_remaining(request.marketplace)
                            .await
                    }
                };
                let summary = summary::summarize(SummaryInput {
                    products: &products,
                    fallback_attempted: fallback_outcome.processed,
                    fallback_capped: fallback_outcome.capped,
                    fallback_deferred: fallback_outcome.deferred,
                    estimated_api_calls: estimated,
                    actual_api_calls: fallback_outcome.api_calls,
                    guard_blocked: fallback_outcome.guard_blocked(),
                    tokens_remaining,
                    duration_ms: run_started.elapsed().as_millis(),
                    scan_error: scan_error_from(&fallback_outcome),
                });
                let output = json!({
                    "total_rows": summary.total_rows,
                    "qualified_rows": summary.qualified_rows,
                    "actual_api_calls": summary.actual_api_calls,
                });
                Ok(StageOutcome::new(summary, output))
            })
            .await?;

        info!(
            target = "sourcer.scan",
            scan_id = %scan_id,
            rows = summary.total_rows,
            qualified = summary.qualified_rows,
            api_calls = summary.actual_api_calls,
            duration_ms = summary.duration_ms as u64,
            "scan complete",
        );

        Ok(ScanResponse {
            scan_id,
            products,
            summary,
            stages,
        })
    }

    /// Re-runs matching for previously unmatched rows, with per-row
    /// identifier overrides applied before lookup. Rows that already
    /// matched are carried over untouched (apart from duplicate flags,
    /// which are recomputed across the combined set).
    pub async fn retry_unmatched(
        &self,
        request: RetryRequest,
        auth: Option<OrgContext>,
    ) -> Result<ScanResponse, ScanError> {
        let (matched, unmatched): (Vec<_>, Vec<_>) = request
            .products
            .into_iter()
            .partition(|product| product.match_source != crate::models::MatchSource::Unmatched);

        if unmatched.is_empty() {
            return Err(ScanError::invalid_input(
                "retry_unmatched",
                "no unmatched rows to retry",
            ));
        }

        let supplier_rows: Vec<SupplierRow> = unmatched
            .iter()
            .map(|product| {
                let overridden = request
                    .overrides
                    .iter()
                    .find(|row_override| row_override.id == product.id);
                SupplierRow {
                    id: Some(product.id.clone()),
                    title: product.title.clone(),
                    barcode: overridden
                        .and_then(|o| o.barcode.clone())
                        .unwrap_or_else(|| product.barcode_raw.clone()),
                    asin: overridden
                        .and_then(|o| o.asin.clone())
                        .unwrap_or_else(|| product.asin.clone()),
                    cost: product.cost,
                }
            })
            .collect();

        let rescan = self
            .run(
                ScanRequest {
                    supplier_rows,
                    export_rows: request.export_rows,
                    config: request.config,
                    marketplace: request.marketplace,
                    identifier_only: request.identifier_only,
                    gateway_token: request.gateway_token,
                },
                auth,
            )
            .await?;

        let mut products = matched;
        products.extend(rescan.products);
        for product in &mut products {
            clear_duplicate_flags(product);
        }
        reconcile::detect_duplicates(&mut products);

        let summary = summary::summarize(SummaryInput {
            products: &products,
            fallback_attempted: rescan.summary.fallback_attempted,
            fallback_capped: rescan.summary.fallback_capped,
            fallback_deferred: rescan.summary.fallback_deferred,
            estimated_api_calls: rescan.summary.estimated_api_calls,
            actual_api_calls: rescan.summary.actual_api_calls,
            guard_blocked: rescan.summary.guard_blocked,
            tokens_remaining: rescan.summary.tokens_remaining,
            duration_ms: rescan.summary.duration_ms,
            scan_error: rescan.summary.scan_error.clone(),
        });

        Ok(ScanResponse {
            scan_id: rescan.scan_id,
            products,
            summary,
            stages: rescan.stages,
        })
    }

    async fn capture_stage<V, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<V, ScanError>
    where
        Fut: Future<Output = Result<StageOutcome<V>, ScanError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn normalize_rows(rows: &[SupplierRow]) -> Result<StageOutcome<Vec<Candidate>>, ScanError> {
    if rows.is_empty() {
        return Err(ScanError::invalid_input(
            "normalize_rows",
            "no supplier rows provided",
        ));
    }
    let candidates: Vec<Candidate> = rows
        .iter()
        .enumerate()
        .map(|(ordinal, row)| Candidate::from_supplier(row, ordinal))
        .collect();
    let with_identifiers = candidates
        .iter()
        .filter(|candidate| candidate.has_identifier())
        .count();
    let output = json!({
        "rows": candidates.len(),
        "with_identifiers": with_identifiers,
        "missing_identifiers": candidates.len() - with_identifiers,
    });
    Ok(StageOutcome::new(candidates, output))
}

/// First local pass: rows the export tiers already resolve are done; the
/// remainder with at least one identifier become the fallback set.
fn match_csv(candidates: &[Candidate], index: &ExportIndex) -> StageOutcome<Vec<Candidate>> {
    let empty_live = LiveResultMap::default();
    let mut asin_hits = 0usize;
    let mut code_hits = 0usize;
    let mut fallback_set = Vec::new();
    for candidate in candidates {
        let resolution = reconcile::resolve(candidate, index, &empty_live);
        match resolution.source {
            crate::models::MatchSource::CsvAsin => asin_hits += 1,
            crate::models::MatchSource::CsvBarcode => code_hits += 1,
            _ if candidate.has_identifier() => fallback_set.push(candidate.clone()),
            _ => {}
        }
    }
    let output = json!({
        "csv_asin": asin_hits,
        "csv_barcode": code_hits,
        "fallback_rows": fallback_set.len(),
    });
    StageOutcome::new(fallback_set, output)
}

fn score_rows(
    candidates: &[Candidate],
    index: &ExportIndex,
    live: &LiveResultMap,
    cfg: &ScanConfig,
    identifier_only: bool,
) -> StageOutcome<Vec<crate::models::MatchedProduct>> {
    let cost_known = !identifier_only;
    let mut qualified = 0usize;
    let products: Vec<_> = candidates
        .iter()
        .map(|candidate| {
            let resolution = reconcile::resolve(candidate, index, live);
            let mut product = reconcile::merge(candidate, &resolution);
            let financials = scoring::score(
                &ScoreInput {
                    sell_price: product.sell_price,
                    cost: candidate.cost,
                    cost_known,
                    export: resolution.export,
                },
                cfg,
            );
            product.referral_fee = financials.referral_fee;
            product.fba_fee = financials.fulfilment_fee;
            product.profit = financials.profit;
            product.roi = financials.roi;
            product.max_buy_cost = financials.max_buy_cost;
            product.fail_reasons = scoring::fail_reasons(
                &ReasonInput {
                    has_asin: !candidate.asin.is_empty(),
                    has_barcode: !candidate.barcode.is_empty(),
                    cost: candidate.cost,
                    cost_known,
                    match_source: product.match_source,
                    sell_price: product.sell_price,
                    bsr: product.bsr,
                    roi: product.roi,
                    profit: product.profit,
                },
                cfg,
            );
            product.status = scoring::status_from(&product.fail_reasons);
            product.matches_criteria = product.fail_reasons.is_empty();
            if product.matches_criteria {
                qualified += 1;
            }
            product
        })
        .collect();
    let output = json!({
        "scored": products.len(),
        "qualified": qualified,
    });
    StageOutcome::new(products, output)
}

fn fallback_params(
    cfg: &ScanConfig,
    request: &ScanRequest,
    auth: Option<&OrgContext>,
) -> FallbackParams {
    let client = match auth {
        Some(context) => ClientIdentity::new(context.org_id.clone(), context.api_key_id.clone()),
        None => ClientIdentity::local(),
    };
    FallbackParams {
        batch_size: cfg.batch_size,
        max_rows: cfg.max_fallback_rows,
        marketplace: request.marketplace,
        client,
        auth_token: request.gateway_token.clone(),
        guard: TokenGuard {
            mode: cfg.token_guard_mode,
            floor: cfg.token_guard_floor,
        },
    }
}

/// A guard block is a structured deferral, not a failure; anything else
/// that stopped the drain is surfaced as the run's scan error.
fn scan_error_from(outcome: &FallbackOutcome) -> Option<String> {
    match &outcome.stop {
        None | Some(crate::fallback::FallbackStop::GuardBlocked) => None,
        Some(stop) => Some(stop.detail()),
    }
}

fn clear_duplicate_flags(product: &mut crate::models::MatchedProduct) {
    product
        .fail_reasons
        .retain(|reason| reason != scoring::REASON_DUPLICATE);
    product.is_duplicate = false;
    product.status = scoring::status_from(&product.fail_reasons);
    product.matches_criteria = product.fail_reasons.is_empty();
}
