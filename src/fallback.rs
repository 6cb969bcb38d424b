//! Batched fallback queue: rows the local tiers could not resolve are
//! drained through the gateway in fixed-size batches, with a progress
//! event per batch. The queue degrades instead of failing the run: a
//! guard block or an unrecoverable gateway error stops draining and the
//! remaining rows are reported as deferred.

use crate::gateway::{ClientIdentity, Gateway, GatewayError, LookupCall, TokenGuard};
use crate::models::MarketplaceId;
use crate::amazon::lookup::LookupTransport;
use crate::reconcile::{Candidate, LiveResultMap};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct FallbackParams {
    pub batch_size: usize,
    pub max_rows: usize,
    pub marketplace: MarketplaceId,
    pub client: ClientIdentity,
    pub auth_token: Option<String>,
    pub guard: TokenGuard,
}

/// Emitted after every completed batch so callers can surface progress.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch: usize,
    pub batches: usize,
    pub processed: usize,
    pub matched: usize,
    pub deferred: usize,
}

/// Why the queue stopped before draining every accepted row.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackStop {
    GuardBlocked,
    RateLimited { retry_after_secs: u64 },
    CircuitOpen { retry_after_secs: u64 },
    Upstream(String),
}

impl FallbackStop {
    pub fn detail(&self) -> String {
        match self {
            FallbackStop::GuardBlocked => "token budget exhausted".to_string(),
            FallbackStop::RateLimited { retry_after_secs } => {
                format!("rate limited, retry after {retry_after_secs}s")
            }
            FallbackStop::CircuitOpen { retry_after_secs } => {
                format!("upstream circuit open, retry after {retry_after_secs}s")
            }
            FallbackStop::Upstream(detail) => detail.clone(),
        }
    }
}

#[derive(Debug)]
pub struct FallbackOutcome {
    /// Rows drained through completed batches.
    pub processed: usize,
    /// Rows accepted but never sent because draining stopped.
    pub deferred: usize,
    /// Rows dropped up front by the per-run cap.
    pub capped: usize,
    /// Rows whose identifier now resolves in the live map.
    pub matched: usize,
    pub api_calls: u32,
    pub tokens_remaining: Option<i64>,
    pub stop: Option<FallbackStop>,
}

impl FallbackOutcome {
    pub fn guard_blocked(&self) -> bool {
        matches!(self.stop, Some(FallbackStop::GuardBlocked))
    }
}

/// Drains unresolved candidates through the gateway, batch by batch,
/// merging results into `live`. One gateway invocation per batch; the
/// gateway internally orders ASIN lookups before barcode lookups.
pub async fn drain<T: LookupTransport>(
    gateway: &Gateway<T>,
    params: &FallbackParams,
    candidates: &[Candidate],
    live: &mut LiveResultMap,
    mut on_progress: impl FnMut(BatchProgress),
) -> FallbackOutcome {
    let batch_size = params.batch_size.max(1);
    let capped = candidates.len().saturating_sub(params.max_rows);
    let accepted = &candidates[..candidates.len().min(params.max_rows)];
    if capped > 0 {
        warn!(
            target = "sourcer.fallback",
            capped,
            max_rows = params.max_rows,
            "fallback_rows_capped"
        );
    }

    let batches = accepted.len().div_ceil(batch_size);
    let mut processed = 0usize;
    let mut matched = 0usize;
    let mut api_calls = 0u32;
    let mut tokens_remaining = None;
    let mut stop = None;

    for (batch_idx, batch) in accepted.chunks(batch_size).enumerate() {
        let call = batch_call(params, batch);
        let reply = match gateway.execute(call).await {
            Ok(reply) => reply,
            Err(GatewayError::RateLimited { retry_after_secs }) => {
                // one in-place retry after the window rolls over
                tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                match gateway.execute(batch_call(params, batch)).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        stop = Some(stop_from(err));
                        break;
                    }
                }
            }
            Err(err) => {
                stop = Some(stop_from(err));
                break;
            }
        };

        api_calls += reply.cost.api_calls;
        if reply.cost.tokens_remaining.is_some() {
            tokens_remaining = reply.cost.tokens_remaining;
        }
        if reply.guard_blocked() {
            stop = Some(FallbackStop::GuardBlocked);
            break;
        }

        live.extend(reply.records);
        processed += batch.len();
        let batch_matched = batch
            .iter()
            .filter(|candidate| live.lookup(candidate).is_some())
            .count();
        matched += batch_matched;

        let deferred = accepted.len() - processed;
        crate::metrics::fallback_batch(batch_idx + 1, processed, deferred);
        on_progress(BatchProgress {
            batch: batch_idx + 1,
            batches,
            processed,
            matched,
            deferred,
        });

        // keep the runtime responsive between batches
        tokio::task::yield_now().await;
    }

    let deferred = accepted.len() - processed;
    if let Some(cause) = &stop {
        warn!(
            target = "sourcer.fallback",
            deferred,
            processed,
            cause = %cause.detail(),
            "fallback_drain_stopped"
        );
    } else {
        info!(
            target = "sourcer.fallback",
            processed, matched, api_calls, "fallback_drain_complete"
        );
    }

    FallbackOutcome {
        processed,
        deferred,
        capped,
        matched,
        api_calls,
        tokens_remaining,
        stop,
    }
}

fn batch_call(params: &FallbackParams, batch: &[Candidate]) -> LookupCall {
    let mut asins = Vec::new();
    let mut codes = Vec::new();
    for candidate in batch {
        // both identifiers go out when present: the remote may know the
        // barcode for an ASIN it cannot resolve
        if !candidate.asin.is_empty() {
            asins.push(candidate.asin.clone());
        }
        if !candidate.barcode.is_empty() {
            codes.push(candidate.barcode.clone());
        }
    }
    LookupCall {
        client: params.client.clone(),
        auth_token: params.auth_token.clone(),
        asins,
        codes,
        marketplace: params.marketplace,
        guard: params.guard,
    }
}

fn stop_from(err: GatewayError) -> FallbackStop {
    match err {
        GatewayError::RateLimited { retry_after_secs } => {
            FallbackStop::RateLimited { retry_after_secs }
        }
        GatewayError::CircuitOpen { retry_after_secs } => {
            FallbackStop::CircuitOpen { retry_after_secs }
        }
        other => FallbackStop::Upstream(other.to_string()),
    }
}
