use tracing::trace;

// Lightweight metrics helpers that are safe in demo builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "sourcer.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "sourcer.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn gateway_call(outcome: &'static str, api_calls: u32, elapsed_ms: u128) {
    trace!(
        target = "sourcer.metrics",
        outcome = outcome,
        api_calls = api_calls,
        elapsed_ms = elapsed_ms as u64,
        "gateway_call"
    );
}

pub fn fallback_batch(batch: usize, processed: usize, deferred: usize) {
    trace!(
        target = "sourcer.metrics",
        batch = batch,
        processed = processed,
        deferred = deferred,
        "fallback_batch"
    );
}
