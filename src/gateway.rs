//! Resilient upstream gateway. Every lookup runs the same pipeline:
//! authorization, fixed-window rate limiting, payload caps, the
//! token-budget guard, then deduplicated/chunked remote invocation under
//! timeout + linear-backoff retries behind a process-wide circuit
//! breaker. Cost metadata for the call is returned to the caller and the
//! marketplace token snapshot is updated as pages come back.

use crate::amazon::lookup::{LookupError, LookupField, LookupPage, LookupTransport};
use crate::ident::{barcode_variants, normalize_asin, normalize_barcode};
use crate::models::{LiveLookupResult, MarketplaceId, TokenGuardMode};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Identifiers per remote call.
pub const LOOKUP_CHUNK: usize = 100;
/// Width of the parallel group for unresolved-code retries.
pub const UNRESOLVED_GROUP: usize = 10;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// When set, callers must present this token or fail `Unauthorized`.
    pub shared_secret: Option<String>,
    pub window: Duration,
    pub max_requests_per_window: u32,
    pub max_ids_per_field: usize,
    pub max_ids_total: usize,
    pub call_timeout: Duration,
    pub retry_attempts: u32,
    pub backoff_base: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            shared_secret: None,
            window: Duration::from_secs(60),
            max_requests_per_window: 30,
            max_ids_per_field: 500,
            max_ids_total: 800,
            call_timeout: Duration::from_secs(20),
            retry_attempts: 3,
            backoff_base: Duration::from_millis(250),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shared_secret: std::env::var("GATEWAY_SHARED_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            window: env_secs("GATEWAY_WINDOW_SECS").unwrap_or(defaults.window),
            max_requests_per_window: env_parse("GATEWAY_MAX_REQUESTS")
                .unwrap_or(defaults.max_requests_per_window),
            max_ids_per_field: env_parse("GATEWAY_MAX_IDS_PER_FIELD")
                .unwrap_or(defaults.max_ids_per_field),
            max_ids_total: env_parse("GATEWAY_MAX_IDS_TOTAL").unwrap_or(defaults.max_ids_total),
            call_timeout: env_secs("LOOKUP_TIMEOUT_SECS").unwrap_or(defaults.call_timeout),
            retry_attempts: env_parse("LOOKUP_RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            backoff_base: std::env::var("LOOKUP_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            breaker_threshold: env_parse("BREAKER_THRESHOLD").unwrap_or(defaults.breaker_threshold),
            breaker_cooldown: env_secs("BREAKER_COOLDOWN_SECS")
                .unwrap_or(defaults.breaker_cooldown),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

/// Rate-limit key: network origin plus the presented key signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub origin: String,
    pub signature: String,
}

impl ClientIdentity {
    pub fn new(origin: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            signature: signature.into(),
        }
    }

    /// Identity for in-process callers (the scan pipeline itself).
    pub fn local() -> Self {
        Self::new("local", "scan")
    }

    fn bucket_key(&self) -> String {
        format!("{}:{}", self.origin, self.signature)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenGuard {
    pub mode: TokenGuardMode,
    pub floor: i64,
}

impl TokenGuard {
    pub fn off() -> Self {
        Self {
            mode: TokenGuardMode::Off,
            floor: 0,
        }
    }

    pub fn hard_stop(floor: i64) -> Self {
        Self {
            mode: TokenGuardMode::HardStop,
            floor,
        }
    }
}

/// One gateway invocation. Either field set may be empty; ASIN lookups
/// always execute before barcode lookups.
#[derive(Debug, Clone)]
pub struct LookupCall {
    pub client: ClientIdentity,
    pub auth_token: Option<String>,
    pub asins: Vec<String>,
    pub codes: Vec<String>,
    pub marketplace: MarketplaceId,
    pub guard: TokenGuard,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestCost {
    pub requested_ids: usize,
    pub api_calls: u32,
    pub elapsed_ms: u128,
    pub guard_blocked: bool,
    pub tokens_remaining: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct LookupReply {
    pub records: Vec<LiveLookupResult>,
    pub cost: RequestCost,
}

impl LookupReply {
    pub fn guard_blocked(&self) -> bool {
        self.cost.guard_blocked
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway token rejected")]
    Unauthorized,
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("payload too large: {detail}")]
    PayloadTooLarge { detail: String },
    #[error("upstream temporarily unavailable, retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },
    #[error("upstream lookup failed: {0}")]
    Upstream(String),
}

struct WindowState {
    started: Instant,
    count: u32,
}

struct BreakerState {
    failures: u32,
    open_until: Option<Instant>,
}

/// Process-wide mutable gateway state. Injected explicitly so tests can
/// hand every case a fresh instance; survives across runs in the server.
pub struct GatewayState {
    windows: Mutex<HashMap<String, WindowState>>,
    breaker: Mutex<BreakerState>,
    tokens: Mutex<HashMap<MarketplaceId, i64>>,
}

impl GatewayState {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            breaker: Mutex::new(BreakerState {
                failures: 0,
                open_until: None,
            }),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub async fn tokens_remaining(&self, marketplace: MarketplaceId) -> Option<i64> {
        self.tokens.lock().await.get(&marketplace).copied()
    }

    pub async fn set_tokens(&self, marketplace: MarketplaceId, remaining: i64) {
        self.tokens.lock().await.insert(marketplace, remaining);
    }

    async fn record_failure(&self, threshold: u32, cooldown: Duration) {
        let mut breaker = self.breaker.lock().await;
        breaker.failures += 1;
        if breaker.failures >= threshold {
            breaker.open_until = Some(Instant::now() + cooldown);
        }
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.failures = 0;
        breaker.open_until = None;
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Gateway<T> {
    transport: Arc<T>,
    state: Arc<GatewayState>,
    config: GatewayConfig,
}

impl<T: LookupTransport> Gateway<T> {
    pub fn new(transport: Arc<T>, state: Arc<GatewayState>, config: GatewayConfig) -> Self {
        Self {
            transport,
            state,
            config,
        }
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    pub async fn execute(&self, call: LookupCall) -> Result<LookupReply, GatewayError> {
        let started = Instant::now();
        self.authorize(&call)?;
        self.consume_window(&call.client).await?;
        self.check_payload(&call)?;

        // malformed identifiers never reach the network
        let asins = sanitize(LookupField::Asin, &call.asins);
        let codes = sanitize(LookupField::Code, &call.codes);
        let requested_ids = asins.len() + codes.len();

        if call.guard.mode == TokenGuardMode::HardStop {
            let snapshot = self.state.tokens_remaining(call.marketplace).await;
            if let Some(remaining) = snapshot
                && remaining <= call.guard.floor
            {
                warn!(
                    target = "sourcer.gateway",
                    remaining,
                    floor = call.guard.floor,
                    marketplace = call.marketplace.code(),
                    "token_guard_blocked"
                );
                crate::metrics::gateway_call("guard_blocked", 0, started.elapsed().as_millis());
                return Ok(LookupReply {
                    records: Vec::new(),
                    cost: RequestCost {
                        requested_ids,
                        api_calls: 0,
                        elapsed_ms: started.elapsed().as_millis(),
                        guard_blocked: true,
                        tokens_remaining: snapshot,
                    },
                });
            }
        }

        if requested_ids == 0 {
            return Ok(LookupReply {
                records: Vec::new(),
                cost: RequestCost {
                    requested_ids: 0,
                    api_calls: 0,
                    elapsed_ms: started.elapsed().as_millis(),
                    guard_blocked: false,
                    tokens_remaining: self.state.tokens_remaining(call.marketplace).await,
                },
            });
        }

        let mut records = Vec::new();
        let mut api_calls = 0u32;
        let mut tokens_remaining = None;

        for chunk in asins.chunks(LOOKUP_CHUNK) {
            let page = run_lookup(
                &self.transport,
                &self.state,
                &self.config,
                LookupField::Asin,
                chunk.to_vec(),
                call.marketplace,
            )
            .await?;
            api_calls += 1;
            if page.tokens_remaining.is_some() {
                tokens_remaining = page.tokens_remaining;
            }
            records.extend(page.records);
        }

        if !codes.is_empty() {
            let (code_records, code_calls, code_tokens) =
                self.lookup_codes(&codes, call.marketplace).await?;
            api_calls += code_calls;
            if code_tokens.is_some() {
                tokens_remaining = code_tokens;
            }
            records.extend(code_records);
        }

        if let Some(remaining) = tokens_remaining {
            self.state.set_tokens(call.marketplace, remaining).await;
        } else {
            tokens_remaining = self.state.tokens_remaining(call.marketplace).await;
        }

        crate::metrics::gateway_call("ok", api_calls, started.elapsed().as_millis());
        Ok(LookupReply {
            records,
            cost: RequestCost {
                requested_ids,
                api_calls,
                elapsed_ms: started.elapsed().as_millis(),
                guard_blocked: false,
                tokens_remaining,
            },
        })
    }

    /// Two-phase barcode resolution: one chunked batch pass over every
    /// code, then codes the remote did not echo back (under any variant)
    /// are retried individually in bounded parallel groups. Phase-two
    /// failures are tolerated; the code simply stays unresolved.
    async fn lookup_codes(
        &self,
        codes: &[String],
        marketplace: MarketplaceId,
    ) -> Result<(Vec<LiveLookupResult>, u32, Option<i64>), GatewayError> {
        let mut records = Vec::new();
        let mut api_calls = 0u32;
        let mut tokens_remaining = None;

        for chunk in codes.chunks(LOOKUP_CHUNK) {
            let page = run_lookup(
                &self.transport,
                &self.state,
                &self.config,
                LookupField::Code,
                chunk.to_vec(),
                marketplace,
            )
            .await?;
            api_calls += 1;
            if page.tokens_remaining.is_some() {
                tokens_remaining = page.tokens_remaining;
            }
            records.extend(page.records);
        }

        let resolved = resolved_code_set(&records);
        let unresolved: Vec<String> = codes
            .iter()
            .filter(|code| {
                !barcode_variants(code)
                    .iter()
                    .any(|variant| resolved.contains(variant))
            })
            .cloned()
            .collect();

        for group in unresolved.chunks(UNRESOLVED_GROUP) {
            let mut set = JoinSet::new();
            for code in group {
                let transport = self.transport.clone();
                let state = self.state.clone();
                let config = self.config.clone();
                let code = code.clone();
                set.spawn(async move {
                    let result = run_lookup(
                        &transport,
                        &state,
                        &config,
                        LookupField::Code,
                        vec![code.clone()],
                        marketplace,
                    )
                    .await;
                    (code, result)
                });
            }
            while let Some(joined) = set.join_next().await {
                let Ok((code, result)) = joined else {
                    continue;
                };
                api_calls += 1;
                match result {
                    Ok(page) => {
                        if page.tokens_remaining.is_some() {
                            tokens_remaining = page.tokens_remaining;
                        }
                        records.extend(page.records);
                    }
                    Err(err) => {
                        warn!(
                            target = "sourcer.gateway",
                            code = %code,
                            error = %err,
                            "unresolved_code_retry_failed"
                        );
                    }
                }
            }
        }

        Ok((records, api_calls, tokens_remaining))
    }

    fn authorize(&self, call: &LookupCall) -> Result<(), GatewayError> {
        let Some(secret) = &self.config.shared_secret else {
            return Ok(());
        };
        match &call.auth_token {
            Some(token) if token == secret => Ok(()),
            _ => Err(GatewayError::Unauthorized),
        }
    }

    /// Fixed-window counter per client. The window resets lazily on the
    /// first request past expiry; there is no background timer.
    async fn consume_window(&self, client: &ClientIdentity) -> Result<(), GatewayError> {
        let mut windows = self.state.windows.lock().await;
        let now = Instant::now();
        let state = windows
            .entry(client.bucket_key())
            .or_insert_with(|| WindowState {
                started: now,
                count: 0,
            });

        if now.duration_since(state.started) >= self.config.window {
            state.started = now;
            state.count = 0;
        }

        if state.count >= self.config.max_requests_per_window {
            let elapsed = now.duration_since(state.started);
            let retry_after = self.config.window.saturating_sub(elapsed);
            return Err(GatewayError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }
        state.count += 1;
        Ok(())
    }

    fn check_payload(&self, call: &LookupCall) -> Result<(), GatewayError> {
        if call.asins.len() > self.config.max_ids_per_field {
            return Err(GatewayError::PayloadTooLarge {
                detail: format!(
                    "{} asins exceeds per-field cap {}",
                    call.asins.len(),
                    self.config.max_ids_per_field
                ),
            });
        }
        if call.codes.len() > self.config.max_ids_per_field {
            return Err(GatewayError::PayloadTooLarge {
                detail: format!(
                    "{} codes exceeds per-field cap {}",
                    call.codes.len(),
                    self.config.max_ids_per_field
                ),
            });
        }
        let total = call.asins.len() + call.codes.len();
        if total > self.config.max_ids_total {
            return Err(GatewayError::PayloadTooLarge {
                detail: format!(
                    "{total} identifiers exceeds total cap {}",
                    self.config.max_ids_total
                ),
            });
        }
        Ok(())
    }
}

/// Single remote call under the breaker with timeout + linearly growing
/// backoff between attempts. Shared by the chunk loop and the spawned
/// unresolved-code workers.
async fn run_lookup<T: LookupTransport>(
    transport: &Arc<T>,
    state: &Arc<GatewayState>,
    config: &GatewayConfig,
    field: LookupField,
    values: Vec<String>,
    marketplace: MarketplaceId,
) -> Result<LookupPage, GatewayError> {
    check_breaker(state).await?;

    let mut last_error = String::new();
    for attempt in 1..=config.retry_attempts.max(1) {
        let outcome = timeout(
            config.call_timeout,
            transport.lookup(field, values.clone(), marketplace),
        )
        .await;
        match outcome {
            Ok(Ok(page)) => {
                state.record_success().await;
                return Ok(page);
            }
            Ok(Err(LookupError::Request(message))) | Ok(Err(LookupError::Deserialize(message))) => {
                last_error = message;
            }
            Err(_) => {
                last_error = format!("timed out after {:?}", config.call_timeout);
            }
        }
        state
            .record_failure(config.breaker_threshold, config.breaker_cooldown)
            .await;
        if attempt < config.retry_attempts {
            sleep(config.backoff_base * attempt).await;
            check_breaker(state).await?;
        }
    }

    warn!(
        target = "sourcer.gateway",
        field = field.as_str(),
        values = values.len(),
        error = %last_error,
        "lookup_retries_exhausted"
    );
    Err(GatewayError::Upstream(last_error))
}

async fn check_breaker(state: &Arc<GatewayState>) -> Result<(), GatewayError> {
    let mut breaker = state.breaker.lock().await;
    if let Some(open_until) = breaker.open_until {
        let now = Instant::now();
        if now < open_until {
            return Err(GatewayError::CircuitOpen {
                retry_after_secs: (open_until - now).as_secs().max(1),
            });
        }
        breaker.open_until = None;
    }
    Ok(())
}

fn sanitize(field: LookupField, values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for value in values {
        let normalized = match field {
            LookupField::Asin => normalize_asin(value),
            LookupField::Code => normalize_barcode(value),
        };
        if let Some(normalized) = normalized
            && seen.insert(normalized.clone())
        {
            result.push(normalized);
        }
    }
    result
}

fn resolved_code_set(records: &[LiveLookupResult]) -> HashSet<String> {
    let mut resolved = HashSet::new();
    for record in records {
        for ean in &record.eans {
            let Some(code) = normalize_barcode(ean) else {
                continue;
            };
            for variant in barcode_variants(&code) {
                resolved.insert(variant);
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted transport: pops pre-baked results per call and records
    /// every request it sees.
    struct Scripted {
        script: StdMutex<VecDeque<Result<LookupPage, LookupError>>>,
        calls: StdMutex<Vec<(LookupField, Vec<String>)>>,
        call_count: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<LookupPage, LookupError>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                calls: StdMutex::new(Vec::new()),
                call_count: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<(LookupField, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    impl LookupTransport for Scripted {
        async fn lookup(
            &self,
            field: LookupField,
            values: Vec<String>,
            _marketplace: MarketplaceId,
        ) -> Result<LookupPage, LookupError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push((field, values.clone()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(echo_page(field, &values)))
        }
    }

    fn echo_page(field: LookupField, values: &[String]) -> LookupPage {
        LookupPage {
            records: values
                .iter()
                .map(|value| LiveLookupResult {
                    asin: match field {
                        LookupField::Asin => value.clone(),
                        LookupField::Code => "B000000000".to_string(),
                    },
                    sell_price: 10.0,
                    bsr: 100,
                    title: format!("record {value}"),
                    eans: match field {
                        LookupField::Asin => vec![],
                        LookupField::Code => vec![value.clone()],
                    },
                })
                .collect(),
            tokens_remaining: Some(250),
        }
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            retry_attempts: 2,
            backoff_base: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
            ..GatewayConfig::default()
        }
    }

    fn gateway(transport: Arc<Scripted>, config: GatewayConfig) -> Gateway<Scripted> {
        Gateway::new(transport, Arc::new(GatewayState::new()), config)
    }

    fn asin_call(asins: &[&str]) -> LookupCall {
        LookupCall {
            client: ClientIdentity::local(),
            auth_token: None,
            asins: asins.iter().map(|a| a.to_string()).collect(),
            codes: vec![],
            marketplace: MarketplaceId::AmazonUk,
            guard: TokenGuard::off(),
        }
    }

    #[tokio::test]
    async fn chunks_asins_per_hundred() {
        let transport = Scripted::new(vec![]);
        let gw = gateway(transport.clone(), fast_config());
        let asins: Vec<String> = (0..250).map(|i| format!("B{i:09}")).collect();
        let call = LookupCall {
            asins,
            ..asin_call(&[])
        };
        let reply = gw.execute(call).await.expect("execute");
        assert_eq!(reply.cost.api_calls, 3);
        assert_eq!(reply.records.len(), 250);
        assert_eq!(transport.count(), 3);
        assert_eq!(reply.cost.tokens_remaining, Some(250));
    }

    #[tokio::test]
    async fn malformed_identifiers_never_reach_network() {
        let transport = Scripted::new(vec![]);
        let gw = gateway(transport.clone(), fast_config());
        let call = LookupCall {
            asins: vec!["not-an-asin".into(), "b000000001".into()],
            codes: vec!["123".into(), "50-1234567-8903".into()],
            ..asin_call(&[])
        };
        let reply = gw.execute(call).await.expect("execute");
        assert!(!reply.guard_blocked());
        let calls = transport.calls();
        assert_eq!(calls[0].1, vec!["B000000001".to_string()]);
        assert_eq!(calls[1].1, vec!["5012345678903".to_string()]);
    }

    #[tokio::test]
    async fn empty_after_filtering_costs_nothing() {
        let transport = Scripted::new(vec![]);
        let gw = gateway(transport.clone(), fast_config());
        let call = LookupCall {
            asins: vec!["garbage".into()],
            ..asin_call(&[])
        };
        let reply = gw.execute(call).await.expect("execute");
        assert_eq!(reply.cost.api_calls, 0);
        assert_eq!(transport.count(), 0);
    }

    #[tokio::test]
    async fn shared_secret_enforced() {
        let transport = Scripted::new(vec![]);
        let config = GatewayConfig {
            shared_secret: Some("s3cret".into()),
            ..fast_config()
        };
        let gw = gateway(transport, config);

        let denied = gw.execute(asin_call(&["B000000001"])).await;
        assert!(matches!(denied, Err(GatewayError::Unauthorized)));

        let allowed = gw
            .execute(LookupCall {
                auth_token: Some("s3cret".into()),
                ..asin_call(&["B000000001"])
            })
            .await;
        assert!(allowed.is_ok());
    }

    #[tokio::test]
    async fn fixed_window_rate_limit() {
        let transport = Scripted::new(vec![]);
        let config = GatewayConfig {
            max_requests_per_window: 2,
            ..fast_config()
        };
        let gw = gateway(transport, config);
        gw.execute(asin_call(&["B000000001"])).await.expect("first");
        gw.execute(asin_call(&["B000000002"]))
            .await
            .expect("second");
        let third = gw.execute(asin_call(&["B000000003"])).await;
        match third {
            Err(GatewayError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_windows_are_per_client() {
        let transport = Scripted::new(vec![]);
        let config = GatewayConfig {
            max_requests_per_window: 1,
            ..fast_config()
        };
        let gw = gateway(transport, config);
        let org_a = LookupCall {
            client: ClientIdentity::new("10.0.0.1", "key-01"),
            ..asin_call(&["B000000001"])
        };
        let org_b = LookupCall {
            client: ClientIdentity::new("10.0.0.2", "key-02"),
            ..asin_call(&["B000000001"])
        };
        gw.execute(org_a.clone()).await.expect("org a");
        gw.execute(org_b).await.expect("org b unaffected");
        assert!(matches!(
            gw.execute(org_a).await,
            Err(GatewayError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn payload_caps_rejected_before_network() {
        let transport = Scripted::new(vec![]);
        let config = GatewayConfig {
            max_ids_per_field: 3,
            max_ids_total: 5,
            ..fast_config()
        };
        let gw = gateway(transport.clone(), config);

        let per_field = gw
            .execute(LookupCall {
                asins: (0..4).map(|i| format!("B{i:09}")).collect(),
                ..asin_call(&[])
            })
            .await;
        assert!(matches!(
            per_field,
            Err(GatewayError::PayloadTooLarge { .. })
        ));

        let combined = gw
            .execute(LookupCall {
                asins: (0..3).map(|i| format!("B{i:09}")).collect(),
                codes: (0..3).map(|i| format!("5000000000{i:03}")).collect(),
                ..asin_call(&[])
            })
            .await;
        assert!(matches!(
            combined,
            Err(GatewayError::PayloadTooLarge { .. })
        ));
        assert_eq!(transport.count(), 0);
    }

    #[tokio::test]
    async fn hard_stop_guard_blocks_before_network() {
        let transport = Scripted::new(vec![]);
        let state = Arc::new(GatewayState::new());
        state.set_tokens(MarketplaceId::AmazonUk, 40).await;
        let gw = Gateway::new(transport.clone(), state, fast_config());

        let reply = gw
            .execute(LookupCall {
                guard: TokenGuard::hard_stop(50),
                ..asin_call(&["B000000001"])
            })
            .await
            .expect("guard block is not an error");
        assert!(reply.guard_blocked());
        assert_eq!(reply.cost.api_calls, 0);
        assert!(reply.records.is_empty());
        assert_eq!(reply.cost.tokens_remaining, Some(40));
        assert_eq!(transport.count(), 0);
    }

    #[tokio::test]
    async fn guard_with_headroom_proceeds() {
        let transport = Scripted::new(vec![]);
        let state = Arc::new(GatewayState::new());
        state.set_tokens(MarketplaceId::AmazonUk, 200).await;
        let gw = Gateway::new(transport, state, fast_config());
        let reply = gw
            .execute(LookupCall {
                guard: TokenGuard::hard_stop(50),
                ..asin_call(&["B000000001"])
            })
            .await
            .expect("execute");
        assert!(!reply.guard_blocked());
        assert_eq!(reply.cost.api_calls, 1);
    }

    #[tokio::test]
    async fn retries_then_surfaces_upstream_failure() {
        let transport = Scripted::new(vec![
            Err(LookupError::Request("boom 1".into())),
            Err(LookupError::Request("boom 2".into())),
        ]);
        let gw = gateway(transport.clone(), fast_config());
        let result = gw.execute(asin_call(&["B000000001"])).await;
        match result {
            Err(GatewayError::Upstream(message)) => assert_eq!(message, "boom 2"),
            other => panic!("expected Upstream, got {other:?}"),
        }
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_retry_budget() {
        let transport = Scripted::new(vec![Err(LookupError::Request("blip".into()))]);
        let gw = gateway(transport.clone(), fast_config());
        let reply = gw.execute(asin_call(&["B000000001"])).await.expect("retry");
        assert_eq!(reply.records.len(), 1);
        assert_eq!(transport.count(), 2);
    }

    #[tokio::test]
    async fn breaker_opens_then_fails_fast() {
        let script: Vec<Result<LookupPage, LookupError>> = (0..6)
            .map(|i| Err(LookupError::Request(format!("down {i}"))))
            .collect();
        let transport = Scripted::new(script);
        let config = GatewayConfig {
            breaker_threshold: 4,
            retry_attempts: 2,
            backoff_base: Duration::from_millis(1),
            ..GatewayConfig::default()
        };
        let state = Arc::new(GatewayState::new());
        let gw = Gateway::new(transport.clone(), state, config);

        // two failed calls x two attempts each = 4 consecutive failures
        let _ = gw.execute(asin_call(&["B000000001"])).await;
        let _ = gw.execute(asin_call(&["B000000002"])).await;
        let calls_before = transport.count();

        let result = gw.execute(asin_call(&["B000000003"])).await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        assert_eq!(transport.count(), calls_before);
    }

    #[tokio::test]
    async fn single_success_resets_breaker() {
        let transport = Scripted::new(vec![
            Err(LookupError::Request("down".into())),
            Err(LookupError::Request("down".into())),
            Err(LookupError::Request("down".into())),
        ]);
        let config = GatewayConfig {
            breaker_threshold: 5,
            retry_attempts: 2,
            backoff_base: Duration::from_millis(1),
            ..GatewayConfig::default()
        };
        let state = Arc::new(GatewayState::new());
        let gw = Gateway::new(transport, state.clone(), config);

        // 3 failures, then a success on the 4th attempt
        let _ = gw.execute(asin_call(&["B000000001"])).await;
        gw.execute(asin_call(&["B000000002"])).await.expect("ok");
        assert_eq!(state.breaker.lock().await.failures, 0);
    }

    #[tokio::test]
    async fn two_phase_code_resolution_retries_unechoed_codes() {
        // phase 1 returns a record for the first code only; the second
        // code is not echoed under any variant and must be retried alone
        let phase1 = LookupPage {
            records: vec![LiveLookupResult {
                asin: "B000000010".into(),
                sell_price: 9.0,
                bsr: 50,
                title: "first".into(),
                eans: vec!["5012345678900".into()],
            }],
            tokens_remaining: Some(290),
        };
        let transport = Scripted::new(vec![Ok(phase1)]);
        let gw = gateway(transport.clone(), fast_config());
        let reply = gw
            .execute(LookupCall {
                codes: vec!["5012345678900".into(), "4006381333931".into()],
                ..asin_call(&[])
            })
            .await
            .expect("execute");

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, vec!["4006381333931".to_string()]);
        assert_eq!(reply.cost.api_calls, 2);
        assert_eq!(reply.records.len(), 2);
    }

    #[tokio::test]
    async fn variant_echo_counts_as_resolved() {
        // remote echoes the EAN-13 variant of a requested UPC-A; no
        // second-phase retry should happen
        let phase1 = LookupPage {
            records: vec![LiveLookupResult {
                asin: "B000000011".into(),
                sell_price: 7.5,
                bsr: 80,
                title: "padded".into(),
                eans: vec!["0036000291452".into()],
            }],
            tokens_remaining: None,
        };
        let transport = Scripted::new(vec![Ok(phase1)]);
        let gw = gateway(transport.clone(), fast_config());
        let reply = gw
            .execute(LookupCall {
                codes: vec!["036000291452".into()],
                ..asin_call(&[])
            })
            .await
            .expect("execute");
        assert_eq!(transport.count(), 1);
        assert_eq!(reply.cost.api_calls, 1);
    }

    #[tokio::test]
    async fn token_snapshot_updates_after_call() {
        let transport = Scripted::new(vec![]);
        let state = Arc::new(GatewayState::new());
        let gw = Gateway::new(transport, state.clone(), fast_config());
        gw.execute(asin_call(&["B000000001"])).await.expect("run");
        assert_eq!(
            state.tokens_remaining(MarketplaceId::AmazonUk).await,
            Some(250)
        );
    }
}
