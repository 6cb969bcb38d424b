//! Remote bulk-lookup transport: batched request by identifier field,
//! returns records plus a remaining-token count. The gateway wraps this
//! with its rate-limit/retry/breaker policies; nothing here retries.

use crate::amazon::config::{LOOKUP_API_KEY, LOOKUP_NETWORK_ENABLED, LOOKUP_ROOT};
use crate::http::build_client;
use crate::models::{LiveLookupResult, MarketplaceId};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupField {
    Asin,
    Code,
}

impl LookupField {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupField::Asin => "asin",
            LookupField::Code => "code",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupPage {
    #[serde(default)]
    pub records: Vec<LiveLookupResult>,
    #[serde(default)]
    pub tokens_remaining: Option<i64>,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// The seam the gateway drives. Implemented by the HTTP client below and
/// by scripted in-memory transports in tests.
pub trait LookupTransport: Send + Sync + 'static {
    fn lookup(
        &self,
        field: LookupField,
        values: Vec<String>,
        marketplace: MarketplaceId,
    ) -> impl Future<Output = Result<LookupPage, LookupError>> + Send;
}

#[derive(Debug, Clone)]
pub struct BulkLookupClient {
    http: Client,
}

impl BulkLookupClient {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }
}

impl Default for BulkLookupClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct LookupBody<'a> {
    field: &'static str,
    values: &'a [String],
    marketplace: &'static str,
}

impl LookupTransport for BulkLookupClient {
    async fn lookup(
        &self,
        field: LookupField,
        values: Vec<String>,
        marketplace: MarketplaceId,
    ) -> Result<LookupPage, LookupError> {
        if !*LOOKUP_NETWORK_ENABLED {
            return Ok(synthetic_page(field, &values));
        }

        let url = format!("{}/v1/lookup", *LOOKUP_ROOT);
        let body = LookupBody {
            field: field.as_str(),
            values: &values,
            marketplace: marketplace.code(),
        };
        let mut request = self.http.post(url).json(&body);
        if !LOOKUP_API_KEY.is_empty() {
            request = request.bearer_auth(LOOKUP_API_KEY.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|err| LookupError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LookupError::Request(format!(
                "HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| LookupError::Deserialize(err.to_string()))
    }
}

/// Offline demo records, deterministic per requested value so repeat
/// scans line up. Used whenever network lookups are not enabled.
fn synthetic_page(field: LookupField, values: &[String]) -> LookupPage {
    let records = values
        .iter()
        .map(|value| {
            let mut hasher = DefaultHasher::new();
            value.hash(&mut hasher);
            let mut rng = SmallRng::seed_from_u64(hasher.finish());
            let (asin, eans) = match field {
                LookupField::Asin => (value.clone(), vec![]),
                LookupField::Code => {
                    let suffix: u32 = rng.random_range(0..1_000_000_000);
                    (format!("B{suffix:09}"), vec![value.clone()])
                }
            };
            LiveLookupResult {
                asin,
                sell_price: rng.random_range(500..4000) as f64 / 100.0,
                bsr: rng.random_range(1_000..200_000),
                title: format!("Demo product {value}"),
                eans,
            }
        })
        .collect();
    LookupPage {
        records,
        tokens_remaining: Some(300),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_lookup_is_deterministic() {
        let client = BulkLookupClient::new();
        let values = vec!["B000000001".to_string(), "B000000002".to_string()];
        let first = client
            .lookup(LookupField::Asin, values.clone(), MarketplaceId::AmazonUk)
            .await
            .expect("lookup");
        let second = client
            .lookup(LookupField::Asin, values, MarketplaceId::AmazonUk)
            .await
            .expect("lookup");
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].sell_price, second.records[0].sell_price);
        assert_eq!(first.records[0].asin, "B000000001");
    }

    #[tokio::test]
    async fn offline_code_lookup_echoes_requested_code() {
        let client = BulkLookupClient::new();
        let page = client
            .lookup(
                LookupField::Code,
                vec!["5012345678900".to_string()],
                MarketplaceId::AmazonUk,
            )
            .await
            .expect("lookup");
        assert_eq!(page.records[0].eans, vec!["5012345678900"]);
        assert!(page.records[0].asin.starts_with('B'));
        assert_eq!(page.tokens_remaining, Some(300));
    }
}
