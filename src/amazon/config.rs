use once_cell::sync::Lazy;
use std::env;

pub static LOOKUP_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("SOURCER_LOOKUP_URL").unwrap_or_else(|_| "https://lookup.sourcer.dev".to_string())
});

pub static LOOKUP_API_KEY: Lazy<String> =
    Lazy::new(|| env::var("SOURCER_LOOKUP_API_KEY").unwrap_or_default());

pub static LOOKUP_NETWORK_ENABLED: Lazy<bool> = Lazy::new(|| {
    env::var("SOURCER_LOOKUP_NETWORK")
        .map(|value| {
            matches!(
                value.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
});
