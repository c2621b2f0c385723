//! Common test utilities for integration tests.

pub mod cache_node;
pub mod mocks;

use purgeman::config::ServiceConfig;
use std::time::Duration;

pub use cache_node::*;
pub use mocks::*;

/// Configuration pointing at local fakes, with a short retry interval.
pub fn test_config(cache_urls: &[String]) -> ServiceConfig {
    let mut config = ServiceConfig::development();
    config.retry_interval = Duration::from_millis(20);
    config.cache.url_prefixes = cache_urls.to_vec();
    config.cache.request_timeout = Duration::from_secs(5);
    config
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
