use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{PaginationConfig, RetryConfig};
use crate::driver::{ReelPage, SessionDriver};
use crate::error::DriverError;
use crate::models::{ReelLimit, ReelRecord};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectError {
    #[error(transparent)]
    Driver(DriverError),

    #[error("still rate limited after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Exponential backoff applied while the platform answers "rate limited".
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per page, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            backoff_factor: config.backoff_factor.max(1),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Wait before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.backoff_factor.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Walks a profile's reels page by page until the limit is met or the
/// platform runs out of pages.
#[derive(Debug, Clone)]
pub struct Paginator {
    retry: RetryPolicy,
    page_delay: (Duration, Duration),
    max_pages: usize,
}

impl Paginator {
    pub fn new(retry: RetryPolicy, page_delay: (Duration, Duration), max_pages: usize) -> Self {
        let (min, max) = page_delay;
        Self {
            retry,
            page_delay: (min, max.max(min)),
            max_pages: max_pages.max(1),
        }
    }

    pub fn from_config(retry: &RetryConfig, pagination: &PaginationConfig) -> Self {
        Self::new(
            RetryPolicy::from_config(retry),
            (
                Duration::from_millis(pagination.page_delay_min_ms),
                Duration::from_millis(pagination.page_delay_max_ms),
            ),
            pagination.max_pages,
        )
    }

    pub async fn collect<D: SessionDriver>(
        &self,
        driver: &D,
        handle: &mut D::Handle,
        username: &str,
        limit: ReelLimit,
    ) -> Result<Vec<ReelRecord>, CollectError> {
        let mut collected: Vec<ReelRecord> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .fetch_with_retry(driver, handle, username, cursor.as_deref())
                .await?;
            pages += 1;
            collected.extend(page.reels.into_iter().map(ReelRecord::from));
            debug!(page = pages, total = collected.len(), "Fetched reels page");

            if let Some(max) = limit.max() {
                if collected.len() >= max {
                    collected.truncate(max);
                    break;
                }
            }

            let Some(next) = page.next_cursor else {
                break;
            };
            if cursor.as_deref() == Some(next.as_str()) {
                warn!(username = %username, cursor = %next, "Platform returned the same cursor, stopping");
                break;
            }
            if pages >= self.max_pages {
                warn!(username = %username, pages, "Page limit reached, stopping");
                break;
            }

            cursor = Some(next);
            self.pause_between_pages().await;
        }

        info!(username = %username, pages, reels = collected.len(), limit = %limit, "Collection finished");
        Ok(collected)
    }

    async fn fetch_with_retry<D: SessionDriver>(
        &self,
        driver: &D,
        handle: &mut D::Handle,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<ReelPage, CollectError> {
        let mut attempt = 1;

        loop {
            match driver.fetch_page(handle, username, cursor).await {
                Ok(page) => return Ok(page),
                Err(DriverError::RateLimited) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, username = %username, "Rate limited, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(DriverError::RateLimited) => {
                    warn!(attempts = attempt, username = %username, "Rate limit retry budget exhausted");
                    return Err(CollectError::RetriesExhausted { attempts: attempt });
                }
                Err(e) => return Err(CollectError::Driver(e)),
            }
        }
    }

    async fn pause_between_pages(&self) {
        let (min, max) = self.page_delay;
        if max.is_zero() {
            return;
        }
        let delay = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64))
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Proxy;
    use crate::testing::{account, fast_paginator, ScriptedDriver};

    async fn run(
        driver: &ScriptedDriver,
        limit: ReelLimit,
    ) -> Result<Vec<ReelRecord>, CollectError> {
        let mut handle = driver
            .authenticate(&account("alice"), &Proxy::new("10.0.0.1", 8080))
            .await
            .unwrap();
        fast_paginator()
            .collect(driver, &mut handle, "target", limit)
            .await
    }

    #[test]
    fn backoff_grows_geometrically_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            backoff_factor: 2,
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(4), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn bounded_limit_truncates_to_exact_count() {
        let driver = ScriptedDriver::serving(250, 12);
        let reels = run(&driver, ReelLimit::AtMost(100)).await.unwrap();

        assert_eq!(reels.len(), 100);
        assert_eq!(reels[0].link, "https://www.instagram.com/reel/r0/");
        assert_eq!(reels[99].link, "https://www.instagram.com/reel/r99/");
        // 100 reels at 12 per page need 9 pages.
        assert_eq!(driver.fetch_calls(), 9);
    }

    #[tokio::test]
    async fn limit_above_available_returns_everything() {
        let driver = ScriptedDriver::serving(30, 12);
        let reels = run(&driver, ReelLimit::AtMost(100)).await.unwrap();
        assert_eq!(reels.len(), 30);
    }

    #[tokio::test]
    async fn unbounded_collects_until_cursor_runs_out() {
        let driver = ScriptedDriver::serving(37, 12);
        let reels = run(&driver, ReelLimit::Unbounded).await.unwrap();

        assert_eq!(reels.len(), 37);
        assert_eq!(driver.fetch_calls(), 4);
    }

    #[tokio::test]
    async fn empty_profile_yields_no_records() {
        let driver = ScriptedDriver::serving(0, 12);
        let reels = run(&driver, ReelLimit::Unbounded).await.unwrap();
        assert!(reels.is_empty());
    }

    #[tokio::test]
    async fn records_carry_virality() {
        let driver = ScriptedDriver::serving(3, 12);
        let reels = run(&driver, ReelLimit::Unbounded).await.unwrap();

        for reel in reels {
            let expected = (reel.likes + reel.comments) as f64 / reel.views as f64;
            assert_eq!(reel.virality, expected);
        }
    }

    #[tokio::test]
    async fn transient_rate_limit_is_retried() {
        let driver = ScriptedDriver::serving(20, 12).rate_limited(2);
        let reels = run(&driver, ReelLimit::Unbounded).await.unwrap();

        assert_eq!(reels.len(), 20);
        assert_eq!(driver.fetch_calls(), 4);
    }

    #[tokio::test]
    async fn persistent_rate_limit_exhausts_budget() {
        let driver = ScriptedDriver::serving(20, 12).always_rate_limited();
        let err = run(&driver, ReelLimit::Unbounded).await.unwrap_err();

        assert_eq!(err, CollectError::RetriesExhausted { attempts: 3 });
        assert_eq!(driver.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn target_errors_are_not_retried() {
        let driver =
            ScriptedDriver::serving(20, 12).failing_on_page(0, DriverError::PrivateAccount);
        let err = run(&driver, ReelLimit::Unbounded).await.unwrap_err();

        assert_eq!(err, CollectError::Driver(DriverError::PrivateAccount));
        assert_eq!(driver.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn failure_after_first_page_discards_partial_result() {
        let driver = ScriptedDriver::serving(40, 12)
            .failing_on_page(2, DriverError::ProxyError("tunnel closed".into()));
        let err = run(&driver, ReelLimit::Unbounded).await.unwrap_err();

        assert!(matches!(err, CollectError::Driver(DriverError::ProxyError(_))));
        assert_eq!(driver.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn repeated_cursor_stops_cleanly() {
        let driver = ScriptedDriver::serving(100, 10).repeating_cursor();
        let reels = run(&driver, ReelLimit::Unbounded).await.unwrap();

        // Page 0, then page 1 which hands back "page-1" again.
        assert_eq!(reels.len(), 20);
        assert_eq!(driver.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn page_limit_stops_cleanly() {
        let driver = ScriptedDriver::serving(100, 10);
        let paginator = Paginator::new(
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::ZERO,
                backoff_factor: 1,
                max_delay: Duration::ZERO,
            },
            (Duration::ZERO, Duration::ZERO),
            3,
        );
        let mut handle = driver
            .authenticate(&account("alice"), &Proxy::new("10.0.0.1", 8080))
            .await
            .unwrap();
        let reels = paginator
            .collect(&driver, &mut handle, "target", ReelLimit::Unbounded)
            .await
            .unwrap();

        assert_eq!(reels.len(), 30);
    }
}
