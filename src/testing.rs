//! Scripted session driver and fixtures shared by the unit tests.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::account_pool::AccountPool;
use crate::driver::{ReelPage, SessionDriver, SessionHandle};
use crate::error::DriverError;
use crate::models::{Account, Proxy, ReelMetrics, Secret, SessionState};
use crate::paginator::{Paginator, RetryPolicy};
use crate::proxy_pool::ProxyPool;
use crate::store::SnapshotFile;

#[derive(Debug)]
pub struct ScriptedHandle {
    login: String,
}

impl SessionHandle for ScriptedHandle {
    fn session_state(&self) -> Option<SessionState> {
        Some(SessionState::from_cookies([(
            "sessionid",
            format!("session-{}", self.login),
        )]))
    }
}

/// Serves `total` reels in pages of `page_size`, with failures injected
/// wherever a test asks for them.
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    total: usize,
    page_size: usize,
    auth_error: Option<DriverError>,
    page_error: Option<(usize, DriverError)>,
    rate_limits_left: AtomicU32,
    repeat_cursor: bool,
    fetch_delay: Option<Duration>,
    auth_delay: Option<Duration>,
    auth_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedDriver {
    pub fn serving(total: usize, page_size: usize) -> Self {
        Self {
            total,
            page_size: page_size.max(1),
            ..Self::default()
        }
    }

    pub fn failing_auth(mut self, err: DriverError) -> Self {
        self.auth_error = Some(err);
        self
    }

    /// Every fetch of page `index` (zero-based) fails with `err`.
    pub fn failing_on_page(mut self, index: usize, err: DriverError) -> Self {
        self.page_error = Some((index, err));
        self
    }

    /// The first `times` fetches answer `RateLimited`.
    pub fn rate_limited(self, times: u32) -> Self {
        self.rate_limits_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn always_rate_limited(self) -> Self {
        self.rate_limited(u32::MAX)
    }

    /// Hands back the cursor it was given instead of advancing.
    pub fn repeating_cursor(mut self) -> Self {
        self.repeat_cursor = true;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn with_auth_delay(mut self, delay: Duration) -> Self {
        self.auth_delay = Some(delay);
        self
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were in flight at once.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn page(&self, index: usize) -> ReelPage {
        let start = (index * self.page_size).min(self.total);
        let end = (start + self.page_size).min(self.total);
        let reels = (start..end)
            .map(|i| ReelMetrics {
                link: format!("https://www.instagram.com/reel/r{}/", i),
                views: (i as u64 + 1) * 100,
                likes: i as u64 * 3,
                comments: i as u64,
            })
            .collect();
        let next_cursor = if end < self.total {
            Some(format!("page-{}", index + 1))
        } else {
            None
        };
        ReelPage { reels, next_cursor }
    }
}

#[async_trait]
impl SessionDriver for ScriptedDriver {
    type Handle = ScriptedHandle;

    async fn authenticate(
        &self,
        account: &Account,
        _proxy: &Proxy,
    ) -> Result<ScriptedHandle, DriverError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.auth_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.auth_error {
            Some(err) => Err(err.clone()),
            None => Ok(ScriptedHandle {
                login: account.login.clone(),
            }),
        }
    }

    async fn fetch_page(
        &self,
        _handle: &mut ScriptedHandle,
        _username: &str,
        cursor: Option<&str>,
    ) -> Result<ReelPage, DriverError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.answer(cursor);

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl ScriptedDriver {
    fn answer(&self, cursor: Option<&str>) -> Result<ReelPage, DriverError> {
        let limited = self
            .rate_limits_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                match left {
                    0 => None,
                    u32::MAX => Some(u32::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok();
        if limited {
            return Err(DriverError::RateLimited);
        }

        let index = cursor
            .and_then(|c| c.strip_prefix("page-"))
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        if let Some((failing, err)) = &self.page_error {
            if *failing == index {
                return Err(err.clone());
            }
        }

        let mut page = self.page(index);
        if self.repeat_cursor && cursor.is_some() {
            page.next_cursor = cursor.map(str::to_string);
        }
        Ok(page)
    }
}

/// Retry and pacing tuned so tests spend milliseconds, not seconds, waiting.
pub fn fast_paginator() -> Paginator {
    Paginator::new(
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2,
            max_delay: Duration::from_millis(10),
        },
        (Duration::ZERO, Duration::ZERO),
        500,
    )
}

pub fn account(login: &str) -> Account {
    Account::new(login, Secret::new("pw"))
}

pub fn account_pool(dir: &Path, accounts: Vec<Account>) -> Arc<AccountPool> {
    let snapshot = SnapshotFile::in_dir(dir, "accounts.json");
    snapshot.save(&accounts).unwrap();
    Arc::new(AccountPool::open(snapshot).unwrap())
}

pub fn proxy_pool(dir: &Path, proxies: Vec<Proxy>) -> Arc<ProxyPool> {
    let snapshot = SnapshotFile::in_dir(dir, "proxies.json");
    snapshot.save(&proxies).unwrap();
    Arc::new(ProxyPool::open(snapshot).unwrap())
}
