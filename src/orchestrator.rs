use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::account_pool::{AccountOutcome, AccountPool};
use crate::driver::{SessionDriver, SessionHandle};
use crate::error::{AdminError, DriverError, PoolError, ScrapeError};
use crate::models::{Account, Proxy, ReelCollection, ReelLimit, ReelRecord, Secret, SessionState};
use crate::paginator::{CollectError, Paginator};
use crate::proxy_pool::{ProxyOutcome, ProxyPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStage {
    Start,
    AccountLeased,
    ProxyLeased,
    Authenticated,
    Paginating,
    Succeeded,
    Failed(&'static str),
}

fn enter(stage: JobStage) {
    debug!(stage = ?stage, "Job stage");
}

/// A job that failed after both leases were taken, with the session as it
/// stood when the failure happened.
struct JobFailure {
    error: CollectError,
    session: Option<SessionState>,
}

/// Outcome of [`ScrapeOrchestrator::test_account`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Ok,
    AuthenticationFailed,
    ProxyFailed,
    RateLimited,
    Unexpected,
}

impl From<&DriverError> for TestOutcome {
    fn from(err: &DriverError) -> Self {
        match err {
            DriverError::AuthenticationFailed(_) => TestOutcome::AuthenticationFailed,
            DriverError::ProxyError(_) => TestOutcome::ProxyFailed,
            DriverError::RateLimited => TestOutcome::RateLimited,
            DriverError::PrivateAccount
            | DriverError::UsernameNotFound
            | DriverError::Unexpected(_) => TestOutcome::Unexpected,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountTestReport {
    pub login: String,
    pub outcome: TestOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Decides who is to blame for a failure: the release outcome for each
/// resource and the error the caller sees.
fn attribute(
    error: CollectError,
    session: Option<SessionState>,
) -> (AccountOutcome, ProxyOutcome, ScrapeError) {
    let success = AccountOutcome::Success {
        session_state: session,
    };
    match error {
        CollectError::RetriesExhausted { attempts } => {
            (success, ProxyOutcome::Success, ScrapeError::Transient { attempts })
        }
        CollectError::Driver(err) => match err {
            DriverError::AuthenticationFailed(msg) => (
                AccountOutcome::AuthFailure,
                ProxyOutcome::Success,
                ScrapeError::Authentication(msg),
            ),
            DriverError::ProxyError(msg) => {
                (success, ProxyOutcome::ProxyFailure, ScrapeError::Proxy(msg))
            }
            DriverError::PrivateAccount => {
                (success, ProxyOutcome::Success, ScrapeError::PrivateAccount)
            }
            DriverError::UsernameNotFound => {
                (success, ProxyOutcome::Success, ScrapeError::UsernameNotFound)
            }
            DriverError::RateLimited => (
                success,
                ProxyOutcome::Success,
                ScrapeError::Transient { attempts: 1 },
            ),
            DriverError::Unexpected(msg) => {
                (success, ProxyOutcome::Success, ScrapeError::Unexpected(msg))
            }
        },
    }
}

/// Runs scrape jobs against the shared pools: lease, authenticate, paginate,
/// attribute the outcome, release.
pub struct ScrapeOrchestrator<D> {
    accounts: Arc<AccountPool>,
    proxies: Arc<ProxyPool>,
    driver: D,
    paginator: Paginator,
}

impl<D: SessionDriver> ScrapeOrchestrator<D> {
    pub fn new(
        accounts: Arc<AccountPool>,
        proxies: Arc<ProxyPool>,
        driver: D,
        paginator: Paginator,
    ) -> Self {
        Self {
            accounts,
            proxies,
            driver,
            paginator,
        }
    }

    pub fn accounts(&self) -> &Arc<AccountPool> {
        &self.accounts
    }

    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    /// Collects up to `limit` reels of `target`. Every resource leased here is
    /// released exactly once before this returns, or on drop if the future is
    /// cancelled.
    pub async fn run(&self, target: &str, limit: ReelLimit) -> Result<ReelCollection, ScrapeError> {
        let job_id = Uuid::new_v4();
        let span = info_span!("scrape_job", job_id = %job_id, username = %target);
        self.run_job(target, limit).instrument(span).await
    }

    async fn run_job(&self, target: &str, limit: ReelLimit) -> Result<ReelCollection, ScrapeError> {
        info!(limit = %limit, "Starting scrape job");
        enter(JobStage::Start);

        let account = match self.accounts.lease() {
            Ok(account) => account,
            Err(e) => {
                warn!(error = %e, "Could not lease an account");
                let err = ScrapeError::from(e);
                enter(JobStage::Failed(err.kind()));
                return Err(err);
            }
        };
        enter(JobStage::AccountLeased);

        let proxy = match self.proxies.lease() {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!(error = %e, "Could not lease a proxy");
                account.release(AccountOutcome::success());
                let err = ScrapeError::from(e);
                enter(JobStage::Failed(err.kind()));
                return Err(err);
            }
        };
        enter(JobStage::ProxyLeased);
        info!(login = %account.login(), proxy = %proxy.id(), "Resources leased");

        let result = self
            .scrape(account.account(), proxy.proxy(), target, limit)
            .await;

        let (account_outcome, proxy_outcome, outcome) = match result {
            Ok((reels, session)) => (
                AccountOutcome::Success {
                    session_state: session,
                },
                ProxyOutcome::Success,
                Ok(reels),
            ),
            Err(JobFailure { error, session }) => {
                let (a, p, err) = attribute(error, session);
                (a, p, Err(err))
            }
        };

        // Reverse acquisition order.
        proxy.release(proxy_outcome);
        account.release(account_outcome);

        match outcome {
            Ok(reels) => {
                enter(JobStage::Succeeded);
                info!(reels = reels.len(), "Scrape job succeeded");
                Ok(ReelCollection {
                    target_username: target.to_string(),
                    reels,
                })
            }
            Err(err) => {
                enter(JobStage::Failed(err.kind()));
                warn!(kind = err.kind(), error = %err, "Scrape job failed");
                Err(err)
            }
        }
    }

    async fn scrape(
        &self,
        account: &Account,
        proxy: &Proxy,
        target: &str,
        limit: ReelLimit,
    ) -> Result<(Vec<ReelRecord>, Option<SessionState>), JobFailure> {
        let mut handle = self
            .driver
            .authenticate(account, proxy)
            .await
            .map_err(|e| JobFailure {
                error: CollectError::Driver(e),
                session: None,
            })?;
        enter(JobStage::Authenticated);

        enter(JobStage::Paginating);
        match self
            .paginator
            .collect(&self.driver, &mut handle, target, limit)
            .await
        {
            Ok(reels) => Ok((reels, handle.session_state())),
            Err(error) => Err(JobFailure {
                error,
                session: handle.session_state(),
            }),
        }
    }

    /// Logs a new account in through a leased proxy and stores it with the
    /// captured session. Nothing is stored when the login fails.
    pub async fn onboard(&self, login: &str, secret: Secret) -> Result<Account, AdminError> {
        if self.accounts.contains(login) {
            return Err(PoolError::AccountExists(login.to_string()).into());
        }

        let proxy = self.proxies.lease()?;
        let candidate = Account::new(login, secret);

        match self.driver.authenticate(&candidate, proxy.proxy()).await {
            Ok(handle) => {
                proxy.release(ProxyOutcome::Success);
                let mut account = candidate;
                account.session_state = handle.session_state();
                let stored = self.accounts.insert(account)?;
                info!(login = %login, "Account onboarded");
                Ok(stored)
            }
            Err(e) => {
                let (_, proxy_outcome, err) = attribute(CollectError::Driver(e), None);
                proxy.release(proxy_outcome);
                warn!(login = %login, kind = err.kind(), error = %err, "Onboarding failed");
                Err(err.into())
            }
        }
    }

    /// Tries a fresh login with one stored account. Penalties follow the same
    /// attribution as a scrape job, but a passing test does not make an
    /// invalid account valid again.
    pub async fn test_account(&self, login: &str) -> Result<AccountTestReport, AdminError> {
        let account = self.accounts.lease_login(login)?;
        let proxy = match self.proxies.lease() {
            Ok(proxy) => proxy,
            Err(e) => {
                account.release(AccountOutcome::success());
                return Err(e.into());
            }
        };

        let (account_outcome, proxy_outcome, outcome, detail) =
            match self.driver.authenticate(account.account(), proxy.proxy()).await {
                Ok(handle) => (
                    AccountOutcome::Success {
                        session_state: handle.session_state(),
                    },
                    ProxyOutcome::Success,
                    TestOutcome::Ok,
                    None,
                ),
                Err(e) => {
                    let outcome = TestOutcome::from(&e);
                    let detail = e.to_string();
                    let (a, p, _) = attribute(CollectError::Driver(e), None);
                    (a, p, outcome, Some(detail))
                }
            };

        proxy.release(proxy_outcome);
        account.release(account_outcome);
        info!(login = %login, outcome = ?outcome, "Account test finished");

        Ok(AccountTestReport {
            login: login.to_string(),
            outcome,
            detail,
        })
    }
}
