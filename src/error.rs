use crate::models::ProxyId;
use crate::store::StoreError;
use thiserror::Error;

/// Failures a session driver may report. The orchestrator decides which
/// resource, if any, is to blame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("platform rejected the account: {0}")]
    AuthenticationFailed(String),

    #[error("network path through proxy failed: {0}")]
    ProxyError(String),

    #[error("target profile is private")]
    PrivateAccount,

    #[error("target profile does not exist")]
    UsernameNotFound,

    #[error("platform is rate limiting requests")]
    RateLimited,

    #[error("unexpected platform response: {0}")]
    Unexpected(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no valid account is free")]
    NoAccountAvailable,

    #[error("no unblocked proxy is free")]
    NoProxyAvailable,

    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error("account '{0}' already exists")]
    AccountExists(String),

    #[error("account '{0}' is leased")]
    AccountBusy(String),

    #[error("proxy {0} not found")]
    ProxyNotFound(ProxyId),

    #[error("proxy {0} already exists")]
    ProxyExists(ProxyId),

    #[error("proxy {0} is leased")]
    ProxyBusy(ProxyId),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl PoolError {
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::NoAccountAvailable => "no_account_available",
            PoolError::NoProxyAvailable => "no_proxy_available",
            PoolError::AccountNotFound(_) => "account_not_found",
            PoolError::AccountExists(_) => "account_exists",
            PoolError::AccountBusy(_) => "account_busy",
            PoolError::ProxyNotFound(_) => "proxy_not_found",
            PoolError::ProxyExists(_) => "proxy_exists",
            PoolError::ProxyBusy(_) => "proxy_busy",
            PoolError::Store(_) => "storage_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            PoolError::NoAccountAvailable => 404,
            PoolError::NoProxyAvailable => 503,
            PoolError::AccountNotFound(_) | PoolError::ProxyNotFound(_) => 404,
            PoolError::AccountExists(_) | PoolError::ProxyExists(_) => 400,
            PoolError::AccountBusy(_) | PoolError::ProxyBusy(_) => 409,
            PoolError::Store(_) => 500,
        }
    }
}

/// Caller-visible outcome of a failed scrape job.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no account available")]
    NoAccountAvailable,

    #[error("no proxy available")]
    NoProxyAvailable,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("proxy failed: {0}")]
    Proxy(String),

    #[error("target account is private")]
    PrivateAccount,

    #[error("target username not found")]
    UsernameNotFound,

    #[error("rate limited after {attempts} attempts")]
    Transient { attempts: u32 },

    #[error("unexpected platform response: {0}")]
    Unexpected(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ScrapeError {
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::NoAccountAvailable => "no_account_available",
            ScrapeError::NoProxyAvailable => "no_proxy_available",
            ScrapeError::Authentication(_) => "authentication_error",
            ScrapeError::Proxy(_) => "proxy_error",
            ScrapeError::PrivateAccount => "private_account_error",
            ScrapeError::UsernameNotFound => "username_not_found_error",
            ScrapeError::Transient { .. } => "transient_error",
            ScrapeError::Unexpected(_) => "unexpected_error",
            ScrapeError::Storage(_) => "storage_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ScrapeError::PrivateAccount => 403,
            ScrapeError::UsernameNotFound | ScrapeError::NoAccountAvailable => 404,
            ScrapeError::NoProxyAvailable => 503,
            ScrapeError::Authentication(_)
            | ScrapeError::Proxy(_)
            | ScrapeError::Transient { .. }
            | ScrapeError::Unexpected(_)
            | ScrapeError::Storage(_) => 500,
        }
    }

    /// Stable text shown to end users; never includes driver details.
    pub fn message(&self) -> &'static str {
        match self {
            ScrapeError::NoAccountAvailable => {
                "No valid Instagram accounts available. Please add an account first."
            }
            ScrapeError::NoProxyAvailable => "No working proxy available. Please add or unblock a proxy.",
            ScrapeError::Authentication(_) => {
                "The scraping account was rejected by Instagram and has been invalidated."
            }
            ScrapeError::Proxy(_) => "The proxy failed and has been blocked. Please try again.",
            ScrapeError::PrivateAccount => "This account is private.",
            ScrapeError::UsernameNotFound => "Account not found.",
            ScrapeError::Transient { .. } => {
                "Instagram is rate limiting requests. Please try again later."
            }
            ScrapeError::Unexpected(_) => "Instagram returned an unexpected response.",
            ScrapeError::Storage(_) => "Internal storage error.",
        }
    }
}

impl From<PoolError> for ScrapeError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoAccountAvailable => ScrapeError::NoAccountAvailable,
            PoolError::NoProxyAvailable => ScrapeError::NoProxyAvailable,
            other => ScrapeError::Storage(other.to_string()),
        }
    }
}

/// Failures of operator actions that touch the platform (onboarding, account
/// tests): either a pool refusal or a classified driver failure.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Scrape(#[from] ScrapeError),
}

impl AdminError {
    pub fn kind(&self) -> &'static str {
        match self {
            AdminError::Pool(e) => e.kind(),
            AdminError::Scrape(e) => e.kind(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AdminError::Pool(e) => e.status_code(),
            AdminError::Scrape(e) => e.status_code(),
        }
    }

    /// Text safe to show an operator.
    pub fn detail(&self) -> String {
        match self {
            AdminError::Pool(e) => e.to_string(),
            AdminError::Scrape(e) => e.message().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_failure_kind() {
        assert_eq!(ScrapeError::PrivateAccount.status_code(), 403);
        assert_eq!(ScrapeError::UsernameNotFound.status_code(), 404);
        assert_eq!(ScrapeError::NoAccountAvailable.status_code(), 404);
        assert_eq!(ScrapeError::Authentication("x".into()).status_code(), 500);
        assert_eq!(ScrapeError::Proxy("x".into()).status_code(), 500);
        assert_eq!(ScrapeError::Transient { attempts: 3 }.status_code(), 500);
    }

    #[test]
    fn messages_hide_driver_details() {
        let err = ScrapeError::Authentication("challenge_required at /accounts/login".into());
        assert!(!err.message().contains("challenge_required"));
        assert!(err.to_string().contains("challenge_required"));
    }

    #[test]
    fn pool_exhaustion_converts_to_matching_scrape_error() {
        assert!(matches!(
            ScrapeError::from(PoolError::NoAccountAvailable),
            ScrapeError::NoAccountAvailable
        ));
        assert!(matches!(
            ScrapeError::from(PoolError::NoProxyAvailable),
            ScrapeError::NoProxyAvailable
        ));
        let store = StoreError::Io {
            path: "data/accounts.json".into(),
            source: std::io::Error::other("disk full"),
        };
        assert!(matches!(
            ScrapeError::from(PoolError::Store(store)),
            ScrapeError::Storage(_)
        ));
    }
}
