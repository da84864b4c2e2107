use async_trait::async_trait;

use crate::error::DriverError;
use crate::models::{Account, Proxy, ReelMetrics, SessionState};

/// One page of reels plus the cursor of the page after it, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReelPage {
    pub reels: Vec<ReelMetrics>,
    pub next_cursor: Option<String>,
}

/// An authenticated session bound to one account/proxy pair.
pub trait SessionHandle: Send {
    /// The session as it stands now, to be persisted on a clean release.
    fn session_state(&self) -> Option<SessionState>;
}

/// Capability to log in to the platform and page through a profile's reels.
///
/// Handles are not shared between jobs; a driver may be called concurrently
/// with distinct handles.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    type Handle: SessionHandle;

    async fn authenticate(&self, account: &Account, proxy: &Proxy)
        -> Result<Self::Handle, DriverError>;

    async fn fetch_page(
        &self,
        handle: &mut Self::Handle,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<ReelPage, DriverError>;
}
