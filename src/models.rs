use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Credential material that must never reach logs or API responses.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    #[cfg(test)]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Opaque platform session: the cookie jar captured after a login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState {
    cookies: BTreeMap<String, String>,
}

impl SessionState {
    pub fn from_cookies<I, K, V>(cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            cookies: cookies
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Renders the jar as a `Cookie` request header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LeaseState {
    #[default]
    Free,
    Leased { since: DateTime<Utc> },
}

impl LeaseState {
    pub fn is_free(&self) -> bool {
        matches!(self, LeaseState::Free)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
    pub secret: Secret,
    #[serde(default)]
    pub session_state: Option<SessionState>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    pub valid: bool,
    #[serde(default)]
    pub lease_state: LeaseState,
}

impl Account {
    pub fn new(login: impl Into<String>, secret: Secret) -> Self {
        Self {
            login: login.into(),
            secret,
            session_state: None,
            last_used_at: None,
            valid: true,
            lease_state: LeaseState::Free,
        }
    }

    pub fn is_leasable(&self) -> bool {
        self.valid && self.lease_state.is_free()
    }
}

/// Account as shown to operators: everything except the secret.
#[derive(Debug, Clone, Serialize)]
pub struct AccountView {
    pub login: String,
    pub has_session: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub valid: bool,
    pub lease_state: LeaseState,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            login: account.login.clone(),
            has_session: account
                .session_state
                .as_ref()
                .is_some_and(|s| !s.is_empty()),
            last_used_at: account.last_used_at,
            valid: account.valid,
            lease_state: account.lease_state,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

/// Composite key of a proxy, written `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProxyId {
    pub host: String,
    pub port: u16,
}

impl ProxyId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got '{}'", s))?;
        if host.is_empty() {
            return Err(format!("missing host in '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in '{}'", s))?;
        Ok(Self::new(host, port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub lease_state: LeaseState,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            protocol: ProxyProtocol::Http,
            is_blocked: false,
            request_count: 0,
            lease_state: LeaseState::Free,
        }
    }

    pub fn id(&self) -> ProxyId {
        ProxyId::new(self.host.clone(), self.port)
    }

    pub fn is_leasable(&self) -> bool {
        !self.is_blocked && self.lease_state.is_free()
    }

    /// `scheme://host:port`, without credentials.
    pub fn server_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyView {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub protocol: ProxyProtocol,
    pub is_blocked: bool,
    pub request_count: u64,
    pub lease_state: LeaseState,
}

impl From<&Proxy> for ProxyView {
    fn from(proxy: &Proxy) -> Self {
        Self {
            id: proxy.id().to_string(),
            host: proxy.host.clone(),
            port: proxy.port,
            username: proxy.username.clone(),
            protocol: proxy.protocol,
            is_blocked: proxy.is_blocked,
            request_count: proxy.request_count,
            lease_state: proxy.lease_state,
        }
    }
}

/// Raw engagement counters for one reel as the platform reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReelMetrics {
    pub link: String,
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReelRecord {
    pub link: String,
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    pub virality: f64,
}

impl ReelRecord {
    pub fn new(link: impl Into<String>, views: u64, likes: u64, comments: u64) -> Self {
        Self {
            link: link.into(),
            views,
            likes,
            comments,
            virality: virality(views, likes, comments),
        }
    }
}

impl From<ReelMetrics> for ReelRecord {
    fn from(m: ReelMetrics) -> Self {
        ReelRecord::new(m.link, m.views, m.likes, m.comments)
    }
}

/// `(likes + comments) / views`; zero-view reels score zero.
pub fn virality(views: u64, likes: u64, comments: u64) -> f64 {
    if views == 0 {
        return 0.0;
    }
    (likes as f64 + comments as f64) / views as f64
}

/// How many reels a job should collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReelLimit {
    Unbounded,
    AtMost(usize),
}

impl ReelLimit {
    /// `None` and `0` both mean "everything the profile has".
    pub fn from_request(max_reels: Option<u32>) -> Self {
        match max_reels {
            None | Some(0) => ReelLimit::Unbounded,
            Some(n) => ReelLimit::AtMost(n as usize),
        }
    }

    pub fn max(&self) -> Option<usize> {
        match self {
            ReelLimit::Unbounded => None,
            ReelLimit::AtMost(n) => Some(*n),
        }
    }
}

impl fmt::Display for ReelLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReelLimit::Unbounded => f.write_str("all"),
            ReelLimit::AtMost(n) => write!(f, "{}", n),
        }
    }
}

/// Records collected for one target, in discovery order.
#[derive(Debug, Clone, Serialize)]
pub struct ReelCollection {
    pub target_username: String,
    pub reels: Vec<ReelRecord>,
}

/// Top-level paths on the site that are not profiles.
const RESERVED_PATHS: &[&str] = &[
    "reel", "reels", "p", "tv", "explore", "stories", "accounts", "direct",
];

fn is_instagram_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "instagram.com" || host.ends_with(".instagram.com")
}

/// Accepts `name`, `@name` or a profile URL and returns the bare username.
/// Post and reel links, the bare host and anything that cannot be a
/// username yield `None`.
pub fn normalize_username(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let (head, rest) = without_scheme
        .split_once(['/', '?', '#'])
        .unwrap_or((without_scheme, ""));
    let path = if is_instagram_host(head) {
        rest
    } else {
        without_scheme
    };

    let name = path
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim_start_matches('@');

    let valid = !name.is_empty()
        && name.len() <= 30
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    if !valid || RESERVED_PATHS.contains(&name.to_ascii_lowercase().as_str()) {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virality_divides_engagement_by_views() {
        let record = ReelRecord::new("https://www.instagram.com/reel/abc/", 200, 30, 10);
        assert_eq!(record.virality, (30.0 + 10.0) / 200.0);
    }

    #[test]
    fn zero_view_reel_has_zero_virality() {
        assert_eq!(virality(0, 15, 4), 0.0);
        assert_eq!(virality(0, 0, 0), 0.0);
    }

    #[test]
    fn virality_handles_large_counters() {
        let v = virality(u64::MAX, u64::MAX, 0);
        assert!(v.is_finite());
        assert!((v - 1.0).abs() < 1e-9);
    }

    #[test]
    fn reel_limit_treats_zero_and_null_as_unbounded() {
        assert_eq!(ReelLimit::from_request(None), ReelLimit::Unbounded);
        assert_eq!(ReelLimit::from_request(Some(0)), ReelLimit::Unbounded);
        assert_eq!(ReelLimit::from_request(Some(25)), ReelLimit::AtMost(25));
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let account = Account::new("alice", Secret::new("hunter2"));
        let rendered = format!("{:?}", account);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn proxy_id_round_trips_through_display() {
        let id: ProxyId = "10.0.0.1:8080".parse().unwrap();
        assert_eq!(id, ProxyId::new("10.0.0.1", 8080));
        assert_eq!(id.to_string(), "10.0.0.1:8080");
        assert!("10.0.0.1".parse::<ProxyId>().is_err());
        assert!(":80".parse::<ProxyId>().is_err());
        assert!("host:notaport".parse::<ProxyId>().is_err());
    }

    #[test]
    fn lease_state_serializes_with_tag() {
        let json = serde_json::to_value(LeaseState::Free).unwrap();
        assert_eq!(json, serde_json::json!({"state": "free"}));
    }

    #[test]
    fn normalizes_profile_links() {
        assert_eq!(normalize_username("iamrigbycat").as_deref(), Some("iamrigbycat"));
        assert_eq!(normalize_username("@iamrigbycat").as_deref(), Some("iamrigbycat"));
        assert_eq!(
            normalize_username("https://www.instagram.com/iamrigbycat/").as_deref(),
            Some("iamrigbycat")
        );
        assert_eq!(
            normalize_username("instagram.com/iamrigbycat?hl=en").as_deref(),
            Some("iamrigbycat")
        );
        assert_eq!(normalize_username("   "), None);
    }

    #[test]
    fn rejects_links_that_are_not_profiles() {
        assert_eq!(normalize_username("https://www.instagram.com/reel/ABC/"), None);
        assert_eq!(normalize_username("instagram.com/p/C1abc/"), None);
        assert_eq!(normalize_username("https://instagram.com/explore/"), None);
        assert_eq!(normalize_username("instagram.com"), None);
        assert_eq!(normalize_username("https://www.instagram.com/"), None);
        assert_eq!(normalize_username("not a name"), None);
        assert_eq!(
            normalize_username("https://www.instagram.com/nat.geo_/reels/").as_deref(),
            Some("nat.geo_")
        );
    }

    #[test]
    fn session_state_renders_cookie_header() {
        let state = SessionState::from_cookies([("sessionid", "abc"), ("csrftoken", "xyz")]);
        assert_eq!(state.cookie_header(), "csrftoken=xyz; sessionid=abc");
        assert_eq!(state.get("sessionid"), Some("abc"));
    }
}
