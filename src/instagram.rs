use async_trait::async_trait;
use chromiumoxide::auth::Credentials;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromeConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EventRequestWillBeSent, GetRequestPostDataParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use reqwest::header::{HeaderMap, COOKIE, REFERER, SET_COOKIE};
use reqwest::{RequestBuilder, StatusCode};
use scraper::{Html, Selector};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, BrowserConfig, InstagramConfig};
use crate::driver::{ReelPage, SessionDriver, SessionHandle};
use crate::error::DriverError;
use crate::models::{Account, Proxy, ReelMetrics, SessionState};

const USERNAME_INPUT: &str = "input[name='username']";
const PASSWORD_INPUT: &str = "input[name='password']";
const COOKIE_DOMAIN: &str = ".instagram.com";

/// Chromium error codes that point at the network path rather than the site.
const PROXY_FAILURE_MARKERS: &[&str] = &[
    "ERR_PROXY",
    "ERR_TUNNEL",
    "ERR_SOCKS",
    "ERR_CONNECTION",
    "ERR_TIMED_OUT",
    "ERR_NAME_NOT_RESOLVED",
    "ERR_EMPTY_RESPONSE",
    "ERR_NO_SUPPORTED_PROXIES",
];

/// Request headers of the web app's reels query replayed on every page fetch.
const FORWARDED_HEADERS: &[&str] = &[
    "x-fb-lsd",
    "x-asbd-id",
    "x-bloks-version-id",
    "x-fb-friendly-name",
    "x-root-field-name",
];

/// Logs in with a real browser, then pages through reels over plain HTTP
/// using the captured cookies.
pub struct InstagramDriver {
    browser: BrowserConfig,
    instagram: InstagramConfig,
}

/// The reels query exactly as the web app sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReelsQuery {
    doc_id: String,
    variables: Value,
    app_id: Option<String>,
    headers: Vec<(String, String)>,
}

/// What a browser login leaves behind.
struct BrowserLogin {
    cookies: SessionState,
    query: Option<ReelsQuery>,
}

/// Cookie jar and HTTP client bound to one account/proxy pair.
pub struct InstagramSession {
    client: reqwest::Client,
    cookies: SessionState,
    query: Option<ReelsQuery>,
    user_ids: HashMap<String, String>,
}

impl SessionHandle for InstagramSession {
    fn session_state(&self) -> Option<SessionState> {
        Some(self.cookies.clone())
    }
}

impl InstagramSession {
    fn absorb_cookies(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Some((name, value)) = value.to_str().ok().and_then(parse_set_cookie) else {
                continue;
            };
            if value.is_empty() || value == "\"\"" {
                continue;
            }
            self.cookies.insert(name, value);
        }
    }
}

impl InstagramDriver {
    pub fn new(browser: BrowserConfig, instagram: InstagramConfig) -> Self {
        Self { browser, instagram }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.browser.clone(), config.instagram.clone())
    }

    async fn launch(&self, proxy: &Proxy, profile_dir: PathBuf) -> Result<Browser, DriverError> {
        let mut config = ChromeConfig::builder();
        if !self.browser.headless {
            config = config.with_head();
        }
        let (width, height) = self.browser.window;
        config = config
            .window_size(width, height)
            .viewport(None)
            .user_data_dir(profile_dir)
            .request_timeout(self.browser.navigation_timeout())
            .arg(format!("--proxy-server={}", proxy.server_url()))
            .arg(format!("--user-agent={}", self.instagram.user_agent));

        let browser_config = config
            .build()
            .map_err(|e| DriverError::Unexpected(format!("Failed to build browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| DriverError::Unexpected(format!("Failed to launch browser: {}", e)))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    debug!("Browser handler error: {:?}", e);
                }
            }
        });

        Ok(browser)
    }

    /// Runs the login in a throwaway browser and returns the resulting cookies
    /// along with the reels query the web app issued.
    async fn browser_login(&self, account: &Account, proxy: &Proxy) -> Result<BrowserLogin, DriverError> {
        let profile_dir = std::env::temp_dir().join(format!("reels-harvester-{}", Uuid::new_v4()));
        let mut browser = self.launch(proxy, profile_dir.clone()).await?;

        let result = self.login_in_browser(&browser, account, proxy).await;

        if let Err(e) = browser.close().await {
            warn!("Failed to close browser: {}", e);
        }
        if let Err(e) = browser.wait().await {
            debug!("Browser process did not exit cleanly: {}", e);
        }
        if let Err(e) = tokio::fs::remove_dir_all(&profile_dir).await {
            debug!(dir = %profile_dir.display(), "Failed to remove browser profile: {}", e);
        }

        result
    }

    async fn login_in_browser(
        &self,
        browser: &Browser,
        account: &Account,
        proxy: &Proxy,
    ) -> Result<BrowserLogin, DriverError> {
        let page = browser.new_page("about:blank").await.map_err(cdp_error)?;

        if let Some(credentials) = proxy_credentials(proxy) {
            debug!(proxy = %proxy.id(), "Answering proxy authentication challenges");
            page.authenticate(credentials).await.map_err(cdp_error)?;
        }

        if let Some(state) = &account.session_state {
            let cookies: Vec<CookieParam> = state
                .cookies()
                .map(|(name, value)| {
                    let mut cookie = CookieParam::new(name, value);
                    cookie.domain = Some(COOKIE_DOMAIN.to_string());
                    cookie.path = Some("/".to_string());
                    cookie.secure = Some(true);
                    cookie
                })
                .collect();
            if !cookies.is_empty() {
                debug!(login = %account.login, count = cookies.len(), "Restoring stored cookies");
                page.set_cookies(cookies).await.map_err(cdp_error)?;
            }
        }

        self.navigate(&page, &self.instagram.login_url).await?;
        tokio::time::sleep(self.browser.action_delay()).await;

        let html = page.content().await.map_err(cdp_error)?;
        if has_login_form(&html) {
            info!(login = %account.login, "Logging into Instagram");
            self.submit_credentials(&page, account).await?;

            let html = page.content().await.map_err(cdp_error)?;
            if let Some(err) = login_failure(&html, &self.instagram.login_error_texts) {
                warn!(login = %account.login, error = %err, "Login rejected");
                return Err(err);
            }
        } else {
            info!(login = %account.login, "Stored session still live, skipping login");
        }

        if page_cookies(&page).await?.get("sessionid").is_none() {
            return Err(DriverError::AuthenticationFailed(
                "no sessionid cookie after login".to_string(),
            ));
        }

        let query = self.capture_reels_query(&page, &account.login).await?;
        let cookies = page_cookies(&page).await?;
        Ok(BrowserLogin { cookies, query })
    }

    /// Opens the account's own reels tab and records the GraphQL request the
    /// web app sends for it.
    async fn capture_reels_query(&self, page: &Page, login: &str) -> Result<Option<ReelsQuery>, DriverError> {
        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(cdp_error)?;
        let reels_url = format!("{}{}/reels/", self.instagram.base_url, login);
        self.navigate(page, &reels_url).await?;

        let watch = async {
            while let Some(event) = requests.next().await {
                let request = &event.request;
                if request.method != "POST" || !request.url.starts_with(&self.instagram.graphql_url) {
                    continue;
                }
                let post_data = match page
                    .execute(GetRequestPostDataParams::new(event.request_id.clone()))
                    .await
                {
                    Ok(response) => response.result.post_data,
                    Err(e) => {
                        debug!("Could not read GraphQL request body: {}", e);
                        continue;
                    }
                };
                let query = parse_reels_query(
                    request.headers.inner(),
                    &post_data,
                    &self.instagram.reels_query_name,
                );
                if query.is_some() {
                    return query;
                }
            }
            None
        };

        let captured = tokio::time::timeout(self.instagram.capture_timeout(), watch)
            .await
            .ok()
            .flatten();
        match &captured {
            Some(query) => info!(login = %login, doc_id = %query.doc_id, "Captured reels query"),
            None => warn!(login = %login, "Reels query not seen, falling back to configured doc_id"),
        }
        Ok(captured)
    }

    async fn navigate(&self, page: &Page, url: &str) -> Result<(), DriverError> {
        match tokio::time::timeout(self.browser.navigation_timeout(), page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(cdp_error(e)),
            Err(_) => Err(DriverError::ProxyError(format!("navigation to {} timed out", url))),
        }
    }

    async fn submit_credentials(&self, page: &Page, account: &Account) -> Result<(), DriverError> {
        let delay = self.browser.action_delay();

        page.find_element(USERNAME_INPUT)
            .await
            .map_err(cdp_error)?
            .click()
            .await
            .map_err(cdp_error)?
            .type_str(&account.login)
            .await
            .map_err(cdp_error)?;
        tokio::time::sleep(delay).await;

        page.find_element(PASSWORD_INPUT)
            .await
            .map_err(cdp_error)?
            .click()
            .await
            .map_err(cdp_error)?
            .type_str(account.secret.expose())
            .await
            .map_err(cdp_error)?
            .press_key("Enter")
            .await
            .map_err(cdp_error)?;

        // Rejected logins stay on the same page, so a missing navigation is fine.
        let navigation =
            tokio::time::timeout(self.browser.navigation_timeout(), page.wait_for_navigation()).await;
        submitted_navigation(navigation.ok())?;
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn http_client(&self, proxy: &Proxy) -> Result<reqwest::Client, DriverError> {
        let mut upstream = reqwest::Proxy::all(proxy.server_url())
            .map_err(|e| DriverError::ProxyError(format!("invalid proxy url: {}", e)))?;
        if let (Some(user), Some(password)) = (&proxy.username, &proxy.password) {
            upstream = upstream.basic_auth(user, password.expose());
        }

        reqwest::Client::builder()
            .proxy(upstream)
            .user_agent(self.instagram.user_agent.as_str())
            .timeout(Duration::from_secs(self.instagram.request_timeout_secs))
            .build()
            .map_err(|e| DriverError::Unexpected(format!("Failed to build HTTP client: {}", e)))
    }

    fn signed(&self, session: &InstagramSession, request: RequestBuilder) -> RequestBuilder {
        let app_id = session
            .query
            .as_ref()
            .and_then(|q| q.app_id.as_deref())
            .unwrap_or(&self.instagram.app_id);
        let mut request = request
            .header(COOKIE, session.cookies.cookie_header())
            .header(REFERER, self.instagram.base_url.as_str())
            .header("x-ig-app-id", app_id)
            .header("x-requested-with", "XMLHttpRequest");
        if let Some(csrf) = session.cookies.get("csrftoken") {
            request = request.header("x-csrftoken", csrf);
        }
        request
    }

    async fn resolve_user_id(&self, session: &mut InstagramSession, username: &str) -> Result<String, DriverError> {
        if let Some(id) = session.user_ids.get(username) {
            return Ok(id.clone());
        }

        let request = session
            .client
            .get(&self.instagram.profile_info_url)
            .query(&[("username", username)]);
        let response = self
            .signed(session, request)
            .send()
            .await
            .map_err(transport_error)?;
        session.absorb_cookies(response.headers());

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DriverError::UsernameNotFound);
        }
        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }

        let body: Value = response.json().await.map_err(transport_error)?;
        let profile = parse_profile(&body)?;
        if profile.is_private && !profile.followed_by_viewer {
            return Err(DriverError::PrivateAccount);
        }

        debug!(username = %username, user_id = %profile.id, "Resolved profile");
        session.user_ids.insert(username.to_string(), profile.id.clone());
        Ok(profile.id)
    }
}

#[async_trait]
impl SessionDriver for InstagramDriver {
    type Handle = InstagramSession;

    async fn authenticate(&self, account: &Account, proxy: &Proxy) -> Result<InstagramSession, DriverError> {
        info!(login = %account.login, proxy = %proxy.id(), "Authenticating account");
        let login = self.browser_login(account, proxy).await?;
        let client = self.http_client(proxy)?;
        info!(login = %account.login, "Successfully logged in");

        Ok(InstagramSession {
            client,
            cookies: login.cookies,
            query: login.query,
            user_ids: HashMap::new(),
        })
    }

    async fn fetch_page(
        &self,
        session: &mut InstagramSession,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<ReelPage, DriverError> {
        let user_id = self.resolve_user_id(session, username).await?;
        let captured = session.query.as_ref();
        let variables =
            reels_variables(captured.map(|q| &q.variables), &user_id, cursor, self.instagram.page_size)
                .to_string();
        let doc_id = captured.map_or(self.instagram.reels_doc_id.as_str(), |q| q.doc_id.as_str());

        debug!(username = %username, cursor = ?cursor, doc_id = %doc_id, "Fetching reels page");
        let mut request = session
            .client
            .post(&self.instagram.graphql_url)
            .form(&[("doc_id", doc_id), ("variables", variables.as_str())]);
        for (name, value) in captured.map(|q| q.headers.as_slice()).unwrap_or_default() {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = self
            .signed(session, request)
            .send()
            .await
            .map_err(transport_error)?;
        session.absorb_cookies(response.headers());

        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }
        let body: Value = response.json().await.map_err(transport_error)?;
        parse_reels_page(&body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProfileInfo {
    id: String,
    is_private: bool,
    followed_by_viewer: bool,
}

fn parse_profile(body: &Value) -> Result<ProfileInfo, DriverError> {
    if let Some(err) = body_error(body) {
        return Err(err);
    }
    let user = match body.pointer("/data/user") {
        Some(user) if !user.is_null() => user,
        _ => return Err(DriverError::UsernameNotFound),
    };
    let id = user
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| DriverError::Unexpected("profile without user id".to_string()))?;

    Ok(ProfileInfo {
        id: id.to_string(),
        is_private: user.get("is_private").and_then(Value::as_bool).unwrap_or(false),
        followed_by_viewer: user
            .get("followed_by_viewer")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// Reads the reels query out of an intercepted web app request: the form
/// body must name `query_name` and carry a `doc_id`.
pub fn parse_reels_query(headers: &Value, post_data: &str, query_name: &str) -> Option<ReelsQuery> {
    if !post_data.contains(query_name) {
        return None;
    }

    let mut doc_id = None;
    let mut variables = Value::Null;
    for (key, value) in url::form_urlencoded::parse(post_data.as_bytes()) {
        match key.as_ref() {
            "doc_id" => doc_id = Some(value.into_owned()),
            "variables" => variables = serde_json::from_str(&value).unwrap_or(Value::Null),
            _ => {}
        }
    }

    let mut app_id = None;
    let mut forwarded = Vec::new();
    if let Some(map) = headers.as_object() {
        for (name, value) in map {
            let Some(value) = value.as_str() else {
                continue;
            };
            let name = name.to_ascii_lowercase();
            if name == "x-ig-app-id" {
                app_id = Some(value.to_string());
            } else if FORWARDED_HEADERS.contains(&name.as_str()) {
                forwarded.push((name, value.to_string()));
            }
        }
    }

    Some(ReelsQuery {
        doc_id: doc_id.filter(|id| !id.is_empty())?,
        variables,
        app_id,
        headers: forwarded,
    })
}

/// Query variables for one page: the captured ones when available, with the
/// target, cursor and page size overridden.
fn reels_variables(captured: Option<&Value>, user_id: &str, cursor: Option<&str>, page_size: u32) -> Value {
    let mut variables = match captured {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({
            "before": null,
            "data": {
                "include_relationship_info": true,
                "latest_besties_reel_media": true,
                "latest_reel_media": true,
            },
            "last": null,
        }),
    };

    variables["after"] = json!(cursor);
    variables["first"] = json!(page_size);
    variables["page_size"] = json!(page_size);
    variables["target_user_id"] = json!(user_id);
    if let Some(data) = variables.get_mut("data").and_then(Value::as_object_mut) {
        data.insert("count".to_string(), json!(page_size));
    }
    variables
}

/// Extracts one page of reels from the clips connection GraphQL response.
pub fn parse_reels_page(body: &Value) -> Result<ReelPage, DriverError> {
    if let Some(err) = body_error(body) {
        return Err(err);
    }

    let connection = match body.pointer("/data/xdt_api__v1__clips__user__connection_v2") {
        Some(c) if !c.is_null() => c,
        _ => {
            return Err(DriverError::Unexpected(
                "reels connection missing from response".to_string(),
            ))
        }
    };
    let edges = connection
        .get("edges")
        .and_then(Value::as_array)
        .ok_or_else(|| DriverError::Unexpected("reels connection without edges".to_string()))?;

    let mut reels = Vec::with_capacity(edges.len());
    for edge in edges {
        let Some(media) = edge.pointer("/node/media") else {
            debug!("Skipping edge without media");
            continue;
        };
        let code = media
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Unexpected("reel without shortcode".to_string()))?;
        reels.push(ReelMetrics {
            link: reel_link(code),
            views: count(media, "play_count"),
            likes: count(media, "like_count"),
            comments: count(media, "comment_count"),
        });
    }

    let page_info = connection.get("page_info");
    let has_next = page_info
        .and_then(|p| p.get("has_next_page"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_cursor = if has_next {
        page_info
            .and_then(|p| p.get("end_cursor"))
            .and_then(Value::as_str)
            .map(str::to_string)
    } else {
        None
    };

    Ok(ReelPage { reels, next_cursor })
}

pub fn reel_link(code: &str) -> String {
    format!("https://www.instagram.com/reel/{}/", code)
}

// Hidden like counts come back as null.
fn count(media: &Value, key: &str) -> u64 {
    media.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Error envelopes the platform returns with a 200 status.
fn body_error(body: &Value) -> Option<DriverError> {
    let message = body.get("message").and_then(Value::as_str).unwrap_or_default();
    let require_login = body.get("require_login").and_then(Value::as_bool).unwrap_or(false);

    if require_login || message == "login_required" || message == "checkpoint_required" {
        return Some(DriverError::AuthenticationFailed(format!(
            "session rejected: {}",
            if message.is_empty() { "login required" } else { message }
        )));
    }
    if is_rate_limit_message(message) {
        return Some(DriverError::RateLimited);
    }
    if body.get("status").and_then(Value::as_str) == Some("fail") {
        return Some(DriverError::Unexpected(format!("platform failure: {}", message)));
    }
    if let Some(first) = body.get("errors").and_then(Value::as_array).and_then(|e| e.first()) {
        let text = first.get("message").and_then(Value::as_str).unwrap_or("graphql error");
        return Some(DriverError::Unexpected(text.to_string()));
    }
    None
}

pub fn status_error(status: StatusCode) -> Option<DriverError> {
    match status.as_u16() {
        200..=299 => None,
        429 | 500..=599 => Some(DriverError::RateLimited),
        401 | 403 => Some(DriverError::AuthenticationFailed(format!(
            "platform answered {}",
            status
        ))),
        407 => Some(DriverError::ProxyError("proxy authentication required".to_string())),
        _ => Some(DriverError::Unexpected(format!("platform answered {}", status))),
    }
}

fn transport_error(e: reqwest::Error) -> DriverError {
    if e.is_connect() || e.is_timeout() {
        DriverError::ProxyError(e.to_string())
    } else if e.is_decode() || e.is_builder() {
        DriverError::Unexpected(e.to_string())
    } else if e.is_request() {
        DriverError::ProxyError(e.to_string())
    } else {
        DriverError::Unexpected(e.to_string())
    }
}

fn is_rate_limit_message(text: &str) -> bool {
    text.to_lowercase().contains("wait a few minutes")
}

fn proxy_credentials(proxy: &Proxy) -> Option<Credentials> {
    match (&proxy.username, &proxy.password) {
        (Some(username), Some(password)) => Some(Credentials {
            username: username.clone(),
            password: password.expose().to_string(),
        }),
        _ => None,
    }
}

async fn page_cookies(page: &Page) -> Result<SessionState, DriverError> {
    let cookies = page.get_cookies().await.map_err(cdp_error)?;
    Ok(SessionState::from_cookies(
        cookies
            .into_iter()
            .filter(|c| c.domain.contains("instagram.com"))
            .map(|c| (c.name, c.value)),
    ))
}

/// Outcome of waiting for the navigation a submitted login form triggers.
/// `None` means no navigation happened within the timeout.
fn submitted_navigation<T>(outcome: Option<Result<T, CdpError>>) -> Result<(), DriverError> {
    match outcome {
        Some(Err(e)) => Err(cdp_error(e)),
        _ => Ok(()),
    }
}

fn cdp_error(e: CdpError) -> DriverError {
    classify_browser_failure(&e.to_string())
}

pub fn classify_browser_failure(message: &str) -> DriverError {
    if PROXY_FAILURE_MARKERS.iter().any(|m| message.contains(m)) {
        DriverError::ProxyError(message.to_string())
    } else {
        DriverError::Unexpected(message.to_string())
    }
}

/// True when the page still shows the username/password form.
pub fn has_login_form(html: &str) -> bool {
    let document = Html::parse_document(html);
    [USERNAME_INPUT, PASSWORD_INPUT].iter().all(|css| {
        Selector::parse(css)
            .map(|selector| document.select(&selector).next().is_some())
            .unwrap_or(false)
    })
}

/// Reads a login page after the form was submitted. Throttling notices are
/// reported as rate limiting; alerts and configured error fragments mean
/// the credentials were rejected.
pub fn login_failure(html: &str, error_texts: &[String]) -> Option<DriverError> {
    let document = Html::parse_document(html);

    let visible = visible_text(&document);
    if is_rate_limit_message(&visible) {
        return Some(DriverError::RateLimited);
    }

    if let Ok(alert) = Selector::parse("#slfErrorAlert, [role='alert']") {
        let text = document
            .select(&alert)
            .map(|el| el.text().collect::<String>())
            .find(|t| !t.trim().is_empty());
        if let Some(text) = text {
            return Some(DriverError::AuthenticationFailed(text.trim().to_string()));
        }
    }

    let visible = visible.to_lowercase();
    error_texts
        .iter()
        .find(|t| visible.contains(&t.to_lowercase()))
        .map(|t| DriverError::AuthenticationFailed(t.clone()))
}

fn visible_text(document: &Html) -> String {
    document
        .root_element()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let parent = node.parent()?;
            let tag = parent.value().as_element()?.name();
            if matches!(tag, "script" | "style" | "noscript" | "template") {
                None
            } else {
                Some(&**text)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_set_cookie(header: &str) -> Option<(&str, &str)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}
