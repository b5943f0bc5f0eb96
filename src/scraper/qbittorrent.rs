//! qBittorrent WebUI API client with session management
//!
//! The client owns the session cookie. Callers never see it: every API call
//! goes through [`SessionClient::call`], which logs in when needed, re-logs in
//! once when the cookie is rejected, and retries network failures and 5xx
//! responses with exponential backoff.
//!
//! Re-authentication is single-flight: when several feeds hit an expired
//! session at the same time, one of them logs in and the others reuse the new
//! cookie.

use async_trait::async_trait;
use reqwest::header::{COOKIE, REFERER, SET_COOKIE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

use crate::config::{ClientConfig, RetryConfig};
use crate::dispatcher::Submitter;
use crate::error::{Error, Result};
use crate::models::DispatchParams;
use crate::scraper::rss::Item;

/// States in which a torrent is downloading or waiting to
const DOWNLOAD_LIKE_STATES: [&str; 6] = [
    "downloading",
    "stalledDL",
    "queuedDL",
    "metaDL",
    "checkingDL",
    "allocating",
];

/// States in which a torrent is paused or stopped
const PAUSED_STATES: [&str; 6] = [
    "pausedDL",
    "pausedUP",
    "paused",
    "stopped",
    "stoppedDL",
    "stoppedUP",
];

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

/// The authenticated session. Only the client creates or replaces it.
#[derive(Clone)]
pub struct Session {
    sid: String,
    generation: u64,
    expires_at: Instant,
}

impl Session {
    fn new(sid: String, generation: u64, ttl: Duration) -> Self {
        Self {
            sid,
            generation,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn cookie(&self) -> String {
        format!("SID={}", self.sid)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &"<redacted>")
            .field("generation", &self.generation)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One API request, relative to `/api/v2/`
#[derive(Debug, Clone)]
enum ApiCall {
    Get(&'static str),
    PostForm(&'static str, Vec<(&'static str, String)>),
}

impl ApiCall {
    fn path(&self) -> &'static str {
        match self {
            ApiCall::Get(path) | ApiCall::PostForm(path, _) => path,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TorrentInfo {
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    category: String,
}

pub struct SessionClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    session_ttl: Duration,
    retry: RetryPolicy,
    excluded_categories: Vec<String>,
    reannounce_wait: Duration,
    session: RwLock<Option<Session>>,
    /// Held for the whole duration of a login
    login_lock: Mutex<()>,
    logins: AtomicU64,
}

impl SessionClient {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: super::build_http_client(config.request_timeout())?,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            session_ttl: config.session_ttl(),
            retry: RetryPolicy::from(&config.retry),
            excluded_categories: config.pause_excluded_categories.clone(),
            reannounce_wait: Duration::from_secs(config.reannounce_wait_secs),
            session: RwLock::new(None),
            login_lock: Mutex::new(()),
            logins: AtomicU64::new(0),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Number of successful logins since start
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    /// Returns the current session, logging in if there is none or it expired
    pub async fn ensure_authenticated(&self) -> Result<Session> {
        if let Some(session) = self.session.read().await.as_ref() {
            if !session.is_expired() {
                return Ok(session.clone());
            }
        }
        self.refresh(None).await
    }

    /// Log in unless someone else already replaced the session.
    ///
    /// `stale` is the generation the caller saw rejected; `None` means the
    /// caller found no usable session at all.
    async fn refresh(&self, stale: Option<u64>) -> Result<Session> {
        let _guard = self.login_lock.lock().await;

        let previous_generation = {
            let current = self.session.read().await;
            if let Some(session) = current.as_ref() {
                let replaced = stale.is_none_or(|g| session.generation != g);
                if replaced && !session.is_expired() {
                    tracing::debug!("Reusing session refreshed by another task");
                    return Ok(session.clone());
                }
                session.generation
            } else {
                0
            }
        };

        let sid = self.login_with_retry().await?;
        let session = Session::new(sid, previous_generation + 1, self.session_ttl);
        *self.session.write().await = Some(session.clone());
        self.logins.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            "Authenticated with qBittorrent at {} (session #{})",
            self.base_url,
            session.generation
        );

        Ok(session)
    }

    async fn login_with_retry(&self) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.login_once().await {
                Ok(sid) => return Ok(sid),
                Err(Error::Transient(msg)) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(Error::Transient(format!(
                            "{} (gave up after {} attempts)",
                            msg, attempt
                        )));
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    tracing::warn!("Login failed ({}), retrying in {:?}", msg, delay);
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn login_once(&self) -> Result<String> {
        let url = format!("{}/api/v2/auth/login", self.base_url);
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];

        let resp = self
            .http
            .post(&url)
            .header(REFERER, &self.base_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| network_error("auth/login", &e))?;

        let status = resp.status();
        if status == StatusCode::FORBIDDEN {
            return Err(Error::Auth(
                "login refused: too many failed attempts, client IP is banned".to_string(),
            ));
        }
        if status.is_server_error() {
            return Err(Error::Transient(format!("HTTP {} from auth/login", status.as_u16())));
        }
        if !status.is_success() {
            return Err(Error::Auth(format!("HTTP {} from auth/login", status.as_u16())));
        }

        let sid = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .find_map(|pair| pair.trim().strip_prefix("SID=").map(str::to_string));

        let body = resp
            .text()
            .await
            .map_err(|e| network_error("auth/login", &e))?;

        if body.trim() == "Fails." {
            return Err(Error::Auth("invalid username or password".to_string()));
        }

        sid.filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Auth("login response carried no SID cookie".to_string()))
    }

    async fn send_once(&self, session: &Session, call: &ApiCall) -> Result<String> {
        let url = format!("{}/api/v2/{}", self.base_url, call.path());
        let request = match call {
            ApiCall::Get(_) => self.http.get(&url),
            ApiCall::PostForm(_, form) => self.http.post(&url).form(form),
        };

        let resp = request
            .header(COOKIE, session.cookie())
            .header(REFERER, &self.base_url)
            .send()
            .await
            .map_err(|e| network_error(call.path(), &e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| network_error(call.path(), &e))?;

        classify(status, call.path(), body)
    }

    /// Run an API call inside the auth and retry envelope
    async fn call(&self, call: ApiCall) -> Result<String> {
        let mut session = self.ensure_authenticated().await?;
        let mut reauthenticated = false;
        let mut attempt = 0;

        loop {
            match self.send_once(&session, &call).await {
                Ok(body) => return Ok(body),
                Err(Error::Auth(msg)) => {
                    if reauthenticated {
                        return Err(Error::Auth(msg));
                    }
                    tracing::info!("Session rejected on {} ({}), re-authenticating", call.path(), msg);
                    session = self.refresh(Some(session.generation)).await?;
                    reauthenticated = true;
                }
                Err(Error::Transient(msg)) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(Error::Transient(format!(
                            "{} (gave up after {} attempts)",
                            msg, attempt
                        )));
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    tracing::warn!("{} failed ({}), retrying in {:?}", call.path(), msg, delay);
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask the remote client to download an item
    pub async fn submit(&self, item: &Item, params: &DispatchParams) -> Result<()> {
        let mut form = vec![("urls", item.download_url.clone())];
        if let Some(save_path) = &params.save_path {
            form.push(("savepath", save_path.clone()));
        }
        if let Some(category) = &params.category {
            form.push(("category", category.clone()));
        }

        let body = self.call(ApiCall::PostForm("torrents/add", form)).await?;

        if body.trim() == "Fails." {
            return Err(Error::Request(format!(
                "qBittorrent refused to add '{}'",
                item.title
            )));
        }

        Ok(())
    }

    /// Application version, doubles as a liveness probe
    pub async fn app_version(&self) -> Result<String> {
        let body = self.call(ApiCall::Get("app/version")).await?;
        Ok(body.trim().to_string())
    }

    async fn torrents(&self) -> Result<Vec<TorrentInfo>> {
        let body = self.call(ApiCall::Get("torrents/info")).await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::Request(format!("unexpected torrents/info response: {}", e)))
    }

    /// Force-reannounce then stop every downloading torrent outside the
    /// excluded categories. Returns the number of torrents stopped.
    pub async fn pause_downloading(&self) -> Result<usize> {
        let excluded: HashSet<&str> = self.excluded_categories.iter().map(String::as_str).collect();
        let hashes: Vec<String> = self
            .torrents()
            .await?
            .into_iter()
            .filter(|t| !t.hash.is_empty())
            .filter(|t| !excluded.contains(t.category.as_str()))
            .filter(|t| DOWNLOAD_LIKE_STATES.contains(&t.state.as_str()))
            .map(|t| {
                tracing::debug!("Pausing '{}' ({})", t.name, t.state);
                t.hash
            })
            .collect();

        if hashes.is_empty() {
            tracing::info!("No downloading torrents to pause");
            return Ok(0);
        }

        let joined = hashes.join("|");

        // Reannounce lets trackers record the final stats before stopping
        if let Err(e) = self
            .call(ApiCall::PostForm("torrents/reannounce", vec![("hashes", joined.clone())]))
            .await
        {
            tracing::warn!("Force reannounce failed, stopping anyway: {}", e);
        }
        if !self.reannounce_wait.is_zero() {
            sleep(self.reannounce_wait).await;
        }

        self.call_with_legacy("torrents/stop", "torrents/pause", joined)
            .await?;
        tracing::info!("Stopped {} downloading torrent(s)", hashes.len());

        Ok(hashes.len())
    }

    /// Start every paused or stopped torrent. Returns the number started.
    pub async fn resume_paused(&self) -> Result<usize> {
        let hashes: Vec<String> = self
            .torrents()
            .await?
            .into_iter()
            .filter(|t| !t.hash.is_empty() && PAUSED_STATES.contains(&t.state.as_str()))
            .map(|t| t.hash)
            .collect();

        if hashes.is_empty() {
            tracing::info!("No paused torrents to resume");
            return Ok(0);
        }

        self.call_with_legacy("torrents/start", "torrents/resume", hashes.join("|"))
            .await?;
        tracing::info!("Resumed {} paused torrent(s)", hashes.len());

        Ok(hashes.len())
    }

    /// Remove every torrent, optionally with its downloaded data
    pub async fn delete_all(&self, delete_files: bool) -> Result<()> {
        self.call(ApiCall::PostForm(
            "torrents/delete",
            vec![
                ("hashes", "all".to_string()),
                ("deleteFiles", delete_files.to_string()),
            ],
        ))
        .await?;
        tracing::info!("Deleted all torrents (delete_files = {})", delete_files);
        Ok(())
    }

    /// qBittorrent 5 renamed pause/resume to stop/start; fall back on 404
    async fn call_with_legacy(
        &self,
        path: &'static str,
        legacy_path: &'static str,
        hashes: String,
    ) -> Result<String> {
        match self
            .call(ApiCall::PostForm(path, vec![("hashes", hashes.clone())]))
            .await
        {
            Err(Error::Request(msg)) if msg.starts_with("HTTP 404") => {
                tracing::debug!("{} not found, using {}", path, legacy_path);
                self.call(ApiCall::PostForm(legacy_path, vec![("hashes", hashes)]))
                    .await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Submitter for SessionClient {
    async fn submit(&self, item: &Item, params: &DispatchParams) -> Result<()> {
        SessionClient::submit(self, item, params).await
    }
}

/// Map an HTTP status to the failure taxonomy
fn classify(status: StatusCode, path: &str, body: String) -> Result<String> {
    if status.is_success() {
        return Ok(body);
    }

    let msg = format!("HTTP {} from {}: {}", status.as_u16(), path, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Auth(msg)),
        s if s.is_server_error() => Err(Error::Transient(msg)),
        _ => Err(Error::Request(msg)),
    }
}

fn network_error(path: &str, err: &reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Transient(format!("{} timed out", path))
    } else {
        Error::Transient(format!("{} failed: {}", path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Form, Router,
        extract::State,
        http::{HeaderMap, HeaderValue, header},
        response::{IntoResponse, Response},
        routing::{get, post},
    };
    use chrono::Utc;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// In-process stand-in for the qBittorrent WebUI
    #[derive(Default)]
    struct MockQb {
        valid_sid: std::sync::Mutex<String>,
        logins: AtomicUsize,
        add_hits: AtomicUsize,
        added: std::sync::Mutex<Vec<HashMap<String, String>>>,
        add_failures: std::sync::Mutex<VecDeque<StatusCode>>,
        always_forbid_add: std::sync::atomic::AtomicBool,
        reject_adds: std::sync::atomic::AtomicBool,
        slow_adds: std::sync::atomic::AtomicBool,
        stop_missing: std::sync::atomic::AtomicBool,
        posted: std::sync::Mutex<Vec<(String, HashMap<String, String>)>>,
    }

    impl MockQb {
        fn expire_session(&self) {
            *self.valid_sid.lock().unwrap() = "expired".to_string();
        }

        fn authorized(&self, headers: &HeaderMap) -> bool {
            let expected = format!("SID={}", self.valid_sid.lock().unwrap());
            headers
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected)
        }

        fn posted_paths(&self) -> Vec<String> {
            self.posted.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
        }
    }

    async fn login(
        State(qb): State<Arc<MockQb>>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        if form.get("username").map(String::as_str) != Some("admin")
            || form.get("password").map(String::as_str) != Some("secret")
        {
            return "Fails.".into_response();
        }
        let n = qb.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let sid = format!("sid-{}", n);
        *qb.valid_sid.lock().unwrap() = sid.clone();

        let mut resp = "Ok.".into_response();
        resp.headers_mut().insert(
            header::SET_COOKIE,
            HeaderValue::from_str(&format!("SID={}; HttpOnly; path=/", sid)).unwrap(),
        );
        resp
    }

    async fn add(
        State(qb): State<Arc<MockQb>>,
        headers: HeaderMap,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        qb.add_hits.fetch_add(1, Ordering::SeqCst);
        if qb.slow_adds.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        if qb.always_forbid_add.load(Ordering::SeqCst) || !qb.authorized(&headers) {
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        let failure = qb.add_failures.lock().unwrap().pop_front();
        if let Some(status) = failure {
            return (status, "boom").into_response();
        }
        if qb.reject_adds.load(Ordering::SeqCst) {
            return "Fails.".into_response();
        }
        qb.added.lock().unwrap().push(form);
        "Ok.".into_response()
    }

    async fn version(State(qb): State<Arc<MockQb>>, headers: HeaderMap) -> Response {
        if !qb.authorized(&headers) {
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        "v4.6.2\n".into_response()
    }

    async fn info(State(qb): State<Arc<MockQb>>, headers: HeaderMap) -> Response {
        if !qb.authorized(&headers) {
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
        let body = r#"[
            {"hash": "aaa", "name": "a", "state": "downloading", "category": "tv"},
            {"hash": "bbb", "name": "b", "state": "stalledDL", "category": "keep"},
            {"hash": "ccc", "name": "c", "state": "uploading", "category": "tv"},
            {"hash": "ddd", "name": "d", "state": "pausedDL", "category": "tv"},
            {"hash": "eee", "name": "e", "state": "stoppedUP", "category": ""}
        ]"#;
        ([(header::CONTENT_TYPE, "application/json")], body).into_response()
    }

    fn record_post(path: &'static str) -> axum::routing::MethodRouter<Arc<MockQb>> {
        post(
            move |State(qb): State<Arc<MockQb>>,
                  headers: HeaderMap,
                  Form(form): Form<HashMap<String, String>>| async move {
                if !qb.authorized(&headers) {
                    return (StatusCode::FORBIDDEN, "Forbidden").into_response();
                }
                if path == "torrents/stop" && qb.stop_missing.load(Ordering::SeqCst) {
                    return (StatusCode::NOT_FOUND, "Not Found").into_response();
                }
                qb.posted.lock().unwrap().push((path.to_string(), form));
                "Ok.".into_response()
            },
        )
    }

    async fn start_mock() -> (Arc<MockQb>, String) {
        let qb = Arc::new(MockQb::default());
        let router = Router::new()
            .route("/api/v2/auth/login", post(login))
            .route("/api/v2/torrents/add", post(add))
            .route("/api/v2/app/version", get(version))
            .route("/api/v2/torrents/info", get(info))
            .route("/api/v2/torrents/reannounce", record_post("torrents/reannounce"))
            .route("/api/v2/torrents/stop", record_post("torrents/stop"))
            .route("/api/v2/torrents/pause", record_post("torrents/pause"))
            .route("/api/v2/torrents/start", record_post("torrents/start"))
            .route("/api/v2/torrents/delete", record_post("torrents/delete"))
            .with_state(qb.clone());
        let base = crate::scraper::serve_for_test(router).await;
        (qb, base)
    }

    fn client_config(base: &str) -> ClientConfig {
        ClientConfig {
            url: format!("{}/", base),
            username: "admin".to_string(),
            password: "secret".to_string(),
            request_timeout_secs: 5,
            session_ttl_secs: 3600,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 40,
            },
            pause_excluded_categories: vec!["keep".to_string()],
            reannounce_wait_secs: 0,
        }
    }

    fn make_item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            title: "Show.S01E02".to_string(),
            link: format!("https://tracker.example/view/{}", id),
            download_url: format!("https://tracker.example/download/{}.torrent", id),
            published: Utc::now(),
        }
    }

    fn params() -> DispatchParams {
        DispatchParams {
            save_path: Some("/data/tv".to_string()),
            category: Some("tv".to_string()),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(StatusCode::OK, "x", "Ok.".into()), Ok("Ok.".to_string()));
        assert!(matches!(classify(StatusCode::FORBIDDEN, "x", String::new()), Err(Error::Auth(_))));
        assert!(matches!(classify(StatusCode::UNAUTHORIZED, "x", String::new()), Err(Error::Auth(_))));
        assert!(matches!(classify(StatusCode::BAD_GATEWAY, "x", String::new()), Err(Error::Transient(_))));
        assert!(matches!(
            classify(StatusCode::UNSUPPORTED_MEDIA_TYPE, "x", String::new()),
            Err(Error::Request(_))
        ));
    }

    #[test]
    fn test_session_debug_hides_cookie() {
        let session = Session::new("super-secret-sid".to_string(), 1, Duration::from_secs(60));
        let debug = format!("{:?}", session);
        assert!(!debug.contains("super-secret-sid"));
    }

    #[tokio::test]
    async fn test_submit_logs_in_and_adds() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();

        client.submit(&make_item("x1"), &params()).await.unwrap();

        assert_eq!(qb.logins.load(Ordering::SeqCst), 1);
        let added = qb.added.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0]["urls"], "https://tracker.example/download/x1.torrent");
        assert_eq!(added[0]["savepath"], "/data/tv");
        assert_eq!(added[0]["category"], "tv");
    }

    #[tokio::test]
    async fn test_session_is_reused_between_calls() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();

        client.submit(&make_item("x1"), &params()).await.unwrap();
        client.submit(&make_item("x2"), &params()).await.unwrap();

        assert_eq!(qb.logins.load(Ordering::SeqCst), 1);
        assert_eq!(client.login_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_session_reauthenticates_once() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();
        client.ensure_authenticated().await.unwrap();
        assert_eq!(qb.logins.load(Ordering::SeqCst), 1);

        qb.expire_session();
        client.submit(&make_item("x1"), &params()).await.unwrap();

        // exactly one re-auth and one accepted add
        assert_eq!(qb.logins.load(Ordering::SeqCst), 2);
        assert_eq!(qb.added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_surfaced() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();
        qb.always_forbid_add.store(true, Ordering::SeqCst);

        let err = client.submit(&make_item("x1"), &params()).await.unwrap_err();

        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(qb.logins.load(Ordering::SeqCst), 2);
        assert_eq!(qb.add_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bad_credentials_are_auth_errors() {
        let (qb, base) = start_mock().await;
        let mut config = client_config(&base);
        config.password = "wrong".to_string();
        let client = SessionClient::new(&config).unwrap();

        let err = client.ensure_authenticated().await.unwrap_err();

        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(qb.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_reauth_collapses_into_one_login() {
        let (qb, base) = start_mock().await;
        let client = Arc::new(SessionClient::new(&client_config(&base)).unwrap());
        client.ensure_authenticated().await.unwrap();
        qb.expire_session();

        let mut handles = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.submit(&make_item(&format!("x{}", i)), &params()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(qb.logins.load(Ordering::SeqCst), 2);
        assert_eq!(qb.added.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_adds_once() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();
        qb.add_failures
            .lock()
            .unwrap()
            .extend([StatusCode::INTERNAL_SERVER_ERROR, StatusCode::SERVICE_UNAVAILABLE]);

        client.submit(&make_item("x1"), &params()).await.unwrap();

        assert_eq!(qb.add_hits.load(Ordering::SeqCst), 3);
        assert_eq!(qb.added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_is_transient() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();
        qb.add_failures
            .lock()
            .unwrap()
            .extend([StatusCode::BAD_GATEWAY; 5]);

        let err = client.submit(&make_item("x1"), &params()).await.unwrap_err();

        assert!(matches!(err, Error::Transient(_)));
        assert_eq!(qb.add_hits.load(Ordering::SeqCst), 3);
        assert!(qb.added.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();
        qb.add_failures
            .lock()
            .unwrap()
            .push_back(StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let err = client.submit(&make_item("x1"), &params()).await.unwrap_err();

        assert!(matches!(err, Error::Request(_)));
        assert_eq!(qb.add_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_add_is_request_error() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();
        qb.reject_adds.store(true, Ordering::SeqCst);

        let err = client.submit(&make_item("x1"), &params()).await.unwrap_err();

        assert!(matches!(err, Error::Request(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let (qb, base) = start_mock().await;
        let mut config = client_config(&base);
        config.request_timeout_secs = 1;
        config.retry.max_attempts = 2;
        let client = SessionClient::new(&config).unwrap();
        client.ensure_authenticated().await.unwrap();
        qb.slow_adds.store(true, Ordering::SeqCst);

        let err = client.submit(&make_item("x1"), &params()).await.unwrap_err();

        assert!(matches!(err, Error::Transient(_)));
        assert_eq!(qb.add_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = SessionClient::new(&client_config(&format!("http://{}", addr))).unwrap();

        let err = client.ensure_authenticated().await.unwrap_err();

        assert!(matches!(err, Error::Transient(_)));
    }

    #[tokio::test]
    async fn test_app_version() {
        let (_qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();

        assert_eq!(client.app_version().await.unwrap(), "v4.6.2");
    }

    #[tokio::test]
    async fn test_pause_downloading_skips_excluded_categories() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();

        let paused = client.pause_downloading().await.unwrap();

        assert_eq!(paused, 1);
        assert_eq!(qb.posted_paths(), vec!["torrents/reannounce", "torrents/stop"]);
        let posted = qb.posted.lock().unwrap();
        assert_eq!(posted[1].1["hashes"], "aaa");
    }

    #[tokio::test]
    async fn test_pause_falls_back_to_legacy_endpoint() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();
        qb.stop_missing.store(true, Ordering::SeqCst);

        client.pause_downloading().await.unwrap();

        assert_eq!(qb.posted_paths(), vec!["torrents/reannounce", "torrents/pause"]);
    }

    #[tokio::test]
    async fn test_resume_paused() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();

        let resumed = client.resume_paused().await.unwrap();

        assert_eq!(resumed, 2);
        let posted = qb.posted.lock().unwrap();
        assert_eq!(posted[0].0, "torrents/start");
        assert_eq!(posted[0].1["hashes"], "ddd|eee");
    }

    #[tokio::test]
    async fn test_delete_all() {
        let (qb, base) = start_mock().await;
        let client = SessionClient::new(&client_config(&base)).unwrap();

        client.delete_all(true).await.unwrap();

        let posted = qb.posted.lock().unwrap();
        assert_eq!(posted[0].0, "torrents/delete");
        assert_eq!(posted[0].1["hashes"], "all");
        assert_eq!(posted[0].1["deleteFiles"], "true");
    }
}
