//! HTTP fetching with retries, streaming downloads, and politeness.
//!
//! A [`Fetcher`] is single-owner: it holds one connection pool, the sticky
//! page referer, and the adaptive rate-limit floor. For fan-out across
//! workers, [`Fetcher::spawn`] produces a sibling with identical
//! configuration and its own pool. The backend (plain HTTP, browser, or
//! challenge-solver proxy) is a mode tag; the public surface is the same
//! for all three.

pub mod browser;
pub mod solver;

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use browser::BrowserSession;

/// Browser-class UA; reduces 403s from sites that block obvious scrapers.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36";

pub const DEFAULT_TIMEOUT: f64 = 30.0;
/// Per-attempt timeouts scale up to this ceiling.
pub const MAX_TIMEOUT: f64 = 120.0;

const MAX_RETRIES: u32 = 3;
/// 502/503/504 get more retries; the server often recovers after a short wait.
const MAX_RETRIES_5XX: u32 = 6;
/// Multiplicative factor for retry waits and timeout scaling.
const RETRY_BACKOFF: f64 = 2.0;
/// Base wait before retrying a 5xx.
const BASE_WAIT_5XX: f64 = 5.0;
/// Minimum wait after a 429.
const MIN_WAIT_429: f64 = 30.0;
/// Default decay applied to the rate floor after each successful HTML fetch.
pub const DEFAULT_RATE_DECAY: f64 = 0.9;

/// Phrases indicating a rate-limit page delivered with a 2xx status.
const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "too many requests",
    "throttl",
    "slow down",
    "try again",
];
const RATE_LIMIT_BODY_MAX_LEN: usize = 50_000;

/// Statuses worth retrying.
const RETRYABLE_STATUSES: &[u16] = &[403, 429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("browser backend: {0}")]
    Browser(String),
    #[error("challenge solver: {0}")]
    Solver(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            FetchError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_403(&self) -> bool {
        self.status() == Some(403)
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// Which transport the fetcher uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FetchBackend {
    #[default]
    Http,
    /// Render pages in a real browser (chromiumoxide).
    Browser,
    /// Route HTML fetches through a challenge-solver proxy at this base URL.
    Solver(String),
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: f64,
    pub backend: FetchBackend,
    /// Run the browser visibly.
    pub headed: bool,
    /// Pause for a human to clear a challenge in the visible browser.
    pub human_bypass: bool,
    /// Multiplier applied to the rate floor after successful HTML fetches.
    pub rate_decay: f64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            backend: FetchBackend::Http,
            headed: false,
            human_bypass: false,
            rate_decay: DEFAULT_RATE_DECAY,
        }
    }
}

/// Parse a Retry-After header value: integer seconds or an HTTP-date.
fn parse_retry_after(value: Option<&str>) -> Option<f64> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
        return value.parse::<f64>().ok();
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let diff = (when.with_timezone(&chrono::Utc) - chrono::Utc::now()).num_milliseconds() as f64
        / 1000.0;
    if diff > 0.0 {
        Some(diff.max(1.0))
    } else {
        None
    }
}

/// True if a small 2xx body reads like a throttle message.
fn body_indicates_rate_limit(content: &[u8]) -> bool {
    if content.is_empty() || content.len() > RATE_LIMIT_BODY_MAX_LEN {
        return false;
    }
    let lower = String::from_utf8_lossy(content).to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p))
}

/// Alternate IIIF Image API size to try on 501 Not Implemented.
fn iiif_alternate_url(url: &str) -> Option<String> {
    if url.contains("/full/full/") {
        return Some(url.replacen("/full/full/", "/full/max/", 1));
    }
    if url.contains("/full/max/") {
        return Some(url.replacen("/full/max/", "/full/full/", 1));
    }
    None
}

fn is_retryable_5xx(code: u16) -> bool {
    matches!(code, 500 | 502 | 503 | 504)
}

/// Seconds to wait before a retry. Retry-After wins; 5xx waits start high.
fn wait_for_retry(code: Option<u16>, attempt: u32, retry_after: Option<&str>) -> f64 {
    if let Some(seconds) = parse_retry_after(retry_after) {
        return seconds;
    }
    match code {
        Some(c) if is_retryable_5xx(c) => BASE_WAIT_5XX * RETRY_BACKOFF.powi(attempt as i32),
        _ => RETRY_BACKOFF.powi(attempt as i32),
    }
}

/// Jittered sleep duration: ±15% plus a small random offset so concurrent
/// workers never fall into a fixed-interval pattern.
fn jittered_seconds(delay: f64) -> f64 {
    let mut rng = rand::rng();
    let jittered = if delay > 0.0 {
        delay * rng.random_range(0.85..1.15)
    } else {
        0.0
    };
    let extra_cap = if delay < 0.5 { 0.02 } else { 0.05 };
    jittered + rng.random_range(0.0..extra_cap)
}

async fn polite_sleep(delay: f64) {
    let total = jittered_seconds(delay);
    if total > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(total)).await;
    }
}

/// Charset from a Content-Type header value, defaulting to utf-8.
fn charset_from_content_type(content_type: Option<&str>) -> String {
    content_type
        .and_then(|ct| {
            ct.split(';').find_map(|part| {
                part.trim()
                    .strip_prefix("charset=")
                    .map(|c| c.trim_matches('"').to_lowercase())
            })
        })
        .unwrap_or_else(|| "utf-8".to_string())
}

fn attempt_timeout(base: f64, attempt: u32) -> f64 {
    (base * RETRY_BACKOFF.powi(attempt as i32)).min(MAX_TIMEOUT)
}

/// HTTP fetcher with connection reuse and adaptive politeness.
pub struct Fetcher {
    config: FetcherConfig,
    client: reqwest::Client,
    browser: Option<BrowserSession>,
    /// URL of the last HTML fetch; sent as Referer on asset requests.
    page_url: Option<String>,
    /// Politeness floor in seconds; raised on throttle signals.
    rate_limit_delay: f64,
}

impl Fetcher {
    pub fn new(config: FetcherConfig) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .default_headers(headers)
            .cookie_store(true)
            .build()
            .expect("failed to build HTTP client");

        Self {
            config,
            client,
            browser: None,
            page_url: None,
            rate_limit_delay: 0.0,
        }
    }

    /// A sibling fetcher with identical configuration and its own
    /// connection pool, for use by another worker.
    pub fn spawn(&self) -> Fetcher {
        Fetcher::new(self.config.clone())
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    pub fn is_browser(&self) -> bool {
        self.config.backend == FetchBackend::Browser
    }

    pub fn is_solver(&self) -> bool {
        matches!(self.config.backend, FetchBackend::Solver(_))
    }

    /// Current politeness floor in seconds.
    pub fn rate_floor(&self) -> f64 {
        self.rate_limit_delay
    }

    /// Raise the politeness floor; it only ever moves up until decay.
    fn note_rate_limit(&mut self, wait: f64) {
        self.rate_limit_delay = self.rate_limit_delay.max(wait);
    }

    /// Sleep at least `delay`, more while in rate-limit backoff.
    async fn sleep_politely(&self, delay: f64) {
        polite_sleep(delay.max(self.rate_limit_delay)).await;
    }

    async fn browser_session(&mut self) -> FetchResult<&mut BrowserSession> {
        if self.browser.is_none() {
            self.browser = Some(BrowserSession::launch(&self.config).await?);
        }
        Ok(self.browser.as_mut().expect("session just created"))
    }

    /// Tear down any browser state. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.browser.take() {
            session.close().await;
        }
    }

    /// Fetch a page; returns `(raw_bytes, charset)`.
    pub async fn fetch_html(&mut self, url: &str, delay: f64) -> FetchResult<(Vec<u8>, String)> {
        match self.config.backend.clone() {
            FetchBackend::Solver(base) => {
                self.sleep_politely(delay).await;
                self.page_url = Some(url.to_string());
                let timeout_ms = (self.config.timeout.min(MAX_TIMEOUT) * 1000.0) as u64;
                let html = solver::fetch_html(&self.client, &base, url, timeout_ms).await?;
                Ok((html, "utf-8".to_string()))
            }
            FetchBackend::Browser => {
                self.sleep_politely(delay).await;
                self.page_url = Some(url.to_string());
                let base_timeout = self.config.timeout;
                let session = self.browser_session().await?;
                let mut last_err = None;
                for attempt in 0..MAX_RETRIES {
                    let timeout = attempt_timeout(base_timeout, attempt);
                    match session.fetch_html(url, timeout).await {
                        Ok(html) => return Ok((html.into_bytes(), "utf-8".to_string())),
                        Err(e) => {
                            last_err = Some(e);
                            if attempt < MAX_RETRIES - 1 {
                                polite_sleep(RETRY_BACKOFF.powi(attempt as i32)).await;
                            }
                        }
                    }
                }
                Err(last_err.expect("at least one attempt"))
            }
            FetchBackend::Http => {
                self.sleep_politely(delay).await;
                self.fetch_html_http(url).await
            }
        }
    }

    async fn fetch_html_http(&mut self, url: &str) -> FetchResult<(Vec<u8>, String)> {
        let mut last_err: Option<FetchError> = None;
        for attempt in 0..MAX_RETRIES_5XX {
            let timeout = attempt_timeout(self.config.timeout, attempt);
            let response = self
                .client
                .get(url)
                .timeout(Duration::from_secs_f64(timeout))
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    // Connect/read errors: default ladder
                    if attempt < MAX_RETRIES - 1 {
                        debug!("request error for {} (attempt {}): {}", url, attempt + 1, e);
                        polite_sleep(RETRY_BACKOFF.powi(attempt as i32)).await;
                        last_err = Some(e.into());
                        continue;
                    }
                    return Err(e.into());
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let max_attempts = if is_retryable_5xx(status) {
                    MAX_RETRIES_5XX
                } else {
                    MAX_RETRIES
                };
                if RETRYABLE_STATUSES.contains(&status) && attempt < max_attempts - 1 {
                    let mut wait = wait_for_retry(Some(status), attempt, retry_after.as_deref());
                    if status == 429 {
                        wait = wait.max(MIN_WAIT_429);
                        warn!("rate limit (429) on {}; waiting {:.0}s then retrying", url, wait);
                    } else if status == 502 {
                        warn!("502 Bad Gateway on {}; waiting {:.0}s then retrying", url, wait);
                    }
                    self.note_rate_limit(wait);
                    polite_sleep(wait).await;
                    last_err = Some(FetchError::Status {
                        status,
                        url: url.to_string(),
                    });
                    continue;
                }
                return Err(FetchError::Status {
                    status,
                    url: url.to_string(),
                });
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let body = response.bytes().await?;

            // Some sites return 200 with a throttle message in the body
            if body_indicates_rate_limit(&body) {
                let wait = parse_retry_after(retry_after.as_deref()).unwrap_or(60.0);
                self.note_rate_limit(wait);
                if attempt < MAX_RETRIES_5XX - 1 {
                    warn!("rate limit page from {}; waiting {:.0}s then retrying", url, wait);
                    polite_sleep(wait).await;
                    last_err = Some(FetchError::Status {
                        status: 429,
                        url: url.to_string(),
                    });
                    continue;
                }
            }

            // Decay the floor after a clean HTML fetch
            self.rate_limit_delay = (self.rate_limit_delay * self.config.rate_decay).max(0.0);
            self.page_url = Some(url.to_string());
            let charset = charset_from_content_type(content_type.as_deref());
            return Ok((body.to_vec(), charset));
        }
        Err(last_err.unwrap_or(FetchError::Status {
            status: 0,
            url: url.to_string(),
        }))
    }

    /// Fetch raw bytes, used for IIIF manifest JSON. In browser mode, JSON
    /// URLs go through an in-page `fetch()` from the last page so
    /// same-origin cookies apply (interstitial bot protection).
    pub async fn fetch_bytes(&mut self, url: &str, delay: f64) -> FetchResult<Vec<u8>> {
        self.sleep_politely(delay).await;

        let json_like =
            url.contains("manifest.json") || url.trim_end_matches('/').ends_with(".json");
        if self.is_browser() && json_like {
            let context = self.page_url.clone();
            let timeout = self.config.timeout.min(MAX_TIMEOUT);
            let session = self.browser_session().await?;
            let bytes = session
                .fetch_json_bytes(url, context.as_deref(), timeout)
                .await?;
            if !bytes.is_empty() {
                return Ok(bytes);
            }
        }

        let timeout = self.config.timeout.min(MAX_TIMEOUT);
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs_f64(timeout))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn stream_to_file(
        response: reqwest::Response,
        dest: &Path,
    ) -> FetchResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = dest.with_file_name(format!(
            "{}.part",
            dest.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string())
        ));
        let mut file = tokio::fs::File::create(&part).await?;
        let mut response = response;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => file.write_all(&chunk).await?,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(e.into());
                }
            }
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        Ok(())
    }

    async fn write_bytes_to_file(dest: &Path, bytes: &[u8]) -> FetchResult<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = dest.with_file_name(format!(
            "{}.part",
            dest.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string())
        ));
        tokio::fs::write(&part, bytes).await?;
        tokio::fs::rename(&part, dest).await?;
        Ok(())
    }

    /// Stream a download to `dest` (written to a temporary `.part` path,
    /// renamed on success). Parent directories are created.
    pub async fn fetch_binary(
        &mut self,
        url: &str,
        dest: &Path,
        timeout: f64,
        delay: f64,
    ) -> FetchResult<()> {
        self.sleep_politely(delay).await;

        if self.is_browser() {
            return self.fetch_binary_browser(url, dest, timeout).await;
        }

        let referer = self.page_url.clone();
        let mut last_err: Option<FetchError> = None;
        for attempt in 0..MAX_RETRIES_5XX {
            let t = attempt_timeout(timeout, attempt);
            let mut request = self
                .client
                .get(url)
                .timeout(Duration::from_secs_f64(t));
            if let Some(ref referer) = referer {
                request = request.header(REFERER, referer.as_str());
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt < MAX_RETRIES - 1 {
                        polite_sleep(RETRY_BACKOFF.powi(attempt as i32)).await;
                        last_err = Some(e.into());
                        continue;
                    }
                    return Err(e.into());
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                match Self::stream_to_file(response, dest).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        // Interrupted body: retry within the default ladder
                        if attempt < MAX_RETRIES - 1 {
                            polite_sleep(RETRY_BACKOFF.powi(attempt as i32)).await;
                            last_err = Some(e);
                            continue;
                        }
                        return Err(e);
                    }
                }
            }

            // IIIF endpoints answer 501 for unsupported size keywords
            if status == 501 {
                if let Some(alt) = iiif_alternate_url(url) {
                    let mut alt_request = self
                        .client
                        .get(&alt)
                        .timeout(Duration::from_secs_f64(t));
                    if let Some(ref referer) = referer {
                        alt_request = alt_request.header(REFERER, referer.as_str());
                    }
                    if let Ok(alt_response) = alt_request.send().await {
                        if alt_response.status().is_success() {
                            return Self::stream_to_file(alt_response, dest).await;
                        }
                    }
                }
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let max_attempts = if is_retryable_5xx(status) {
                MAX_RETRIES_5XX
            } else {
                MAX_RETRIES
            };
            if RETRYABLE_STATUSES.contains(&status) && attempt < max_attempts - 1 {
                let mut wait = wait_for_retry(Some(status), attempt, retry_after.as_deref());
                if status == 429 {
                    wait = wait.max(MIN_WAIT_429);
                    warn!("rate limit (429) on {}; waiting {:.0}s then retrying", url, wait);
                } else if status == 502 {
                    warn!("502 Bad Gateway on {}; waiting {:.0}s then retrying", url, wait);
                }
                self.note_rate_limit(wait);
                polite_sleep(wait).await;
                last_err = Some(FetchError::Status {
                    status,
                    url: url.to_string(),
                });
                continue;
            }
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }
        Err(last_err.unwrap_or(FetchError::Status {
            status: 0,
            url: url.to_string(),
        }))
    }

    async fn fetch_binary_browser(
        &mut self,
        url: &str,
        dest: &Path,
        timeout: f64,
    ) -> FetchResult<()> {
        let referer = self.page_url.clone();
        let session = self.browser_session().await?;
        let mut last_err: Option<FetchError> = None;
        for attempt in 0..MAX_RETRIES_5XX {
            let t = attempt_timeout(timeout, attempt);
            match session.fetch_binary(url, referer.as_deref(), t).await {
                Ok(bytes) => return Self::write_bytes_to_file(dest, &bytes).await,
                Err(e) => {
                    let status = e.status();
                    if status == Some(501) {
                        if let Some(alt) = iiif_alternate_url(url) {
                            if let Ok(bytes) =
                                session.fetch_binary(&alt, referer.as_deref(), t).await
                            {
                                return Self::write_bytes_to_file(dest, &bytes).await;
                            }
                        }
                        return Err(e);
                    }
                    let retryable = match status {
                        Some(s) if is_retryable_5xx(s) => attempt < MAX_RETRIES_5XX - 1,
                        Some(403) => attempt < MAX_RETRIES - 1,
                        _ => false,
                    };
                    if retryable {
                        let wait = wait_for_retry(status, attempt, None);
                        polite_sleep(wait).await;
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Err(last_err.unwrap_or(FetchError::Status {
            status: 0,
            url: url.to_string(),
        }))
    }

    /// HEAD a URL; returns `(content_type, content_length)`. Failures are
    /// soft: both fields come back `None`.
    pub async fn head_metadata(
        &mut self,
        url: &str,
        timeout: f64,
        delay: f64,
    ) -> (Option<String>, Option<u64>) {
        self.sleep_politely(delay).await;
        let t = timeout.min(MAX_TIMEOUT);

        if self.is_browser() {
            let referer = self.page_url.clone();
            let session = match self.browser_session().await {
                Ok(s) => s,
                Err(_) => return (None, None),
            };
            match session.head_metadata(url, referer.as_deref(), t).await {
                Ok(meta) => return meta,
                Err(e) if e.status() == Some(501) => {
                    if let Some(alt) = iiif_alternate_url(url) {
                        if let Ok(meta) = session.head_metadata(&alt, referer.as_deref(), t).await {
                            return meta;
                        }
                    }
                    return (None, None);
                }
                Err(_) => return (None, None),
            }
        }

        match self.head_once(url, t).await {
            Ok(meta) => meta,
            Err(e) if e.status() == Some(501) => {
                if let Some(alt) = iiif_alternate_url(url) {
                    self.head_once(&alt, t).await.unwrap_or((None, None))
                } else {
                    (None, None)
                }
            }
            Err(_) => (None, None),
        }
    }

    async fn head_once(
        &self,
        url: &str,
        timeout: f64,
    ) -> FetchResult<(Option<String>, Option<u64>)> {
        let mut request = self
            .client
            .head(url)
            .timeout(Duration::from_secs_f64(timeout));
        if let Some(ref referer) = self.page_url {
            request = request.header(REFERER, referer.as_str());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| {
                ct.split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_lowercase()
            })
            .filter(|ct| !ct.is_empty());
        let content_length = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Ok((content_type, content_length))
    }
}
