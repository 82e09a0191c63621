//! Browser-backed fetching for JS-heavy or bot-protected sites.
//!
//! One chromiumoxide session per [`Fetcher`](super::Fetcher), opened lazily
//! on first use so cookies from the first page load apply to subsequent
//! asset fetches. Binary and JSON fetches run as in-page JavaScript
//! `fetch()` calls (base64 transport), which keeps the browser's cookies
//! and session state attached to every request.

#[cfg(feature = "browser")]
use std::time::Duration;

#[cfg(feature = "browser")]
use base64::Engine;
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig, Page};
#[cfg(feature = "browser")]
use futures::StreamExt;
#[cfg(feature = "browser")]
use tracing::{debug, info, warn};

use super::{FetchError, FetchResult, FetcherConfig};

#[cfg(feature = "browser")]
use super::DEFAULT_USER_AGENT;

/// Markers of an interactive anti-bot challenge page.
#[cfg(feature = "browser")]
const CHALLENGE_MARKERS: &[&str] = &["Just a moment", "_cf_chl_opt", "challenge-platform"];

/// Hosts that keep loading content well after DOMContentLoaded.
#[cfg(feature = "browser")]
const JS_HEAVY_HOSTS: &[&str] = &["digitalcollections.nypl.org", "universalviewer.io"];

#[cfg(feature = "browser")]
const CHROME_PATHS: &[&str] = &[
    // Linux
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    // macOS
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    // Common install locations
    "/opt/google/chrome/google-chrome",
];

/// A live browser plus its CDP handler task.
#[cfg(feature = "browser")]
pub struct BrowserSession {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    human_bypass: bool,
}

#[cfg(feature = "browser")]
impl BrowserSession {
    /// Find a system Chrome/Chromium, or download one on first use.
    async fn find_or_install_chrome() -> FetchResult<std::path::PathBuf> {
        for path in CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                info!("found browser at {}", path);
                return Ok(p.to_path_buf());
            }
        }
        for cmd in &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        info!("found browser in PATH: {}", path);
                        return Ok(std::path::PathBuf::from(path));
                    }
                }
            }
        }

        // No system browser: download one (one-time)
        let cache = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("strigil")
            .join("browser");
        tokio::fs::create_dir_all(&cache)
            .await
            .map_err(|e| FetchError::Browser(format!("cannot create browser cache: {e}")))?;
        info!("no system browser found; downloading one to {:?}", cache);
        let fetcher = chromiumoxide::fetcher::BrowserFetcher::new(
            chromiumoxide::fetcher::BrowserFetcherOptions::builder()
                .with_path(&cache)
                .build()
                .map_err(|e| FetchError::Browser(format!("browser fetcher options: {e}")))?,
        );
        let installed = fetcher
            .fetch()
            .await
            .map_err(|e| FetchError::Browser(format!("browser download failed: {e}")))?;
        Ok(installed.executable_path)
    }

    /// Launch a browser with a desktop viewport. `headed` turns the window
    /// on; human-bypass mode requires it.
    pub async fn launch(config: &FetcherConfig) -> FetchResult<Self> {
        let headed = config.headed || config.human_bypass;
        let chrome = Self::find_or_install_chrome().await?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome)
            .window_size(1280, 720)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync");
        if headed {
            builder = builder.with_head();
        }
        let browser_config = builder
            .build()
            .map_err(|e| FetchError::Browser(format!("browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| FetchError::Browser(format!("launch failed: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            browser,
            handler_task,
            human_bypass: config.human_bypass,
        })
    }

    async fn new_page(&self, url: &str) -> FetchResult<Page> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| FetchError::Browser(format!("new page: {e}")))?;
        let _ = page
            .execute(SetUserAgentOverrideParams::new(
                DEFAULT_USER_AGENT.to_string(),
            ))
            .await;
        Ok(page)
    }

    async fn page_content(page: &Page) -> FetchResult<String> {
        page.content()
            .await
            .map_err(|e| FetchError::Browser(format!("page content: {e}")))
    }

    fn has_challenge_marker(html: &str) -> bool {
        CHALLENGE_MARKERS.iter().any(|m| html.contains(m))
    }

    /// Render a page and return its HTML. Waits for DOMContentLoaded (with
    /// a longer fallback on known JS-heavy hosts), then handles challenge
    /// pages: wait for automatic clearance, or pause for a human when
    /// human-bypass is on.
    pub async fn fetch_html(&mut self, url: &str, timeout: f64) -> FetchResult<String> {
        let page = self.new_page("about:blank").await?;
        let result = self.fetch_html_inner(&page, url, timeout).await;
        let _ = page.close().await;
        result
    }

    async fn fetch_html_inner(
        &self,
        page: &Page,
        url: &str,
        timeout: f64,
    ) -> FetchResult<String> {
        tokio::time::timeout(Duration::from_secs_f64(timeout), page.goto(url))
            .await
            .map_err(|_| FetchError::Browser(format!("navigation timeout for {url}")))?
            .map_err(|e| FetchError::Browser(format!("navigation failed: {e}")))?;

        // Wait for lazy-loaded content; longer for known JS-heavy sites
        let settle_ms: u64 = if JS_HEAVY_HOSTS.iter().any(|h| url.contains(h)) {
            15_000
        } else {
            4_000
        };
        let ready_script = format!(
            r#"
            new Promise((resolve) => {{
                if (document.readyState === 'complete' || document.readyState === 'interactive') {{
                    resolve(document.readyState);
                }} else {{
                    document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
                    setTimeout(() => resolve('timeout'), {settle_ms});
                }}
            }})
            "#
        );
        match tokio::time::timeout(
            Duration::from_millis(settle_ms + 1000),
            page.evaluate(ready_script),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("readiness check failed (non-HTML page?): {}", e),
            Err(_) => warn!("timed out waiting for page readiness on {}", url),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut html = Self::page_content(page).await?;
        if Self::has_challenge_marker(&html) {
            if self.human_bypass {
                eprintln!(
                    "\nChallenge page detected. Solve it in the browser window, \
                     then press Enter here to continue..."
                );
                let _ = tokio::task::spawn_blocking(|| {
                    let mut line = String::new();
                    let _ = std::io::stdin().read_line(&mut line);
                })
                .await;
                html = Self::page_content(page).await?;
            } else {
                // Give the challenge up to ~20 seconds to clear on its own
                for _ in 0..20 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    html = Self::page_content(page).await?;
                    if !Self::has_challenge_marker(&html) {
                        break;
                    }
                }
            }
        }

        Ok(html)
    }

    /// Fetch JSON bytes via an in-page `fetch()` from `context_url`, so
    /// same-origin cookies apply.
    pub async fn fetch_json_bytes(
        &mut self,
        url: &str,
        context_url: Option<&str>,
        timeout: f64,
    ) -> FetchResult<Vec<u8>> {
        let page = self.new_page(context_url.unwrap_or("about:blank")).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let result = self.evaluate_fetch(&page, url, "same-origin", timeout).await;
        let _ = page.close().await;
        result
    }

    /// Fetch a binary asset via in-page `fetch()`. The page context is the
    /// referer page, so the request carries its cookies and Referer.
    pub async fn fetch_binary(
        &mut self,
        url: &str,
        referer: Option<&str>,
        timeout: f64,
    ) -> FetchResult<Vec<u8>> {
        let page = self.new_page(referer.unwrap_or("about:blank")).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let result = self.evaluate_fetch(&page, url, "include", timeout).await;
        let _ = page.close().await;
        result
    }

    async fn evaluate_fetch(
        &self,
        page: &Page,
        url: &str,
        credentials: &str,
        timeout: f64,
    ) -> FetchResult<Vec<u8>> {
        let script = format!(
            r#"
            (async () => {{
                try {{
                    const response = await fetch('{url}', {{
                        method: 'GET',
                        credentials: '{credentials}'
                    }});
                    if (!response.ok) {{
                        return {{ status: response.status, error: 'HTTP ' + response.status }};
                    }}
                    const buffer = await response.arrayBuffer();
                    const bytes = new Uint8Array(buffer);
                    let binary = '';
                    for (let i = 0; i < bytes.length; i++) {{
                        binary += String.fromCharCode(bytes[i]);
                    }}
                    return {{ status: response.status, data: btoa(binary) }};
                }} catch (e) {{
                    return {{ error: e.toString() }};
                }}
            }})()
            "#
        );

        let evaluated = tokio::time::timeout(
            Duration::from_secs_f64(timeout),
            page.evaluate(script),
        )
        .await
        .map_err(|_| FetchError::Browser(format!("in-page fetch timeout for {url}")))?
        .map_err(|e| FetchError::Browser(format!("in-page fetch: {e}")))?;

        let value: serde_json::Value = evaluated
            .into_value()
            .map_err(|e| FetchError::Browser(format!("in-page fetch result: {e}")))?;

        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            if let Some(status) = value.get("status").and_then(|s| s.as_u64()) {
                return Err(FetchError::Status {
                    status: status as u16,
                    url: url.to_string(),
                });
            }
            return Err(FetchError::Browser(format!("in-page fetch failed: {error}")));
        }

        let data = value.get("data").and_then(|d| d.as_str()).unwrap_or("");
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| FetchError::Browser(format!("base64 decode: {e}")))
    }

    /// HEAD a URL from the page context; soft-fails like the HTTP path.
    pub async fn head_metadata(
        &mut self,
        url: &str,
        referer: Option<&str>,
        timeout: f64,
    ) -> FetchResult<(Option<String>, Option<u64>)> {
        let page = self.new_page(referer.unwrap_or("about:blank")).await?;
        let script = format!(
            r#"
            (async () => {{
                try {{
                    const response = await fetch('{url}', {{
                        method: 'HEAD',
                        credentials: 'include'
                    }});
                    return {{
                        status: response.status,
                        contentType: response.headers.get('content-type'),
                        contentLength: response.headers.get('content-length')
                    }};
                }} catch (e) {{
                    return {{ error: e.toString() }};
                }}
            }})()
            "#
        );
        let evaluated = tokio::time::timeout(
            Duration::from_secs_f64(timeout),
            page.evaluate(script),
        )
        .await;
        let _ = page.close().await;

        let evaluated = evaluated
            .map_err(|_| FetchError::Browser(format!("HEAD timeout for {url}")))?
            .map_err(|e| FetchError::Browser(format!("HEAD failed: {e}")))?;
        let value: serde_json::Value = evaluated
            .into_value()
            .map_err(|e| FetchError::Browser(format!("HEAD result: {e}")))?;

        if value.get("error").is_some() {
            return Ok((None, None));
        }
        let status = value.get("status").and_then(|s| s.as_u64()).unwrap_or(0) as u16;
        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }
        let content_type = value
            .get("contentType")
            .and_then(|c| c.as_str())
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_lowercase())
            .filter(|ct| !ct.is_empty());
        let content_length = value
            .get("contentLength")
            .and_then(|c| c.as_str())
            .and_then(|c| c.parse::<u64>().ok());
        Ok((content_type, content_length))
    }

    /// Stop the browser and its handler task, swallowing teardown errors.
    pub async fn close(&mut self) {
        let _ = self.browser.close().await;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
    }
}

// Stub for builds without the browser feature.
#[cfg(not(feature = "browser"))]
pub struct BrowserSession;

#[cfg(not(feature = "browser"))]
impl BrowserSession {
    fn unsupported<T>() -> FetchResult<T> {
        Err(FetchError::Browser(
            "browser support not compiled; rebuild with --features browser".to_string(),
        ))
    }

    pub async fn launch(_config: &FetcherConfig) -> FetchResult<Self> {
        Self::unsupported()
    }

    pub async fn fetch_html(&mut self, _url: &str, _timeout: f64) -> FetchResult<String> {
        Self::unsupported()
    }

    pub async fn fetch_json_bytes(
        &mut self,
        _url: &str,
        _context_url: Option<&str>,
        _timeout: f64,
    ) -> FetchResult<Vec<u8>> {
        Self::unsupported()
    }

    pub async fn fetch_binary(
        &mut self,
        _url: &str,
        _referer: Option<&str>,
        _timeout: f64,
    ) -> FetchResult<Vec<u8>> {
        Self::unsupported()
    }

    pub async fn head_metadata(
        &mut self,
        _url: &str,
        _referer: Option<&str>,
        _timeout: f64,
    ) -> FetchResult<(Option<String>, Option<u64>)> {
        Self::unsupported()
    }

    pub async fn close(&mut self) {}
}

#[cfg(all(test, feature = "browser"))]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_markers() {
        assert!(BrowserSession::has_challenge_marker(
            "<title>Just a moment...</title>"
        ));
        assert!(BrowserSession::has_challenge_marker(
            "window._cf_chl_opt = {}"
        ));
        assert!(!BrowserSession::has_challenge_marker("<p>hello</p>"));
    }
}
