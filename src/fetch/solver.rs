//! Challenge-solver proxy client.
//!
//! The proxy runs a headless browser that clears interactive anti-bot
//! challenges and returns the solved HTML. Protocol: POST a JSON envelope
//! `{cmd: "request.get", url, maxTimeout}` to `{base}/v1`; a response with
//! `status == "ok"` carries the page in `solution.response`.

use std::time::Duration;

use serde_json::json;

use super::{FetchError, FetchResult};

/// Default proxy endpoint when none is configured.
pub const DEFAULT_SOLVER_URL: &str = "http://localhost:8191";

/// Environment variable holding the proxy base URL.
pub const SOLVER_URL_ENV: &str = "FLARESOLVERR_URL";

/// Proxy base URL from the environment, if set and non-empty.
pub fn solver_url_from_env() -> Option<String> {
    std::env::var(SOLVER_URL_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Fetch a page through the solver proxy; returns the solved HTML bytes.
pub async fn fetch_html(
    client: &reqwest::Client,
    base_url: &str,
    url: &str,
    timeout_ms: u64,
) -> FetchResult<Vec<u8>> {
    let api_url = format!("{}/v1", base_url.trim_end_matches('/'));
    let payload = json!({
        "cmd": "request.get",
        "url": url,
        "maxTimeout": timeout_ms,
    });

    let response = client
        .post(&api_url)
        .json(&payload)
        .timeout(Duration::from_millis(timeout_ms + 30_000))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(FetchError::Solver(format!(
            "proxy returned HTTP {}",
            response.status()
        )));
    }

    let data: serde_json::Value = response
        .json()
        .await
        .map_err(|e| FetchError::Solver(format!("unparseable proxy response: {e}")))?;

    if data.get("status").and_then(|s| s.as_str()) != Some("ok") {
        let message = data
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown solver error");
        return Err(FetchError::Solver(message.to_string()));
    }

    let html = data
        .get("solution")
        .and_then(|s| s.get("response"))
        .and_then(|r| r.as_str())
        .ok_or_else(|| FetchError::Solver("no response body in solution".to_string()))?;

    Ok(html.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solver_url_from_env() {
        // Serialize env mutation within the test
        std::env::remove_var(SOLVER_URL_ENV);
        assert_eq!(solver_url_from_env(), None);
        std::env::set_var(SOLVER_URL_ENV, "  ");
        assert_eq!(solver_url_from_env(), None);
        std::env::set_var(SOLVER_URL_ENV, "http://solver:8191");
        assert_eq!(solver_url_from_env(), Some("http://solver:8191".to_string()));
        std::env::remove_var(SOLVER_URL_ENV);
    }
}
