//! Advisory robots.txt gate with a per-host cache.
//!
//! The first consult for a `(scheme, host)` pair fetches `/robots.txt`;
//! fetch failures install an allow-all sentinel. The cache is never evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// User agent token checked against robots.txt rules.
pub const ROBOTS_USER_AGENT: &str = "strigil/0.4 (+https://github.com/strigil/strigil)";

const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached robots.txt bodies keyed by `(scheme, host)`. `None` means the
/// fetch failed and the host is treated as allow-all.
type RobotsCache = HashMap<(String, String), Option<String>>;

/// Cheap-clone handle over the shared robots cache.
#[derive(Clone)]
pub struct RobotsGate {
    client: reqwest::Client,
    cache: Arc<RwLock<RobotsCache>>,
}

impl Default for RobotsGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RobotsGate {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(ROBOTS_USER_AGENT)
            .timeout(ROBOTS_FETCH_TIMEOUT)
            .build()
            .expect("failed to build robots client");
        Self {
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn cache_key(url: &Url) -> (String, String) {
        let scheme = if url.scheme().is_empty() {
            "https".to_string()
        } else {
            url.scheme().to_string()
        };
        let host = url.host_str().unwrap_or_default().to_string();
        (scheme, host)
    }

    async fn robots_body(&self, url: &Url) -> Option<String> {
        let key = Self::cache_key(url);
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                return entry.clone();
            }
        }

        let robots_url = format!("{}://{}/robots.txt", key.0, key.1);
        let fetched = match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
            Ok(resp) => {
                debug!("robots.txt for {} returned {}", key.1, resp.status());
                None
            }
            Err(e) => {
                debug!("robots.txt fetch failed for {}: {}", key.1, e);
                None
            }
        };

        let mut cache = self.cache.write().await;
        cache.entry(key).or_insert(fetched).clone()
    }

    /// Check whether robots.txt allows fetching the URL. Fetch failures and
    /// unparseable URLs allow by default.
    pub async fn can_fetch(&self, url: &str, user_agent: &str) -> bool {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(_) => return true,
        };
        if parsed.host_str().is_none() {
            return true;
        }
        let body = match self.robots_body(&parsed).await {
            Some(body) => body,
            None => return true,
        };
        if body.trim().is_empty() {
            return true;
        }
        let mut matcher = robotstxt::DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&body, user_agent, url)
    }

    /// Number of cached hosts (for tests and stats).
    pub async fn cached_hosts(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Seed the cache directly, bypassing the network.
    #[cfg(test)]
    pub(crate) async fn preload(&self, scheme: &str, host: &str, body: Option<String>) {
        let mut cache = self.cache.write().await;
        cache.insert((scheme.to_string(), host.to_string()), body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allows_when_no_robots() {
        let gate = RobotsGate::new();
        gate.preload("https", "example.com", None).await;
        assert!(
            gate.can_fetch("https://example.com/anything", ROBOTS_USER_AGENT)
                .await
        );
    }

    #[tokio::test]
    async fn test_disallow_rule_applies() {
        let gate = RobotsGate::new();
        let body = "User-agent: *\nDisallow: /private/\n";
        gate.preload("https", "example.com", Some(body.to_string()))
            .await;
        assert!(
            !gate
                .can_fetch("https://example.com/private/x.html", ROBOTS_USER_AGENT)
                .await
        );
        assert!(
            gate.can_fetch("https://example.com/public/x.html", ROBOTS_USER_AGENT)
                .await
        );
    }

    #[tokio::test]
    async fn test_empty_body_allows() {
        let gate = RobotsGate::new();
        gate.preload("https", "example.com", Some(String::new()))
            .await;
        assert!(
            gate.can_fetch("https://example.com/x", ROBOTS_USER_AGENT)
                .await
        );
    }

    #[tokio::test]
    async fn test_invalid_url_allows() {
        let gate = RobotsGate::new();
        assert!(gate.can_fetch("not a url", ROBOTS_USER_AGENT).await);
    }

    #[tokio::test]
    async fn test_sentinel_installed_once() {
        let gate = RobotsGate::new();
        gate.preload("https", "example.com", None).await;
        gate.can_fetch("https://example.com/a", ROBOTS_USER_AGENT)
            .await;
        gate.can_fetch("https://example.com/b", ROBOTS_USER_AGENT)
            .await;
        assert_eq!(gate.cached_hosts().await, 1);
    }
}
