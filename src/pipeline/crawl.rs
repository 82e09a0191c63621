//! Crawl controllers: a sequential BFS walker and a parallel worker pool
//! over a shared page frontier.
//!
//! Both modes guard page identity with a visit set and serialize per-host
//! manifest access. The parallel pool terminates through a pending counter:
//! the transition to zero emits exactly one shutdown sentinel per worker.
//! Lock order is visit → pending → manifest; no lock is held across a
//! network call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};
use url::Url;

use super::{scrape_page, PageOptions, SAFE_ASSET_WORKERS};
use crate::fetch::Fetcher;
use crate::robots::{RobotsGate, ROBOTS_USER_AGENT};
use crate::storage::{load_manifest, manifest_path, sanitize_host};

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub max_depth: u32,
    pub same_domain_only: bool,
    pub workers: usize,
    pub ignore_robots: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_depth: 2,
            same_domain_only: false,
            workers: 1,
            ignore_robots: false,
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

fn domain_allows(same_domain_only: bool, start_host: &str, url: &str) -> bool {
    if !same_domain_only {
        return true;
    }
    host_of(url).as_deref() == Some(start_host)
}

/// Sequential crawl: FIFO frontier, one page at a time, one fetcher.
pub async fn crawl_sequential(
    seed: &str,
    fetcher: &mut Fetcher,
    robots: &RobotsGate,
    page_opts: &PageOptions,
    crawl_opts: &CrawlOptions,
) -> HashSet<String> {
    let start_host = host_of(seed).unwrap_or_default();
    let link_filter = crawl_opts.same_domain_only.then(|| start_host.clone());

    let mut frontier: VecDeque<(String, u32)> = VecDeque::from([(seed.to_string(), 0)]);
    let mut visited: HashSet<String> = HashSet::new();

    info!("crawl started (max depth {})", crawl_opts.max_depth);

    while let Some((url, depth)) = frontier.pop_front() {
        if visited.contains(&url) || depth > crawl_opts.max_depth {
            continue;
        }
        if !domain_allows(crawl_opts.same_domain_only, &start_host, &url) {
            continue;
        }
        if !crawl_opts.ignore_robots && !robots.can_fetch(&url, ROBOTS_USER_AGENT).await {
            info!("skip (robots): {}", url);
            continue;
        }
        visited.insert(url.clone());
        info!("[{}] {}", depth, url);

        let host = sanitize_host(&url);
        let mut manifest = load_manifest(&manifest_path(&page_opts.out_dir, &host));
        let links = match scrape_page(
            &url,
            fetcher,
            &mut manifest,
            page_opts,
            true,
            link_filter.as_deref(),
            1,
            None,
        )
        .await
        {
            Ok(links) => links,
            Err(e) => {
                warn!("error on {}: {}", url, e);
                continue;
            }
        };

        for link in links {
            if !visited.contains(&link)
                && domain_allows(crawl_opts.same_domain_only, &start_host, &link)
            {
                frontier.push_back((link, depth + 1));
            }
        }
    }

    visited
}

enum QueueItem {
    Page(String, u32),
    Shutdown,
}

struct CrawlState {
    visited: StdMutex<HashSet<String>>,
    pending: StdMutex<usize>,
    manifest_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    tx: mpsc::UnboundedSender<QueueItem>,
    workers: usize,
}

impl CrawlState {
    /// Mark a URL dispatched. Test-and-set under the visit lock.
    fn try_visit(&self, url: &str) -> bool {
        self.visited
            .lock()
            .expect("visit set poisoned")
            .insert(url.to_string())
    }

    fn already_visited(&self, url: &str) -> bool {
        self.visited
            .lock()
            .expect("visit set poisoned")
            .contains(url)
    }

    /// Enqueue a page, incrementing pending before it becomes visible.
    fn enqueue(&self, url: String, depth: u32) {
        {
            let mut pending = self.pending.lock().expect("pending counter poisoned");
            *pending += 1;
        }
        let _ = self.tx.send(QueueItem::Page(url, depth));
    }

    /// Retire one in-flight item. The transition to zero is the sole
    /// termination signal: it emits one sentinel per worker.
    fn finish_one(&self) {
        let reached_zero = {
            let mut pending = self.pending.lock().expect("pending counter poisoned");
            *pending -= 1;
            *pending == 0
        };
        if reached_zero {
            for _ in 0..self.workers {
                let _ = self.tx.send(QueueItem::Shutdown);
            }
        }
    }

    fn manifest_lock(&self, host: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.manifest_locks.lock().expect("manifest lock map poisoned");
        locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[allow(clippy::too_many_arguments)]
async fn parallel_worker(
    state: Arc<CrawlState>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<QueueItem>>>,
    mut fetcher: Fetcher,
    robots: RobotsGate,
    page_opts: PageOptions,
    crawl_opts: CrawlOptions,
    start_host: String,
    link_filter: Option<String>,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let (url, depth) = match item {
            None | Some(QueueItem::Shutdown) => break,
            Some(QueueItem::Page(url, depth)) => (url, depth),
        };

        if depth > crawl_opts.max_depth {
            state.finish_one();
            continue;
        }
        if !state.try_visit(&url) {
            state.finish_one();
            continue;
        }
        if !crawl_opts.ignore_robots && !robots.can_fetch(&url, ROBOTS_USER_AGENT).await {
            info!("skip (robots): {}", url);
            state.finish_one();
            continue;
        }

        info!("[{}] {}", depth, url);
        let host = sanitize_host(&url);
        let manifest_lock = state.manifest_lock(&host);
        let links = {
            let _guard = manifest_lock.lock().await;
            let mut manifest = load_manifest(&manifest_path(&page_opts.out_dir, &host));
            match scrape_page(
                &url,
                &mut fetcher,
                &mut manifest,
                &page_opts,
                true,
                link_filter.as_deref(),
                SAFE_ASSET_WORKERS.min(crawl_opts.workers).max(1),
                None,
            )
            .await
            {
                Ok(links) => links,
                Err(e) => {
                    warn!("error on {}: {}", url, e);
                    Vec::new()
                }
            }
        };

        // New work becomes pending before this page retires, so the
        // counter can never hit zero while links are still in hand.
        for link in links {
            if !domain_allows(crawl_opts.same_domain_only, &start_host, &link) {
                continue;
            }
            if state.already_visited(&link) {
                continue;
            }
            state.enqueue(link, depth + 1);
        }
        state.finish_one();
    }

    fetcher.close().await;
}

/// Parallel crawl: a shared frontier drained by `workers` tasks, each with
/// its own fetcher spawned from `template`.
pub async fn crawl_parallel(
    seed: &str,
    template: &Fetcher,
    robots: &RobotsGate,
    page_opts: &PageOptions,
    crawl_opts: &CrawlOptions,
) -> HashSet<String> {
    let start_host = host_of(seed).unwrap_or_default();
    let link_filter = crawl_opts.same_domain_only.then(|| start_host.clone());
    let workers = crawl_opts.workers.max(1);

    info!(
        "crawl started (max depth {}, {} workers)",
        crawl_opts.max_depth, workers
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(CrawlState {
        visited: StdMutex::new(HashSet::new()),
        pending: StdMutex::new(0),
        manifest_locks: StdMutex::new(HashMap::new()),
        tx,
        workers,
    });
    let rx = Arc::new(AsyncMutex::new(rx));

    state.enqueue(seed.to_string(), 0);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        handles.push(tokio::spawn(parallel_worker(
            state.clone(),
            rx.clone(),
            template.spawn(),
            robots.clone(),
            page_opts.clone(),
            crawl_opts.clone(),
            start_host.clone(),
            link_filter.clone(),
        )));
    }
    for handle in handles {
        let _ = handle.await;
    }

    let visited = state.visited.lock().expect("visit set poisoned");
    visited.clone()
}

/// Crawl a seed, retrying once across domains when a same-domain crawl
/// visits at most one page (typical of sites whose content lives on a CDN
/// domain).
pub async fn crawl_seed(
    seed: &str,
    fetcher: &mut Fetcher,
    robots: &RobotsGate,
    page_opts: &PageOptions,
    crawl_opts: &CrawlOptions,
    parallel: bool,
) -> HashSet<String> {
    let visited = if parallel {
        crawl_parallel(seed, fetcher, robots, page_opts, crawl_opts).await
    } else {
        crawl_sequential(seed, fetcher, robots, page_opts, crawl_opts).await
    };

    if crawl_opts.same_domain_only && visited.len() <= 1 {
        info!("crawl found nothing beyond the seed; retrying across domains");
        let mut cross = crawl_opts.clone();
        cross.same_domain_only = false;
        if parallel {
            return crawl_parallel(seed, fetcher, robots, page_opts, &cross).await;
        }
        return crawl_sequential(seed, fetcher, robots, page_opts, &cross).await;
    }

    visited
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_allows() {
        assert!(domain_allows(false, "a.test", "https://b.test/x"));
        assert!(domain_allows(true, "a.test", "https://a.test/x"));
        assert!(!domain_allows(true, "a.test", "https://b.test/x"));
        assert!(!domain_allows(true, "a.test", "not a url"));
    }

    fn test_state(workers: usize) -> (Arc<CrawlState>, mpsc::UnboundedReceiver<QueueItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(CrawlState {
                visited: StdMutex::new(HashSet::new()),
                pending: StdMutex::new(0),
                manifest_locks: StdMutex::new(HashMap::new()),
                tx,
                workers,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_visit_set_test_and_set() {
        let (state, _rx) = test_state(2);
        assert!(state.try_visit("https://a.test/"));
        assert!(!state.try_visit("https://a.test/"));
        assert!(state.already_visited("https://a.test/"));
        assert!(!state.already_visited("https://a.test/other"));
    }

    #[tokio::test]
    async fn test_pending_zero_emits_one_sentinel_per_worker() {
        let (state, mut rx) = test_state(3);
        state.enqueue("https://a.test/".to_string(), 0);
        state.enqueue("https://a.test/b".to_string(), 1);

        // Drain the two pages
        for _ in 0..2 {
            match rx.recv().await {
                Some(QueueItem::Page(..)) => {}
                _ => panic!("expected page"),
            }
        }

        state.finish_one();
        // Still one in flight: no sentinel yet
        assert!(rx.try_recv().is_err());
        state.finish_one();

        let mut sentinels = 0;
        while let Ok(item) = rx.try_recv() {
            match item {
                QueueItem::Shutdown => sentinels += 1,
                QueueItem::Page(..) => panic!("unexpected page"),
            }
        }
        assert_eq!(sentinels, 3);
    }

    #[tokio::test]
    async fn test_manifest_lock_shared_per_host() {
        let (state, _rx) = test_state(1);
        let a1 = state.manifest_lock("a.test");
        let a2 = state.manifest_lock("a.test");
        let b = state.manifest_lock("b.test");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
