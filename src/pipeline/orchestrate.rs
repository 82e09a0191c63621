//! Per-seed orchestration: iteration ladder, backend escalation, and the
//! completion hook.
//!
//! Each seed gets up to `max_iterations` attempts. Iteration *i* stretches
//! the politeness delay by 1.2^i and the timeout by 1.5^i (capped); a 403
//! on one iteration forces the browser backend on the next. Failures stay
//! local to the seed; only configuration errors abort a run.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, warn};

use super::crawl::{crawl_seed, CrawlOptions};
use super::{
    manifest_for_url, map_page, scrape_assets, scrape_page, PageOptions, ProgressCallback,
    SAFE_HEAD_WORKERS,
};
use crate::fetch::{FetchBackend, Fetcher, FetcherConfig, DEFAULT_TIMEOUT, MAX_TIMEOUT};
use crate::robots::{RobotsGate, ROBOTS_USER_AGENT};
use crate::storage::{manifest_path, save_manifest};

const ITERATION_DELAY_FACTOR: f64 = 1.2;
const ITERATION_TIMEOUT_FACTOR: f64 = 1.5;

/// A whole run: seeds plus everything the pipeline needs to process them.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub seeds: Vec<String>,
    pub page: PageOptions,
    /// Crawl configuration; `None` scrapes each seed as a single page.
    pub crawl: Option<CrawlOptions>,
    pub backend: FetchBackend,
    pub headed: bool,
    pub human_bypass: bool,
    pub max_iterations: u32,
    /// Timeout floor for the final retry iteration.
    pub retry_timeout: f64,
    pub ignore_robots: bool,
    pub map_first: bool,
    pub done_script: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            page: PageOptions::default(),
            crawl: None,
            backend: FetchBackend::Http,
            headed: false,
            human_bypass: false,
            max_iterations: 3,
            retry_timeout: 90.0,
            ignore_robots: false,
            map_first: true,
            done_script: None,
        }
    }
}

impl RunOptions {
    fn fetcher_config(&self, timeout: f64, backend: FetchBackend) -> FetcherConfig {
        FetcherConfig {
            timeout,
            backend,
            headed: self.headed,
            human_bypass: self.human_bypass,
            ..FetcherConfig::default()
        }
    }
}

fn iteration_delay(base: f64, iteration: u32) -> f64 {
    base * ITERATION_DELAY_FACTOR.powi(iteration as i32)
}

fn iteration_timeout(iteration: u32, final_iteration: bool, retry_timeout: f64) -> f64 {
    let mut timeout =
        (DEFAULT_TIMEOUT * ITERATION_TIMEOUT_FACTOR.powi(iteration as i32)).min(MAX_TIMEOUT);
    if final_iteration {
        timeout = timeout.max(retry_timeout).min(MAX_TIMEOUT);
    }
    timeout
}

/// Why a seed could not be processed.
#[derive(Debug, Error)]
enum SeedError {
    /// Hard failure: single-page scrapes of robots-disallowed URLs exit
    /// nonzero.
    #[error("robots.txt disallows {0}")]
    RobotsDenied(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Scrape one seed as a single page through the iteration ladder.
async fn scrape_single(
    seed: &str,
    opts: &RunOptions,
    robots: &RobotsGate,
    progress: Option<&ProgressCallback>,
) -> Result<(), SeedError> {
    if !opts.ignore_robots && !robots.can_fetch(seed, ROBOTS_USER_AGENT).await {
        return Err(SeedError::RobotsDenied(seed.to_string()));
    }

    let (host, mut manifest) = manifest_for_url(&opts.page.out_dir, seed);
    let mut had_403 = false;

    for iteration in 0..opts.max_iterations.max(1) {
        let final_iteration = iteration + 1 >= opts.max_iterations.max(1);
        let delay = iteration_delay(opts.page.delay, iteration);
        let timeout = iteration_timeout(iteration, final_iteration, opts.retry_timeout);
        let use_browser = opts.backend == FetchBackend::Browser || (iteration > 0 && had_403);
        let backend = if use_browser {
            FetchBackend::Browser
        } else {
            opts.backend.clone()
        };

        if iteration > 0 {
            info!(
                "iteration {}/{} (timeout={:.0}s, delay={:.1}s{})",
                iteration + 1,
                opts.max_iterations,
                timeout,
                delay,
                if use_browser { "; browser" } else { "" },
            );
        } else {
            info!("scrape: {}", seed);
        }

        let mut page_opts = opts.page.clone();
        page_opts.delay = delay;
        page_opts.head_workers = SAFE_HEAD_WORKERS.min(opts.page.workers.max(1));

        let mut fetcher = Fetcher::new(opts.fetcher_config(timeout, backend));
        let outcome = if opts.map_first {
            match map_page(seed, &mut fetcher, &page_opts, None).await {
                Ok(result) => {
                    let found = [
                        result.text.is_some().then(|| "text".to_string()),
                        (!result.pdf_urls.is_empty())
                            .then(|| format!("{} PDFs", result.pdf_urls.len())),
                        (!result.image_items.is_empty())
                            .then(|| format!("{} images", result.image_items.len())),
                    ]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>();
                    if !found.is_empty() {
                        info!("found: {}", found.join(", "));
                    }
                    scrape_assets(
                        &result,
                        &mut fetcher,
                        &host,
                        &mut manifest,
                        &page_opts,
                        progress,
                    )
                    .await;
                    save_manifest(&manifest_path(&page_opts.out_dir, &host), &manifest)
                        .map_err(anyhow::Error::from)
                }
                Err(e) => Err(e.into()),
            }
        } else {
            scrape_page(
                seed,
                &mut fetcher,
                &mut manifest,
                &page_opts,
                false,
                None,
                1,
                progress,
            )
            .await
            .map(|_| ())
            .map_err(anyhow::Error::from)
        };
        fetcher.close().await;

        match outcome {
            Ok(()) => return Ok(()),
            Err(e) => {
                let is_403 = e
                    .downcast_ref::<crate::fetch::FetchError>()
                    .map(|f| f.is_403())
                    .unwrap_or(false);
                if is_403 {
                    had_403 = true;
                }
                if final_iteration {
                    return Err(e.into());
                }
                warn!(
                    "retrying after {} (iteration {})",
                    if is_403 { "403" } else { "error" },
                    iteration + 1
                );
            }
        }
    }

    Ok(())
}

/// Crawl one seed. Parallel workers only apply to the plain HTTP backend;
/// browser and solver rendering serialize to one page at a time.
async fn crawl_one(
    seed: &str,
    opts: &RunOptions,
    crawl_opts: &CrawlOptions,
    robots: &RobotsGate,
) -> HashSet<String> {
    let parallel = crawl_opts.workers > 1 && opts.backend == FetchBackend::Http;
    if crawl_opts.workers > 1 && !parallel {
        info!("using 1 worker with the browser/solver backend for reliable rendering");
    }

    let mut crawl_opts = crawl_opts.clone();
    crawl_opts.ignore_robots = opts.ignore_robots;
    if !parallel {
        crawl_opts.workers = 1;
    }

    let mut fetcher = Fetcher::new(opts.fetcher_config(DEFAULT_TIMEOUT, opts.backend.clone()));
    let visited = crawl_seed(seed, &mut fetcher, robots, &opts.page, &crawl_opts, parallel).await;
    fetcher.close().await;
    visited
}

/// Run the completion hook: a shell command with `{out_dir}` substituted.
/// Failures are logged and ignored.
pub async fn run_done_script(cmd: &str, out_dir: &Path) {
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return;
    }
    let resolved = out_dir
        .canonicalize()
        .unwrap_or_else(|_| out_dir.to_path_buf());
    let cmd = cmd.replace("{out_dir}", &resolved.display().to_string());
    info!("running completion hook: {}", cmd);
    match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .status()
        .await
    {
        Ok(status) if !status.success() => {
            warn!("completion hook exited with {}", status);
        }
        Ok(_) => {}
        Err(e) => warn!("completion hook failed to start: {}", e),
    }
}

/// Process every seed, then fire the completion hook. Per-seed failures are
/// logged; only robots denial in single-page mode is escalated to the
/// caller (nonzero exit).
pub async fn run(opts: RunOptions, progress: Option<ProgressCallback>) -> Result<()> {
    let robots = RobotsGate::new();
    let total = opts.seeds.len();
    let mut hard_error: Option<anyhow::Error> = None;

    for (index, seed) in opts.seeds.iter().enumerate() {
        if total > 1 {
            info!("——— site {}/{}: {} ———", index + 1, total, seed);
        }
        match &opts.crawl {
            Some(crawl_opts) => {
                let visited = crawl_one(seed, &opts, crawl_opts, &robots).await;
                info!("crawl of {} finished: {} pages", seed, visited.len());
            }
            None => match scrape_single(seed, &opts, &robots, progress.as_ref()).await {
                Ok(()) => {}
                Err(SeedError::RobotsDenied(url)) => {
                    hard_error = Some(anyhow::anyhow!("robots.txt disallows {}", url));
                    break;
                }
                Err(SeedError::Failed(e)) => {
                    error!("giving up on {}: {}", seed, e);
                }
            },
        }
    }

    if let Some(cmd) = &opts.done_script {
        run_done_script(cmd, &opts.page.out_dir).await;
    }

    match hard_error {
        Some(e) => Err(e),
        None => {
            info!("done");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_delay_escalation() {
        assert!((iteration_delay(0.5, 0) - 0.5).abs() < 1e-9);
        assert!((iteration_delay(0.5, 1) - 0.6).abs() < 1e-9);
        assert!((iteration_delay(0.5, 2) - 0.72).abs() < 1e-9);
    }

    #[test]
    fn test_iteration_timeout_escalation_and_cap() {
        assert_eq!(iteration_timeout(0, false, 90.0), 30.0);
        assert_eq!(iteration_timeout(1, false, 90.0), 45.0);
        assert_eq!(iteration_timeout(2, true, 90.0), 90.0);
        // Retry-timeout floors the final iteration but never exceeds the cap
        assert_eq!(iteration_timeout(0, true, 90.0), 90.0);
        assert_eq!(iteration_timeout(0, true, 500.0), MAX_TIMEOUT);
    }

    #[tokio::test]
    async fn test_done_script_substitutes_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran.txt");
        let cmd = format!("echo {{out_dir}} > {}", marker.display());
        run_done_script(&cmd, dir.path()).await;
        let contents = std::fs::read_to_string(&marker).unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(contents.trim(), canonical.display().to_string());
    }

    #[tokio::test]
    async fn test_done_script_failures_ignored() {
        let dir = tempfile::tempdir().unwrap();
        // Nonexistent command: must not panic or error
        run_done_script("definitely-not-a-command-xyz", dir.path()).await;
        run_done_script("   ", dir.path()).await;
    }
}
