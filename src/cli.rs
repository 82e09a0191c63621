//! Command-line surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use crate::fetch::solver::{solver_url_from_env, DEFAULT_SOLVER_URL};
use crate::fetch::FetchBackend;
use crate::pipeline::crawl::CrawlOptions;
use crate::pipeline::orchestrate::{run, RunOptions};
use crate::pipeline::{
    parse_size, PageOptions, ProgressCallback, ProgressEvent, WantedTypes, SAFE_HEAD_WORKERS,
};

/// Ceiling for crawl workers.
const MAX_WORKERS: usize = 12;

/// Scrape speed vs politeness presets (crawl workers, inter-request delay).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Aggressiveness {
    Conservative,
    Balanced,
    Aggressive,
    Auto,
}

impl Aggressiveness {
    fn params(self) -> (usize, f64) {
        match self {
            Aggressiveness::Conservative => (2, 1.0),
            Aggressiveness::Balanced | Aggressiveness::Auto => (4, 0.4),
            Aggressiveness::Aggressive => (MAX_WORKERS, 0.15),
        }
    }
}

#[derive(Parser)]
#[command(name = "strigil")]
#[command(about = "Scrape PDFs, text, and images from URLs and store them locally")]
#[command(version)]
pub struct Cli {
    /// URL(s) to scrape (one or more)
    #[arg(required = true, value_name = "URL")]
    urls: Vec<String>,

    /// Output directory
    #[arg(long, default_value = "output", value_name = "DIR")]
    out_dir: PathBuf,

    /// Delay between requests in seconds (default from --aggressiveness)
    #[arg(long, value_name = "SECS")]
    delay: Option<f64>,

    /// Scrape speed vs politeness
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    aggressiveness: Aggressiveness,

    /// Follow in-page links
    #[arg(long)]
    crawl: bool,

    /// Max crawl depth with --crawl
    #[arg(long, default_value_t = 2, value_name = "N")]
    max_depth: u32,

    /// Only follow same-domain links
    #[arg(long)]
    same_domain_only: bool,

    /// Max PDFs/images per page
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// File types to scrape: pdf, text, images (default: all)
    #[arg(long, value_name = "TYPE", num_args = 1..)]
    types: Vec<String>,

    /// Parallel workers for crawl (clamped to 12)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Download one asset at a time (more polite; same as --workers 1)
    #[arg(long)]
    sequential: bool,

    /// Disable the progress bar (for scripting)
    #[arg(long)]
    no_progress: bool,

    /// Skip images smaller than SIZE (e.g. 50k, 1m); uses HEAD Content-Length
    #[arg(long, value_name = "SIZE")]
    min_image_size: Option<String>,

    /// Skip images larger than SIZE (e.g. 5m, 10m)
    #[arg(long, value_name = "SIZE")]
    max_image_size: Option<String>,

    /// Fetch HTML with a real browser; for JS-heavy or bot-protected sites
    #[arg(long, alias = "js")]
    browser: bool,

    /// Fetch HTML via a challenge-solver proxy (default: FLARESOLVERR_URL
    /// or http://localhost:8191)
    #[arg(long, value_name = "URL", num_args = 0..=1, default_missing_value = "")]
    solver: Option<String>,

    /// Run the browser visibly (not headless)
    #[arg(long)]
    headed: bool,

    /// Pause for you to solve a challenge in the browser, then continue
    #[arg(long)]
    human_bypass: bool,

    /// Max retry iterations per seed; escalates timeout/delay and falls
    /// back to the browser after a 403
    #[arg(long, default_value_t = 3, value_name = "N")]
    max_iterations: u32,

    /// Timeout in seconds for the final retry iteration
    #[arg(long, default_value_t = 90.0, value_name = "SECS")]
    retry_timeout: f64,

    /// Scrape sequentially as discovered instead of mapping first
    #[arg(long)]
    no_map_first: bool,

    /// Ignore robots.txt (only with permission)
    #[arg(long)]
    no_robots: bool,

    /// Prevent system sleep during the scrape
    #[arg(long)]
    keep_awake: bool,

    /// Shell command to run on completion; {out_dir} expands to the output path
    #[arg(long, value_name = "CMD")]
    done_script: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Check verbosity before clap runs, for early logging setup.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

/// The backend for initial fetches. An explicit browser request wins over
/// a configured solver proxy; a 403 can still escalate individual seeds to
/// the browser later.
fn resolve_backend(solver: Option<&str>, browser: bool, human_bypass: bool) -> FetchBackend {
    if browser || human_bypass {
        return FetchBackend::Browser;
    }
    match solver {
        Some(url) => FetchBackend::Solver(url.to_string()),
        None => FetchBackend::Http,
    }
}

fn resolve_solver_url(flag: Option<&str>) -> Option<String> {
    match flag {
        Some(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Some(_) => Some(solver_url_from_env().unwrap_or_else(|| DEFAULT_SOLVER_URL.to_string())),
        None => solver_url_from_env(),
    }
}

fn progress_callback() -> (ProgressBar, ProgressCallback) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} assets")
            .expect("valid progress template")
            .progress_chars("=> "),
    );
    let cb_bar = bar.clone();
    let callback: ProgressCallback = Arc::new(move |event| match event {
        ProgressEvent::Total(n) => {
            cb_bar.set_length(n as u64);
            cb_bar.set_position(0);
        }
        _ => cb_bar.inc(1),
    });
    (bar, callback)
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    let (preset_workers, preset_delay) = cli.aggressiveness.params();
    let mut workers = cli.workers.unwrap_or(preset_workers);
    if cli.sequential {
        workers = 1;
    }
    let workers = workers.clamp(1, MAX_WORKERS);
    let delay = cli.delay.unwrap_or(preset_delay);

    let types = match WantedTypes::from_labels(&cli.types) {
        Ok(t) => t,
        Err(e) => bail!("--types: {e}"),
    };

    let min_image_size = match &cli.min_image_size {
        Some(s) => Some(parse_size(s).map_err(|e| anyhow::anyhow!("--min-image-size: {e}"))?),
        None => None,
    };
    let max_image_size = match &cli.max_image_size {
        Some(s) => Some(parse_size(s).map_err(|e| anyhow::anyhow!("--max-image-size: {e}"))?),
        None => None,
    };

    let seeds: Vec<String> = cli
        .urls
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    if seeds.is_empty() {
        bail!("at least one URL is required");
    }

    if cli.keep_awake {
        warn!("--keep-awake is handled by an external inhibitor; continuing without one");
    }

    let solver_url = resolve_solver_url(cli.solver.as_deref());
    let backend = resolve_backend(solver_url.as_deref(), cli.browser, cli.human_bypass);

    let page = PageOptions {
        out_dir: cli.out_dir.clone(),
        delay,
        limit: cli.limit,
        types,
        min_image_size,
        max_image_size,
        workers,
        head_workers: SAFE_HEAD_WORKERS.min(workers),
    };

    let crawl = cli.crawl.then(|| CrawlOptions {
        max_depth: cli.max_depth,
        same_domain_only: cli.same_domain_only,
        workers,
        ignore_robots: cli.no_robots,
    });

    let (bar, callback) = if cli.no_progress {
        (
            ProgressBar::hidden(),
            Arc::new(|_event: ProgressEvent| {}) as ProgressCallback,
        )
    } else {
        progress_callback()
    };

    let opts = RunOptions {
        seeds,
        page,
        crawl,
        backend,
        headed: cli.headed,
        human_bypass: cli.human_bypass,
        max_iterations: cli.max_iterations.max(1),
        retry_timeout: cli.retry_timeout,
        ignore_robots: cli.no_robots,
        map_first: !cli.no_map_first,
        done_script: cli.done_script.clone(),
    };

    let result = run(opts, Some(callback)).await;
    bar.finish_and_clear();
    if result.is_ok() {
        eprintln!("{}", console::style("Done.").green().bold());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggressiveness_presets() {
        assert_eq!(Aggressiveness::Conservative.params(), (2, 1.0));
        assert_eq!(Aggressiveness::Balanced.params(), (4, 0.4));
        assert_eq!(Aggressiveness::Aggressive.params(), (12, 0.15));
        assert_eq!(Aggressiveness::Auto.params(), (4, 0.4));
    }

    #[test]
    fn test_resolve_backend() {
        assert_eq!(resolve_backend(None, false, false), FetchBackend::Http);
        assert_eq!(resolve_backend(None, true, false), FetchBackend::Browser);
        // Human bypass requires the browser even when a solver is set
        assert_eq!(
            resolve_backend(Some("http://s:8191"), false, true),
            FetchBackend::Browser
        );
        assert_eq!(
            resolve_backend(Some("http://s:8191"), false, false),
            FetchBackend::Solver("http://s:8191".to_string())
        );
    }

    #[test]
    fn test_cli_parses_full_surface() {
        let cli = Cli::try_parse_from([
            "strigil",
            "https://example.com/",
            "https://other.test/",
            "--out-dir",
            "result",
            "--crawl",
            "--max-depth",
            "1",
            "--same-domain-only",
            "--types",
            "pdf",
            "images",
            "--workers",
            "40",
            "--min-image-size",
            "50k",
            "--max-image-size",
            "2m",
            "--max-iterations",
            "5",
            "--no-robots",
            "--done-script",
            "echo {out_dir}",
        ])
        .unwrap();
        assert_eq!(cli.urls.len(), 2);
        assert_eq!(cli.out_dir, PathBuf::from("result"));
        assert!(cli.crawl && cli.same_domain_only && cli.no_robots);
        assert_eq!(cli.max_depth, 1);
        assert_eq!(cli.types, vec!["pdf", "images"]);
        assert_eq!(cli.workers, Some(40));
        assert_eq!(cli.max_iterations, 5);
    }

    #[test]
    fn test_cli_requires_url() {
        assert!(Cli::try_parse_from(["strigil"]).is_err());
    }

    #[test]
    fn test_js_alias() {
        let cli = Cli::try_parse_from(["strigil", "https://e.test/", "--js"]).unwrap();
        assert!(cli.browser);
    }

    #[test]
    fn test_solver_flag_value_forms() {
        let cli = Cli::try_parse_from(["strigil", "https://e.test/", "--solver"]).unwrap();
        assert_eq!(cli.solver.as_deref(), Some(""));
        let cli =
            Cli::try_parse_from(["strigil", "https://e.test/", "--solver", "http://s:1"]).unwrap();
        assert_eq!(cli.solver.as_deref(), Some("http://s:1"));
        let cli = Cli::try_parse_from(["strigil", "https://e.test/"]).unwrap();
        assert_eq!(cli.solver, None);
    }
}
