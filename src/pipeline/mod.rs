//! The map/scrape page engine.
//!
//! Work on a page happens in two phases: *map* fetches the HTML, enumerates
//! candidate assets, and HEAD-filters images by size; *scrape* downloads the
//! mapped assets with bounded, staggered parallelism. Splitting the phases
//! lets downloads parallelize without re-parsing the page.

pub mod crawl;
pub mod orchestrate;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use scraper::Html;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::extract::schema::ImagePlan;
use crate::extract::text::extract_text;
use crate::extract::{find_page_links, find_pdf_urls, get_best_image_url};
use crate::fetch::{FetchResult, Fetcher};
use crate::storage::{
    load_manifest, manifest_path, path_for_image, path_for_image_canonical, path_for_pdf,
    path_for_pdf_canonical, path_for_text, path_for_text_canonical, sanitize_host, save_manifest,
    write_text, Manifest,
};

/// Per-page parallelism ceilings for asset downloads and size-filter HEADs.
pub const SAFE_ASSET_WORKERS: usize = 8;
pub const SAFE_HEAD_WORKERS: usize = 6;

/// IIIF full-region images are typically multi-megabyte; at this many or
/// more, downloads go sequential to avoid timeouts under fan-out.
const LARGE_IIIF_MIN_COUNT: usize = 10;

/// Timeout for individual asset downloads.
const BINARY_TIMEOUT: f64 = 60.0;
/// Timeout for size-filter HEAD requests.
const HEAD_TIMEOUT: f64 = 10.0;

const PDF_MIME: &str = "application/pdf";

/// Which asset classes a run collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WantedTypes {
    pub pdf: bool,
    pub text: bool,
    pub images: bool,
}

impl Default for WantedTypes {
    fn default() -> Self {
        Self {
            pdf: true,
            text: true,
            images: true,
        }
    }
}

impl WantedTypes {
    /// Parse labels like `pdf`, `text`, `images`. Unknown labels error.
    pub fn from_labels(labels: &[String]) -> Result<Self, String> {
        if labels.is_empty() {
            return Ok(Self::default());
        }
        let mut wanted = Self {
            pdf: false,
            text: false,
            images: false,
        };
        for label in labels {
            match label.as_str() {
                "pdf" => wanted.pdf = true,
                "text" => wanted.text = true,
                "images" => wanted.images = true,
                other => return Err(format!("unknown type: {other}")),
            }
        }
        Ok(wanted)
    }
}

/// Progress events from the page engine. `Total` is emitted once per page
/// before per-completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Total(usize),
    Text,
    Pdf,
    Image,
    Asset,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// An image candidate: the URL found on the page, the (possibly rewritten)
/// high-resolution URL to fetch, and the content type when known.
#[derive(Debug, Clone)]
pub struct ImageItem {
    pub url: String,
    pub fetch_url: String,
    pub content_type: String,
}

/// Result of mapping a page: URLs to scrape, no downloads yet.
#[derive(Debug, Default)]
pub struct MapResult {
    pub page_links: Vec<String>,
    pub pdf_urls: Vec<String>,
    pub image_items: Vec<ImageItem>,
    pub text: Option<(String, String)>,
}

/// Knobs shared by the map and scrape phases.
#[derive(Debug, Clone)]
pub struct PageOptions {
    pub out_dir: PathBuf,
    pub delay: f64,
    pub limit: Option<usize>,
    pub types: WantedTypes,
    pub min_image_size: Option<u64>,
    pub max_image_size: Option<u64>,
    pub workers: usize,
    pub head_workers: usize,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("output"),
            delay: 0.5,
            limit: None,
            types: WantedTypes::default(),
            min_image_size: None,
            max_image_size: None,
            workers: 1,
            head_workers: SAFE_HEAD_WORKERS,
        }
    }
}

/// True for IIIF Image API full-region URLs (typically multi-MB).
fn is_large_iiif_image(url: &str) -> bool {
    if !url.to_lowercase().contains("/iiif/image/") {
        return false;
    }
    Url::parse(url)
        .map(|u| u.path().to_lowercase().contains("/full/"))
        .unwrap_or(false)
}

/// One unit of scrape-phase work.
#[derive(Debug, Clone)]
struct AssetTask {
    index: usize,
    map_key: String,
    fetch_url: String,
    content_type: String,
}

impl AssetTask {
    fn is_pdf(&self) -> bool {
        self.content_type == PDF_MIME
    }
}

/// Reduce parallelism when the worklist is dominated by large IIIF images.
fn effective_asset_workers(tasks: &[AssetTask], requested: usize, use_browser: bool) -> usize {
    if use_browser {
        return 1;
    }
    if requested <= 1 {
        return requested.max(1);
    }
    let image_tasks: Vec<&AssetTask> = tasks.iter().filter(|t| !t.is_pdf()).collect();
    let large_count = image_tasks
        .iter()
        .filter(|t| is_large_iiif_image(&t.fetch_url))
        .count();
    if large_count >= LARGE_IIIF_MIN_COUNT && large_count >= image_tasks.len().div_ceil(2) {
        return 1;
    }
    requested.min(SAFE_ASSET_WORKERS).min(tasks.len().max(1))
}

/// Everything extractable from the DOM without further I/O.
struct PageExtract {
    page_links: Vec<String>,
    pdf_urls: Vec<String>,
    text: Option<String>,
    image_plan: Option<ImagePlan>,
}

fn extract_page(url: &str, html_str: &str, same_host: Option<&str>, opts: &PageOptions) -> PageExtract {
    let doc = Html::parse_document(html_str);

    let page_links = find_page_links(&doc, url, same_host);

    let mut pdf_urls = Vec::new();
    if opts.types.pdf {
        for u in find_pdf_urls(&doc, url) {
            if let Some(limit) = opts.limit {
                if pdf_urls.len() >= limit {
                    break;
                }
            }
            pdf_urls.push(u);
        }
    }

    let text = if opts.types.text {
        let extracted = extract_text(&doc);
        if extracted.trim().is_empty() {
            None
        } else {
            Some(extracted)
        }
    } else {
        None
    };

    let image_plan = if opts.types.images {
        Some(ImagePlan::build(url, &doc, html_str))
    } else {
        None
    };

    PageExtract {
        page_links,
        pdf_urls,
        text,
        image_plan,
    }
}

/// An image candidate after the HEAD pass.
#[derive(Debug, Clone)]
struct HeadedImage {
    url: String,
    fetch_url: String,
    content_type: Option<String>,
    content_length: Option<u64>,
}

/// HEAD one candidate. The rewritten URL is tried first; a non-image
/// content type there falls back to the original URL.
async fn head_one_image(fetcher: &mut Fetcher, url: &str, delay: f64) -> Option<HeadedImage> {
    let mut fetch_url = get_best_image_url(url);
    let (mut ct, mut cl) = fetcher.head_metadata(&fetch_url, HEAD_TIMEOUT, delay).await;
    if let Some(ref t) = ct {
        if !t.starts_with("image/") {
            fetch_url = url.to_string();
            (ct, cl) = fetcher.head_metadata(url, HEAD_TIMEOUT, delay).await;
        }
    }
    ct.map(|content_type| HeadedImage {
        url: url.to_string(),
        fetch_url,
        content_type: Some(content_type),
        content_length: cl,
    })
}

/// HEAD candidates on a small worker pool, each worker with its own
/// fetcher. Result order matches input order.
async fn head_images_parallel(
    template: &Fetcher,
    urls: Vec<String>,
    workers: usize,
    delay: f64,
) -> Vec<Option<HeadedImage>> {
    let count = urls.len();
    let queue: Arc<StdMutex<VecDeque<(usize, String)>>> =
        Arc::new(StdMutex::new(urls.into_iter().enumerate().collect()));
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Option<HeadedImage>)>();

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers.max(1) {
        let queue = queue.clone();
        let tx = tx.clone();
        let mut fetcher = template.spawn();
        handles.push(tokio::spawn(async move {
            loop {
                let item = queue.lock().expect("head queue poisoned").pop_front();
                let Some((index, url)) = item else { break };
                let result = head_one_image(&mut fetcher, &url, delay).await;
                if tx.send((index, result)).is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let mut results: Vec<Option<HeadedImage>> = vec![None; count];
    while let Some((index, result)) = rx.recv().await {
        results[index] = result;
    }
    for handle in handles {
        let _ = handle.await;
    }
    results
}

fn within_size_band(length: Option<u64>, opts: &PageOptions) -> bool {
    let Some(length) = length else {
        // Unknown Content-Length is not filterable
        return true;
    };
    if let Some(min) = opts.min_image_size {
        if length < min {
            return false;
        }
    }
    if let Some(max) = opts.max_image_size {
        if length > max {
            return false;
        }
    }
    true
}

/// Map a page: fetch HTML, enumerate assets, HEAD-filter images. No
/// downloads happen here.
pub async fn map_page(
    url: &str,
    fetcher: &mut Fetcher,
    opts: &PageOptions,
    same_host: Option<&str>,
) -> FetchResult<MapResult> {
    let (raw, _charset) = fetcher.fetch_html(url, opts.delay).await?;
    let html_str = String::from_utf8_lossy(&raw).into_owned();

    let extract = extract_page(url, &html_str, same_host, opts);

    let mut image_items = Vec::new();
    if let Some(plan) = extract.image_plan {
        let img_urls = plan.resolve(fetcher, opts.delay, opts.limit).await;
        let need_size_filter = opts.min_image_size.is_some() || opts.max_image_size.is_some();

        if !need_size_filter {
            for u in img_urls {
                let fetch_url = get_best_image_url(&u);
                image_items.push(ImageItem {
                    url: u,
                    fetch_url,
                    content_type: "image".to_string(),
                });
            }
        } else {
            let head_workers = if fetcher.is_browser() {
                1
            } else {
                opts.head_workers
            };
            let headed = if head_workers > 1 && img_urls.len() > 4 {
                head_images_parallel(fetcher, img_urls, head_workers, opts.delay).await
            } else {
                let mut out = Vec::with_capacity(img_urls.len());
                for u in &img_urls {
                    out.push(head_one_image(fetcher, u, opts.delay).await);
                }
                out
            };
            for item in headed.into_iter().flatten() {
                if !within_size_band(item.content_length, opts) {
                    continue;
                }
                image_items.push(ImageItem {
                    url: item.url,
                    fetch_url: item.fetch_url,
                    content_type: item.content_type.unwrap_or_else(|| "image".to_string()),
                });
            }
        }
    }

    Ok(MapResult {
        page_links: extract.page_links,
        pdf_urls: extract.pdf_urls,
        image_items,
        text: extract.text.map(|t| (url.to_string(), t)),
    })
}

/// True when the canonical file exists and its size matches the remote
/// Content-Length.
async fn matches_existing_size(fetcher: &mut Fetcher, fetch_url: &str, canon: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(canon) else {
        return false;
    };
    let (_, content_length) = fetcher.head_metadata(fetch_url, HEAD_TIMEOUT, 0.0).await;
    content_length == Some(meta.len())
}

enum DownloadOutcome {
    /// Asset is on disk (downloaded or size-matched); record it.
    Done { dest: PathBuf, hit: bool },
    Failed(String),
}

async fn download_one(
    fetcher: &mut Fetcher,
    task: &AssetTask,
    out_dir: &Path,
    host: &str,
    delay: f64,
) -> DownloadOutcome {
    let ct = if task.is_pdf() {
        None
    } else {
        Some(task.content_type.as_str())
    };
    let canon = if task.is_pdf() {
        path_for_pdf_canonical(out_dir, host, &task.map_key)
    } else {
        path_for_image_canonical(out_dir, host, &task.map_key, ct)
    };

    let dest = if canon.exists() {
        if matches_existing_size(fetcher, &task.fetch_url, &canon).await {
            return DownloadOutcome::Done { dest: canon, hit: true };
        }
        canon // sizes differ: overwrite in place
    } else if task.is_pdf() {
        path_for_pdf(out_dir, host, &task.fetch_url)
    } else {
        path_for_image(out_dir, host, &task.fetch_url, ct)
    };

    match fetcher
        .fetch_binary(&task.fetch_url, &dest, BINARY_TIMEOUT, delay)
        .await
    {
        Ok(()) => DownloadOutcome::Done { dest, hit: false },
        Err(e) => {
            // High-res rewrites can 404; fall back to the page's own URL
            if !task.is_pdf() && task.fetch_url != task.map_key {
                match fetcher
                    .fetch_binary(&task.map_key, &dest, BINARY_TIMEOUT, delay)
                    .await
                {
                    Ok(()) => return DownloadOutcome::Done { dest, hit: false },
                    Err(inner) => return DownloadOutcome::Failed(inner.to_string()),
                }
            }
            DownloadOutcome::Failed(e.to_string())
        }
    }
}

/// How per-completion progress is reported.
#[derive(Clone, Copy, PartialEq)]
enum EventStyle {
    /// Uniform `Asset` events (map-first mode).
    Uniform,
    /// `Pdf` / `Image` events (fused scrape mode).
    PerKind,
}

fn completion_event(style: EventStyle, task: &AssetTask) -> ProgressEvent {
    match style {
        EventStyle::Uniform => ProgressEvent::Asset,
        EventStyle::PerKind => {
            if task.is_pdf() {
                ProgressEvent::Pdf
            } else {
                ProgressEvent::Image
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_downloads(
    tasks: Vec<AssetTask>,
    fetcher: &mut Fetcher,
    out_dir: &Path,
    host: &str,
    manifest: &mut Manifest,
    delay: f64,
    requested_workers: usize,
    style: EventStyle,
    progress: Option<&ProgressCallback>,
) {
    if tasks.is_empty() {
        return;
    }
    let effective = effective_asset_workers(&tasks, requested_workers, fetcher.is_browser());
    let total = tasks.len();

    if effective <= 1 {
        for (done, task) in tasks.iter().enumerate() {
            match download_one(fetcher, task, out_dir, host, delay).await {
                DownloadOutcome::Done { dest, hit } => {
                    manifest.record(&task.map_key, &dest, &task.content_type);
                    if let Some(cb) = progress {
                        cb(completion_event(style, task));
                    }
                    info!(
                        "[{}/{}] {}{}: {}",
                        done + 1,
                        total,
                        if task.is_pdf() { "pdf" } else { "image" },
                        if hit { " (cached)" } else { "" },
                        task.fetch_url
                    );
                }
                DownloadOutcome::Failed(err) => {
                    warn!("failed {}: {}", task.map_key, err);
                }
            }
        }
        return;
    }

    // Workers hit the origin spread across one delay window, not all at t0
    let stagger = delay / effective as f64;
    let queue: Arc<StdMutex<VecDeque<AssetTask>>> = Arc::new(StdMutex::new(tasks.into()));
    let (tx, mut rx) = mpsc::unbounded_channel::<(AssetTask, DownloadOutcome)>();

    let mut handles = Vec::with_capacity(effective);
    for _ in 0..effective {
        let queue = queue.clone();
        let tx = tx.clone();
        let mut worker_fetcher = fetcher.spawn();
        let out_dir = out_dir.to_path_buf();
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            loop {
                let task = queue.lock().expect("asset queue poisoned").pop_front();
                let Some(task) = task else { break };
                let offset = stagger * (task.index % effective) as f64;
                if offset > 0.0 {
                    tokio::time::sleep(std::time::Duration::from_secs_f64(offset)).await;
                }
                let outcome =
                    download_one(&mut worker_fetcher, &task, &out_dir, &host, delay).await;
                if tx.send((task, outcome)).is_err() {
                    break;
                }
            }
            worker_fetcher.close().await;
        }));
    }
    drop(tx);

    let mut done = 0usize;
    while let Some((task, outcome)) = rx.recv().await {
        done += 1;
        match outcome {
            DownloadOutcome::Done { dest, hit } => {
                manifest.record(&task.map_key, &dest, &task.content_type);
                if let Some(cb) = progress {
                    cb(completion_event(style, &task));
                }
                info!(
                    "[{}/{}] {}{}: {}",
                    done,
                    total,
                    if task.is_pdf() { "pdf" } else { "image" },
                    if hit { " (cached)" } else { "" },
                    task.fetch_url
                );
            }
            DownloadOutcome::Failed(err) => {
                warn!("failed {}: {}", task.map_key, err);
            }
        }
    }
    for handle in handles {
        let _ = handle.await;
    }
}

fn write_page_text(
    url: &str,
    text: &str,
    out_dir: &Path,
    host: &str,
    manifest: &mut Manifest,
    progress: Option<&ProgressCallback>,
) -> bool {
    let canon = path_for_text_canonical(out_dir, host, url);
    if canon.exists() {
        manifest.record(url, &canon, "text/plain");
        return false;
    }
    if manifest.contains_url(url) {
        return false;
    }
    let dest = path_for_text(out_dir, host, url);
    match write_text(&dest, text) {
        Ok(()) => {
            manifest.record(url, &dest, "text/plain");
            if let Some(cb) = progress {
                cb(ProgressEvent::Text);
            }
            info!("text: {}", dest.display());
            true
        }
        Err(e) => {
            warn!("cannot write text for {}: {}", url, e);
            false
        }
    }
}

fn build_asset_tasks(result: &MapResult, manifest: &Manifest) -> Vec<AssetTask> {
    let mut tasks = Vec::new();
    for url in &result.pdf_urls {
        if !manifest.contains_url(url) {
            tasks.push(AssetTask {
                index: tasks.len(),
                map_key: url.clone(),
                fetch_url: url.clone(),
                content_type: PDF_MIME.to_string(),
            });
        }
    }
    for item in &result.image_items {
        if !manifest.contains_url(&item.url) {
            tasks.push(AssetTask {
                index: tasks.len(),
                map_key: item.url.clone(),
                fetch_url: item.fetch_url.clone(),
                content_type: item.content_type.clone(),
            });
        }
    }
    tasks
}

/// Scrape the assets a map phase produced: write text, download PDFs and
/// images, record everything in the manifest.
pub async fn scrape_assets(
    result: &MapResult,
    fetcher: &mut Fetcher,
    host: &str,
    manifest: &mut Manifest,
    opts: &PageOptions,
    progress: Option<&ProgressCallback>,
) {
    let mut text_written = false;
    if let Some((url, text)) = &result.text {
        text_written = write_page_text(url, text, &opts.out_dir, host, manifest, progress);
    }

    let tasks = build_asset_tasks(result, manifest);
    let total = tasks.len() + usize::from(text_written);
    if total > 0 {
        debug!(
            "downloading {} assets ({} pdfs, {} images)",
            total,
            tasks.iter().filter(|t| t.is_pdf()).count(),
            tasks.iter().filter(|t| !t.is_pdf()).count(),
        );
        if let Some(cb) = progress {
            cb(ProgressEvent::Total(total));
        }
    }

    run_downloads(
        tasks,
        fetcher,
        &opts.out_dir,
        host,
        manifest,
        opts.delay,
        opts.workers,
        EventStyle::Uniform,
        progress,
    )
    .await;
}

/// Fused map+scrape for crawl mode. Saves the manifest and returns the
/// page's links when `collect_links` is set.
#[allow(clippy::too_many_arguments)]
pub async fn scrape_page(
    url: &str,
    fetcher: &mut Fetcher,
    manifest: &mut Manifest,
    opts: &PageOptions,
    collect_links: bool,
    link_filter: Option<&str>,
    asset_workers: usize,
    progress: Option<&ProgressCallback>,
) -> FetchResult<Vec<String>> {
    let host = sanitize_host(url);
    let result = map_page(url, fetcher, opts, link_filter).await?;

    if let Some((text_url, text)) = &result.text {
        write_page_text(text_url, text, &opts.out_dir, &host, manifest, progress);
    }

    let tasks = build_asset_tasks(&result, manifest);
    run_downloads(
        tasks,
        fetcher,
        &opts.out_dir,
        &host,
        manifest,
        opts.delay,
        asset_workers,
        EventStyle::PerKind,
        progress,
    )
    .await;

    if let Err(e) = save_manifest(&manifest_path(&opts.out_dir, &host), manifest) {
        warn!("cannot save manifest for {}: {}", host, e);
    }

    Ok(if collect_links { result.page_links } else { Vec::new() })
}

/// Load the manifest for a URL's host.
pub fn manifest_for_url(out_dir: &Path, url: &str) -> (String, Manifest) {
    let host = sanitize_host(url);
    let manifest = load_manifest(&manifest_path(out_dir, &host));
    (host, manifest)
}

/// Parse a human size string: `100`, `100k`, `1m` (case-insensitive).
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, multiplier) = if let Some(d) = s.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = s.strip_suffix('m') {
        (d, 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid size: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_task(index: usize, fetch_url: &str) -> AssetTask {
        AssetTask {
            index,
            map_key: format!("https://page.test/img{index}"),
            fetch_url: fetch_url.to_string(),
            content_type: "image".to_string(),
        }
    }

    fn large_iiif_task(index: usize) -> AssetTask {
        image_task(
            index,
            &format!("https://lib.test/iiif/image/{index}/full/full/0/default.jpg"),
        )
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("100").unwrap(), 100);
        assert_eq!(parse_size("50k").unwrap(), 50 * 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn test_is_large_iiif_image() {
        assert!(is_large_iiif_image(
            "https://lib.test/iiif/image/42/full/full/0/default.jpg"
        ));
        assert!(!is_large_iiif_image("https://lib.test/images/42.jpg"));
        // CONTENTdm-style URLs are not the multi-MB tile endpoint
        assert!(!is_large_iiif_image(
            "https://cdm.test/digital/iiif/2/p1:42/full/full/0/default.jpg"
        ));
    }

    #[test]
    fn test_effective_workers_large_iiif_boundary() {
        // Exactly 10 large items, 100% share: downgrade to 1
        let tasks: Vec<AssetTask> = (0..10).map(large_iiif_task).collect();
        assert_eq!(effective_asset_workers(&tasks, 8, false), 1);

        // 9 large items does not downgrade
        let tasks: Vec<AssetTask> = (0..9).map(large_iiif_task).collect();
        assert_eq!(effective_asset_workers(&tasks, 8, false), 8);

        // 10 large of 21 images: under a 50% share, no downgrade
        let mut tasks: Vec<AssetTask> = (0..10).map(large_iiif_task).collect();
        for i in 10..21 {
            tasks.push(image_task(i, "https://x.test/small.jpg"));
        }
        assert_eq!(effective_asset_workers(&tasks, 8, false), 8);

        // 10 large of 20 images: at the 50% share, downgrade
        let mut tasks: Vec<AssetTask> = (0..10).map(large_iiif_task).collect();
        for i in 10..20 {
            tasks.push(image_task(i, "https://x.test/small.jpg"));
        }
        assert_eq!(effective_asset_workers(&tasks, 8, false), 1);
    }

    #[test]
    fn test_effective_workers_browser_and_bounds() {
        let tasks: Vec<AssetTask> = (0..3).map(|i| image_task(i, "https://x/i.jpg")).collect();
        assert_eq!(effective_asset_workers(&tasks, 8, true), 1);
        // Bounded by worklist size
        assert_eq!(effective_asset_workers(&tasks, 8, false), 3);
        // Bounded by the safe ceiling
        let many: Vec<AssetTask> = (0..40).map(|i| image_task(i, "https://x/i.jpg")).collect();
        assert_eq!(effective_asset_workers(&many, 40, false), SAFE_ASSET_WORKERS);
    }

    #[test]
    fn test_within_size_band() {
        let mut opts = PageOptions::default();
        opts.min_image_size = Some(50 * 1024);
        opts.max_image_size = Some(200 * 1024);
        assert!(!within_size_band(Some(48 * 1024), &opts));
        assert!(within_size_band(Some(100 * 1024), &opts));
        assert!(!within_size_band(Some(250 * 1024), &opts));
        // Unknown Content-Length is not filterable
        assert!(within_size_band(None, &opts));
    }

    #[test]
    fn test_wanted_types_from_labels() {
        let all = WantedTypes::from_labels(&[]).unwrap();
        assert!(all.pdf && all.text && all.images);
        let some = WantedTypes::from_labels(&["pdf".to_string(), "text".to_string()]).unwrap();
        assert!(some.pdf && some.text && !some.images);
        assert!(WantedTypes::from_labels(&["video".to_string()]).is_err());
    }

    #[test]
    fn test_build_asset_tasks_skips_manifested() {
        let mut manifest = Manifest::default();
        manifest.record(
            "https://e.test/a.pdf",
            Path::new("/out/a.pdf"),
            PDF_MIME,
        );
        let result = MapResult {
            pdf_urls: vec![
                "https://e.test/a.pdf".to_string(),
                "https://e.test/b.pdf".to_string(),
            ],
            image_items: vec![ImageItem {
                url: "https://e.test/i.jpg".to_string(),
                fetch_url: "https://e.test/i.jpg".to_string(),
                content_type: "image/jpeg".to_string(),
            }],
            ..Default::default()
        };
        let tasks = build_asset_tasks(&result, &manifest);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].map_key, "https://e.test/b.pdf");
        assert!(tasks[0].is_pdf());
        assert_eq!(tasks[1].map_key, "https://e.test/i.jpg");
    }

    #[test]
    fn test_extract_page_respects_types_and_limit() {
        let html = r#"<html><body>
            <main><p>Some content</p></main>
            <a href="/a.pdf">a</a><a href="/b.pdf">b</a><a href="/c.pdf">c</a>
            <a href="/next">next</a>
            <img src="/i.jpg">
        </body></html>"#;
        let mut opts = PageOptions::default();
        opts.limit = Some(2);
        let extract = extract_page("https://e.test/", html, None, &opts);
        assert_eq!(extract.pdf_urls.len(), 2);
        assert_eq!(extract.page_links, vec!["https://e.test/next"]);
        assert_eq!(extract.text.as_deref(), Some("Some content"));
        assert!(extract.image_plan.is_some());

        let mut no_text = PageOptions::default();
        no_text.types = WantedTypes {
            pdf: false,
            text: false,
            images: false,
        };
        let extract = extract_page("https://e.test/", html, None, &no_text);
        assert!(extract.pdf_urls.is_empty());
        assert!(extract.text.is_none());
        assert!(extract.image_plan.is_none());
    }

    #[test]
    fn test_write_page_text_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        let wrote = write_page_text(
            "https://e.test/page",
            "hello",
            dir.path(),
            "e.test",
            &mut manifest,
            None,
        );
        assert!(wrote);
        let recorded = manifest.urls.get("https://e.test/page").unwrap().clone();
        assert!(Path::new(&recorded).exists());

        // Second call finds the canonical file and records without rewriting
        let mut manifest2 = Manifest::default();
        let wrote2 = write_page_text(
            "https://e.test/page",
            "hello",
            dir.path(),
            "e.test",
            &mut manifest2,
            None,
        );
        assert!(!wrote2);
        assert_eq!(manifest2.urls.get("https://e.test/page").unwrap(), &recorded);
    }
}
