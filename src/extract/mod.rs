//! Extract PDF links, image candidates, and page links from a parsed DOM.
//!
//! Everything here is pure over `scraper::Html`; callers do all network I/O.

pub mod iiif;
pub mod schema;
pub mod text;

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Data attributes that carry lazy-loaded or high-resolution image URLs,
/// in preference order (hi-res before lazy).
const IMG_DATA_ATTRS: &[&str] = &[
    "data-zoom-src",
    "data-full-url",
    "data-hires",
    "data-highres",
    "data-large",
    "data-src",
    "data-lazy-src",
    "data-original",
    "data-srcset",
    "data-full",
    "data-image",
    "data-url",
];

/// Path segments that suggest an image URL (for extension-less `a[href]`).
const IMG_PATH_HINTS: &[&str] = &[
    "/image", "/img", "/photo", "/media", "/thumb", "/icaimage", "/gallery", "/asset",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".bmp", ".ico",
];

/// URL path patterns for UI chrome (favicons, social icons).
const SKIP_IMAGE_PATTERNS: &[&str] = &[
    "/favicon.ico",
    "/icon_",
    "icon_facebook",
    "icon_instagram",
    "icon_google",
    "icon_youtube",
    "icon_pinterest",
    "icon_twitter",
    "icon_linkedin",
];

/// URL substrings that indicate tracking/analytics pixels.
const TRACKING_URL_SUBSTRINGS: &[&str] = &[
    "facebook.com/tr",
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "scorecardresearch.com",
];

/// Ordered thumbnail→full URL substitutions. Kept as data so new schemas
/// are one row, not code.
static THUMB_TO_FULL: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)/thumb(s|nails?)/", "/full/"),
        (r"(?i)/small/", "/large/"),
        (r"(?i)/_s\.", "/_b."),
        (r"(?i)-thumb", ""),
        (r"(?i)_thumb", ""),
        (r"(?i)/thumb/", "/original/"),
        (r"(?i)thumbnail", "original"),
    ]
    .into_iter()
    .map(|(p, r)| (Regex::new(p).expect("valid substitution pattern"), r))
    .collect()
});

static STYLE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)url\s*\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).unwrap());

static PDF_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href], object[data], embed[src]").unwrap());
static IMAGE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img, source, video, a, object, embed").unwrap());
static PRELOAD_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"link[rel="preload"][as="image"][href]"#).unwrap());
static STYLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("[style]").unwrap());
static ANCHOR_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

/// Resolve a raw href/src against a base URL. Returns None for fragments,
/// `mailto:`, `javascript:`, and `data:` pseudo-links.
pub fn resolve_url(base_url: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty()
        || raw.starts_with('#')
        || raw.starts_with("mailto:")
        || raw.starts_with("javascript:")
        || raw.starts_with("data:")
    {
        return None;
    }
    let base = Url::parse(base_url).ok()?;
    base.join(raw).ok().map(|u| u.to_string())
}

fn push_new(seen: &mut HashSet<String>, urls: &mut Vec<String>, url: String) {
    if seen.insert(url.clone()) {
        urls.push(url);
    }
}

/// True if the URL looks like UI chrome or a tracking pixel.
pub fn should_skip_image_url(url: &str) -> bool {
    let path = Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_default();
    if SKIP_IMAGE_PATTERNS.iter().any(|p| path.contains(p)) {
        return true;
    }
    let url_lower = url.to_lowercase();
    TRACKING_URL_SUBSTRINGS.iter().any(|t| url_lower.contains(t))
}

/// True if the URL or path appears to reference an image, by extension or
/// by path hints.
pub fn looks_like_image(url_or_path: &str) -> bool {
    let path = Url::parse(url_or_path)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url_or_path.to_lowercase());
    if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return true;
    }
    IMG_PATH_HINTS.iter().any(|hint| path.contains(hint))
}

/// Collect PDF links from `a[href]`, `object[data]`, `embed[src]`.
pub fn find_pdf_urls(doc: &Html, base_url: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for el in doc.select(&PDF_SELECTOR) {
        let value = el.value();
        let href = value
            .attr("href")
            .or_else(|| value.attr("data"))
            .or_else(|| value.attr("src"));
        let Some(href) = href else { continue };
        let declares_pdf = value
            .attr("type")
            .map(|t| t.trim().eq_ignore_ascii_case("application/pdf"))
            .unwrap_or(false);
        if !href.to_lowercase().ends_with(".pdf") && !declares_pdf {
            continue;
        }
        if let Some(url) = resolve_url(base_url, href) {
            push_new(&mut seen, &mut urls, url);
        }
    }

    urls
}

/// Parse a `srcset` attribute into `(url, width)` entries; width is 0 when
/// the descriptor is missing or not a `w` descriptor.
pub(crate) fn parse_srcset(srcset: &str, base_url: &str) -> Vec<(String, u32)> {
    let mut entries = Vec::new();
    for part in srcset.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut bits = part.split_whitespace();
        let Some(raw) = bits.next() else { continue };
        let width = bits
            .find_map(|b| b.strip_suffix('w').and_then(|n| n.parse::<u32>().ok()))
            .unwrap_or(0);
        if let Some(url) = resolve_url(base_url, raw) {
            entries.push((url, width));
        }
    }
    entries
}

/// Pick the URL with the greatest width; ties (including the no-width
/// case) go to the earliest entry.
pub(crate) fn pick_largest_srcset(entries: &[(String, u32)]) -> Option<String> {
    let best = entries.iter().map(|(_, w)| *w).max()?;
    entries
        .iter()
        .find(|(_, w)| *w == best)
        .map(|(u, _)| u.clone())
}

fn add_image_candidate(
    base_url: &str,
    seen: &mut HashSet<String>,
    urls: &mut Vec<String>,
    value: &str,
    is_srcset: bool,
) {
    if is_srcset {
        let entries = parse_srcset(value, base_url);
        if let Some(best) = pick_largest_srcset(&entries) {
            push_new(seen, urls, best);
        }
    } else if let Some(url) = resolve_url(base_url, value) {
        push_new(seen, urls, url);
    }
}

/// Collect image URLs from `img`, `source`, `video` posters, `a[href]`,
/// `object`/`embed`, `link[rel=preload]`, and inline-style backgrounds.
/// Single pass over the tree; order-preserving dedupe.
pub fn find_image_urls(doc: &Html, base_url: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for el in doc.select(&IMAGE_SELECTOR) {
        let value = el.value();
        match value.name() {
            "img" => {
                if let Some(srcset) = value.attr("srcset") {
                    add_image_candidate(base_url, &mut seen, &mut urls, srcset, true);
                    continue;
                }
                let data_attr = IMG_DATA_ATTRS
                    .iter()
                    .find_map(|a| value.attr(a).map(|v| (*a, v)));
                if let Some((attr, v)) = data_attr {
                    let is_srcset = attr == "data-srcset";
                    add_image_candidate(base_url, &mut seen, &mut urls, v, is_srcset);
                } else if let Some(src) = value.attr("src") {
                    add_image_candidate(base_url, &mut seen, &mut urls, src, false);
                }
            }
            "source" => {
                if let Some(srcset) = value.attr("srcset") {
                    add_image_candidate(base_url, &mut seen, &mut urls, srcset, true);
                } else if let Some(src) = value.attr("src") {
                    if looks_like_image(src) {
                        add_image_candidate(base_url, &mut seen, &mut urls, src, false);
                    }
                }
            }
            "video" => {
                if let Some(poster) = value.attr("poster") {
                    add_image_candidate(base_url, &mut seen, &mut urls, poster, false);
                }
            }
            "a" => {
                if let Some(href) = value.attr("href") {
                    let href = href.trim();
                    if !href.is_empty() && looks_like_image(href) {
                        add_image_candidate(base_url, &mut seen, &mut urls, href, false);
                    }
                }
            }
            "object" | "embed" => {
                let data = value.attr("data").or_else(|| value.attr("src"));
                if let Some(data) = data {
                    if looks_like_image(data) {
                        add_image_candidate(base_url, &mut seen, &mut urls, data, false);
                    }
                }
            }
            _ => {}
        }
    }

    // link[rel="preload"][as="image"] (common in modern galleries)
    for el in doc.select(&PRELOAD_SELECTOR) {
        if let Some(href) = el.value().attr("href") {
            add_image_candidate(base_url, &mut seen, &mut urls, href, false);
        }
    }

    // style="background-image: url(...)" and friends
    for el in doc.select(&STYLE_SELECTOR) {
        let Some(style) = el.value().attr("style") else {
            continue;
        };
        for cap in STYLE_URL_RE.captures_iter(style) {
            let raw = cap[1].trim();
            if !raw.is_empty() && !raw.starts_with("data:") && looks_like_image(raw) {
                add_image_candidate(base_url, &mut seen, &mut urls, raw, false);
            }
        }
    }

    urls
}

/// Apply the thumbnail→full substitution table. Returns the input URL when
/// no rule fires.
pub fn get_best_image_url(url: &str) -> String {
    let mut result = url.to_string();
    for (pattern, replacement) in THUMB_TO_FULL.iter() {
        result = pattern.replace_all(&result, *replacement).into_owned();
    }
    result
}

const PAGE_LINK_ASSET_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".zip",
];

/// Find links to HTML pages for crawling: http(s) only, no asset
/// extensions, optional same-host filter.
pub fn find_page_links(doc: &Html, base_url: &str, same_host: Option<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for el in doc.select(&ANCHOR_SELECTOR) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let Some(abs) = resolve_url(base_url, href) else {
            continue;
        };
        let Ok(parsed) = Url::parse(&abs) else {
            continue;
        };
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            continue;
        }
        let path = parsed.path().to_lowercase();
        if PAGE_LINK_ASSET_EXTENSIONS
            .iter()
            .any(|ext| path.ends_with(ext))
        {
            continue;
        }
        if let Some(host) = same_host {
            if parsed.host_str() != Some(host) {
                continue;
            }
        }
        push_new(&mut seen, &mut urls, abs);
    }

    urls
}

/// All attribute values of an element, for manifest-attribute scans.
pub(crate) fn element_attrs(el: &ElementRef) -> Vec<(String, String)> {
    el.value()
        .attrs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str) -> Html {
        Html::parse_document(html)
    }

    #[test]
    fn test_find_pdf_urls_resolves_and_dedupes() {
        let doc = parse(
            r#"<a href="/a.pdf">A</a>
               <a href="./b.pdf">B</a>
               <a href="/a.pdf">A again</a>
               <object data="/c.pdf"></object>
               <embed src="viewer" type="application/pdf">
               <a href="/page.html">not a pdf</a>"#,
        );
        let urls = find_pdf_urls(&doc, "http://example.test/docs.html");
        assert_eq!(
            urls,
            vec![
                "http://example.test/a.pdf",
                "http://example.test/b.pdf",
                "http://example.test/c.pdf",
                "http://example.test/viewer",
            ]
        );
    }

    #[test]
    fn test_srcset_picks_largest_width() {
        let doc = parse(
            r#"<img srcset="/s.jpg 320w, /m.jpg 800w, /l.jpg 1600w" src="/fallback.jpg">"#,
        );
        let urls = find_image_urls(&doc, "https://example.com/");
        assert_eq!(urls, vec!["https://example.com/l.jpg"]);
    }

    #[test]
    fn test_srcset_without_widths_picks_first() {
        let entries = parse_srcset("/one.jpg, /two.jpg 2x", "https://example.com/");
        assert_eq!(
            pick_largest_srcset(&entries).unwrap(),
            "https://example.com/one.jpg"
        );
    }

    #[test]
    fn test_data_attr_preference_over_src() {
        let doc = parse(r#"<img data-zoom-src="/zoom.jpg" data-src="/lazy.jpg" src="/s.jpg">"#);
        let urls = find_image_urls(&doc, "https://example.com/");
        assert_eq!(urls, vec!["https://example.com/zoom.jpg"]);
    }

    #[test]
    fn test_video_poster_and_anchor_hints() {
        let doc = parse(
            r#"<video poster="/poster.jpg"></video>
               <a href="/gallery/item/42">gallery link</a>
               <a href="/about.html">about</a>"#,
        );
        let urls = find_image_urls(&doc, "https://example.com/");
        assert_eq!(
            urls,
            vec![
                "https://example.com/poster.jpg",
                "https://example.com/gallery/item/42",
            ]
        );
    }

    #[test]
    fn test_pseudo_urls_dropped() {
        let doc = parse(
            r##"<img src="data:image/png;base64,xyz">
               <a href="javascript:void(0)">x</a>
               <a href="#top">y</a>
               <img src="/real.png">"##,
        );
        let urls = find_image_urls(&doc, "https://example.com/");
        assert_eq!(urls, vec!["https://example.com/real.png"]);
    }

    #[test]
    fn test_preload_and_style_backgrounds() {
        let doc = parse(
            r#"<link rel="preload" as="image" href="/hero.webp">
               <div style="background-image: url('/bg.jpg')">x</div>"#,
        );
        let urls = find_image_urls(&doc, "https://example.com/");
        assert_eq!(
            urls,
            vec!["https://example.com/hero.webp", "https://example.com/bg.jpg"]
        );
    }

    #[test]
    fn test_should_skip_image_url() {
        assert!(should_skip_image_url("https://e.com/favicon.ico"));
        assert!(should_skip_image_url("https://e.com/img/icon_facebook.png"));
        assert!(should_skip_image_url(
            "https://www.facebook.com/tr?id=1&ev=PageView"
        ));
        assert!(should_skip_image_url(
            "https://www.google-analytics.com/collect"
        ));
        assert!(!should_skip_image_url("https://e.com/photos/cat.jpg"));
    }

    #[test]
    fn test_find_page_links_filters() {
        let doc = parse(
            r#"<a href="/next.html">next</a>
               <a href="https://other.test/page">other</a>
               <a href="/file.pdf">pdf</a>
               <a href="/pic.jpg">jpg</a>
               <a href="ftp://example.com/x">ftp</a>"#,
        );
        let all = find_page_links(&doc, "https://example.com/", None);
        assert_eq!(
            all,
            vec!["https://example.com/next.html", "https://other.test/page"]
        );
        let same = find_page_links(&doc, "https://example.com/", Some("example.com"));
        assert_eq!(same, vec!["https://example.com/next.html"]);
    }

    #[test]
    fn test_thumb_to_full_substitutions() {
        assert_eq!(
            get_best_image_url("https://e.com/thumbs/a.jpg"),
            "https://e.com/full/a.jpg"
        );
        assert_eq!(
            get_best_image_url("https://e.com/small/a.jpg"),
            "https://e.com/large/a.jpg"
        );
        assert_eq!(
            get_best_image_url("https://e.com/a-thumb.jpg"),
            "https://e.com/a.jpg"
        );
        assert_eq!(
            get_best_image_url("https://e.com/thumb/a.jpg"),
            "https://e.com/original/a.jpg"
        );
        // "/thumbnail/" is caught by the first rule, not the generic word swap
        assert_eq!(
            get_best_image_url("https://e.com/thumbnail/a.jpg"),
            "https://e.com/full/a.jpg"
        );
        assert_eq!(
            get_best_image_url("https://e.com/p/photo_s.thumbnail.png"),
            "https://e.com/p/photo_s.original.png"
        );
        // No rule fires: unchanged
        assert_eq!(
            get_best_image_url("https://e.com/images/a.jpg"),
            "https://e.com/images/a.jpg"
        );
    }

    #[test]
    fn test_image_urls_no_skip_patterns_after_dedupe() {
        let doc = parse(
            r#"<img src="/a.jpg"><img src="/a.jpg"><img src="/b.jpg">"#,
        );
        let urls = find_image_urls(&doc, "https://example.com/");
        let unique: std::collections::HashSet<_> = urls.iter().collect();
        assert_eq!(unique.len(), urls.len());
    }
}
