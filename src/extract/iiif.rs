//! IIIF manifest discovery and parsing, plus the CONTENTdm and NYPL
//! digital-library URL derivations.
//!
//! IIIF Image API endpoints have the shape
//! `{id}/{region}/{size}/{rotation}/{quality}.{format}`; region `full` with
//! size `full` (v2) or `max` (v3) yields the source image.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use url::Url;

use super::element_attrs;

/// `manifest=` parameter inside a viewer URL (Universal Viewer, Mirador).
static MANIFEST_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)manifest=([^&\s'"]+manifest\.json)"#).unwrap());
/// Bare manifest.json URLs in attributes or page text.
static MANIFEST_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)https?://[^\s'"<>]+manifest\.json(?:\?[^\s'"]*)?"#).unwrap());
/// CONTENTdm item page: `/digital/collection/{coll}/id/{id}`.
static CONTENTDM_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)/digital/collection/([^/?#]+)/id/(\d+)").unwrap());
/// CONTENTdm IIIF Image API URL with an arbitrary size segment.
static CONTENTDM_IIIF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(https?://[^/]+/digital/iiif/2/[^/]+)/full/[^/]+/\d+/[^/]+\.(jpg|png|webp)")
        .unwrap()
});
/// Digital Bodleian object pages; the manifest lives on iiif.bodleian.ox.ac.uk.
static BODLEIAN_OBJECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)digital\.bodleian\.ox\.ac\.uk/objects/([a-f0-9-]{36})").unwrap());
/// Internet Archive details pages.
static ARCHIVE_ORG_DETAILS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)archive\.org/details/([^/?#]+)").unwrap());
/// Stanford PURL pages.
static STANFORD_PURL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)purl\.stanford\.edu/([a-z0-9_-]+)").unwrap());
/// NYPL Digital Collections item page (JS-heavy; manifest at api-collections).
static NYPL_ITEMS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^https?://(?:www\.)?digitalcollections\.nypl\.org/items/[a-f0-9-]{36}")
        .unwrap()
});
/// NYPL IIIF 3 image URLs embedded in HTML.
static NYPL_IIIF3_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(https?://iiif\.nypl\.org/iiif/3/[a-f0-9]+)/full/[^/]+/\d+/[^/]+\.(jpg|png|webp)")
        .unwrap()
});
static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}").unwrap()
});

static IFRAME_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("iframe[src]").unwrap());
static LINKISH_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href], embed[src], object[data]").unwrap());
static ANY_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("*").unwrap());

/// True when the URL is a CONTENTdm item page.
pub fn is_contentdm_item_url(url: &str) -> bool {
    CONTENTDM_ITEM_RE.is_match(url)
}

/// True when the HTML embeds CONTENTdm IIIF Image API URLs.
pub fn html_has_contentdm_iiif(raw_html: &str) -> bool {
    CONTENTDM_IIIF_RE.is_match(raw_html)
}

/// True when the URL is an NYPL Digital Collections item page.
pub fn is_nypl_item_url(url: &str) -> bool {
    NYPL_ITEMS_RE.is_match(url)
}

/// Derive full-resolution IIIF image URLs for CONTENTdm pages: the item
/// page's own `{origin}/digital/iiif/2/{coll}:{id}/full/full/0/default.jpg`
/// plus any in-HTML thumbnail rewritten to full size.
pub fn find_contentdm_full_res_urls(page_url: &str, raw_html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    if let Ok(parsed) = Url::parse(page_url) {
        let origin = format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default()
        );
        if let Some(caps) = CONTENTDM_ITEM_RE.captures(parsed.path()) {
            let full_url = format!(
                "{}/digital/iiif/2/{}:{}/full/full/0/default.jpg",
                origin, &caps[1], &caps[2]
            );
            if seen.insert(full_url.clone()) {
                out.push(full_url);
            }
        }
    }

    for caps in CONTENTDM_IIIF_RE.captures_iter(raw_html) {
        let full_url = format!("{}/full/full/0/default.{}", &caps[1], caps[2].to_lowercase());
        if seen.insert(full_url.clone()) {
            out.push(full_url);
        }
    }

    out
}

/// For NYPL item pages, the manifest lives at api-collections.nypl.org.
pub fn find_nypl_manifest_urls(page_url: &str) -> Vec<String> {
    if !NYPL_ITEMS_RE.is_match(page_url) {
        return Vec::new();
    }
    match UUID_RE.find(page_url) {
        Some(m) => vec![format!(
            "https://api-collections.nypl.org/manifests/{}",
            m.as_str()
        )],
        None => Vec::new(),
    }
}

/// Extract NYPL IIIF 3 image URLs from HTML, rewriting the size segment to
/// `full/max` (IIIF 3 spells full size "max").
pub fn find_nypl_iiif_image_urls(raw_html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in NYPL_IIIF3_RE.captures_iter(raw_html) {
        let full_url = format!("{}/full/max/0/default.{}", &caps[1], &caps[2]);
        if seen.insert(full_url.clone()) {
            out.push(full_url);
        }
    }
    out
}

fn add_manifest_candidate(
    candidate: &str,
    base_url: &str,
    seen: &mut HashSet<String>,
    urls: &mut Vec<String>,
) {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return;
    }
    let lower = candidate.to_lowercase();
    // Must be a manifest endpoint, not a viewer URL that embeds manifest=
    if !lower.contains("/manifest.json") || lower.contains("uv.html") || lower.contains("mirador") {
        return;
    }
    let abs = match Url::parse(base_url).and_then(|b| b.join(candidate)) {
        Ok(u) => u.to_string(),
        Err(_) => return,
    };
    if seen.insert(abs.clone()) {
        urls.push(abs);
    }
}

fn scan_manifest_text(
    text: &str,
    base_url: &str,
    seen: &mut HashSet<String>,
    urls: &mut Vec<String>,
) {
    for caps in MANIFEST_PARAM_RE.captures_iter(text) {
        add_manifest_candidate(&caps[1], base_url, seen, urls);
    }
    for m in MANIFEST_URL_RE.find_iter(text) {
        add_manifest_candidate(m.as_str(), base_url, seen, urls);
    }
}

/// Find IIIF manifest URLs in iframes (Universal Viewer, Mirador), links,
/// manifest-named attributes, and raw page text. Absolute, deduplicated.
pub fn find_iiif_manifest_urls(doc: &Html, base_url: &str, raw_html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for iframe in doc.select(&IFRAME_SELECTOR) {
        if let Some(src) = iframe.value().attr("src") {
            scan_manifest_text(src, base_url, &mut seen, &mut urls);
        }
    }

    for el in doc.select(&LINKISH_SELECTOR) {
        let value = el.value();
        let attr = value
            .attr("href")
            .or_else(|| value.attr("src"))
            .or_else(|| value.attr("data"))
            .unwrap_or("");
        scan_manifest_text(attr, base_url, &mut seen, &mut urls);
    }

    // data-manifest, data-iiif-manifest, and similar
    for el in doc.select(&ANY_SELECTOR) {
        for (name, value) in element_attrs(&el) {
            if name.to_lowercase().contains("manifest") && !value.is_empty() {
                scan_manifest_text(&value, base_url, &mut seen, &mut urls);
                add_manifest_candidate(&value, base_url, &mut seen, &mut urls);
            }
        }
    }

    scan_manifest_text(raw_html, base_url, &mut seen, &mut urls);

    urls
}

/// Derive manifest URLs from known page-URL patterns where the manifest is
/// never present in the HTML (JS-heavy viewers).
pub fn find_derived_iiif_manifest_urls(page_url: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();

    let mut add = |candidate: &str| {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return;
        }
        let decoded = urlencoding::decode(candidate)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| candidate.to_string());
        if !decoded.starts_with("http://") && !decoded.starts_with("https://") {
            return;
        }
        let lower = decoded.to_lowercase();
        if (lower.contains("manifest") || lower.contains("/iiif/")) && !urls.contains(&decoded) {
            urls.push(decoded);
        }
    };

    let parsed = match Url::parse(page_url) {
        Ok(u) => u,
        Err(_) => return urls,
    };
    let host = parsed.host_str().unwrap_or_default().to_lowercase();
    let combined = format!("{}{}", host, parsed.path());

    // manifest= / iiif-content= in the query string or fragment
    for part in [parsed.query().unwrap_or(""), parsed.fragment().unwrap_or("")] {
        let part = part.strip_prefix('?').unwrap_or(part);
        if part.is_empty() {
            continue;
        }
        for (key, value) in url::form_urlencoded::parse(part.as_bytes()) {
            if matches!(&*key, "manifest" | "iiif-content" | "iiif_content") {
                add(&value);
            }
        }
    }

    if let Some(caps) = BODLEIAN_OBJECT_RE.captures(&combined) {
        add(&format!(
            "https://iiif.bodleian.ox.ac.uk/iiif/manifest/{}.json",
            &caps[1]
        ));
    }
    if let Some(caps) = ARCHIVE_ORG_DETAILS_RE.captures(&combined) {
        add(&format!(
            "https://iiif.archive.org/iiif/{}/manifest.json",
            &caps[1]
        ));
    }
    if let Some(caps) = STANFORD_PURL_RE.captures(&combined) {
        add(&format!(
            "https://purl.stanford.edu/{}/iiif/manifest",
            &caps[1]
        ));
    }

    urls
}

/// Rewrite an IIIF image URL to full resolution, leaving already-full URLs
/// untouched.
fn to_full_res_iiif(url: &str) -> String {
    if url.contains("/full/max/") || url.contains("/full/full/") {
        return url.to_string();
    }
    if url.contains("/full/") && url.to_lowercase().contains("iiif") {
        let base = url.split("/full/").next().unwrap_or(url);
        let tail = match url.find("/0/default.") {
            Some(idx) => &url[idx..],
            None => "/0/default.jpg",
        };
        return format!("{}/full/max{}", base, tail);
    }
    url.to_string()
}

fn service_id(service: &Value) -> Option<String> {
    let entry = match service {
        Value::Array(items) => items.first()?,
        other => other,
    };
    entry
        .get("@id")
        .or_else(|| entry.get("id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
}

/// Best image URL for an annotation body or v2 resource: prefer the image
/// service's full-size endpoint, then a IIIF-looking or image-suffixed id.
fn image_from_resource(resource: &Value) -> Option<String> {
    if let Some(sid) = resource.get("service").and_then(service_id) {
        return Some(format!(
            "{}/full/max/0/default.jpg",
            sid.trim_end_matches('/')
        ));
    }
    let rid = resource
        .get("@id")
        .or_else(|| resource.get("id"))
        .and_then(Value::as_str)?;
    let lower = rid.to_lowercase();
    if lower.contains("iiif")
        || lower.ends_with(".jpg")
        || lower.ends_with(".jpeg")
        || lower.ends_with(".png")
        || lower.ends_with(".webp")
    {
        return Some(to_full_res_iiif(rid));
    }
    None
}

/// Pick a full-resolution URL from a canvas `rendering` list (NYPL lists
/// an "Original" rendering alongside derivatives).
fn best_url_from_rendering(rendering: &Value) -> Option<String> {
    let items = rendering.as_array()?;
    let mut full_full = None;
    for entry in items {
        let rid = entry
            .get("id")
            .or_else(|| entry.get("@id"))
            .and_then(Value::as_str);
        let Some(rid) = rid else { continue };
        if rid.contains("/full/max/") {
            return Some(rid.to_string());
        }
        if rid.contains("/full/full/") {
            full_full = Some(rid.to_string());
        }
    }
    full_full
}

fn walk_canvas(canvas: &Value, add: &mut dyn FnMut(String)) {
    // NYPL-style rendering options take priority
    if let Some(rendering) = canvas.get("rendering") {
        if let Some(url) = best_url_from_rendering(rendering) {
            add(url);
            return;
        }
    }

    // IIIF 3: canvas.items -> annotation pages -> annotations -> body
    if let Some(pages) = canvas.get("items").and_then(Value::as_array) {
        for page in pages {
            let Some(annotations) = page.get("items").and_then(Value::as_array) else {
                continue;
            };
            for annotation in annotations {
                if let Some(body) = annotation.get("body") {
                    if let Some(url) = image_from_resource(body) {
                        add(url);
                        return;
                    }
                }
            }
        }
    }

    // IIIF 2: canvas.images -> resource
    if let Some(images) = canvas.get("images").and_then(Value::as_array) {
        for img in images {
            if let Some(resource) = img.get("resource") {
                if let Some(url) = image_from_resource(resource) {
                    add(url);
                }
            }
        }
    }
}

/// Parse a IIIF 2.0 or 3.0 manifest; returns full-size image URLs, one per
/// canvas, in document order.
pub fn parse_iiif_manifest(manifest: &Value) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    let mut add = |url: String| {
        if seen.insert(url.clone()) {
            urls.push(url);
        }
    };

    let top = manifest
        .get("sequences")
        .and_then(Value::as_array)
        .or_else(|| manifest.get("items").and_then(Value::as_array));
    let Some(top) = top else {
        return urls;
    };

    for thing in top {
        if thing.get("type").and_then(Value::as_str) == Some("Canvas") {
            walk_canvas(thing, &mut add);
        } else {
            let canvases = thing
                .get("canvases")
                .and_then(Value::as_array)
                .or_else(|| thing.get("items").and_then(Value::as_array));
            if let Some(canvases) = canvases {
                for canvas in canvases {
                    walk_canvas(canvas, &mut add);
                }
            }
        }
    }

    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contentdm_item_derivation() {
        let urls = find_contentdm_full_res_urls("https://cdm.test/digital/collection/p1/id/42", "");
        assert_eq!(
            urls,
            vec!["https://cdm.test/digital/iiif/2/p1:42/full/full/0/default.jpg"]
        );
    }

    #[test]
    fn test_contentdm_thumbnail_rewrite() {
        let html = r#"<img src="https://cdm.test/digital/iiif/2/p1:42/full/pct:15/0/default.jpg">"#;
        let urls = find_contentdm_full_res_urls("https://cdm.test/somewhere", html);
        assert_eq!(
            urls,
            vec!["https://cdm.test/digital/iiif/2/p1:42/full/full/0/default.jpg"]
        );
    }

    #[test]
    fn test_nypl_manifest_url_derivation() {
        let urls = find_nypl_manifest_urls(
            "https://digitalcollections.nypl.org/items/510d47d9-7be2-a3d9-e040-e00a18064a99",
        );
        assert_eq!(
            urls,
            vec![
                "https://api-collections.nypl.org/manifests/510d47d9-7be2-a3d9-e040-e00a18064a99"
            ]
        );
        assert!(find_nypl_manifest_urls("https://example.com/items/xyz").is_empty());
    }

    #[test]
    fn test_nypl_iiif3_rewrite() {
        let html = r#"src="https://iiif.nypl.org/iiif/3/abc123/full/!760,760/0/default.jpg""#;
        let urls = find_nypl_iiif_image_urls(html);
        assert_eq!(
            urls,
            vec!["https://iiif.nypl.org/iiif/3/abc123/full/max/0/default.jpg"]
        );
    }

    #[test]
    fn test_manifest_urls_from_iframe() {
        let doc = Html::parse_document(
            r#"<iframe src="https://viewer.example/uv.html#?manifest=https://lib.example/iiif/manifest.json"></iframe>"#,
        );
        let urls = find_iiif_manifest_urls(&doc, "https://lib.example/page", "");
        assert_eq!(urls, vec!["https://lib.example/iiif/manifest.json"]);
    }

    #[test]
    fn test_manifest_urls_skip_viewer_urls() {
        let doc = Html::parse_document(
            r#"<a href="https://viewer.example/uv.html?manifest=x/manifest.json">view</a>"#,
        );
        // The embedded manifest= value is extracted; the uv.html URL itself is not
        let urls = find_iiif_manifest_urls(&doc, "https://lib.example/", "");
        assert_eq!(urls, vec!["https://lib.example/x/manifest.json"]);
    }

    #[test]
    fn test_manifest_urls_from_data_attribute() {
        let doc = Html::parse_document(
            r#"<div data-iiif-manifest="https://lib.example/obj/1/manifest.json"></div>"#,
        );
        let urls = find_iiif_manifest_urls(&doc, "https://lib.example/", "");
        assert_eq!(urls, vec!["https://lib.example/obj/1/manifest.json"]);
    }

    #[test]
    fn test_derived_manifest_urls() {
        let urls = find_derived_iiif_manifest_urls(
            "https://digital.bodleian.ox.ac.uk/objects/12345678-1234-1234-1234-123456789abc/",
        );
        assert_eq!(
            urls,
            vec![
                "https://iiif.bodleian.ox.ac.uk/iiif/manifest/12345678-1234-1234-1234-123456789abc.json"
            ]
        );

        let urls = find_derived_iiif_manifest_urls("https://archive.org/details/someitem/page/n1");
        assert_eq!(
            urls,
            vec!["https://iiif.archive.org/iiif/someitem/manifest.json"]
        );

        let urls = find_derived_iiif_manifest_urls("https://purl.stanford.edu/ab123cd4567");
        assert_eq!(
            urls,
            vec!["https://purl.stanford.edu/ab123cd4567/iiif/manifest"]
        );
    }

    #[test]
    fn test_derived_manifest_from_fragment_param() {
        let urls = find_derived_iiif_manifest_urls(
            "https://viewer.example/uv.html#?manifest=https%3A%2F%2Flib.example%2Fiiif%2Fmanifest.json",
        );
        assert_eq!(urls, vec!["https://lib.example/iiif/manifest.json"]);
    }

    #[test]
    fn test_parse_v2_manifest() {
        let manifest = json!({
            "@context": "http://iiif.io/api/presentation/2/context.json",
            "sequences": [{
                "canvases": [
                    {"images": [{"resource": {
                        "@id": "https://lib.example/iiif/img1/full/!512,512/0/default.jpg",
                        "service": {"@id": "https://lib.example/iiif/img1"}
                    }}]},
                    {"images": [{"resource": {
                        "@id": "https://lib.example/iiif/img2/full/!512,512/0/default.jpg",
                        "service": {"@id": "https://lib.example/iiif/img2"}
                    }}]}
                ]
            }]
        });
        let urls = parse_iiif_manifest(&manifest);
        assert_eq!(
            urls,
            vec![
                "https://lib.example/iiif/img1/full/max/0/default.jpg",
                "https://lib.example/iiif/img2/full/max/0/default.jpg",
            ]
        );
        for u in &urls {
            assert!(u.contains("/full/max/") || u.contains("/full/full/"));
        }
    }

    #[test]
    fn test_parse_v3_manifest() {
        let manifest = json!({
            "items": [{
                "type": "Canvas",
                "items": [{
                    "items": [{
                        "body": {
                            "id": "https://lib.example/iiif/3/p1/full/600,/0/default.png",
                            "service": [{"id": "https://lib.example/iiif/3/p1"}]
                        }
                    }]
                }]
            }]
        });
        let urls = parse_iiif_manifest(&manifest);
        assert_eq!(urls, vec!["https://lib.example/iiif/3/p1/full/max/0/default.jpg"]);
    }

    #[test]
    fn test_rendering_preferred_over_body() {
        let manifest = json!({
            "items": [{
                "type": "Canvas",
                "rendering": [
                    {"id": "https://lib.example/iiif/p1/full/760,/0/default.jpg"},
                    {"id": "https://lib.example/iiif/p1/full/max/0/default.jpg"}
                ],
                "items": [{"items": [{"body": {"id": "https://lib.example/other.jpg"}}]}]
            }]
        });
        let urls = parse_iiif_manifest(&manifest);
        assert_eq!(urls, vec!["https://lib.example/iiif/p1/full/max/0/default.jpg"]);
    }

    #[test]
    fn test_rendering_full_full_fallback() {
        let rendering = json!([
            {"id": "https://lib.example/iiif/p1/full/500,/0/default.jpg"},
            {"id": "https://lib.example/iiif/p1/full/full/0/default.jpg"}
        ]);
        assert_eq!(
            best_url_from_rendering(&rendering).unwrap(),
            "https://lib.example/iiif/p1/full/full/0/default.jpg"
        );
    }

    #[test]
    fn test_to_full_res_leaves_full_urls() {
        assert_eq!(
            to_full_res_iiif("https://x/iiif/a/full/full/0/default.jpg"),
            "https://x/iiif/a/full/full/0/default.jpg"
        );
        assert_eq!(
            to_full_res_iiif("https://x/iiif/a/full/300,/0/default.jpg"),
            "https://x/iiif/a/full/max/0/default.jpg"
        );
    }

    #[test]
    fn test_empty_manifest() {
        assert!(parse_iiif_manifest(&json!({})).is_empty());
        assert!(parse_iiif_manifest(&json!({"items": []})).is_empty());
    }
}
