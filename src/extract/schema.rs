//! Image storage schema detection.
//!
//! Classifies a page into {CONTENTdm, NYPL, generic IIIF, generic HTML} and
//! collects image URLs with the matching strategy. Detection and DOM work
//! happen synchronously in [`ImagePlan::build`]; manifest fetches happen in
//! [`ImagePlan::resolve`] (the parsed DOM cannot cross an await point).

use scraper::Html;
use tracing::debug;

use super::iiif::{
    find_contentdm_full_res_urls, find_derived_iiif_manifest_urls, find_iiif_manifest_urls,
    find_nypl_iiif_image_urls, find_nypl_manifest_urls, html_has_contentdm_iiif,
    is_contentdm_item_url, is_nypl_item_url, parse_iiif_manifest,
};
use super::{find_image_urls, should_skip_image_url};
use crate::fetch::Fetcher;

/// Image storage schema used by a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// NYPL Digital Collections (manifest at api-collections).
    Nypl,
    /// OCLC CONTENTdm IIIF.
    ContentDm,
    /// Generic IIIF (manifest in iframe/link/attribute).
    IiifManifest,
    /// Standard img, srcset, data-src, etc.
    GenericHtml,
}

/// A detected schema with its confidence (0–1).
#[derive(Debug, Clone, Copy)]
pub struct Detection {
    pub schema: SchemaKind,
    pub confidence: f32,
}

/// Detect which image storage schemas apply to a page, highest confidence
/// first. Generic HTML is always present as the final entry.
pub fn detect_image_schemas(url: &str, doc: &Html, raw_html: &str) -> Vec<Detection> {
    let mut detections = Vec::new();

    // NYPL: the URL pattern is definitive
    if is_nypl_item_url(url) {
        detections.push(Detection {
            schema: SchemaKind::Nypl,
            confidence: 1.0,
        });
    }

    // CONTENTdm: item URL, or IIIF Image API URLs embedded in the HTML
    if is_contentdm_item_url(url) {
        detections.push(Detection {
            schema: SchemaKind::ContentDm,
            confidence: 0.95,
        });
    } else if html_has_contentdm_iiif(raw_html) {
        detections.push(Detection {
            schema: SchemaKind::ContentDm,
            confidence: 0.8,
        });
    }

    // Generic IIIF: manifest URLs present (NYPL pages use the NYPL path)
    if !detections
        .iter()
        .any(|d| d.schema == SchemaKind::Nypl)
    {
        let found = !find_iiif_manifest_urls(doc, url, raw_html).is_empty()
            || !find_derived_iiif_manifest_urls(url).is_empty();
        if found {
            detections.push(Detection {
                schema: SchemaKind::IiifManifest,
                confidence: 0.9,
            });
        }
    }

    detections.push(Detection {
        schema: SchemaKind::GenericHtml,
        confidence: 0.5,
    });

    detections
}

/// Everything the schema strategies need, gathered from the DOM up front.
#[derive(Debug, Default)]
pub struct ImagePlan {
    pub detections: Vec<Detection>,
    contentdm_urls: Vec<String>,
    nypl_manifest_urls: Vec<String>,
    nypl_fallback_urls: Vec<String>,
    manifest_urls: Vec<String>,
    generic_urls: Vec<String>,
}

impl ImagePlan {
    /// Run detection and gather each schema's candidates from the DOM.
    pub fn build(url: &str, doc: &Html, raw_html: &str) -> Self {
        let detections = detect_image_schemas(url, doc, raw_html);

        let mut plan = ImagePlan {
            detections,
            ..Default::default()
        };

        for detection in &plan.detections.clone() {
            match detection.schema {
                SchemaKind::Nypl => {
                    plan.nypl_manifest_urls = find_nypl_manifest_urls(url);
                    plan.nypl_fallback_urls = find_nypl_iiif_image_urls(raw_html);
                }
                SchemaKind::ContentDm => {
                    plan.contentdm_urls = find_contentdm_full_res_urls(url, raw_html);
                }
                SchemaKind::IiifManifest => {
                    let mut urls = find_iiif_manifest_urls(doc, url, raw_html);
                    for derived in find_derived_iiif_manifest_urls(url) {
                        if !urls.contains(&derived) {
                            urls.push(derived);
                        }
                    }
                    plan.manifest_urls = urls;
                }
                SchemaKind::GenericHtml => {
                    plan.generic_urls = find_image_urls(doc, url);
                }
            }
        }

        plan
    }

    async fn fetch_manifest_images(
        fetcher: &mut Fetcher,
        manifest_url: &str,
        delay: f64,
    ) -> Vec<String> {
        match fetcher.fetch_bytes(manifest_url, delay).await {
            Ok(raw) => match serde_json::from_slice::<serde_json::Value>(&raw) {
                Ok(manifest) => parse_iiif_manifest(&manifest),
                Err(e) => {
                    debug!("unparseable IIIF manifest {}: {}", manifest_url, e);
                    Vec::new()
                }
            },
            Err(e) => {
                debug!("failed to fetch IIIF manifest {}: {}", manifest_url, e);
                Vec::new()
            }
        }
    }

    /// Execute the strategies in confidence order, fetching manifests as
    /// needed. Deduplicates across schemas preserving first insertion,
    /// drops skip-pattern URLs, applies the optional limit.
    pub async fn resolve(
        &self,
        fetcher: &mut Fetcher,
        delay: f64,
        limit: Option<usize>,
    ) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut urls: Vec<String> = Vec::new();

        let mut add = |u: &str, seen: &mut std::collections::HashSet<String>, urls: &mut Vec<String>| {
            if !u.is_empty() && !should_skip_image_url(u) && seen.insert(u.to_string()) {
                urls.push(u.to_string());
            }
        };

        for detection in &self.detections {
            match detection.schema {
                SchemaKind::Nypl => {
                    let mut from_manifest = Vec::new();
                    for manifest_url in &self.nypl_manifest_urls {
                        from_manifest
                            .extend(Self::fetch_manifest_images(fetcher, manifest_url, delay).await);
                    }
                    if from_manifest.is_empty() {
                        // Manifest unavailable: fall back to IIIF 3 URLs in the HTML
                        for u in &self.nypl_fallback_urls {
                            add(u, &mut seen, &mut urls);
                        }
                    } else {
                        for u in &from_manifest {
                            add(u, &mut seen, &mut urls);
                        }
                    }
                }
                SchemaKind::ContentDm => {
                    for u in &self.contentdm_urls {
                        add(u, &mut seen, &mut urls);
                    }
                }
                SchemaKind::IiifManifest => {
                    for manifest_url in &self.manifest_urls {
                        for u in Self::fetch_manifest_images(fetcher, manifest_url, delay).await {
                            add(&u, &mut seen, &mut urls);
                        }
                    }
                }
                SchemaKind::GenericHtml => {
                    for u in &self.generic_urls {
                        add(u, &mut seen, &mut urls);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            urls.truncate(limit);
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetcherConfig;

    fn parse(html: &str) -> Html {
        Html::parse_document(html)
    }

    #[test]
    fn test_detect_nypl() {
        let doc = parse("<html></html>");
        let url = "https://digitalcollections.nypl.org/items/510d47d9-7be2-a3d9-e040-e00a18064a99";
        let detections = detect_image_schemas(url, &doc, "");
        assert_eq!(detections[0].schema, SchemaKind::Nypl);
        assert_eq!(detections[0].confidence, 1.0);
        assert_eq!(
            detections.last().unwrap().schema,
            SchemaKind::GenericHtml
        );
    }

    #[test]
    fn test_detect_contentdm_by_url_and_html() {
        let doc = parse("<html></html>");
        let by_url =
            detect_image_schemas("https://cdm.test/digital/collection/p1/id/42", &doc, "");
        assert_eq!(by_url[0].schema, SchemaKind::ContentDm);
        assert_eq!(by_url[0].confidence, 0.95);

        let html = r#"<img src="https://cdm.test/digital/iiif/2/p1:7/full/200,/0/default.jpg">"#;
        let by_html = detect_image_schemas("https://cdm.test/page", &parse(html), html);
        assert_eq!(by_html[0].schema, SchemaKind::ContentDm);
        assert_eq!(by_html[0].confidence, 0.8);
    }

    #[test]
    fn test_detect_generic_iiif() {
        let html = r#"<iframe src="https://v.example/uv.html#?manifest=https://lib.example/iiif/manifest.json"></iframe>"#;
        let doc = parse(html);
        let detections = detect_image_schemas("https://lib.example/obj", &doc, html);
        assert_eq!(detections[0].schema, SchemaKind::IiifManifest);
        assert_eq!(detections[0].confidence, 0.9);
    }

    #[test]
    fn test_generic_always_last() {
        let doc = parse("<html><img src='/a.jpg'></html>");
        let detections = detect_image_schemas("https://example.com/", &doc, "");
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].schema, SchemaKind::GenericHtml);
        assert_eq!(detections[0].confidence, 0.5);
    }

    #[tokio::test]
    async fn test_resolve_contentdm_before_generic_with_dedupe() {
        let html = r#"<html><body>
            <img src="https://cdm.test/digital/iiif/2/p1:42/full/200,/0/default.jpg">
            <img src="https://cdm.test/extra/cover.jpg">
            <img src="https://cdm.test/favicon.ico">
        </body></html>"#;
        let doc = parse(html);
        let plan = ImagePlan::build("https://cdm.test/digital/collection/p1/id/42", &doc, html);
        let mut fetcher = Fetcher::new(FetcherConfig::default());
        let urls = plan.resolve(&mut fetcher, 0.0, None).await;

        // Full-res rewrite first, generic supplements after, favicon dropped
        assert_eq!(urls[0], "https://cdm.test/digital/iiif/2/p1:42/full/full/0/default.jpg");
        assert!(urls.contains(&"https://cdm.test/extra/cover.jpg".to_string()));
        assert!(!urls.iter().any(|u| u.contains("favicon")));
        let unique: std::collections::HashSet<_> = urls.iter().collect();
        assert_eq!(unique.len(), urls.len());
    }

    #[tokio::test]
    async fn test_resolve_applies_limit() {
        let html = r#"<img src="/a.jpg"><img src="/b.jpg"><img src="/c.jpg">"#;
        let doc = parse(html);
        let plan = ImagePlan::build("https://example.com/", &doc, html);
        let mut fetcher = Fetcher::new(FetcherConfig::default());
        let urls = plan.resolve(&mut fetcher, 0.0, Some(2)).await;
        assert_eq!(urls.len(), 2);
    }
}
