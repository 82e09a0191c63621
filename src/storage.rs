//! On-disk layout, filename sanitization, and the per-host manifest.
//!
//! Output structure: `<out_dir>/<host_slug>/{pdfs,images,texts}/`.
//! The manifest maps source URLs to the local paths they were saved at.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

/// Maximum length for a sanitized basename.
const MAX_BASENAME_LEN: usize = 200;
/// Maximum length for a text-page slug.
const MAX_SLUG_LEN: usize = 150;

/// Extract and sanitize the host from a URL for use as a directory name.
/// Characters outside `[A-Za-z0-9._-]` become underscores; empty → "unknown".
pub fn sanitize_host(url: &str) -> String {
    let host = Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default();
    let slug: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

fn sanitize_chars(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// True when `ident` is an all-digit record id or a 36-char hyphenated hex UUID.
fn is_iiif_identifier(ident: &str) -> bool {
    if !ident.is_empty() && ident.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    ident.len() == 36
        && ident.matches('-').count() == 4
        && ident.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

/// Sanitize a URL into a safe basename. IIIF Image API URLs
/// (`/image/{ident}/.../full/...`) take `{ident}_{last_segment}` so distinct
/// canvases served as `default.jpg` never collide.
pub fn sanitize_basename(url: &str, default_ext: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let path_lower = path.to_lowercase();

    let mut name = String::new();
    if path_lower.contains("/image/") && path_lower.contains("/full/") && parts.len() >= 2 {
        if let Some(idx) = parts.iter().position(|p| p.eq_ignore_ascii_case("image")) {
            if idx + 1 < parts.len() && is_iiif_identifier(parts[idx + 1]) {
                let last = parts.last().copied().unwrap_or("default");
                name = format!("{}_{}", parts[idx + 1], last);
            }
        }
    }
    if name.is_empty() {
        name = parts.last().copied().unwrap_or("index").to_string();
    }

    let name = name.split('?').next().unwrap_or("");
    let mut name = sanitize_chars(name);
    name = name.trim_matches('_').to_string();
    if name.is_empty() {
        name = "file".to_string();
    }
    if name.len() > MAX_BASENAME_LEN {
        name.truncate(MAX_BASENAME_LEN);
    }
    if !default_ext.is_empty()
        && !name
            .to_lowercase()
            .ends_with(&format!(".{}", default_ext.to_lowercase()))
        && !name.contains('.')
    {
        name = format!("{}.{}", name, default_ext);
    }
    name
}

/// Create a slug for a page URL, used for text output filenames.
pub fn slug_from_url(url: &str) -> String {
    let path = Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string());
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let slug = if parts.is_empty() {
        "index".to_string()
    } else {
        parts.join("_")
    };
    let mut slug = sanitize_chars(&slug).trim_matches('_').to_string();
    if slug.is_empty() {
        slug = "index".to_string();
    }
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
    }
    slug
}

/// Map an image MIME type to a file extension.
fn image_mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        _ => None,
    }
}

const IMAGE_URL_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".bmp", ".ico",
];

/// If the path exists, append `_1`, `_2`, ... until it does not.
fn ensure_unique(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut n = 1;
    loop {
        let candidate = parent.join(format!("{}_{}{}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Canonical path for a PDF (no uniqueness suffix); use for skip-if-exists.
pub fn path_for_pdf_canonical(out_dir: &Path, host: &str, url: &str) -> PathBuf {
    let base = sanitize_basename(url, "pdf");
    out_dir.join(host).join("pdfs").join(base)
}

/// Full path for a PDF, suffixed to avoid overwriting an existing file.
pub fn path_for_pdf(out_dir: &Path, host: &str, url: &str) -> PathBuf {
    ensure_unique(path_for_pdf_canonical(out_dir, host, url))
}

/// Canonical path for an image. Extension inference: Content-Type mapping,
/// then URL extension, then `bin`.
pub fn path_for_image_canonical(
    out_dir: &Path,
    host: &str,
    url: &str,
    content_type: Option<&str>,
) -> PathBuf {
    let mut ext = content_type.and_then(image_mime_to_extension).unwrap_or("");
    if ext.is_empty() {
        let path = Url::parse(url)
            .map(|u| u.path().to_lowercase())
            .unwrap_or_default();
        for e in IMAGE_URL_EXTENSIONS {
            if path.ends_with(e) {
                ext = &e[1..];
                break;
            }
        }
    }
    let ext = if ext.is_empty() { "bin" } else { ext };
    let mut base = sanitize_basename(url, ext);
    if !base.to_lowercase().ends_with(&format!(".{ext}")) && !base.contains('.') {
        base = format!("{base}.{ext}");
    }
    out_dir.join(host).join("images").join(base)
}

/// Full path for an image, suffixed to avoid overwriting an existing file.
pub fn path_for_image(
    out_dir: &Path,
    host: &str,
    url: &str,
    content_type: Option<&str>,
) -> PathBuf {
    ensure_unique(path_for_image_canonical(out_dir, host, url, content_type))
}

/// Canonical path for extracted page text.
pub fn path_for_text_canonical(out_dir: &Path, host: &str, url: &str) -> PathBuf {
    let slug = slug_from_url(url);
    out_dir.join(host).join("texts").join(format!("{slug}.txt"))
}

/// Full path for extracted page text, suffixed to avoid overwrite.
pub fn path_for_text(out_dir: &Path, host: &str, url: &str) -> PathBuf {
    ensure_unique(path_for_text_canonical(out_dir, host, url))
}

/// Write text as UTF-8, creating parent directories.
pub fn write_text(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)
}

/// Per-host record of what was downloaded and where it went.
///
/// Keys of `urls` are always a subset of keys of `types`; paths recorded
/// here point at files that existed when the manifest was saved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
    #[serde(default)]
    pub types: BTreeMap<String, String>,
}

impl Manifest {
    /// Record a downloaded asset.
    pub fn record(&mut self, url: &str, path: &Path, content_type: &str) {
        self.urls
            .insert(url.to_string(), path.display().to_string());
        self.types.insert(url.to_string(), content_type.to_string());
    }

    /// True when the source URL has already been recorded.
    pub fn contains_url(&self, url: &str) -> bool {
        self.urls.contains_key(url)
    }
}

/// Path of the per-host manifest file.
pub fn manifest_path(out_dir: &Path, host: &str) -> PathBuf {
    out_dir.join(host).join("manifest.json")
}

/// Load a manifest; missing or malformed files yield an empty one.
pub fn load_manifest(path: &Path) -> Manifest {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => Manifest::default(),
    }
}

/// Save a manifest as pretty-printed JSON, creating parent directories.
pub fn save_manifest(path: &Path, manifest: &Manifest) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}
