//! Readable-text extraction from a parsed page.

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector};

/// Subtrees that never contribute readable text.
const STRIP_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "noscript", "iframe",
];

/// Semantic containers likely to hold the main content, in preference order.
static CONTENT_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("main, article, [role='main'], .content, .article, .post-content, .entry-content")
        .unwrap()
});
static BODY_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());

fn collect_text(el: ElementRef, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => {
                let s = t.trim();
                if !s.is_empty() {
                    out.push_str(s);
                    out.push('\n');
                }
            }
            Node::Element(e) => {
                if STRIP_TAGS.contains(&e.name()) {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    collect_text(child_el, out);
                }
            }
            _ => {}
        }
    }
}

/// Normalize whitespace: trim each line, drop blanks.
fn normalize_text(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract the main text of a page. Takes the first semantic content
/// container (`main`, `article`, ...), falling back to `body`, stripping
/// script/style/navigation subtrees along the way. Output is UTF-8 with
/// blank lines collapsed.
pub fn extract_text(doc: &Html) -> String {
    let container = doc
        .select(&CONTENT_SELECTOR)
        .next()
        .or_else(|| doc.select(&BODY_SELECTOR).next())
        .unwrap_or_else(|| doc.root_element());

    let mut raw = String::new();
    collect_text(container, &mut raw);
    normalize_text(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_semantic_container() {
        let doc = Html::parse_document(
            r#"<html><body>
                <nav>Menu items</nav>
                <main><p>Hello</p><p>World</p></main>
                <footer>Footer junk</footer>
            </body></html>"#,
        );
        let text = extract_text(&doc);
        assert_eq!(text, "Hello\nWorld");
    }

    #[test]
    fn test_strips_noise_subtrees() {
        let doc = Html::parse_document(
            r#"<html><body>
                <script>var x = 1;</script>
                <style>.a { color: red }</style>
                <p>Visible</p>
                <aside>Sidebar</aside>
            </body></html>"#,
        );
        let text = extract_text(&doc);
        assert_eq!(text, "Visible");
    }

    #[test]
    fn test_article_class_fallbacks() {
        let doc = Html::parse_document(
            r#"<html><body>
                <div class="post-content"><p>Body text here.</p></div>
                <div>Unrelated</div>
            </body></html>"#,
        );
        assert_eq!(extract_text(&doc), "Body text here.");
    }

    #[test]
    fn test_blank_lines_collapsed() {
        let doc = Html::parse_document(
            "<html><body><p>a</p>\n\n\n<p>   </p><p>b</p></body></html>",
        );
        assert_eq!(extract_text(&doc), "a\nb");
    }

    #[test]
    fn test_empty_page() {
        let doc = Html::parse_document("<html><body></body></html>");
        assert_eq!(extract_text(&doc), "");
    }
}
