//! HTML structural analyzer.
//!
//! Reduces a page's DOM to its tag shape: a nested tag-name-only tree hashed
//! into a structural fingerprint, plus the multiset of root-to-leaf tag paths
//! used for partial-overlap similarity when the hashes differ. Text content,
//! attribute values and media sources never influence the fingerprint.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Tags excluded from the structural tree. Scripts and styles rotate with
/// every deploy and are audited by the domain channel instead.
const SKIPPED_TAGS: &[&str] = &["script", "noscript", "style", "template"];

static RE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static RE_NONCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\s+nonce="[^"]*""#).unwrap());
static RE_CSRF_INPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<input[^>]*(?:csrf|_token)[^>]*>"#).unwrap());
static RE_TRACKING_PIXEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<img[^>]*(?:width="1"|height="1")[^>]*>"#).unwrap());
static RE_DYNAMIC_SCRIPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<script[^>]*src="[^"]*(?:analytics|gtag|googletagmanager|doubleclick|hotjar)[^"]*"[^>]*>.*?</script>"#,
    )
    .unwrap()
});
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Derived structural data for one HTML document.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    /// blake3 hash of the tag-only nested tree.
    pub structural_hash: String,
    /// Root-to-leaf `/`-joined tag paths, one per leaf, with multiplicity.
    pub tag_paths: Vec<String>,
    /// blake3 hash of the normalized document text.
    pub content_hash: String,
}

/// Fingerprint an HTML document, skipping subtrees that match any of the
/// caller-supplied ignore selectors.
pub fn fingerprint(html: &str, ignore_selectors: &[String]) -> Fingerprint {
    let ignored: Vec<Selector> = ignore_selectors
        .iter()
        .filter_map(|s| match Selector::parse(s) {
            Ok(sel) => Some(sel),
            Err(e) => {
                tracing::warn!("Skipping invalid ignore selector {:?}: {}", s, e);
                None
            }
        })
        .collect();

    let doc = Html::parse_document(html);
    let mut serialized = String::new();
    let mut path = Vec::new();
    let mut tag_paths = Vec::new();
    walk(doc.root_element(), &ignored, &mut serialized, &mut path, &mut tag_paths);

    Fingerprint {
        structural_hash: blake3::hash(serialized.as_bytes()).to_hex().to_string(),
        tag_paths,
        content_hash: blake3::hash(normalize_html(html).as_bytes()).to_hex().to_string(),
    }
}

fn walk(
    el: ElementRef<'_>,
    ignored: &[Selector],
    serialized: &mut String,
    path: &mut Vec<String>,
    tag_paths: &mut Vec<String>,
) {
    let name = el.value().name();
    serialized.push_str(name);
    serialized.push('(');
    path.push(name.to_string());

    let children: Vec<ElementRef<'_>> = el
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| !is_skipped(c, ignored))
        .collect();

    if children.is_empty() {
        tag_paths.push(path.join("/"));
    } else {
        for child in children {
            walk(child, ignored, serialized, path, tag_paths);
        }
    }

    serialized.push(')');
    path.pop();
}

fn is_skipped(el: &ElementRef<'_>, ignored: &[Selector]) -> bool {
    let name = el.value().name();
    if SKIPPED_TAGS.contains(&name) {
        return true;
    }
    // 1x1 images are tracking pixels, not structure.
    if name == "img"
        && (el.value().attr("width") == Some("1") || el.value().attr("height") == Some("1"))
    {
        return true;
    }
    if name == "input" {
        if let Some(n) = el.value().attr("name") {
            let n = n.to_ascii_lowercase();
            if n.contains("csrf") || n.contains("_token") {
                return true;
            }
        }
    }
    ignored.iter().any(|sel| sel.matches(el))
}

/// Normalize HTML for content hashing: strip comments, nonce attributes,
/// CSRF inputs, tracking pixels and analytics scripts, then collapse
/// whitespace.
pub fn normalize_html(html: &str) -> String {
    let s = RE_COMMENT.replace_all(html, "");
    let s = RE_DYNAMIC_SCRIPT.replace_all(&s, "");
    let s = RE_NONCE.replace_all(&s, "");
    let s = RE_CSRF_INPUT.replace_all(&s, "");
    let s = RE_TRACKING_PIXEL.replace_all(&s, "");
    RE_WHITESPACE.replace_all(&s, " ").trim().to_string()
}

/// Multiset Jaccard similarity between two tag-path collections, in percent.
/// Multiplicities count: a page with three identical cards differs from a
/// page with one.
pub fn structural_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 100.0;
    }

    let mut counts_a: HashMap<&str, i64> = HashMap::new();
    for p in a {
        *counts_a.entry(p.as_str()).or_default() += 1;
    }
    let mut counts_b: HashMap<&str, i64> = HashMap::new();
    for p in b {
        *counts_b.entry(p.as_str()).or_default() += 1;
    }

    let mut intersection = 0i64;
    let mut union = 0i64;
    let keys: std::collections::HashSet<&str> =
        counts_a.keys().chain(counts_b.keys()).copied().collect();
    for key in keys {
        let ca = counts_a.get(key).copied().unwrap_or(0);
        let cb = counts_b.get(key).copied().unwrap_or(0);
        intersection += ca.min(cb);
        union += ca.max(cb);
    }

    if union == 0 {
        100.0
    } else {
        100.0 * intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_invariant_to_text_attrs_and_media() {
        let a = fingerprint(
            r#"<div class="x"><h1>Hello</h1><img src="a.png"></div>"#,
            &[],
        );
        let b = fingerprint(
            r#"<div id="y"><h1>Completely different</h1><img src="other.jpg"></div>"#,
            &[],
        );
        assert_eq!(a.structural_hash, b.structural_hash);
        assert_eq!(a.tag_paths, b.tag_paths);
    }

    #[test]
    fn test_one_extra_leaf_changes_hash() {
        let a = fingerprint("<div><h1>A</h1></div>", &[]);
        let b = fingerprint("<div><h1>A</h1><span>B</span></div>", &[]);
        assert_ne!(a.structural_hash, b.structural_hash);
    }

    #[test]
    fn test_scripts_do_not_affect_structure() {
        let a = fingerprint("<div><h1>A</h1></div>", &[]);
        let b = fingerprint(
            r#"<div><h1>B</h1></div><script src="https://evil.com/x.js"></script>"#,
            &[],
        );
        assert_eq!(a.structural_hash, b.structural_hash);
    }

    #[test]
    fn test_ignore_selectors_strip_subtree() {
        let a = fingerprint("<div><h1>A</h1></div>", &[]);
        let b = fingerprint(
            r#"<div><h1>A</h1><aside class="cookie-banner"><p>hi</p></aside></div>"#,
            &["aside.cookie-banner".to_string()],
        );
        assert_eq!(a.structural_hash, b.structural_hash);
    }

    #[test]
    fn test_tag_paths_are_root_to_leaf() {
        let fp = fingerprint("<div><h1>A</h1></div>", &[]);
        assert!(fp.tag_paths.contains(&"html/body/div/h1".to_string()));
    }

    #[test]
    fn test_similarity_bounds_and_identity() {
        let paths: Vec<String> = vec!["html/body/div".into(), "html/body/div".into(), "html/body/p".into()];
        assert_eq!(structural_similarity(&paths, &paths), 100.0);

        let other: Vec<String> = vec!["html/body/table".into()];
        assert_eq!(structural_similarity(&paths, &other), 0.0);

        let partial: Vec<String> = vec!["html/body/div".into()];
        let sim = structural_similarity(&paths, &partial);
        assert!(sim > 0.0 && sim < 100.0);
    }

    #[test]
    fn test_similarity_uses_multiplicities() {
        let one: Vec<String> = vec!["html/body/div".into()];
        let three: Vec<String> = vec!["html/body/div".into(); 3];
        // |intersection| = 1, |union| = 3.
        assert!((structural_similarity(&one, &three) - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_strips_dynamic_regions() {
        let html = r#"
            <!-- build 1234 -->
            <div  nonce="abc123">Hello</div>
            <input type="hidden" name="csrf_token" value="zzz">
            <img src="https://t.example/p.gif" width="1" height="1">
        "#;
        let normalized = normalize_html(html);
        assert!(!normalized.contains("build 1234"));
        assert!(!normalized.contains("nonce"));
        assert!(!normalized.contains("csrf_token"));
        assert!(!normalized.contains("p.gif"));
        assert!(normalized.contains("Hello"));
    }

    #[test]
    fn test_content_hash_tracks_text_changes() {
        let a = fingerprint("<div><h1>A</h1></div>", &[]);
        let b = fingerprint("<div><h1>B</h1></div>", &[]);
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(a.structural_hash, b.structural_hash);
    }
}
