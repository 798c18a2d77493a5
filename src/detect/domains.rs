//! External-domain audit.
//!
//! Extracts every external domain a page references and diffs it against the
//! baseline allowlist, ignoring globally trusted infrastructure so rotating
//! vendor subdomains don't trigger false positives.

use scraper::{Html, Selector};
use std::sync::LazyLock;
use url::Url;

/// Penalty per newly appeared untrusted domain.
const NEW_DOMAIN_PENALTY: f64 = 25.0;
/// Penalty per domain that disappeared from the page.
const REMOVED_DOMAIN_PENALTY: f64 = 5.0;

/// Globally trusted infrastructure: CDNs, analytics, fonts, social embeds,
/// government TLDs. Matched as dot-boundary suffixes.
pub const BUILTIN_TRUSTED: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "googleapis.com",
    "gstatic.com",
    "google.com",
    "doubleclick.net",
    "cloudflare.com",
    "cloudfront.net",
    "akamaihd.net",
    "akamaized.net",
    "fastly.net",
    "jsdelivr.net",
    "unpkg.com",
    "bootstrapcdn.com",
    "typekit.net",
    "fonts.net",
    "facebook.net",
    "facebook.com",
    "twitter.com",
    "youtube.com",
    "vimeo.com",
    ".gov",
];

static DOMAIN_SELECTOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("script[src], iframe[src], link[href], form[action], object[data], embed[src]")
        .unwrap()
});

/// Outcome of diffing a page's external domains against the allowlist.
#[derive(Debug, Clone)]
pub struct DomainAudit {
    pub new_domains: Vec<String>,
    pub removed_domains: Vec<String>,
    /// `max(0, 100 - 25*new - 5*removed)`.
    pub score: f64,
}

/// Extract the external domains referenced by a page, sorted and deduplicated.
/// Protocol-relative URLs resolve against the site's own scheme; hosts equal
/// to the site's own host are not external.
pub fn extract_external_domains(html: &str, site_url: &str) -> Vec<String> {
    let base = match Url::parse(site_url) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!("Cannot parse site URL {:?}: {}", site_url, e);
            return Vec::new();
        }
    };
    let own_host = base.host_str().unwrap_or("").to_ascii_lowercase();

    let doc = Html::parse_document(html);
    let mut domains = Vec::new();

    for el in doc.select(&DOMAIN_SELECTOR) {
        let raw = el
            .value()
            .attr("src")
            .or_else(|| el.value().attr("href"))
            .or_else(|| el.value().attr("action"))
            .or_else(|| el.value().attr("data"));
        let raw = match raw {
            Some(r) => r.trim(),
            None => continue,
        };
        if raw.is_empty() {
            continue;
        }

        let resolved = match base.join(raw) {
            Ok(u) => u,
            Err(_) => continue,
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        if let Some(host) = resolved.host_str() {
            let host = host.to_ascii_lowercase();
            if host != own_host {
                domains.push(host);
            }
        }
    }

    domains.sort();
    domains.dedup();
    domains
}

/// Diff current domains against the baseline allowlist, excluding trusted
/// infrastructure from both sides of the diff.
pub fn audit_domains(current: &[String], allowlist: &[String], trusted: &[String]) -> DomainAudit {
    let new_domains: Vec<String> = current
        .iter()
        .filter(|d| !allowlist.contains(d) && !is_trusted(d, trusted))
        .cloned()
        .collect();
    let removed_domains: Vec<String> = allowlist
        .iter()
        .filter(|d| !current.contains(d) && !is_trusted(d, trusted))
        .cloned()
        .collect();

    DomainAudit {
        score: domain_score(new_domains.len(), removed_domains.len()),
        new_domains,
        removed_domains,
    }
}

/// Flat per-domain deductions, floored at zero. These are calibrated
/// thresholds, not tunables.
pub fn domain_score(new_count: usize, removed_count: usize) -> f64 {
    (100.0 - NEW_DOMAIN_PENALTY * new_count as f64 - REMOVED_DOMAIN_PENALTY * removed_count as f64)
        .max(0.0)
}

/// Dot-boundary suffix match against the built-in list plus operator
/// additions. An entry starting with `.` matches any host under that suffix.
pub fn is_trusted(host: &str, extra: &[String]) -> bool {
    BUILTIN_TRUSTED
        .iter()
        .copied()
        .chain(extra.iter().map(String::as_str))
        .any(|entry| {
            if let Some(suffix) = entry.strip_prefix('.') {
                host.ends_with(entry) || host == suffix
            } else {
                host == entry || host.ends_with(&format!(".{}", entry))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extract_external_domains() {
        let html = r#"
            <script src="https://cdn.example.net/app.js"></script>
            <script src="/local.js"></script>
            <iframe src="//embed.example.org/frame"></iframe>
            <link href="https://mysite.com/style.css" rel="stylesheet">
            <form action="https://forms.example.io/submit"></form>
        "#;
        let domains = extract_external_domains(html, "https://mysite.com");
        assert_eq!(
            domains,
            v(&["cdn.example.net", "embed.example.org", "forms.example.io"])
        );
    }

    #[test]
    fn test_extract_skips_non_http_schemes() {
        let html = r#"<link href="mailto:a@b.com"><script src="https://x.example/a.js"></script>"#;
        let domains = extract_external_domains(html, "https://mysite.com");
        assert_eq!(domains, v(&["x.example"]));
    }

    #[test]
    fn test_domain_score_formula() {
        assert_eq!(domain_score(0, 0), 100.0);
        assert_eq!(domain_score(1, 0), 75.0);
        assert_eq!(domain_score(0, 1), 95.0);
        assert_eq!(domain_score(2, 3), 35.0);
        // Floored, never negative.
        assert_eq!(domain_score(5, 0), 0.0);
        assert_eq!(domain_score(7, 4), 0.0);
    }

    #[test]
    fn test_audit_one_new_domain() {
        let audit = audit_domains(
            &v(&["cdn.good.com", "evil.com"]),
            &v(&["cdn.good.com"]),
            &[],
        );
        assert_eq!(audit.new_domains, v(&["evil.com"]));
        assert!(audit.removed_domains.is_empty());
        assert_eq!(audit.score, 75.0);
    }

    #[test]
    fn test_audit_trusted_domains_excluded() {
        let audit = audit_domains(
            &v(&["www.google-analytics.com", "fonts.googleapis.com"]),
            &[],
            &[],
        );
        assert!(audit.new_domains.is_empty());
        assert_eq!(audit.score, 100.0);
    }

    #[test]
    fn test_audit_operator_trusted_additions() {
        let audit = audit_domains(&v(&["static.mycdn.example"]), &[], &v(&["mycdn.example"]));
        assert!(audit.new_domains.is_empty());
        assert_eq!(audit.score, 100.0);
    }

    #[test]
    fn test_trusted_suffix_is_dot_bounded() {
        assert!(is_trusted("maps.google.com", &[]));
        assert!(!is_trusted("notgoogle.com", &[]));
        assert!(is_trusted("whitehouse.gov", &[]));
        assert!(!is_trusted("fakegov.example", &[]));
    }

    #[test]
    fn test_removed_domain_penalty() {
        let audit = audit_domains(&[], &v(&["cdn.old.example"]), &[]);
        assert_eq!(audit.removed_domains, v(&["cdn.old.example"]));
        assert_eq!(audit.score, 95.0);
    }
}
