//! URL scope matching
//!
//! Include patterns are evaluated against the request's path+query, exclude
//! patterns against the full URL. Both inputs are passed explicitly so call
//! sites cannot mix the two views up.

use regex::Regex;
use url::Url;

use crate::{RecorderError, Result};

/// Compiled include pattern
#[derive(Debug, Clone)]
enum IncludePattern {
    /// Literal `*`
    Any,
    /// Pattern containing `*`, compiled with `*` → `.*`
    Wildcard(Regex),
    /// Plain substring
    Contains(String),
}

impl IncludePattern {
    fn compile(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(Self::Any);
        }
        if pattern.contains('*') {
            let regex = wildcard_regex(pattern).map_err(|source| RecorderError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            return Ok(Self::Wildcard(regex));
        }
        Ok(Self::Contains(pattern.to_string()))
    }

    fn matches(&self, path_and_query: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Wildcard(regex) => regex.is_match(path_and_query),
            Self::Contains(literal) => path_and_query.contains(literal.as_str()),
        }
    }
}

/// Compiled exclude pattern
#[derive(Debug, Clone)]
enum ExcludePattern {
    /// `*.ext` style pattern, stored without the leading `*`
    Suffix(String),
    /// Plain substring
    Contains(String),
}

impl ExcludePattern {
    fn compile(pattern: &str) -> Self {
        match pattern.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') => Self::Suffix(suffix.to_string()),
            _ => Self::Contains(pattern.to_string()),
        }
    }

    fn matches(&self, full_url: &str) -> bool {
        match self {
            Self::Suffix(suffix) => full_url.ends_with(suffix.as_str()),
            Self::Contains(literal) => full_url.contains(literal.as_str()),
        }
    }
}

/// Include/exclude scope predicate with patterns compiled once
#[derive(Debug, Clone)]
pub struct Matcher {
    include: Vec<IncludePattern>,
    exclude: Vec<ExcludePattern>,
}

impl Matcher {
    /// Compile include and exclude pattern lists
    ///
    /// # Errors
    ///
    /// Returns error if a wildcard include pattern is not a valid regex
    /// after `*` expansion
    pub fn new(include_patterns: &[String], exclude_patterns: &[String]) -> Result<Self> {
        let include = include_patterns
            .iter()
            .map(|p| IncludePattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        let exclude = exclude_patterns
            .iter()
            .map(|p| ExcludePattern::compile(p))
            .collect();

        Ok(Self { include, exclude })
    }

    /// Whether path+query passes the include list
    #[must_use]
    pub fn includes(&self, path_and_query: &str) -> bool {
        self.include.is_empty() || self.include.iter().any(|p| p.matches(path_and_query))
    }

    /// Whether the full URL hits any exclude pattern
    #[must_use]
    pub fn excludes(&self, full_url: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(full_url))
    }

    /// Final scope decision for one request
    #[must_use]
    pub fn is_in_scope(&self, path_and_query: &str, full_url: &str) -> bool {
        self.includes(path_and_query) && !self.excludes(full_url) && has_http_scheme(full_url)
    }

    /// Parse `raw_url` and return its path+query if it is in scope
    ///
    /// Unparseable URLs are out of scope.
    #[must_use]
    pub fn scope(&self, raw_url: &str) -> Option<String> {
        let url = Url::parse(raw_url).ok()?;
        let path = path_and_query(&url);
        self.is_in_scope(&path, raw_url).then_some(path)
    }
}

/// Include evaluation over raw pattern strings
///
/// A wildcard pattern that does not compile never matches.
#[must_use]
pub fn matches_include(path_and_query: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|pattern| {
        if pattern == "*" {
            true
        } else if pattern.contains('*') {
            wildcard_regex(pattern).is_ok_and(|re| re.is_match(path_and_query))
        } else {
            path_and_query.contains(pattern.as_str())
        }
    })
}

/// Exclude evaluation over raw pattern strings
#[must_use]
pub fn matches_exclude(full_url: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|pattern| ExcludePattern::compile(pattern).matches(full_url))
}

/// Path plus query string, origin stripped
#[must_use]
pub fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) if !query.is_empty() => format!("{}?{query}", url.path()),
        _ => url.path().to_string(),
    }
}

/// Scheme+host+port of a URL, e.g. `https://example.com:8443`
///
/// # Errors
///
/// Returns error if the URL cannot be parsed
pub fn origin(raw_url: &str) -> Result<String> {
    let url = Url::parse(raw_url).map_err(|source| RecorderError::InvalidUrl {
        url: raw_url.to_string(),
        source,
    })?;
    Ok(url.origin().ascii_serialization())
}

fn wildcard_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&pattern.replace('*', ".*"))
}

fn has_http_scheme(full_url: &str) -> bool {
    let lower = full_url
        .get(..8)
        .unwrap_or(full_url)
        .to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn matcher(include: &[&str], exclude: &[&str]) -> Matcher {
        Matcher::new(&patterns(include), &patterns(exclude)).unwrap()
    }

    #[test]
    fn test_empty_include_matches_everything() {
        let m = matcher(&[], &[]);
        assert!(m.includes("/anything"));
        assert!(m.includes(""));
        assert!(matches_include("/anything", &[]));
    }

    #[test]
    fn test_star_matches_everything() {
        let m = matcher(&["*"], &[]);
        assert!(m.includes("/static/app.css"));
    }

    #[test]
    fn test_wildcard_include() {
        let m = matcher(&["/api/*/bookings"], &[]);
        assert!(m.includes("/api/v1/bookings"));
        assert!(m.includes("/prefix/api/v2/bookings?page=1"));
        assert!(!m.includes("/api/bookings"));
    }

    #[test]
    fn test_substring_include() {
        let m = matcher(&["/api/"], &[]);
        assert!(m.includes("/api/room"));
        assert!(m.includes("/v2/api/room"));
        assert!(!m.includes("/apiv2/room"));
    }

    #[test]
    fn test_exclude_suffix() {
        let m = matcher(&[], &["*.png"]);
        assert!(m.excludes("https://x/y/z.png"));
        assert!(!m.excludes("https://x/y/zpng"));
        assert!(!m.excludes("https://x/y/z.png?v=1"));
    }

    #[test]
    fn test_exclude_substring() {
        let m = matcher(&[], &[".js"]);
        assert!(m.excludes("https://x/app.js"));
        assert!(m.excludes("https://x/app.json"));
        assert!(!m.excludes("https://x/api/data"));
    }

    #[test]
    fn test_scope_requires_http_scheme() {
        let m = matcher(&[], &[]);
        assert!(m.is_in_scope("/a", "https://example.com/a"));
        assert!(m.is_in_scope("/a", "HTTP://example.com/a"));
        assert!(!m.is_in_scope("/a", "ws://example.com/a"));
        assert!(m.scope("data:text/plain,hello").is_none());
        assert!(m.scope("chrome-extension://abc/api/x").is_none());
    }

    #[test]
    fn test_scope_uses_path_for_include_and_url_for_exclude() {
        // Include never sees the host
        let m = matcher(&["example"], &["example.com"]);
        assert!(m.scope("https://example.com/other").is_none());

        let m = matcher(&["/api/"], &["cdn."]);
        assert_eq!(
            m.scope("https://example.com/api/rooms?id=3").as_deref(),
            Some("/api/rooms?id=3")
        );
        assert!(m.scope("https://cdn.example.com/api/rooms").is_none());
    }

    #[test]
    fn test_scope_unparseable_url() {
        let m = matcher(&[], &[]);
        assert!(m.scope("not a url").is_none());
    }

    #[test]
    fn test_invalid_wildcard_is_rejected() {
        let result = Matcher::new(&patterns(&["/api/[*"]), &[]);
        assert!(matches!(result, Err(RecorderError::InvalidPattern { .. })));
        assert!(!matches_include("/api/[x", &patterns(&["/api/[*"])));
    }

    #[test]
    fn test_path_and_query() {
        let url = Url::parse("https://example.com:8080/api/a?b=1#frag").unwrap();
        assert_eq!(path_and_query(&url), "/api/a?b=1");

        let url = Url::parse("https://example.com/api/a?").unwrap();
        assert_eq!(path_and_query(&url), "/api/a");
    }

    #[test]
    fn test_origin() {
        assert_eq!(
            origin("https://automationintesting.online/room/1").unwrap(),
            "https://automationintesting.online"
        );
        assert_eq!(
            origin("http://localhost:3000/").unwrap(),
            "http://localhost:3000"
        );
        assert!(origin("::::").is_err());
    }

    proptest! {
        #[test]
        fn prop_wildcard_equivalent_to_containment(
            prefix in "[a-z/]{0,12}",
            suffix in "[a-z0-9/?=&]{0,12}",
        ) {
            let path = format!("{prefix}/api/{suffix}");
            let wildcard = matcher(&["/api/*"], &[]);
            let literal = matcher(&["/api/"], &[]);
            prop_assert!(wildcard.includes(&path));
            prop_assert_eq!(wildcard.includes(&path), literal.includes(&path));
        }

        #[test]
        fn prop_empty_include_is_total(path in "/[a-zA-Z0-9/._?=&-]{0,40}") {
            let m = matcher(&[], &[]);
            let url = format!("https://example.com{path}");
            prop_assert!(m.includes(&path));
            prop_assert!(m.is_in_scope(&path, &url));
        }

        #[test]
        fn prop_matcher_agrees_with_free_functions(
            path in "/[a-z/.]{0,20}",
        ) {
            let include = patterns(&["/a*", "b"]);
            let exclude = patterns(&["*.png", "c"]);
            let m = Matcher::new(&include, &exclude).unwrap();
            let url = format!("https://h{path}");
            prop_assert_eq!(m.includes(&path), matches_include(&path, &include));
            prop_assert_eq!(m.excludes(&url), matches_exclude(&url, &exclude));
        }
    }
}
