//! URL match patterns of the form `<scheme>://<host>/<path>`.
//!
//! Patterns are used to scope request listeners to a subset of URLs.
//! The grammar is deliberately small:
//!
//! * `scheme` is a literal (`https`) or `*`,
//! * `host` is a literal (`example.com`), `*`, or a subdomain wildcard
//!   (`*.example.com`, which also matches the bare domain),
//! * `path` starts with `/` and may contain `*` wildcards matching any
//!   sequence of characters (including `/`),
//! * the special pattern `<all_urls>` matches every URL.
//!
//! Matching is performed against an [`http::Uri`], so the same pattern type
//! can be reused anywhere request URLs are already parsed.

use std::{fmt, str::FromStr};

use http::Uri;
use thiserror::Error;

/// The catch-all pattern literal.
pub const ALL_URLS: &str = "<all_urls>";

/// Errors returned when parsing a [`MatchPattern`] from a string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternParseError {
    #[error("pattern is missing the `://` separator")]
    MissingSchemeSeparator,
    #[error("pattern scheme is empty")]
    EmptyScheme,
    #[error("pattern scheme may only be a literal or `*`")]
    InvalidScheme,
    #[error("pattern host is empty")]
    EmptyHost,
    #[error("`*` in the host may only appear as `*` or a leading `*.`")]
    InvalidHostWildcard,
    #[error("pattern path must start with `/`")]
    MissingPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemePattern {
    Any,
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Any,
    /// `*.example.com` - matches the domain itself and any subdomain.
    Subdomain(String),
    Literal(String),
}

/// A single parsed URL pattern.
///
/// Obtained via [`FromStr`]: `"https://example.com/*".parse::<MatchPattern>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPattern {
    raw: String,
    all_urls: bool,
    scheme: SchemePattern,
    host: HostPattern,
    path: String,
}

impl MatchPattern {
    /// Returns the pattern matching every URL.
    pub fn all_urls() -> Self {
        Self {
            raw: ALL_URLS.into(),
            all_urls: true,
            scheme: SchemePattern::Any,
            host: HostPattern::Any,
            path: "/*".into(),
        }
    }

    /// Checks whether the given URL satisfies this pattern's scheme, host and
    /// path constraints.
    pub fn matches(&self, url: &Uri) -> bool {
        if self.all_urls {
            return true;
        }

        match (&self.scheme, url.scheme_str()) {
            (SchemePattern::Any, _) => {}
            (SchemePattern::Literal(scheme), Some(url_scheme))
                if scheme.eq_ignore_ascii_case(url_scheme) => {}
            _ => return false,
        }

        let Some(url_host) = url.host() else {
            return false;
        };
        let url_host = url_host.to_ascii_lowercase();
        match &self.host {
            HostPattern::Any => {}
            HostPattern::Literal(host) if *host == url_host => {}
            HostPattern::Subdomain(domain)
                if url_host == *domain
                    || (url_host.ends_with(domain.as_str())
                        && url_host.as_bytes()[url_host.len() - domain.len() - 1] == b'.') => {}
            _ => return false,
        }

        wildcard_match(&self.path, url.path())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for MatchPattern {
    type Err = PatternParseError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        if pattern == ALL_URLS {
            return Ok(Self::all_urls());
        }

        let (scheme, rest) = pattern
            .split_once("://")
            .ok_or(PatternParseError::MissingSchemeSeparator)?;

        let scheme = match scheme {
            "" => return Err(PatternParseError::EmptyScheme),
            "*" => SchemePattern::Any,
            literal if literal.contains('*') => return Err(PatternParseError::InvalidScheme),
            literal => SchemePattern::Literal(literal.to_ascii_lowercase()),
        };

        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => return Err(PatternParseError::MissingPath),
        };

        let host = match host {
            "" => return Err(PatternParseError::EmptyHost),
            "*" => HostPattern::Any,
            wild if wild.starts_with("*.") => {
                let domain = &wild[2..];
                if domain.is_empty() || domain.contains('*') {
                    return Err(PatternParseError::InvalidHostWildcard);
                }
                HostPattern::Subdomain(domain.to_ascii_lowercase())
            }
            literal if literal.contains('*') => {
                return Err(PatternParseError::InvalidHostWildcard)
            }
            literal => HostPattern::Literal(literal.to_ascii_lowercase()),
        };

        Ok(Self {
            raw: pattern.into(),
            all_urls: false,
            scheme,
            host,
            path: path.into(),
        })
    }
}

/// A set of [`MatchPattern`]s.
///
/// An empty set matches every URL - callers that want to scope a listener
/// must provide at least one pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchPatternSet {
    patterns: Vec<MatchPattern>,
}

impl MatchPatternSet {
    pub fn new(patterns: Vec<MatchPattern>) -> Self {
        Self { patterns }
    }

    /// Parses all given pattern strings, failing on the first invalid one.
    pub fn parse<'a, I>(patterns: I) -> Result<Self, PatternParseError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        patterns
            .into_iter()
            .map(MatchPattern::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if this set is empty or any pattern matches the URL.
    pub fn matches(&self, url: &Uri) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|pattern| pattern.matches(url))
    }
}

impl FromIterator<MatchPattern> for MatchPatternSet {
    fn from_iter<I: IntoIterator<Item = MatchPattern>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Glob match where `*` matches any sequence of characters.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let (pattern, text) = (pattern.as_bytes(), text.as_bytes());
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|byte| *byte == b'*')
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("https://example.com/*", "https://example.com/a", true)]
    #[case("https://example.com/*", "https://other.com/a", false)]
    #[case("https://example.com/*", "http://example.com/a", false)]
    #[case("*://example.com/*", "http://example.com/a", true)]
    #[case("https://*.example.com/*", "https://sub.example.com/x", true)]
    #[case("https://*.example.com/*", "https://example.com/x", true)]
    #[case("https://*.example.com/*", "https://notexample.com/x", false)]
    #[case("https://*/api/*", "https://anything.io/api/v1/users", true)]
    #[case("https://*/api/*", "https://anything.io/rest/v1", false)]
    #[case("https://example.com/a/*/c", "https://example.com/a/b/c", true)]
    #[case("https://example.com/a/*/c", "https://example.com/a/b/d", false)]
    #[case("https://example.com/", "https://example.com/", true)]
    #[case("https://example.com/", "https://example.com/a", false)]
    #[case("<all_urls>", "ftp://whatever/anything", true)]
    fn pattern_matching(#[case] pattern: &str, #[case] url: &str, #[case] expected: bool) {
        let pattern: MatchPattern = pattern.parse().unwrap();
        assert_eq!(pattern.matches(&uri(url)), expected, "{pattern} vs {url}");
    }

    #[rstest]
    #[case("example.com/*", PatternParseError::MissingSchemeSeparator)]
    #[case("://example.com/*", PatternParseError::EmptyScheme)]
    #[case("ht*ps://example.com/*", PatternParseError::InvalidScheme)]
    #[case("https:///*", PatternParseError::EmptyHost)]
    #[case("https://ex*mple.com/*", PatternParseError::InvalidHostWildcard)]
    #[case("https://*./*", PatternParseError::InvalidHostWildcard)]
    #[case("https://example.com", PatternParseError::MissingPath)]
    fn parse_errors(#[case] pattern: &str, #[case] expected: PatternParseError) {
        assert_eq!(pattern.parse::<MatchPattern>().unwrap_err(), expected);
    }

    #[test]
    fn empty_set_matches_everything() {
        let set = MatchPatternSet::default();
        assert!(set.matches(&uri("https://example.com/a")));
    }

    #[test]
    fn set_requires_any_match() {
        let set = MatchPatternSet::parse(["https://a.com/*", "https://b.com/*"]).unwrap();
        assert!(set.matches(&uri("https://b.com/x")));
        assert!(!set.matches(&uri("https://c.com/x")));
    }

    #[test]
    fn host_matching_is_case_insensitive() {
        let pattern: MatchPattern = "https://Example.COM/*".parse().unwrap();
        assert!(pattern.matches(&uri("https://EXAMPLE.com/a")));
    }
}
