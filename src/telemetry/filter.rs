use globset::{Glob, GlobSet, GlobSetBuilder};

/// Well-known analytics/tracking domains excluded by default unless
/// `includeAll` is set (spec.md §4.2).
const DEFAULT_EXCLUDE_DOMAINS: &[&str] = &[
    "*google-analytics.com*",
    "*googletagmanager.com*",
    "*doubleclick.net*",
    "*segment.com*",
    "*segment.io*",
    "*mixpanel.com*",
    "*hotjar.com*",
    "*fullstory.com*",
    "*amplitude.com*",
    "*facebook.net*",
    "*sentry.io*",
];

/// Wildcard URL matcher with include/exclude precedence.
///
/// Built once per session from the user's configured patterns plus the
/// default exclude list (unless `includeAll` disables it). Precedence:
/// include always trumps exclude; if any include patterns are configured
/// and none match, the URL is excluded.
#[derive(Debug)]
pub struct UrlFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl UrlFilter {
    /// Build a filter from user-supplied include/exclude glob patterns.
    ///
    /// `include_all` disables the built-in default exclude list (user
    /// exclude patterns, if any, still apply).
    ///
    /// # Errors
    ///
    /// Returns an error string if any pattern fails to compile as a glob.
    pub fn new(
        include_patterns: &[String],
        exclude_patterns: &[String],
        include_all: bool,
    ) -> Result<Self, String> {
        let include = if include_patterns.is_empty() {
            None
        } else {
            Some(build_globset(include_patterns)?)
        };

        let mut exclude_all: Vec<String> = Vec::new();
        if !include_all {
            exclude_all.extend(DEFAULT_EXCLUDE_DOMAINS.iter().map(|s| (*s).to_string()));
        }
        exclude_all.extend(exclude_patterns.iter().cloned());
        let exclude = build_globset(&exclude_all)?;

        Ok(Self { include, exclude })
    }

    /// Returns `true` if `url` should be kept.
    #[must_use]
    pub fn allows(&self, url: &str) -> bool {
        if let Some(include) = &self.include {
            return include.is_match(url);
        }
        !self.exclude.is_match(url)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| format!("invalid pattern {pattern:?}: {e}"))?;
        builder.add(glob);
    }
    builder.build().map_err(|e| e.to_string())
}
