//! Glob patterns deciding which files a tree sync skips
//!
//! # Pattern Syntax
//!
//! - `*` matches anything except `/`
//! - `**` matches anything including `/` (crosses directories)
//! - `?` matches a single character (except `/`)
//! - `[...]` character classes
//! - Leading `/` anchors the pattern to the sync root
//!
//! Patterns without `/` match the file name. Patterns with `/` match the trailing
//! components of the path relative to the sync root, so `logs/*.txt` matches
//! `a/logs/x.txt`. Anchored patterns and patterns containing `**` must match the whole
//! relative path.
//!
//! # Examples
//!
//! ```
//! use common::filter::SkipPattern;
//! use std::path::Path;
//!
//! let pattern = SkipPattern::parse("*.log").unwrap();
//! assert!(pattern.matches(Path::new("build/debug.log")));
//! assert!(!pattern.matches(Path::new("build/main.rs")));
//! ```

use anyhow::{Context, anyhow};
use std::path::Path;

/// A compiled skip pattern with metadata about its original form
#[derive(Debug, Clone)]
pub struct SkipPattern {
    /// original pattern string, used in log messages
    pub original: String,
    /// compiled glob matcher
    matcher: globset::GlobMatcher,
    /// pattern starts with / (anchored to root)
    pub anchored: bool,
    /// number of path components the pattern spans, `None` when it must match the full path
    components: Option<usize>,
}

impl SkipPattern {
    /// Parse a pattern string into a SkipPattern
    pub fn parse(pattern: &str) -> Result<Self, anyhow::Error> {
        if pattern.is_empty() {
            return Err(anyhow!("empty skip pattern is not allowed"));
        }
        let anchored = pattern.starts_with('/');
        let pattern_str = pattern.trim_start_matches('/');
        if pattern_str.is_empty() || pattern_str.ends_with('/') {
            return Err(anyhow!(
                "skip pattern '{}' must name files, not directories",
                pattern
            ));
        }
        let glob = globset::GlobBuilder::new(pattern_str)
            .literal_separator(true) // * doesn't match /
            .build()
            .with_context(|| format!("invalid skip pattern: {}", pattern))?;
        let components = if anchored || pattern_str.contains("**") {
            None
        } else {
            Some(pattern_str.split('/').count())
        };
        Ok(Self {
            original: pattern.to_string(),
            matcher: glob.compile_matcher(),
            anchored,
            components,
        })
    }

    /// Check if this pattern matches a file path relative to the sync root
    pub fn matches(&self, relative_path: &Path) -> bool {
        match self.components {
            None => self.matcher.is_match(relative_path),
            Some(count) => {
                let parts: Vec<_> = relative_path.components().collect();
                if parts.len() < count {
                    return false;
                }
                let tail: std::path::PathBuf = parts[parts.len() - count..].iter().collect();
                self.matcher.is_match(&tail)
            }
        }
    }
}

impl std::fmt::Display for SkipPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.original)
    }
}

impl std::str::FromStr for SkipPattern {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_pattern_matches_file_name() {
        let pattern = SkipPattern::parse("*.tmp").unwrap();
        assert!(pattern.matches(Path::new("a.tmp")));
        assert!(pattern.matches(Path::new("deep/er/b.tmp")));
        assert!(!pattern.matches(Path::new("a.tmp.bak")));
    }

    #[test]
    fn path_pattern_matches_trailing_components() {
        let pattern = SkipPattern::parse("cache/*.bin").unwrap();
        assert!(pattern.matches(Path::new("cache/x.bin")));
        assert!(pattern.matches(Path::new("model/cache/x.bin")));
        assert!(!pattern.matches(Path::new("x.bin")));
        assert!(!pattern.matches(Path::new("cache/sub/x.bin")));
    }

    #[test]
    fn anchored_pattern_matches_from_root() {
        let pattern = SkipPattern::parse("/top.txt").unwrap();
        assert!(pattern.anchored);
        assert!(pattern.matches(Path::new("top.txt")));
        assert!(!pattern.matches(Path::new("sub/top.txt")));
    }

    #[test]
    fn double_star_crosses_directories() {
        let pattern = SkipPattern::parse("build/**").unwrap();
        assert!(pattern.matches(Path::new("build/a/b/c.o")));
        assert!(!pattern.matches(Path::new("src/build/c.o")));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(SkipPattern::parse("").is_err());
        assert!(SkipPattern::parse("/").is_err());
        assert!(SkipPattern::parse("target/").is_err());
        assert!(SkipPattern::parse("[unclosed").is_err());
    }
}
