//! Tool-name filtering policy
//!
//! Patterns arrive from `--ignore-tool` as shell-style globs where `*` is
//! the only wildcard (`create*`, `*account`, `exactName`). A tool name is
//! included iff it matches none of the patterns. Matching is
//! case-insensitive and anchored to both ends: the pattern converts to a
//! regex by splitting on `*`, escaping each literal segment, and joining
//! with `.*`.

use regex::Regex;

use crate::error::{McpRemoteError, Result};

/// Compiled ignore-list for tool names.
///
/// # Examples
///
/// ```
/// use mcp_remote::proxy::filter::ToolFilter;
///
/// let filter = ToolFilter::new(&["delete*".to_string(), "*account".to_string()]).unwrap();
/// assert!(filter.should_include("createTask"));
/// assert!(!filter.should_include("deleteTask"));
/// assert!(!filter.should_include("getAccount"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    patterns: Vec<Regex>,
}

impl ToolFilter {
    /// Compiles the glob patterns.
    ///
    /// # Errors
    ///
    /// Returns [`McpRemoteError::Config`] when a compiled pattern is
    /// rejected by the regex engine (which for escaped-segment globs does
    /// not happen in practice).
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let body = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let anchored = format!("^{body}$");
            let regex = regex::RegexBuilder::new(&anchored)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    McpRemoteError::Config(format!("invalid --ignore-tool pattern `{pattern}`: {e}"))
                })?;
            compiled.push(regex);
        }
        Ok(Self { patterns: compiled })
    }

    /// Whether the client is allowed to see and call `name`.
    pub fn should_include(&self, name: &str) -> bool {
        !self.patterns.iter().any(|p| p.is_match(name))
    }

    /// Whether any patterns were configured at all.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str]) -> ToolFilter {
        let owned: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        ToolFilter::new(&owned).expect("patterns compile")
    }

    #[test]
    fn test_empty_pattern_list_includes_everything() {
        let f = filter(&[]);
        assert!(f.is_empty());
        assert!(f.should_include("anything"));
        assert!(f.should_include(""));
    }

    #[test]
    fn test_prefix_glob() {
        let f = filter(&["create*"]);
        assert!(!f.should_include("createTask"));
        assert!(!f.should_include("create"));
        assert!(f.should_include("recreate"));
    }

    #[test]
    fn test_suffix_glob() {
        let f = filter(&["*account"]);
        assert!(!f.should_include("getAccount"));
        assert!(!f.should_include("account"));
        assert!(f.should_include("accountList"));
    }

    #[test]
    fn test_exact_name_is_anchored() {
        let f = filter(&["exactName"]);
        assert!(!f.should_include("exactName"));
        assert!(f.should_include("exactName2"));
        assert!(f.should_include("myExactName"));
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let f = filter(&["delete*"]);
        assert!(!f.should_include("DeleteTask"));
        assert!(!f.should_include("DELETETASK"));
    }

    #[test]
    fn test_multiple_patterns_combine() {
        let f = filter(&["delete*", "*account"]);
        let tools = ["createTask", "deleteTask", "getAccount", "listTasks"];
        let visible: Vec<&str> = tools
            .iter()
            .copied()
            .filter(|t| f.should_include(t))
            .collect();
        assert_eq!(visible, vec!["createTask", "listTasks"]);
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let f = filter(&["a.b"]);
        assert!(!f.should_include("a.b"));
        assert!(f.should_include("axb"), "dot must not act as a wildcard");
    }

    #[test]
    fn test_inner_star_spans_arbitrary_text() {
        let f = filter(&["get*Secret"]);
        assert!(!f.should_include("getVerySecret"));
        assert!(!f.should_include("getSecret"));
        assert!(f.should_include("getSecretValue"));
    }
}
