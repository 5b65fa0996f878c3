//! Glob pattern matcher: `*` -> `.*`, `?` -> `.`, anchored at both ends.
//!
//! Each pattern is compiled once, at config-load time, into an anchored
//! `Regex`. Exact string equality is tried before falling back to the
//! compiled pattern, so a literal path never pays for a regex match it
//! doesn't need. Paths are matched case-sensitively; HTTP methods
//! case-insensitively (handled by the caller, which should upper/lowercase
//! before comparing — this module only deals in path globs).

use regex::Regex;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    #[error("invalid glob pattern {0:?}: {1}")]
    InvalidPattern(String, regex::Error),
}

/// A single compiled glob. Cheap to clone (`Arc<Regex>` inside).
#[derive(Debug, Clone)]
pub struct CompiledGlob {
    pub source: String,
    regex: Option<Arc<Regex>>,
}

impl CompiledGlob {
    /// Compile `pattern`. A pattern with no `*`/`?` compiles to `None` for
    /// the regex and is matched by direct string equality only (the
    /// "exact match tried before regex" rule from the fast path).
    pub fn compile(pattern: &str) -> Result<Self, MatcherError> {
        if !pattern.contains('*') && !pattern.contains('?') {
            return Ok(Self {
                source: pattern.to_string(),
                regex: None,
            });
        }
        let mut re = String::with_capacity(pattern.len() * 2 + 2);
        re.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                c => {
                    if regex_syntax::is_meta_character(c) {
                        re.push('\\');
                    }
                    re.push(c);
                }
            }
        }
        re.push('$');
        let compiled = Regex::new(&re).map_err(|e| MatcherError::InvalidPattern(pattern.to_string(), e))?;
        Ok(Self {
            source: pattern.to_string(),
            regex: Some(Arc::new(compiled)),
        })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        if candidate == self.source {
            return true;
        }
        match &self.regex {
            Some(re) => re.is_match(candidate),
            None => false,
        }
    }
}

/// A minimal reimplementation of `regex_syntax::is_meta_character` so this
/// module doesn't need an extra dependency: characters that are special to
/// the regex crate's default syntax and must be escaped to be matched
/// literally.
mod regex_syntax {
    pub fn is_meta_character(c: char) -> bool {
        matches!(
            c,
            '\\' | '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '#' | '&' | '-' | '~'
        )
    }
}

/// Finds the first user-declared entry whose glob matches a candidate
/// string. Used for both path rule matching and model-map pattern
/// matching (spec §4.1, §4.3) — both need "first match in declared order,
/// exact-string fast path before falling back to the glob."
pub struct GlobSet<T> {
    entries: Vec<(CompiledGlob, T)>,
}

impl<T> GlobSet<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, pattern: &str, value: T) -> Result<(), MatcherError> {
        self.entries.push((CompiledGlob::compile(pattern)?, value));
        Ok(())
    }

    /// First matching entry, in declared order.
    pub fn find(&self, candidate: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(glob, _)| glob.matches(candidate))
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for GlobSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_without_wildcards() {
        let g = CompiledGlob::compile("/ccrelay/health").unwrap();
        assert!(g.matches("/ccrelay/health"));
        assert!(!g.matches("/ccrelay/health/x"));
    }

    #[test]
    fn star_matches_any_suffix() {
        let g = CompiledGlob::compile("/v1/models/*").unwrap();
        assert!(g.matches("/v1/models/claude-3"));
        assert!(!g.matches("/v1/models"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let g = CompiledGlob::compile("/v?/chat").unwrap();
        assert!(g.matches("/v1/chat"));
        assert!(!g.matches("/v12/chat"));
    }

    #[test]
    fn anchored_both_ends() {
        let g = CompiledGlob::compile("*.json").unwrap();
        assert!(g.matches("config.json"));
        assert!(!g.matches("config.json.bak"));
    }

    #[test]
    fn special_regex_characters_are_escaped() {
        let g = CompiledGlob::compile("/v1/chat.completions").unwrap();
        assert!(g.matches("/v1/chat.completions"));
        assert!(!g.matches("/v1/chatXcompletions"));
    }

    #[test]
    fn first_match_wins_in_declared_order() {
        let mut set: GlobSet<&str> = GlobSet::new();
        set.push("claude-*", "A").unwrap();
        set.push("claude-3", "B").unwrap();
        assert_eq!(set.find("claude-3"), Some(&"A"));
    }
}
