//! Topic exchange pattern matching.
//!
//! Both routing key and pattern split on `.` into word lists. A literal word
//! matches by equality, `*` matches exactly one word, and `#` matches zero
//! or more words with backtracking across word boundaries. Matching is total
//! and deterministic; compiled patterns are cached by their source text.

use std::collections::HashMap;

/// One token of a compiled pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Single,
    Multi,
}

/// A compiled topic pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPattern {
    tokens: Vec<Token>,
}

impl TopicPattern {
    /// Compile a pattern string. Splitting the empty pattern yields an empty
    /// token list, which matches only the empty routing key.
    pub fn compile(pattern: &str) -> Self {
        let tokens = split_words(pattern)
            .into_iter()
            .map(|w| match w.as_str() {
                "*" => Token::Single,
                "#" => Token::Multi,
                _ => Token::Word(w),
            })
            .collect();
        Self { tokens }
    }

    /// Whether this pattern matches the given routing key.
    pub fn matches(&self, routing_key: &str) -> bool {
        let words = split_words(routing_key);
        matches_at(&self.tokens, &words)
    }
}

fn split_words(s: &str) -> Vec<String> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').map(str::to_string).collect()
    }
}

fn matches_at(tokens: &[Token], words: &[String]) -> bool {
    match tokens.split_first() {
        None => words.is_empty(),
        Some((Token::Word(w), rest)) => {
            words.first().map(|first| first == w).unwrap_or(false) && matches_at(rest, &words[1..])
        }
        Some((Token::Single, rest)) => !words.is_empty() && matches_at(rest, &words[1..]),
        Some((Token::Multi, rest)) => {
            // `#` consumes zero or more words; try every split point.
            (0..=words.len()).any(|skip| matches_at(rest, &words[skip..]))
        }
    }
}

/// A cache of compiled patterns keyed by source text.
#[derive(Debug, Default)]
pub struct PatternCache {
    patterns: HashMap<String, TopicPattern>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `pattern` matches `routing_key`, compiling and caching the
    /// pattern on first use.
    pub fn matches(&mut self, pattern: &str, routing_key: &str) -> bool {
        self.patterns
            .entry(pattern.to_string())
            .or_insert_with(|| TopicPattern::compile(pattern))
            .matches(routing_key)
    }
}
