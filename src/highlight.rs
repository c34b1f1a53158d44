use std::sync::LazyLock;

use regex::Regex;

/// A digit, then digits/spaces/tabs, then a digit; at least six characters in all.
static CODE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9][0-9 \t]{4,}[0-9]\b").unwrap());

/// Highlights verification codes in bodies that mention one of the configured keywords.
#[derive(Debug, Clone, Default)]
pub struct CodeHighlighter {
    keywords: Vec<String>,
}

impl CodeHighlighter {
    /// Parse a comma-separated keyword list. Matching is case-insensitive.
    pub fn parse(raw: &str) -> Self {
        let keywords = raw
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { keywords }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn mentions_code(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }

    /// Replace each code-shaped run with its digits, fenced when `markdown` is set.
    ///
    /// Every match is substituted at its first occurrence in the working text, so a
    /// code that appears verbatim twice is only rewritten once per match.
    pub fn process(&self, text: &str, markdown: bool) -> String {
        if !self.mentions_code(text) {
            return text.to_string();
        }

        let mut out = text.to_string();
        for found in CODE_PATTERN.find_iter(text) {
            let span = found.as_str();
            let digits: String = span.chars().filter(|c| !c.is_whitespace()).collect();
            let replacement = if markdown {
                format!("```{}```", digits)
            } else {
                digits
            };
            out = out.replacen(span, &replacement, 1);
        }
        out
    }
}
