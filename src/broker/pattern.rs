//! Glob-style channel patterns as used by pattern subscriptions.
//!
//! Supports `*`, `?`, `[...]` / `[^...]` classes and `\` escapes.

use regex::Regex;

use crate::error::BrokerError;

/// Compiled channel pattern.
#[derive(Debug, Clone)]
pub struct ChannelPattern {
    source: String,
    regex: Regex,
}

impl ChannelPattern {
    /// Compiles a glob pattern.
    pub fn new(pattern: &str) -> Result<Self, BrokerError> {
        let invalid = |reason: &str| BrokerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut out = String::with_capacity(pattern.len() * 2 + 2);
        out.push('^');
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => out.push_str(".*"),
                '?' => out.push('.'),
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| invalid("trailing escape"))?;
                    out.push_str(&regex::escape(&escaped.to_string()));
                }
                '[' => {
                    out.push('[');
                    let mut first = true;
                    let mut negated = false;
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        match c {
                            ']' if !first => {
                                closed = true;
                                break;
                            }
                            '^' | '!' if first && !negated => {
                                out.push('^');
                                negated = true;
                                continue;
                            }
                            '-' => out.push('-'),
                            '\\' => {
                                let escaped =
                                    chars.next().ok_or_else(|| invalid("trailing escape"))?;
                                out.push_str(&regex::escape(&escaped.to_string()));
                            }
                            _ => out.push_str(&regex::escape(&c.to_string())),
                        }
                        first = false;
                    }
                    if !closed {
                        return Err(invalid("unterminated character class"));
                    }
                    out.push(']');
                }
                _ => out.push_str(&regex::escape(&c.to_string())),
            }
        }
        out.push('$');

        let regex = Regex::new(&out).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether a channel name matches.
    pub fn matches(&self, channel: &str) -> bool {
        self.regex.is_match(channel)
    }

    /// The original glob text.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern() {
        let pattern = ChannelPattern::new("entry.queue").expect("valid pattern");
        assert!(pattern.matches("entry.queue"));
        assert!(!pattern.matches("entryXqueue"));
        assert!(!pattern.matches("entry.queue2"));
    }

    #[test]
    fn test_wildcards() {
        let pattern = ChannelPattern::new("news.*").expect("valid pattern");
        assert!(pattern.matches("news.sport"));
        assert!(pattern.matches("news."));
        assert!(!pattern.matches("weather.today"));

        let pattern = ChannelPattern::new("h?llo").expect("valid pattern");
        assert!(pattern.matches("hello"));
        assert!(pattern.matches("hallo"));
        assert!(!pattern.matches("hllo"));
    }

    #[test]
    fn test_character_classes() {
        let pattern = ChannelPattern::new("h[ae]llo").expect("valid pattern");
        assert!(pattern.matches("hello"));
        assert!(pattern.matches("hallo"));
        assert!(!pattern.matches("hillo"));

        let pattern = ChannelPattern::new("h[^e]llo").expect("valid pattern");
        assert!(!pattern.matches("hello"));
        assert!(pattern.matches("hallo"));

        let pattern = ChannelPattern::new("q[0-9]").expect("valid pattern");
        assert!(pattern.matches("q7"));
        assert!(!pattern.matches("qa"));
    }

    #[test]
    fn test_escape() {
        let pattern = ChannelPattern::new(r"a\*b").expect("valid pattern");
        assert!(pattern.matches("a*b"));
        assert!(!pattern.matches("axb"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(ChannelPattern::new("a[bc").is_err());
        assert!(ChannelPattern::new("trailing\\").is_err());
    }
}
