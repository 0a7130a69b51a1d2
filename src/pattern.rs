//! Routing-key patterns for topic-style matching.
//!
//! Patterns are dot-segmented, matched against routing keys of the form
//! `"domain.action"`:
//!
//! - a literal segment matches itself (case- and whitespace-sensitive)
//! - `*` matches exactly one segment
//! - `#` matches zero or more segments; on its own it matches any key
//! - a bare `*` also matches any key, regardless of segment count
//!
//! Overlapping patterns are allowed by design: `order.*` and `*.created`
//! both match `order.created`.
//!
//! ## Example
//!
//! ```
//! use topic_bus::Pattern;
//!
//! let p = Pattern::new("order.*");
//! assert!(p.matches("order.created"));
//! assert!(p.matches("order.paid"));
//! assert!(!p.matches("user.created"));
//! ```

/// The all-match token: matches any routing key.
pub const MATCH_ALL: &str = "#";

/// A routing-key pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
}

impl Pattern {
    /// Create a pattern from its textual form.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            raw: pattern.into(),
        }
    }

    /// The textual form of this pattern.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether this pattern matches every routing key.
    pub fn is_match_all(&self) -> bool {
        self.raw == MATCH_ALL || self.raw == "*"
    }

    /// Match a routing key against this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        if self.is_match_all() {
            return true;
        }

        let pattern: Vec<&str> = self.raw.split('.').collect();
        let key: Vec<&str> = routing_key.split('.').collect();
        matches_segments(&pattern, &key)
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern::new(s)
    }
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((seg, rest)) if *seg == MATCH_ALL => {
            // `#` absorbs zero or more segments.
            (0..=key.len()).any(|skip| matches_segments(rest, &key[skip..]))
        }
        Some((seg, rest)) => match key.split_first() {
            Some((head, tail)) => (*seg == "*" || seg == head) && matches_segments(rest, tail),
            None => false,
        },
    }
}
