//! Wildcard path patterns.
//!
//! A pattern such as `mapped/{sample}_{mate,[12]}.bam` compiles to an anchored
//! regex with one named capture group per wildcard occurrence. Matching a
//! concrete path yields a [`WildcardBinding`]; rendering substitutes a binding
//! back into the pattern. The two directions are independent of each other.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use ruleflow_types::{FlowError, Result};

use crate::braces::{is_identifier, tokenize, Token};

/// Wildcard name → concrete value. Ordered so bindings hash and print stably.
pub type WildcardBinding = BTreeMap<String, String>;

/// Unconstrained wildcards match any non-separator substring.
const DEFAULT_WILDCARD_REGEX: &str = "[^/]+";

/// A placeholder name with no value in the rendering scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unbound(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard {
        name: String,
        constraint: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
    regex: Regex,
    /// Capture group `g{i}` belongs to wildcard `groups[i]`.
    groups: Vec<String>,
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |message: String| FlowError::InvalidPattern {
            pattern: raw.to_string(),
            message,
        };

        if raw.is_empty() {
            return Err(invalid("pattern is empty".into()));
        }

        let tokens = tokenize(raw).map_err(invalid)?;
        let mut segments = Vec::with_capacity(tokens.len());
        for tok in tokens {
            match tok {
                Token::Literal(text) => segments.push(Segment::Literal(text)),
                Token::Placeholder(body) => {
                    let (name, constraint) = match body.split_once(',') {
                        Some((name, constraint)) => {
                            (name.trim().to_string(), Some(constraint.to_string()))
                        }
                        None => (body.trim().to_string(), None),
                    };
                    if !is_identifier(&name) {
                        return Err(invalid(format!("'{{{body}}}' is not a valid wildcard name")));
                    }
                    if let Some(ref c) = constraint {
                        if c.is_empty() {
                            return Err(invalid(format!("wildcard '{name}' has an empty constraint")));
                        }
                    }
                    segments.push(Segment::Wildcard { name, constraint });
                }
            }
        }

        let mut source = String::from("^");
        let mut groups = Vec::new();
        for seg in &segments {
            match seg {
                Segment::Literal(text) => source.push_str(&regex::escape(text)),
                Segment::Wildcard { name, constraint } => {
                    let body = constraint.as_deref().unwrap_or(DEFAULT_WILDCARD_REGEX);
                    source.push_str(&format!("(?P<g{}>(?:{}))", groups.len(), body));
                    groups.push(name.clone());
                }
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| invalid(format!("bad constraint: {e}")))?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
            regex,
            groups,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Distinct wildcard names used by this pattern.
    pub fn wildcards(&self) -> BTreeSet<String> {
        self.groups.iter().cloned().collect()
    }

    /// `true` when the pattern contains no wildcard at all.
    pub fn is_concrete(&self) -> bool {
        self.groups.is_empty()
    }

    /// Match a concrete path, extracting wildcard values.
    ///
    /// A wildcard that occurs more than once must capture the same value at
    /// every occurrence.
    pub fn matches(&self, path: &str) -> Option<WildcardBinding> {
        let caps = self.regex.captures(path)?;
        let mut binding = WildcardBinding::new();
        for (i, name) in self.groups.iter().enumerate() {
            let value = caps.name(&format!("g{i}"))?.as_str();
            match binding.get(name) {
                Some(existing) if existing != value => return None,
                Some(_) => {}
                None => {
                    binding.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(binding)
    }

    /// Substitute `binding` into the pattern.
    pub fn render(&self, binding: &WildcardBinding) -> std::result::Result<String, Unbound> {
        let mut out = String::with_capacity(self.raw.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Wildcard { name, .. } => match binding.get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(Unbound(name.clone())),
                },
            }
        }
        Ok(out)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
