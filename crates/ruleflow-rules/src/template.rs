//! Shell command templates.
//!
//! Templates are parsed once at load time into literal text and typed
//! [`Placeholder`]s. Rendering is a pure function of a caller-supplied scope,
//! so the same template type serves commands and parameter values.

use ruleflow_types::{FlowError, Result};

use crate::braces::{is_identifier, tokenize, Token};
use crate::pattern::Unbound;

/// Which file of an input or output list a placeholder refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every path, space separated.
    All,
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Input(Selector),
    Output(Selector),
    Log,
    Threads,
    Memory,
    Param(String),
    Wildcard(String),
    Rule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Placeholder { text: String, placeholder: Placeholder },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    raw: String,
    parts: Vec<Part>,
}

fn parse_selector(rest: &str) -> Option<Selector> {
    let key = if let Some(inner) = rest.strip_prefix('[') {
        inner.strip_suffix(']')?
    } else {
        rest.strip_prefix('.')?
    };
    if let Ok(idx) = key.parse::<usize>() {
        return Some(Selector::Index(idx));
    }
    is_identifier(key).then(|| Selector::Name(key.to_string()))
}

fn parse_placeholder(body: &str) -> Option<Placeholder> {
    let body = body.trim();
    match body {
        "input" => return Some(Placeholder::Input(Selector::All)),
        "output" => return Some(Placeholder::Output(Selector::All)),
        "log" => return Some(Placeholder::Log),
        "threads" | "resources.threads" => return Some(Placeholder::Threads),
        "resources.memory" | "resources.mem" => return Some(Placeholder::Memory),
        "rule" => return Some(Placeholder::Rule),
        _ => {}
    }
    if let Some(sel) = body.strip_prefix("input").and_then(parse_selector) {
        return Some(Placeholder::Input(sel));
    }
    if let Some(sel) = body.strip_prefix("output").and_then(parse_selector) {
        return Some(Placeholder::Output(sel));
    }
    if let Some(key) = body.strip_prefix("params.") {
        return is_identifier(key).then(|| Placeholder::Param(key.to_string()));
    }
    if let Some(key) = body.strip_prefix("wildcards.") {
        return is_identifier(key).then(|| Placeholder::Wildcard(key.to_string()));
    }
    // Bare `{sample}` is shorthand for `{wildcards.sample}`.
    is_identifier(body).then(|| Placeholder::Wildcard(body.to_string()))
}

impl CommandTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let tokens = tokenize(raw).map_err(|message| FlowError::InvalidPattern {
            pattern: raw.to_string(),
            message,
        })?;

        let mut parts = Vec::with_capacity(tokens.len());
        for tok in tokens {
            match tok {
                Token::Literal(text) => parts.push(Part::Literal(text)),
                Token::Placeholder(body) => {
                    let placeholder =
                        parse_placeholder(&body).ok_or_else(|| FlowError::InvalidPattern {
                            pattern: raw.to_string(),
                            message: format!("unknown placeholder '{{{body}}}'"),
                        })?;
                    parts.push(Part::Placeholder {
                        text: body.trim().to_string(),
                        placeholder,
                    });
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &Placeholder> {
        self.parts.iter().filter_map(|p| match p {
            Part::Placeholder { placeholder, .. } => Some(placeholder),
            Part::Literal(_) => None,
        })
    }

    /// Render with `scope` supplying a value for each placeholder.
    ///
    /// The first placeholder the scope cannot resolve is returned as
    /// [`Unbound`] with its source text.
    pub fn render<F>(&self, scope: F) -> std::result::Result<String, Unbound>
    where
        F: Fn(&Placeholder) -> Option<String>,
    {
        let mut out = String::with_capacity(self.raw.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Placeholder { text, placeholder } => match scope(placeholder) {
                    Some(value) => out.push_str(&value),
                    None => return Err(Unbound(text.clone())),
                },
            }
        }
        Ok(out)
    }
}

impl std::fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_placeholders() {
        let t = CommandTemplate::parse(
            "tool -@ {threads} -m {resources.memory} {params.opts} {input.reads} {input[1]} > {output.0} 2> {log}",
        )
        .unwrap();
        let phs: Vec<_> = t.placeholders().cloned().collect();
        assert_eq!(
            phs,
            vec![
                Placeholder::Threads,
                Placeholder::Memory,
                Placeholder::Param("opts".into()),
                Placeholder::Input(Selector::Name("reads".into())),
                Placeholder::Input(Selector::Index(1)),
                Placeholder::Output(Selector::Index(0)),
                Placeholder::Log,
            ]
        );
    }

    #[test]
    fn bare_name_is_a_wildcard() {
        let t = CommandTemplate::parse("echo {sample} {wildcards.mate}").unwrap();
        let phs: Vec<_> = t.placeholders().cloned().collect();
        assert_eq!(
            phs,
            vec![
                Placeholder::Wildcard("sample".into()),
                Placeholder::Wildcard("mate".into())
            ]
        );
    }

    #[test]
    fn unknown_namespace_is_rejected() {
        let err = CommandTemplate::parse("echo {foo.bar}").unwrap_err();
        assert!(err.to_string().contains("unknown placeholder"), "got: {err}");
    }

    #[test]
    fn render_uses_scope() {
        let t = CommandTemplate::parse("cat {input} > {output}").unwrap();
        let rendered = t
            .render(|p| match p {
                Placeholder::Input(Selector::All) => Some("a.txt b.txt".into()),
                Placeholder::Output(Selector::All) => Some("c.txt".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(rendered, "cat a.txt b.txt > c.txt");
    }

    #[test]
    fn render_reports_first_unbound_placeholder() {
        let t = CommandTemplate::parse("samtools sort {x}.bam -o {output}").unwrap();
        let err = t.render(|_| None).unwrap_err();
        assert_eq!(err, Unbound("x".into()));
    }

    #[test]
    fn escaped_braces_render_literally() {
        let t = CommandTemplate::parse("awk '{{print $1}}' {input}").unwrap();
        let out = t.render(|_| Some("f".into())).unwrap();
        assert_eq!(out, "awk '{print $1}' f");
    }
}
