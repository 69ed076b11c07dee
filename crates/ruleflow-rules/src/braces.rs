//! Brace-template tokenizer shared by path patterns and command templates.
//!
//! `{name}` is a placeholder, `{{` and `}}` are literal braces. Placeholder
//! bodies may contain balanced inner braces so regex constraints such as
//! `{lane,\d{3}}` survive intact.

use winnow::combinator::{alt, cut_err, repeat};
use winnow::error::{StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Literal(String),
    Placeholder(String),
}

/// `{{` or `}}`.
fn escaped_brace(input: &mut &str) -> ModalResult<char> {
    alt((literal("{{").value('{'), literal("}}").value('}'))).parse_next(input)
}

/// A run of text without any brace.
fn literal_run<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| c != '{' && c != '}').parse_next(input)
}

/// Text up to the closing brace of the current placeholder, keeping nested pairs.
fn balanced(input: &mut &str) -> ModalResult<String> {
    let mut out = String::new();
    loop {
        let chunk: &str = take_while(0.., |c: char| c != '{' && c != '}').parse_next(input)?;
        out.push_str(chunk);
        if !input.starts_with('{') {
            break;
        }
        let _ = '{'.parse_next(input)?;
        let inner = balanced.parse_next(input)?;
        let _ = cut_err('}')
            .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
            .parse_next(input)?;
        out.push('{');
        out.push_str(&inner);
        out.push('}');
    }
    Ok(out)
}

fn placeholder(input: &mut &str) -> ModalResult<String> {
    let _ = '{'.parse_next(input)?;
    let body = balanced.parse_next(input)?;
    let _ = cut_err('}')
        .context(StrContext::Expected(StrContextValue::CharLiteral('}')))
        .parse_next(input)?;
    Ok(body)
}

fn token(input: &mut &str) -> ModalResult<Token> {
    alt((
        escaped_brace.map(|c| Token::Literal(c.to_string())),
        literal_run.map(|s| Token::Literal(s.to_string())),
        placeholder.map(Token::Placeholder),
    ))
    .parse_next(input)
}

/// Split a template into literal text and placeholder bodies.
///
/// Adjacent literal tokens are merged. Errors carry a human-readable message.
pub(crate) fn tokenize(raw: &str) -> Result<Vec<Token>, String> {
    let mut remaining = raw;
    let tokens: Vec<Token> = repeat(0.., token)
        .parse_next(&mut remaining)
        .map_err(|e| format!("unterminated placeholder ({e})"))?;

    if !remaining.is_empty() {
        let offset = raw.len() - remaining.len();
        return Err(format!("unmatched '}}' at offset {offset}"));
    }

    let mut merged: Vec<Token> = Vec::with_capacity(tokens.len());
    for tok in tokens {
        match (merged.last_mut(), tok) {
            (Some(Token::Literal(prev)), Token::Literal(next)) => prev.push_str(&next),
            (_, tok) => merged.push(tok),
        }
    }
    Ok(merged)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
