//! Pull the SQL statement out of raw model output.

use super::tokens::{lex, split_statements};
use crate::error::{AgentError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::tokenizer::Token;
use tracing::debug;

lazy_static! {
    static ref FENCE: Regex = Regex::new(r"(?s)```[ \t]*([A-Za-z]*)[^\n]*\n(.*?)```").unwrap();
    static ref SQL_TAG: Regex = Regex::new(r"(?is)<sql>(.*?)</sql>").unwrap();
    static ref EXPLANATION: Regex = Regex::new(r"(?is)^\s*(?:\*\*)?explanation(?:\*\*)?\s*:?\s*(?:\*\*)?\s*").unwrap();
}

const SQL_FENCE_TAGS: [&str; 6] = ["", "sql", "postgresql", "postgres", "psql", "sqlite"];

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// The single statement, without its terminating delimiter.
    pub sql: String,
    /// Text after the SQL block, when the model supplied one.
    pub explanation: Option<String>,
}

/// Locate the first fenced (```` ```sql ````) or `<sql>`-delimited block.
///
/// Fails with `AgentError::Extraction` when there is no block, when the block
/// is empty, or when it holds more than one top-level statement.
pub fn extract(raw: &str) -> Result<Extracted> {
    let (body, block_end) = find_block(raw)
        .ok_or_else(|| AgentError::Extraction("no fenced or delimited SQL block in model output".to_string()))?;

    let statements = split_statements(body);
    let sql = match statements.as_slice() {
        [] => return Err(AgentError::Extraction("SQL block is empty".to_string())),
        [single] => keep_trailing_comments(body, single),
        many => {
            return Err(AgentError::Extraction(format!(
                "expected exactly one statement, found {}",
                many.len()
            )))
        }
    };

    let explanation = explanation_after(&raw[block_end..]);
    debug!("Extracted statement: {}", sql);
    Ok(Extracted { sql, explanation })
}

fn find_block(raw: &str) -> Option<(&str, usize)> {
    let fenced = FENCE.captures_iter(raw).find_map(|caps| {
        let tag = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        if !SQL_FENCE_TAGS.contains(&tag.as_str()) {
            return None;
        }
        let body = caps.get(2)?;
        let whole = caps.get(0)?;
        Some((body.as_str(), whole.start(), whole.end()))
    });
    let tagged = SQL_TAG.captures(raw).and_then(|caps| {
        let body = caps.get(1)?;
        let whole = caps.get(0)?;
        Some((body.as_str(), whole.start(), whole.end()))
    });

    let first = match (fenced, tagged) {
        (Some(f), Some(t)) => Some(if t.1 < f.1 { t } else { f }),
        (f, t) => f.or(t),
    };
    first.map(|(body, _, end)| (body, end))
}

/// A comment after the delimiter is not a second statement, but it must stay
/// visible to the validator.
fn keep_trailing_comments(body: &str, statement: &str) -> String {
    let trailing: Vec<&str> = lex(body)
        .unwrap_or_default()
        .iter()
        .skip_while(|l| l.token != Token::SemiColon)
        .filter(|l| l.is_comment())
        .map(|l| body[l.start..l.end].trim())
        .collect();
    if trailing.is_empty() {
        statement.to_string()
    } else {
        format!("{} {}", statement, trailing.join(" "))
    }
}

fn explanation_after(rest: &str) -> Option<String> {
    let text = EXPLANATION.replace(rest.trim(), "");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
