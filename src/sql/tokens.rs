//! Source spans for sqlparser tokens
//!
//! The parser drops comments and literal positions; the safety checks need
//! both, so tokens are re-anchored to byte offsets in the original text.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer, TokenizerError, Whitespace};

#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

impl Lexeme {
    pub fn is_comment(&self) -> bool {
        matches!(
            self.token,
            Token::Whitespace(Whitespace::SingleLineComment { .. }) | Token::Whitespace(Whitespace::MultiLineComment(_))
        )
    }

    pub fn is_whitespace(&self) -> bool {
        matches!(self.token, Token::Whitespace(_))
    }

    pub fn is_string_literal(&self) -> bool {
        matches!(
            self.token,
            Token::SingleQuotedString(_) | Token::NationalStringLiteral(_) | Token::EscapedStringLiteral(_)
        )
    }

    /// Unquoted word value, or `None` for anything but a word.
    pub fn word(&self) -> Option<&str> {
        match &self.token {
            Token::Word(word) => Some(&word.value),
            _ => None,
        }
    }

    pub fn is_keyword(&self, keyword: &str) -> bool {
        match &self.token {
            Token::Word(word) => word.quote_style.is_none() && word.value.eq_ignore_ascii_case(keyword),
            _ => false,
        }
    }
}

pub fn lex(sql: &str) -> std::result::Result<Vec<Lexeme>, TokenizerError> {
    let dialect = GenericDialect {};
    let located = Tokenizer::new(&dialect, sql).tokenize_with_location()?;

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();
    let offset = |line: u64, column: u64| -> usize {
        let line_start = line
            .checked_sub(1)
            .and_then(|l| line_starts.get(l as usize))
            .copied()
            .unwrap_or(sql.len());
        let skip = column.saturating_sub(1) as usize;
        sql[line_start..]
            .char_indices()
            .nth(skip)
            .map(|(i, _)| line_start + i)
            .unwrap_or(sql.len())
    };

    let starts: Vec<usize> = located.iter().map(|t| offset(t.location.line, t.location.column)).collect();
    Ok(located
        .into_iter()
        .enumerate()
        .filter(|(_, t)| t.token != Token::EOF)
        .map(|(i, t)| Lexeme {
            token: t.token,
            start: starts[i],
            end: starts.get(i + 1).copied().unwrap_or(sql.len()),
        })
        .collect())
}

/// Statement bodies between top-level `;` delimiters, skipping pieces that
/// hold nothing but whitespace and comments. Text the tokenizer cannot read
/// comes back as a single piece for the parser to reject.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let Ok(lexemes) = lex(sql) else {
        let body = sql.trim().trim_end_matches(';').trim_end();
        return if body.is_empty() { Vec::new() } else { vec![body] };
    };

    let mut pieces = Vec::new();
    let mut piece_start = 0;
    let mut has_code = false;
    for lexeme in &lexemes {
        if lexeme.token == Token::SemiColon {
            if has_code {
                pieces.push(sql[piece_start..lexeme.start].trim());
            }
            piece_start = lexeme.end;
            has_code = false;
        } else if !lexeme.is_whitespace() {
            has_code = true;
        }
    }
    if has_code {
        pieces.push(sql[piece_start..].trim());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_cover_source_text() {
        let sql = "SELECT 'a;b'\n  FROM t -- tail";
        let lexemes = lex(sql).unwrap();
        let literal = lexemes.iter().find(|l| l.is_string_literal()).unwrap();
        assert_eq!(&sql[literal.start..literal.end], "'a;b'");
        let table = lexemes.iter().find(|l| l.word() == Some("t")).unwrap();
        assert_eq!(&sql[table.start..table.end], "t");
        assert!(lexemes.last().unwrap().is_comment());
    }

    #[test]
    fn test_split_statements() {
        assert_eq!(split_statements("SELECT 1;"), vec!["SELECT 1"]);
        assert_eq!(split_statements("SELECT 1; DROP TABLE x;"), vec!["SELECT 1", "DROP TABLE x"]);
        assert_eq!(split_statements("SELECT ';' AS semi"), vec!["SELECT ';' AS semi"]);
        assert_eq!(split_statements("SELECT 1; -- trailing note"), vec!["SELECT 1"]);
        assert!(split_statements("  ;  ").is_empty());
    }
}
