//! Prompt builder
//!
//! Turns a [`QueryRequest`] plus the live [`Schema`] into a [`Prompt`]. Pure:
//! no I/O, and the only failure is a malformed schema.

use crate::db::Dialect;
use crate::error::{AgentError, Result};
use crate::llm::Prompt;
use crate::query::QueryRequest;
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default word budget for a query prompt.
pub const DEFAULT_MAX_WORDS: usize = 4000;

/// A past question and the statement that answered it well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub question: String,
    pub sql: String,
}

fn system_prompt(dialect: Dialect) -> String {
    format!(
        r#"You are a {dialect} expert who translates questions about a relational database into SQL.

RULES:
- Answer with exactly ONE {dialect} statement inside a ```sql fenced block
- Never write more than one statement and never use SQL comments
- Use only the tables and columns listed in the schema
- Do not query system catalogs
- Read-only questions must be answered with SELECT or WITH"#,
        dialect = dialect.name()
    )
}

fn dialect_notes(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            r#"POSTGRESQL NOTES:
- Use PostgreSQL date/time functions (date_trunc, EXTRACT)
- Use INTERVAL syntax like: CURRENT_DATE - INTERVAL '1 month'
- Always use single quotes for string and interval literals
- For month comparison, use EXTRACT(MONTH FROM timestamp_column)"#
        }
        Dialect::Sqlite => {
            r#"SQLITE NOTES:
- Use strftime('%Y-%m', column) and date('now', '-1 month') for dates
- Always use single quotes for string literals
- There is no INTERVAL type"#
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    dialect: Dialect,
    max_words: usize,
    examples: Vec<Example>,
    history: Vec<Example>,
}

impl PromptBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            max_words: DEFAULT_MAX_WORDS,
            examples: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn with_word_budget(mut self, max_words: usize) -> Self {
        self.max_words = max_words;
        self
    }

    pub fn with_examples(mut self, examples: Vec<Example>) -> Self {
        self.examples = examples;
        self
    }

    /// Earlier turns of the conversation that relate to this question.
    pub fn with_history(mut self, history: Vec<Example>) -> Self {
        self.history = history;
        self
    }

    pub fn build_query_prompt(&self, request: &QueryRequest, schema: &Schema) -> Result<Prompt> {
        if let Some(table) = schema.tables.iter().find(|t| t.columns.is_empty()) {
            return Err(AgentError::SchemaParse(format!("table '{}' has no columns", table.name)));
        }

        let mut sections = vec![
            format!("DATABASE SCHEMA ({}):\n{}", self.dialect.name(), schema.describe().trim_end()),
            dialect_notes(self.dialect).to_string(),
        ];

        if let Some(context) = request.context() {
            sections.push(format!("ADDITIONAL CONTEXT:\n{}", context.trim()));
        }

        if !self.history.is_empty() {
            sections.push(pairs_section("PREVIOUS QUERIES:", &self.history));
        }

        let examples = self.examples_section();
        if !examples.is_empty() {
            sections.push(examples);
        }

        sections.push(format!("QUESTION:\n{}", request.question()));

        let mut output = String::from("OUTPUT:\n```sql\n<one statement>\n```");
        if request.explain() {
            output.push_str("\nExplanation: <one short paragraph on how the statement answers the question>");
        }
        sections.push(output);

        let user = optimize_tokens(&sections.join("\n\n"), self.max_words);
        let prompt = Prompt::new(system_prompt(self.dialect), user);
        debug!("Built query prompt ({} words)", prompt.word_count());
        Ok(prompt)
    }

    /// Few-shot block, dropped entirely when it would use more than a quarter
    /// of the word budget.
    fn examples_section(&self) -> String {
        if self.examples.is_empty() {
            return String::new();
        }
        let text = pairs_section("SIMILAR EXAMPLES:", &self.examples);
        if text.split_whitespace().count() > self.max_words / 4 {
            debug!("Dropping {} examples over the word budget", self.examples.len());
            return String::new();
        }
        text
    }
}

fn pairs_section(header: &str, pairs: &[Example]) -> String {
    let mut text = String::from(header);
    for pair in pairs {
        text.push_str(&format!("\nQuestion: {}\nQuery: {}", pair.question, pair.sql));
    }
    text
}

/// Trim `prompt` to at most `max_words` words by removing lines from the
/// middle, keeping the opening and the closing instructions.
pub fn optimize_tokens(prompt: &str, max_words: usize) -> String {
    if prompt.split_whitespace().count() <= max_words {
        return prompt.to_string();
    }
    let mut lines: Vec<&str> = prompt.lines().collect();
    while lines.len() > 1 && lines.iter().map(|l| l.split_whitespace().count()).sum::<usize>() > max_words {
        lines.remove(lines.len() / 2);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Table};

    fn schema() -> Schema {
        Schema::new(vec![Table::new(
            "customers",
            vec![Column::new("id", "SERIAL").primary(), Column::new("name", "TEXT")],
        )])
    }

    #[test]
    fn test_prompt_contains_schema_question_and_format() {
        let request = QueryRequest::new("How many customers do we have?")
            .unwrap()
            .with_context("Only active accounts")
            .with_explanation(true);
        let prompt = PromptBuilder::new(Dialect::Postgres).build_query_prompt(&request, &schema()).unwrap();

        assert!(prompt.system.contains("exactly ONE PostgreSQL statement"));
        assert!(prompt.user.contains("Table: customers"));
        assert!(prompt.user.contains("QUESTION:\nHow many customers do we have?"));
        assert!(prompt.user.contains("ADDITIONAL CONTEXT:\nOnly active accounts"));
        assert!(prompt.user.contains("INTERVAL '1 month'"));
        assert!(prompt.user.contains("Explanation:"));
    }

    #[test]
    fn test_table_without_columns_is_rejected() {
        let request = QueryRequest::new("anything").unwrap();
        let broken = Schema::new(vec![Table::new("empty", vec![])]);
        let err = PromptBuilder::new(Dialect::Sqlite).build_query_prompt(&request, &broken).unwrap_err();
        assert!(matches!(err, AgentError::SchemaParse(_)));
    }

    #[test]
    fn test_examples_are_included() {
        let request = QueryRequest::new("count orders").unwrap();
        let prompt = PromptBuilder::new(Dialect::Sqlite)
            .with_examples(vec![Example {
                question: "count customers".into(),
                sql: "SELECT COUNT(*) FROM customers".into(),
            }])
            .build_query_prompt(&request, &schema())
            .unwrap();
        assert!(prompt.user.contains("Query: SELECT COUNT(*) FROM customers"));
        assert!(!prompt.user.contains("Explanation:"));
    }

    #[test]
    fn test_history_follows_context() {
        let request = QueryRequest::new("orders per city").unwrap().with_context("only 2024");
        let prompt = PromptBuilder::new(Dialect::Sqlite)
            .with_history(vec![Example {
                question: "orders per customer".into(),
                sql: "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id".into(),
            }])
            .build_query_prompt(&request, &schema())
            .unwrap();
        let context = prompt.user.find("ADDITIONAL CONTEXT:").unwrap();
        let history = prompt.user.find("PREVIOUS QUERIES:").unwrap();
        let question = prompt.user.find("QUESTION:").unwrap();
        assert!(context < history && history < question);
        assert!(prompt.user.contains("Question: orders per customer"));
    }

    #[test]
    fn test_word_budget_drops_examples() {
        let request = QueryRequest::new("count orders").unwrap();
        let examples = vec![Example {
            question: "count customers in every city we know about".into(),
            sql: "SELECT city, COUNT(*) FROM customers GROUP BY city".into(),
        }];
        let roomy = PromptBuilder::new(Dialect::Sqlite)
            .with_examples(examples.clone())
            .build_query_prompt(&request, &schema())
            .unwrap();
        assert!(roomy.user.contains("SIMILAR EXAMPLES:"));
        let tight = PromptBuilder::new(Dialect::Sqlite)
            .with_word_budget(40)
            .with_examples(examples)
            .build_query_prompt(&request, &schema())
            .unwrap();
        assert!(!tight.user.contains("SIMILAR EXAMPLES:"));
    }

    #[test]
    fn test_optimize_tokens_removes_middle_lines() {
        let text = "first line\nmiddle one\nmiddle two\nlast line";
        assert_eq!(optimize_tokens(text, 100), text);
        let trimmed = optimize_tokens(text, 4);
        assert_eq!(trimmed, "first line\nlast line");
    }
}
