//! Statement validation
//!
//! Rules run in a fixed order and stop at the first failure:
//!
//! 1. statement type (read-only unless writes are allowed)
//! 2. forbidden constructs (comments, system catalogs, file output)
//! 3. question injection (question fragments pasted outside literals)
//! 4. schema references (tables and columns must exist)
//! 5. result limit (enforce the caller's limit, never widen it)
//!
//! Statements are parsed with `sqlparser`; comment and literal checks run on
//! its token stream because the AST drops both.

use super::tokens::{lex, Lexeme};
use crate::db::StatementKind;
use crate::error::{AgentError, Result, ValidationRule};
use crate::schema::{Schema, Table};
use sqlparser::ast::{
    Expr, Ident, ObjectName, Query, SelectItem, SetExpr, Statement, TableAlias, TableFactor, TableWithJoins, Value,
    Visit, Visitor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use tracing::{debug, warn};

const SYSTEM_CATALOGS: [&str; 5] = [
    "information_schema",
    "pg_catalog",
    "sqlite_master",
    "sqlite_schema",
    "sqlite_temp_master",
];
const SUSPICIOUS_MARKERS: [&str; 7] = [";", "--", "/*", "*/", "'", "\"", "="];

/// A statement that passed every rule and is ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedStatement {
    pub sql: String,
    pub kind: StatementKind,
    /// Schema tables the statement reads or writes, in first-seen order.
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlValidator {
    allow_writes: bool,
}

impl SqlValidator {
    pub fn new(allow_writes: bool) -> Self {
        Self { allow_writes }
    }

    pub fn validate(&self, sql: &str, schema: &Schema, question: &str, limit: Option<u64>) -> Result<ValidatedStatement> {
        let result = self.run_rules(sql, schema, question, limit);
        match &result {
            Ok(statement) => debug!("Statement validated: {}", statement.sql),
            Err(e) => warn!("Statement rejected: {}", e),
        }
        result
    }

    fn run_rules(&self, sql: &str, schema: &Schema, question: &str, limit: Option<u64>) -> Result<ValidatedStatement> {
        let sql = sql.trim().trim_end_matches(';').trim_end();
        let statement = parse_single(sql)?;
        let facts = Facts::gather(&statement);

        let kind = self.check_statement_type(&statement, &facts)?;
        let lexemes = lex(sql).map_err(|e| {
            AgentError::validation(ValidationRule::StatementType, format!("statement could not be read: {}", e))
        })?;
        check_forbidden_constructs(&lexemes, schema)?;
        check_question_injection(sql, &lexemes, question)?;
        let tables = check_schema_references(&facts, schema)?;
        let sql = enforce_limit(sql, statement, kind, limit)?;

        Ok(ValidatedStatement { sql, kind, tables })
    }

    fn check_statement_type(&self, statement: &Statement, facts: &Facts) -> Result<StatementKind> {
        let reject = |message: String| Err(AgentError::validation(ValidationRule::StatementType, message));

        let writes = match statement {
            Statement::Query(_) => facts.writes,
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. } => true,
            other => return reject(format!("{} statements are not allowed", leading_keyword(other))),
        };
        if writes && !self.allow_writes {
            return reject("write statements require writes to be enabled".to_string());
        }
        // SELECT ... INTO creates a table.
        if facts.select_into {
            return reject("SELECT ... INTO is not allowed".to_string());
        }

        Ok(if writes { StatementKind::Write } else { StatementKind::Read })
    }
}

fn parse_single(sql: &str) -> Result<Statement> {
    let reject = |message: String| AgentError::validation(ValidationRule::StatementType, message);

    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| reject(format!("statement could not be parsed: {}", e)))?;
    match statements.len() {
        0 => Err(reject("empty statement".to_string())),
        1 => statements.pop().ok_or_else(|| reject("empty statement".to_string())),
        _ => Err(reject("multiple statements are not allowed".to_string())),
    }
}

fn leading_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase()
}

fn lower(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

/// Names and references gathered from one walk over the statement.
#[derive(Debug, Default)]
struct Facts {
    /// An INSERT, UPDATE or DELETE appears anywhere in the statement.
    writes: bool,
    select_into: bool,
    ctes: HashSet<String>,
    table_functions: HashSet<String>,
    /// Relation names as written, first-seen order.
    relations: Vec<String>,
    /// Alias to the schema table it stands for; `None` for derived tables,
    /// CTEs and table functions.
    aliases: HashMap<String, Option<String>>,
    /// CTE names, column aliases and projection aliases.
    known: HashSet<String>,
    /// Every column reference as its dotted path.
    identifiers: Vec<Vec<String>>,
}

impl Facts {
    fn gather(statement: &Statement) -> Self {
        let mut facts = Facts::default();
        let _ = statement.visit(&mut facts);
        facts
    }

    fn collect_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.select_into = true;
                }
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.known.insert(lower(alias));
                    }
                }
                for from in &select.from {
                    self.collect_joined(from);
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left);
                self.collect_set_expr(right);
            }
            _ => {}
        }
    }

    fn collect_joined(&mut self, joined: &TableWithJoins) {
        self.collect_factor(&joined.relation);
        for join in &joined.joins {
            self.collect_factor(&join.relation);
        }
    }

    fn collect_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, args, .. } => {
                let table = name.0.last().map(lower).unwrap_or_default();
                if args.is_some() {
                    self.table_functions.insert(table.clone());
                }
                let target = (args.is_none() && !self.ctes.contains(&table)).then_some(table);
                if let Some(alias) = alias {
                    self.add_alias(alias, target);
                }
            }
            TableFactor::Derived { alias, .. } | TableFactor::TableFunction { alias, .. } => {
                if let Some(alias) = alias {
                    self.add_alias(alias, None);
                }
            }
            TableFactor::NestedJoin { table_with_joins, alias } => {
                self.collect_joined(table_with_joins);
                if let Some(alias) = alias {
                    self.add_alias(alias, None);
                }
            }
            _ => {}
        }
    }

    fn add_alias(&mut self, alias: &TableAlias, target: Option<String>) {
        let name = lower(&alias.name);
        self.known.insert(name.clone());
        self.aliases.insert(name, target);
        self.known.extend(alias.columns.iter().map(lower));
    }
}

impl Visitor for Facts {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        match statement {
            Statement::Insert { .. } | Statement::Delete { .. } => self.writes = true,
            Statement::Update { table, .. } => {
                self.writes = true;
                self.collect_joined(table);
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = lower(&cte.alias.name);
                self.known.insert(name.clone());
                self.ctes.insert(name);
                self.known.extend(cte.alias.columns.iter().map(lower));
            }
        }
        self.collect_set_expr(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some(name) = relation.0.last() {
            if !self.relations.iter().any(|r| r.eq_ignore_ascii_case(&name.value)) {
                self.relations.push(name.value.clone());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.identifiers.push(vec![ident.value.clone()]),
            Expr::CompoundIdentifier(idents) => self.identifiers.push(idents.iter().map(|i| i.value.clone()).collect()),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn check_forbidden_constructs(lexemes: &[Lexeme], schema: &Schema) -> Result<()> {
    let reject = |message: String| Err(AgentError::validation(ValidationRule::ForbiddenConstruct, message));

    if lexemes.iter().any(Lexeme::is_comment) {
        return reject("SQL comments are not allowed".to_string());
    }

    let significant: Vec<&Lexeme> = lexemes.iter().filter(|l| !l.is_whitespace()).collect();
    for (i, lexeme) in significant.iter().enumerate() {
        let Some(name) = lexeme.word() else { continue };
        let lower = name.to_lowercase();
        if SYSTEM_CATALOGS.contains(&lower.as_str()) {
            return reject(format!("system catalog '{}' is not accessible", name));
        }
        if lower.starts_with("pg_") && !schema.has_table(name) && !schema.tables.iter().any(|t| t.column(name).is_some()) {
            return reject(format!("system object '{}' is not accessible", name));
        }
        if lexeme.is_keyword("INTO")
            && significant
                .get(i + 1)
                .is_some_and(|n| n.is_keyword("OUTFILE") || n.is_keyword("DUMPFILE"))
        {
            return reject("file output is not allowed".to_string());
        }
    }
    Ok(())
}

/// Reject question fragments that carry SQL syntax and appear in the
/// statement outside a single string literal.
fn check_question_injection(sql: &str, lexemes: &[Lexeme], question: &str) -> Result<()> {
    let literals: Vec<(usize, usize)> = lexemes
        .iter()
        .filter(|l| l.is_string_literal())
        .map(|l| (l.start, l.end))
        .collect();

    let fragments = question
        .split_whitespace()
        .map(|w| w.trim_end_matches(['?', '.', ',', '!']))
        .filter(|w| w.chars().count() >= 2 && SUSPICIOUS_MARKERS.iter().any(|m| w.contains(m)));

    for fragment in fragments {
        for (start, _) in sql.match_indices(fragment) {
            let end = start + fragment.len();
            let inside_literal = literals.iter().any(|&(ls, le)| start > ls && end < le);
            if !inside_literal {
                return Err(AgentError::validation(
                    ValidationRule::QuestionInjection,
                    format!("question fragment '{}' appears unescaped in the statement", fragment),
                ));
            }
        }
    }
    Ok(())
}

fn mismatch(message: String) -> AgentError {
    AgentError::SchemaMismatch(message)
}

fn check_schema_references(facts: &Facts, schema: &Schema) -> Result<Vec<String>> {
    let mut tables: Vec<&Table> = Vec::new();
    for name in &facts.relations {
        let lower = name.to_lowercase();
        if facts.ctes.contains(&lower) || facts.table_functions.contains(&lower) {
            continue;
        }
        let table = schema
            .table(name)
            .ok_or_else(|| mismatch(format!("unknown table '{}'", name)))?;
        if !tables.iter().any(|t| std::ptr::eq(*t, table)) {
            tables.push(table);
        }
    }

    for path in &facts.identifiers {
        match path.as_slice() {
            [] => {}
            [column] => {
                let known = facts.known.contains(&column.to_lowercase());
                if !known && !tables.iter().any(|t| t.column(column).is_some()) {
                    return Err(mismatch(format!("unknown column '{}'", column)));
                }
            }
            [.., qualifier, column] => check_qualified(qualifier, column, facts, schema, &tables)?,
        }
    }

    Ok(tables.iter().map(|t| t.name.clone()).collect())
}

fn check_qualified(qualifier: &str, column: &str, facts: &Facts, schema: &Schema, tables: &[&Table]) -> Result<()> {
    let lower = qualifier.to_lowercase();
    let target = match facts.aliases.get(&lower) {
        Some(target) => target.as_deref().and_then(|name| schema.table(name)),
        None => match schema.table(qualifier) {
            Some(table) if tables.iter().any(|t| std::ptr::eq(*t, table)) => Some(table),
            _ if facts.known.contains(&lower) => None,
            _ => return Err(mismatch(format!("unknown table or alias '{}'", qualifier))),
        },
    };

    match target {
        Some(table) if table.column(column).is_none() => {
            Err(mismatch(format!("unknown column '{}.{}'", table.name, column)))
        }
        _ => Ok(()),
    }
}

/// Plain non-negative integer literal, if that is what the clause holds.
fn literal_count(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        _ => None,
    }
}

fn enforce_limit(sql: &str, statement: Statement, kind: StatementKind, limit: Option<u64>) -> Result<String> {
    let Some(limit) = limit else { return Ok(sql.to_string()) };

    if kind == StatementKind::Write {
        return Err(AgentError::validation(
            ValidationRule::ResultLimit,
            "a row limit cannot be applied to a write statement",
        ));
    }
    let Statement::Query(mut query) = statement else { return Ok(wrap(sql, limit)) };
    let requested = Expr::Value(Value::Number(limit.to_string(), false));

    if let Some(existing) = query.limit.as_ref().map(literal_count) {
        return Ok(match existing {
            Some(n) if n <= limit => sql.to_string(),
            Some(_) => {
                query.limit = Some(requested);
                Statement::Query(query).to_string()
            }
            None => wrap(sql, limit),
        });
    }

    if let Some((percent, quantity)) = query.fetch.as_ref().map(|f| (f.percent, f.quantity.as_ref().map(literal_count))) {
        return Ok(match quantity {
            _ if percent => wrap(sql, limit),
            // FETCH FIRST ROW ONLY
            None => sql.to_string(),
            Some(Some(n)) if n <= limit => sql.to_string(),
            Some(Some(_)) => {
                if let Some(fetch) = query.fetch.as_mut() {
                    fetch.quantity = Some(requested);
                }
                Statement::Query(query).to_string()
            }
            Some(None) => wrap(sql, limit),
        });
    }

    query.limit = Some(requested);
    Ok(Statement::Query(query).to_string())
}

fn wrap(sql: &str, limit: u64) -> String {
    format!("SELECT * FROM ({}) AS limited LIMIT {}", sql, limit)
}
