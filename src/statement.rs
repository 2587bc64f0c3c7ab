//! Lightweight statement classification.
//!
//! The connection never executes SQL itself; it only needs to know what kind of
//! statement a query is so it can decide whether data must be received from the
//! client before execution starts. Anything more is the engine's business.
use thiserror::Error;

use crate::block::DataType;

/// Where the rows of an INSERT come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertSource {
    /// Bare `INSERT INTO t [FORMAT ...]`: the client streams the rows as data blocks.
    ClientData,
    /// `INSERT INTO t SELECT ...`
    Select(String),
    /// `INSERT INTO t VALUES (...)`
    Values(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Select(String),
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        source: InsertSource,
    },
    CreateTable {
        table: String,
        columns: Vec<(String, DataType)>,
    },
}

#[derive(Error, Debug)]
pub enum StatementError {
    #[error("empty query")]
    EmptyStatement,

    #[error("statement not supported: {0}")]
    Unsupported(String),

    #[error("syntax error: {reason}")]
    Syntax { reason: String },
}

/// Query text together with its classified form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub text: String,
    pub statement: Statement,
}

impl ParsedQuery {
    pub fn parse(text: &str) -> Result<Self, StatementError> {
        let statement = Statement::try_from(text)?;
        Ok(Self {
            text: text.to_string(),
            statement,
        })
    }

    /// True only for a bare INSERT whose rows the client sends as data packets.
    pub fn needs_client_data(&self) -> bool {
        matches!(
            self.statement,
            Statement::Insert {
                source: InsertSource::ClientData,
                ..
            }
        )
    }

    pub fn insert_table(&self) -> Option<&str> {
        match &self.statement {
            Statement::Insert { table, .. } => Some(table),
            _ => None,
        }
    }
}

impl TryFrom<&str> for Statement {
    type Error = StatementError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let s = value.trim().trim_end_matches(';').trim();
        let lower = s.to_ascii_lowercase();

        match lower.split_whitespace().next() {
            None => Err(StatementError::EmptyStatement),
            Some("select") | Some("with") => Ok(Statement::Select(s.to_string())),
            Some("insert") => parse_insert(s, &lower),
            Some("create") => parse_create(s, &lower),
            Some(_) => Err(StatementError::Unsupported(s.to_string())),
        }
    }
}

fn parse_insert(s: &str, lower: &str) -> Result<Statement, StatementError> {
    let into = lower.find(" into ").ok_or_else(|| StatementError::Syntax {
        reason: "INSERT requires INTO <table>".to_string(),
    })?;
    let rest = s[into + " into ".len()..].trim_start();

    let table_end = rest
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(rest.len());
    let table = rest[..table_end].to_string();
    if table.is_empty() {
        return Err(StatementError::Syntax {
            reason: "INSERT requires a table name".to_string(),
        });
    }

    let mut rest = rest[table_end..].trim_start();
    let mut columns = None;
    if rest.starts_with('(') {
        let close = rest.find(')').ok_or_else(|| StatementError::Syntax {
            reason: "unterminated column list".to_string(),
        })?;
        columns = Some(
            rest[1..close]
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        );
        rest = rest[close + 1..].trim_start();
    }

    let keyword = rest
        .split_whitespace()
        .next()
        .map(str::to_lowercase)
        .unwrap_or_default();
    let source = match keyword.as_str() {
        "" | "format" => InsertSource::ClientData,
        "select" | "with" => InsertSource::Select(rest.to_string()),
        "values" => InsertSource::Values(rest["values".len()..].trim().to_string()),
        other => {
            return Err(StatementError::Syntax {
                reason: format!("unexpected '{other}' after INSERT target"),
            });
        }
    };

    Ok(Statement::Insert {
        table,
        columns,
        source,
    })
}

fn parse_create(s: &str, lower: &str) -> Result<Statement, StatementError> {
    let Some(after) = lower.strip_prefix("create table") else {
        return Err(StatementError::Unsupported(s.to_string()));
    };
    let offset = s.len() - after.len();
    let rest = s[offset..].trim_start();

    let (open, close) = match (rest.find('('), rest.rfind(')')) {
        (Some(open), Some(close)) if open < close => (open, close),
        _ => {
            return Err(StatementError::Syntax {
                reason: "CREATE TABLE requires a column list".to_string(),
            });
        }
    };

    let table = rest[..open].trim().to_string();
    let mut columns = Vec::new();
    for definition in rest[open + 1..close].split(',') {
        let mut parts = definition.split_whitespace();
        let (Some(name), Some(ty)) = (parts.next(), parts.next()) else {
            return Err(StatementError::Syntax {
                reason: format!("invalid column definition '{}'", definition.trim()),
            });
        };
        let data_type = DataType::parse(ty).ok_or_else(|| StatementError::Syntax {
            reason: format!("unknown type '{ty}'"),
        })?;
        columns.push((name.to_string(), data_type));
    }

    Ok(Statement::CreateTable { table, columns })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "Unsupported")]
    fn unsupported_statement() {
        let _: Statement = "get from somewhere".try_into().unwrap();
    }

    #[test]
    #[should_panic(expected = "EmptyStatement")]
    fn empty_statement() {
        let _: Statement = "  ;".try_into().unwrap();
    }

    #[test]
    fn select_case_insensitive() {
        let stmt: Statement = "SeLeCt 1".try_into().unwrap();

        assert_eq!(stmt, Statement::Select("SeLeCt 1".to_string()));
    }

    #[test]
    fn bare_insert_needs_client_data() {
        let query = ParsedQuery::parse("INSERT INTO events (id, name) FORMAT Native").unwrap();

        assert!(query.needs_client_data());
        assert_eq!(
            query.statement,
            Statement::Insert {
                table: "events".to_string(),
                columns: Some(vec!["id".to_string(), "name".to_string()]),
                source: InsertSource::ClientData,
            }
        );
    }

    #[test]
    fn insert_select_does_not_need_client_data() {
        let query = ParsedQuery::parse("insert into t select number from numbers(3)").unwrap();

        assert!(!query.needs_client_data());
        assert_eq!(query.insert_table(), Some("t"));
    }

    #[test]
    fn insert_values_keeps_literal_text() {
        let stmt: Statement = "INSERT INTO t VALUES (1, 'a')".try_into().unwrap();

        assert!(matches!(
            stmt,
            Statement::Insert { source: InsertSource::Values(ref v), .. } if v == "(1, 'a')"
        ));
    }

    #[test]
    fn create_table_columns() {
        let stmt: Statement = "CREATE TABLE t (id UInt64, name String)".try_into().unwrap();

        assert_eq!(
            stmt,
            Statement::CreateTable {
                table: "t".to_string(),
                columns: vec![
                    ("id".to_string(), DataType::UInt64),
                    ("name".to_string(), DataType::String)
                ],
            }
        );
    }

    #[test]
    fn create_table_rejects_unknown_type() {
        let res: Result<Statement, _> = "CREATE TABLE t (id Decimal)".try_into();

        assert!(matches!(res, Err(StatementError::Syntax { .. })));
    }
}
