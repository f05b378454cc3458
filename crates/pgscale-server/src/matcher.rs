//! SELECT recognition and cache routing
//!
//! Decides whether a client query is eligible for the result cache. The
//! fast path rejects anything that does not start with `SEL`; the full path
//! parses the statement with the PostgreSQL dialect and collects every
//! table reference reachable from a FROM clause (joins, nested joins,
//! derived subqueries, set operations). The resulting hierarchy is matched
//! against the configured schema caches in declaration order; the first
//! table hit drives the query.

use std::collections::HashSet;

use sqlparser::ast::{Query, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use pgscale_common::config::{DatabaseConfig, TableCacheConfig};
use pgscale_common::error::{PgScaleError, Result};

const DEFAULT_SCHEMA: &str = "public";

/// The set of `(schema, table)` pairs a query reads from.
#[derive(Debug, Default, PartialEq)]
pub struct QueryHierarchy {
    tables: HashSet<(String, String)>,
}

impl QueryHierarchy {
    pub fn contains(&self, schema: &str, table: &str) -> bool {
        self.tables
            .contains(&(schema.to_string(), table.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Match this hierarchy against the database's schema caches in
    /// configuration order. At most one table drives a query.
    pub fn match_table<'a>(&self, db: &'a DatabaseConfig) -> Option<&'a TableCacheConfig> {
        for schema_cache in &db.schemas {
            for table in &schema_cache.tables {
                if self.contains(&schema_cache.schema, &table.name) {
                    return Some(table);
                }
            }
        }
        None
    }
}

/// Strip the single leading NUL byte the extended protocol uses for the
/// unnamed statement.
pub fn trim_nul_prefix(payload: &[u8]) -> &[u8] {
    match payload.first() {
        Some(0) => &payload[1..],
        _ => payload,
    }
}

/// Fast-path check: the payload must begin with `SEL` in any case.
pub fn starts_with_select(payload: &[u8]) -> bool {
    if payload.len() < 6 {
        return false;
    }
    payload[..3].eq_ignore_ascii_case(b"SEL")
}

/// Parse a SQL payload and extract its table hierarchy.
pub fn parse(sql: &str) -> Result<QueryHierarchy> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| PgScaleError::Protocol(format!("SQL parse error: {e}")))?;

    let mut hierarchy = QueryHierarchy::default();
    for statement in &statements {
        if let Statement::Query(query) = statement {
            collect_query(query, &mut hierarchy.tables);
        }
    }

    Ok(hierarchy)
}

fn collect_query(query: &Query, tables: &mut HashSet<(String, String)>) {
    collect_set_expr(&query.body, tables);
}

fn collect_set_expr(expr: &SetExpr, tables: &mut HashSet<(String, String)>) {
    match expr {
        SetExpr::Select(select) => {
            for table in &select.from {
                collect_table_with_joins(table, tables);
            }
        }
        SetExpr::Query(query) => collect_query(query, tables),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, tables);
            collect_set_expr(right, tables);
        }
        _ => {}
    }
}

fn collect_table_with_joins(table: &TableWithJoins, tables: &mut HashSet<(String, String)>) {
    collect_table_factor(&table.relation, tables);
    for join in &table.joins {
        collect_table_factor(&join.relation, tables);
    }
}

fn collect_table_factor(factor: &TableFactor, tables: &mut HashSet<(String, String)>) {
    match factor {
        TableFactor::Table { name, .. } => {
            let parts = &name.0;
            if let Some(table) = parts.last() {
                let schema = if parts.len() >= 2 {
                    parts[parts.len() - 2].value.clone()
                } else {
                    DEFAULT_SCHEMA.to_string()
                };
                tables.insert((schema, table.value.clone()));
            }
        }
        TableFactor::Derived { subquery, .. } => collect_query(subquery, tables),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, tables),
        _ => {}
    }
}
