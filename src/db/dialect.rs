//! SQL generation for the narrow statement set the scope issues.
//!
//! Identifiers are validated and quoted per backend; every value travels as
//! a bound parameter. Page limits and offsets are inlined as integers, and
//! NULLs written by inserts and updates as the `NULL` literal so PostgreSQL
//! does not type them as text.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Filters, OrderBy, Page, QueryParam};

/// A generated statement and its bind values, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

/// Validate a column or table name. `schema.table` is accepted.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::invalid_input("Identifier cannot be empty"));
    }
    for part in name.split('.') {
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DbError::invalid_input(format!(
                "Invalid identifier '{}': use letters, digits and '_' only",
                name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    db: DatabaseType,
}

impl Dialect {
    pub fn new(db: DatabaseType) -> Self {
        Self { db }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db
    }

    /// Quote a validated identifier.
    pub fn quote(&self, name: &str) -> DbResult<String> {
        validate_identifier(name)?;
        let quoted: Vec<String> = name
            .split('.')
            .map(|part| match self.db {
                DatabaseType::MySQL => format!("`{}`", part),
                DatabaseType::PostgreSQL | DatabaseType::SQLite => format!("\"{}\"", part),
            })
            .collect();
        Ok(quoted.join("."))
    }

    /// Placeholder for the `n`th (1-based) bound parameter.
    pub fn placeholder(&self, n: usize) -> String {
        match self.db {
            DatabaseType::PostgreSQL => format!("${}", n),
            DatabaseType::MySQL | DatabaseType::SQLite => "?".to_string(),
        }
    }

    /// Whether `INSERT ... RETURNING` is available.
    pub fn supports_returning(&self) -> bool {
        !matches!(self.db, DatabaseType::MySQL)
    }

    pub fn select_by_key(&self, table: &str, pk: &str, key: QueryParam) -> DbResult<Statement> {
        Ok(Statement {
            sql: format!(
                "SELECT * FROM {} WHERE {} = {}",
                self.quote(table)?,
                self.quote(pk)?,
                self.placeholder(1)
            ),
            params: vec![key],
        })
    }

    pub fn exists(&self, table: &str, pk: &str, key: QueryParam) -> DbResult<Statement> {
        Ok(Statement {
            sql: format!(
                "SELECT 1 FROM {} WHERE {} = {} LIMIT 1",
                self.quote(table)?,
                self.quote(pk)?,
                self.placeholder(1)
            ),
            params: vec![key],
        })
    }

    /// Filtered, ordered page. An empty `order` falls back to `pk` ascending.
    pub fn select_page(
        &self,
        table: &str,
        pk: &str,
        filters: &Filters,
        order: &OrderBy,
        page: Page,
    ) -> DbResult<Statement> {
        let mut sql = format!("SELECT * FROM {}", self.quote(table)?);
        let mut params = Vec::with_capacity(filters.len());

        let mut conditions = Vec::with_capacity(filters.len());
        for (column, value) in filters.iter() {
            let column = self.quote(column)?;
            if value.is_null() {
                conditions.push(format!("{} IS NULL", column));
            } else {
                params.push(value.clone());
                conditions.push(format!("{} = {}", column, self.placeholder(params.len())));
            }
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        let keys = if order.is_empty() {
            vec![format!("{} ASC", self.quote(pk)?)]
        } else {
            order
                .iter()
                .map(|(column, dir)| Ok(format!("{} {}", self.quote(column)?, dir.as_sql())))
                .collect::<DbResult<Vec<_>>>()?
        };
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));

        sql.push_str(&self.limit_clause(page));
        Ok(Statement { sql, params })
    }

    fn limit_clause(&self, page: Page) -> String {
        match (page.effective_limit(), page.offset) {
            (Some(limit), 0) => format!(" LIMIT {}", limit),
            (Some(limit), offset) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (None, 0) => String::new(),
            // OFFSET without LIMIT needs a sentinel limit outside PostgreSQL
            (None, offset) => match self.db {
                DatabaseType::PostgreSQL => format!(" OFFSET {}", offset),
                DatabaseType::SQLite => format!(" LIMIT -1 OFFSET {}", offset),
                DatabaseType::MySQL => format!(" LIMIT 18446744073709551615 OFFSET {}", offset),
            },
        }
    }

    /// Value expressions for `fields` and the parameters they bind.
    fn values(&self, fields: &[(String, QueryParam)]) -> (Vec<String>, Vec<QueryParam>) {
        let mut exprs = Vec::with_capacity(fields.len());
        let mut params = Vec::with_capacity(fields.len());
        for (_, value) in fields {
            if value.is_null() {
                exprs.push("NULL".to_string());
            } else {
                params.push(value.clone());
                exprs.push(self.placeholder(params.len()));
            }
        }
        (exprs, params)
    }

    /// Insert the given fields. With `returning`, the statement yields that column.
    pub fn insert(
        &self,
        table: &str,
        fields: &[(String, QueryParam)],
        returning: Option<&str>,
    ) -> DbResult<Statement> {
        let table = self.quote(table)?;
        let (values, params) = self.values(fields);
        let mut sql = if fields.is_empty() {
            match self.db {
                DatabaseType::MySQL => format!("INSERT INTO {} () VALUES ()", table),
                _ => format!("INSERT INTO {} DEFAULT VALUES", table),
            }
        } else {
            let columns = fields
                .iter()
                .map(|(c, _)| self.quote(c))
                .collect::<DbResult<Vec<_>>>()?;
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                values.join(", ")
            )
        };
        if let Some(column) = returning.filter(|_| self.supports_returning()) {
            sql.push_str(&format!(" RETURNING {}", self.quote(column)?));
        }
        Ok(Statement { sql, params })
    }

    /// Update only the named fields of one row.
    pub fn update(
        &self,
        table: &str,
        pk: &str,
        key: QueryParam,
        fields: &[(String, QueryParam)],
    ) -> DbResult<Statement> {
        if fields.is_empty() {
            return Err(DbError::invalid_input("Update needs at least one field"));
        }
        let (values, mut params) = self.values(fields);
        let assignments = fields
            .iter()
            .zip(&values)
            .map(|((c, _), value)| Ok(format!("{} = {}", self.quote(c)?, value)))
            .collect::<DbResult<Vec<_>>>()?;
        params.push(key);
        Ok(Statement {
            sql: format!(
                "UPDATE {} SET {} WHERE {} = {}",
                self.quote(table)?,
                assignments.join(", "),
                self.quote(pk)?,
                self.placeholder(params.len())
            ),
            params,
        })
    }

    pub fn delete(&self, table: &str, pk: &str, key: QueryParam) -> DbResult<Statement> {
        Ok(Statement {
            sql: format!(
                "DELETE FROM {} WHERE {} = {}",
                self.quote(table)?,
                self.quote(pk)?,
                self.placeholder(1)
            ),
            params: vec![key],
        })
    }
}
