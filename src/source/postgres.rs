//! Postgres row source: streams one table through a current-thread runtime.

use std::fmt;
use std::pin::Pin;

use futures_util::StreamExt;
use serde_json::{Number, Value};
use tokio::runtime::{Builder, Runtime};
use tokio_postgres::types::Type;
use tokio_postgres::{Client, NoTls, Row as PgRow, RowStream};
use url::Url;

use crate::error::{PipelineError, Result};
use crate::record::Row;

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        if schema.trim().is_empty() {
            return Err(PipelineError::config("schema name is required"));
        }
        if table.trim().is_empty() {
            return Err(PipelineError::config("table name is required"));
        }
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

/// Connection string with any password masked.
pub(super) fn redact(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<postgres>".to_string(),
    }
}

pub(super) fn table_rows(url: &str, table: &TableName) -> Result<PostgresRows> {
    let name = format!("{} ({})", redact(url), table.qualified());
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| PipelineError::unavailable(&name, err))?;

    let (client, stream) = runtime.block_on(async {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "postgres connection error");
            }
        });
        let sql = format!("SELECT * FROM {}", table.qualified());
        let stream = client.query_raw(sql.as_str(), std::iter::empty::<String>()).await?;
        Ok::<_, tokio_postgres::Error>((client, stream))
    })
    .map_err(|err| PipelineError::unavailable(&name, err))?;

    Ok(PostgresRows {
        stream: Box::pin(stream),
        _client: client,
        runtime,
        row: 0,
        done: false,
    })
}

/// Pull iterator over a streaming query; each `next` drives the runtime until a row arrives.
pub(super) struct PostgresRows {
    stream: Pin<Box<RowStream>>,
    _client: Client,
    runtime: Runtime,
    row: u64,
    done: bool,
}

impl Iterator for PostgresRows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.runtime.block_on(self.stream.as_mut().next());
        self.row += 1;
        match next {
            Some(Ok(row)) => Some(convert_row(&row, self.row)),
            Some(Err(err)) => {
                self.done = true;
                Some(Err(PipelineError::Source {
                    row: self.row,
                    reason: err.to_string(),
                }))
            }
            None => {
                self.done = true;
                tracing::debug!(rows = self.row - 1, "postgres source exhausted");
                None
            }
        }
    }
}

fn convert_row(row: &PgRow, position: u64) -> Result<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = convert_value(row, idx, column.type_()).map_err(|reason| PipelineError::Source {
            row: position,
            reason: format!("column `{}`: {reason}", column.name()),
        })?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn convert_value(row: &PgRow, idx: usize, ty: &Type) -> std::result::Result<Value, String> {
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx).map(|v| v.map(Value::Bool))
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx).map(|v| v.map(Value::from))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx).map(|v| v.map(Value::from))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).map(|v| v.map(Value::from))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .map(|v| v.and_then(|n| Number::from_f64(f64::from(n))).map(Value::Number))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)
            .map(|v| v.and_then(Number::from_f64).map(Value::Number))
    } else {
        // Text-like columns; anything else fails the conversion below.
        row.try_get::<_, Option<String>>(idx).map(|v| v.map(Value::String))
    };
    value
        .map(|v| v.unwrap_or(Value::Null))
        .map_err(|err| format!("unsupported column type {ty}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers() {
        let table = TableName::new("content", "we\"ird").unwrap();
        assert_eq!(table.qualified(), "\"content\".\"we\"\"ird\"");
        assert!(TableName::new("", "title").is_err());
    }

    #[test]
    fn redacts_password_only() {
        let shown = redact("postgres://reader:secret@db:5432/govuk");
        assert!(!shown.contains("secret"));
        assert!(shown.starts_with("postgres://reader:"));
        assert!(shown.ends_with("@db:5432/govuk"));
        assert_eq!(redact("postgres://db/govuk"), "postgres://db/govuk");
    }

    #[test]
    fn unreachable_database_is_unavailable() {
        let table = TableName::new("content", "title").unwrap();
        let err = table_rows("postgres://govner@127.0.0.1:1/govuk?connect_timeout=2", &table)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }
}
