//! The SQLite backend.
//!
//! One connection behind an async mutex. Standalone queries are submitted
//! as local tasks that take the connection briefly; a
//! [`Transaction`](crate::Transaction) driver holds it from BEGIN to
//! COMMIT/ROLLBACK. Statement text stays opaque here; binding and row
//! materialization are the only driver-specific parts of the store.

use std::sync::Arc;

use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Connection, Row as _, SqliteConnection, TypeInfo, ValueRef};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::query::Query;
use crate::schema;
use crate::value::{Row, Value};

/// A handle to the backing store. Cheap to clone; clones share the
/// connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl Database {
    /// Opens a database at `url` and bootstraps the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(url: &str) -> Result<Self> {
        let mut conn = SqliteConnection::connect(url).await?;
        schema::bootstrap(&mut conn).await?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    /// Submits a standalone query. It runs as a local task; the query's
    /// owner is notified when it completes. Must be called from within a
    /// `LocalSet`.
    pub fn submit(&self, query: Query) {
        let db = self.clone();
        tokio::task::spawn_local(async move {
            db.execute(&query).await;
        });
    }

    /// Executes a standalone query to completion, recording results or
    /// failure on the query and notifying its owner.
    pub async fn execute(&self, query: &Query) {
        let mut conn = self.conn.lock().await;
        run_query(&mut conn, query).await;
        drop(conn);
        query.notify_owner();
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<SqliteConnection>> {
        Arc::clone(&self.conn)
    }
}

/// Runs one query on an already-acquired connection. Failures are recorded
/// on the query, never returned.
pub(crate) async fn run_query(conn: &mut SqliteConnection, query: &Query) {
    let (statement, params) = query.statement_and_params();
    let mut q = sqlx::query(&statement);
    for p in &params {
        q = bind_value(q, p);
    }
    match q.fetch_all(&mut *conn).await {
        Ok(rows) => {
            let mut out = Vec::with_capacity(rows.len());
            let mut bad = None;
            for row in &rows {
                match materialize(row) {
                    Ok(r) => out.push(r),
                    Err(e) => {
                        bad = Some(e.to_string());
                        break;
                    }
                }
            }
            match bad {
                Some(e) => query.set_error(e),
                None => query.set_results(out),
            }
        }
        Err(e) => {
            let text = match &e {
                sqlx::Error::Database(db) => db.message().to_owned(),
                other => other.to_string(),
            };
            if !query.is_failure_allowed() {
                tracing::debug!(error = %text, statement = %statement, "query failed");
            }
            query.set_error(text);
        }
    }
}

fn bind_value<'q>(
    q: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => q.bind(None::<i64>),
        Value::Int(v) => q.bind(*v),
        Value::Real(v) => q.bind(*v),
        Value::Text(v) => q.bind(v.as_str()),
        Value::Blob(v) => q.bind(v.as_slice()),
        Value::Bool(v) => q.bind(*v),
    }
}

fn materialize(row: &SqliteRow) -> Result<Row> {
    let mut columns = Vec::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => Value::Int(row.try_get::<i64, _>(i)?),
                "REAL" => Value::Real(row.try_get::<f64, _>(i)?),
                "BLOB" => Value::Blob(row.try_get::<Vec<u8>, _>(i)?),
                _ => Value::Text(row.try_get::<String, _>(i)?),
            }
        };
        columns.push((col.name().to_owned(), value));
    }
    Ok(Row::new(columns))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_materializes_typed_rows() {
        let db = Database::in_memory().await.unwrap();
        let q = Query::new("select 42 as answer, 'x' as label, null as hole");
        db.execute(&q).await;

        assert!(q.done());
        assert!(!q.failed());
        let row = q.next_row().unwrap();
        assert_eq!(row.int("answer"), Some(42));
        assert_eq!(row.text("label"), Some("x"));
        assert!(row.is_null("hole"));
    }

    #[tokio::test]
    async fn failure_is_recorded_with_driver_text() {
        let db = Database::in_memory().await.unwrap();
        let q = Query::new("select * from no_such_table");
        db.execute(&q).await;

        assert!(q.done());
        assert!(q.failed());
        assert!(q.error().unwrap().contains("no_such_table"));
    }

    #[tokio::test]
    async fn bound_parameters_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let insert = Query::new("insert into flag_names (name) values ($1)").bind("\\Answered");
        db.execute(&insert).await;
        assert!(!insert.failed());

        let select = Query::new("select id, name from flag_names where name=$1").bind("\\Answered");
        db.execute(&select).await;
        let row = select.next_row().unwrap();
        assert!(row.int("id").is_some());
        assert_eq!(row.text("name"), Some("\\Answered"));
    }
}
