//! Database driver and capabilities (`db` module).
//!
//! The driver is chosen by connection-string scheme; SQLite is the only
//! engine bundled. Every call runs on the blocking pool and is awaited inside
//! the capability, so the guest sees a plain synchronous result.
//!
//! Statements run inside the instance's most recently begun transaction
//! while it has one open, and in autocommit mode otherwise.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use guest_runtime_common::{DatabaseError, RuntimeError};
use guest_runtime_core::{DatabaseDriver, GuestState, Row};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use wasmtime::{Caller, Linker};

use crate::bridge::{flag, link_error, text_arg, text_result};

const MODULE: &str = "db";

/// Open the driver named by `url`.
///
/// Accepted forms: `sqlite::memory:`, `sqlite://<path>` and `sqlite:<path>`.
///
/// # Errors
///
/// [`DatabaseError::UnsupportedScheme`] for any other scheme and
/// [`DatabaseError::Query`] when the database cannot be opened.
pub fn connect(url: &str) -> Result<Arc<dyn DatabaseDriver>, DatabaseError> {
    let Some((scheme, rest)) = url.split_once(':') else {
        return Err(DatabaseError::UnsupportedScheme {
            scheme: url.to_string(),
        });
    };

    match scheme.to_ascii_lowercase().as_str() {
        "sqlite" => {
            let driver = match rest {
                ":memory:" | "" => SqliteDriver::in_memory()?,
                path => SqliteDriver::open(path.strip_prefix("//").unwrap_or(path))?,
            };
            Ok(Arc::new(driver))
        }
        other => Err(DatabaseError::UnsupportedScheme {
            scheme: other.to_string(),
        }),
    }
}

/// SQLite with one connection per open transaction.
///
/// Autocommit statements share a base connection that never holds a
/// transaction. `begin_transaction` opens a fresh connection to the same
/// database and runs `BEGIN` on it, so concurrent requests each get their
/// own transaction. In-memory databases use a named shared-cache URI so
/// that every connection sees the same data.
pub struct SqliteDriver {
    pool: Arc<Pool>,
}

struct Pool {
    source: String,
    base: Mutex<Option<Connection>>,
    transactions: Mutex<HashMap<String, Arc<Mutex<Connection>>>>,
}

impl Pool {
    fn connect(&self) -> Result<Connection, DatabaseError> {
        open_connection(&self.source)
    }

    /// Run `f` on the connection owning `tx`, or on the base connection.
    fn run<R>(
        &self,
        tx: Option<&str>,
        f: impl FnOnce(&Connection) -> Result<R, DatabaseError>,
    ) -> Result<R, DatabaseError> {
        match tx {
            Some(id) => {
                let conn = self
                    .transactions
                    .lock()
                    .get(id)
                    .cloned()
                    .ok_or_else(|| DatabaseError::TransactionNotFound { id: id.to_string() })?;
                let conn = conn.lock();
                f(&conn)
            }
            None => {
                let base = self.base.lock();
                f(base.as_ref().ok_or_else(closed)?)
            }
        }
    }
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn open_connection(source: &str) -> Result<Connection, DatabaseError> {
    let conn = Connection::open(source).map_err(query_error)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(query_error)?;
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(query_error)?;
    Ok(conn)
}

impl SqliteDriver {
    /// Open or create a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let driver = Self::with_source(path.display().to_string())?;
        info!(path = %path.display(), "Opened SQLite database");
        Ok(driver)
    }

    /// A private in-memory database, alive until [`DatabaseDriver::close`].
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Self::with_source(format!(
            "file:guest-runtime-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        ))
    }

    fn with_source(source: String) -> Result<Self, DatabaseError> {
        let base = open_connection(&source)?;
        Ok(Self {
            pool: Arc::new(Pool {
                source,
                base: Mutex::new(Some(base)),
                transactions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Number of transactions currently open.
    pub fn open_transactions(&self) -> usize {
        self.pool.transactions.lock().len()
    }

    /// Run `f` against the pool on the blocking pool.
    async fn blocking<R, F>(&self, f: F) -> Result<R, DatabaseError>
    where
        R: Send + 'static,
        F: FnOnce(&Pool) -> Result<R, DatabaseError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || f(&pool))
            .await
            .map_err(|e| DatabaseError::Query {
                message: format!("database task failed: {e}"),
            })?
    }

    async fn finish_transaction(
        &self,
        tx_id: &str,
        statement: &'static str,
    ) -> Result<(), DatabaseError> {
        let tx_id = tx_id.to_string();
        self.blocking(move |pool| {
            let conn = pool
                .transactions
                .lock()
                .remove(&tx_id)
                .ok_or(DatabaseError::TransactionNotFound { id: tx_id })?;
            // Dropping the connection rolls back whatever COMMIT left open.
            let conn = conn.lock();
            conn.execute_batch(statement).map_err(query_error)
        })
        .await
    }
}

fn closed() -> DatabaseError {
    DatabaseError::Query {
        message: "connection closed".to_string(),
    }
}

#[allow(clippy::needless_pass_by_value)]
fn query_error(error: rusqlite::Error) -> DatabaseError {
    DatabaseError::Query {
        message: error.to_string(),
    }
}

/// Convert a JSON parameter into a SQLite value.
fn to_sql(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s),
        nested @ (Value::Array(_) | Value::Object(_)) => SqlValue::Text(nested.to_string()),
    }
}

/// Convert a SQLite column value into JSON.
fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}

#[async_trait]
impl DatabaseDriver for SqliteDriver {
    async fn query(
        &self,
        tx: Option<&str>,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Row>, DatabaseError> {
        let tx = tx.map(str::to_string);
        let sql = sql.to_string();
        self.blocking(move |pool| {
            pool.run(tx.as_deref(), |conn| {
                let mut stmt = conn.prepare(&sql).map_err(query_error)?;
                let columns: Vec<String> =
                    stmt.column_names().into_iter().map(String::from).collect();

                let mut rows = stmt
                    .query(params_from_iter(params.into_iter().map(to_sql)))
                    .map_err(query_error)?;

                let mut out = Vec::new();
                while let Some(row) = rows.next().map_err(query_error)? {
                    let mut record = Row::new();
                    for (i, column) in columns.iter().enumerate() {
                        let value = row.get_ref(i).map_err(query_error)?;
                        record.insert(column.clone(), to_json(value));
                    }
                    out.push(record);
                }
                Ok(out)
            })
        })
        .await
    }

    async fn execute(
        &self,
        tx: Option<&str>,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<u64, DatabaseError> {
        let tx = tx.map(str::to_string);
        let sql = sql.to_string();
        self.blocking(move |pool| {
            pool.run(tx.as_deref(), |conn| {
                let affected = conn
                    .execute(&sql, params_from_iter(params.into_iter().map(to_sql)))
                    .map_err(query_error)?;
                Ok(affected as u64)
            })
        })
        .await
    }

    async fn begin_transaction(&self) -> Result<String, DatabaseError> {
        self.blocking(|pool| {
            if pool.base.lock().is_none() {
                return Err(closed());
            }
            let conn = pool.connect()?;
            conn.execute_batch("BEGIN").map_err(query_error)?;

            let id = uuid::Uuid::new_v4().to_string();
            pool.transactions
                .lock()
                .insert(id.clone(), Arc::new(Mutex::new(conn)));
            debug!(tx_id = %id, "Transaction started");
            Ok(id)
        })
        .await
    }

    async fn commit(&self, tx_id: &str) -> Result<(), DatabaseError> {
        self.finish_transaction(tx_id, "COMMIT").await
    }

    async fn rollback(&self, tx_id: &str) -> Result<(), DatabaseError> {
        self.finish_transaction(tx_id, "ROLLBACK").await
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        self.blocking(|pool| {
            let abandoned = std::mem::take(&mut *pool.transactions.lock());
            if !abandoned.is_empty() {
                warn!(count = abandoned.len(), "Closing database with open transactions");
            }
            drop(abandoned);

            match pool.base.lock().take() {
                Some(conn) => conn.close().map_err(|(_, e)| query_error(e)),
                None => Ok(()),
            }
        })
        .await
    }

    fn engine(&self) -> &'static str {
        "sqlite"
    }
}

/// Parse the guest's JSON parameter array; anything else is an error.
pub fn parse_params(json: &str) -> Result<Vec<Value>, DatabaseError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str(json) {
        Ok(Value::Array(params)) => Ok(params),
        Ok(_) => Err(DatabaseError::Query {
            message: "parameters must be a JSON array".to_string(),
        }),
        Err(e) => Err(DatabaseError::Query {
            message: format!("invalid parameters: {e}"),
        }),
    }
}

fn driver(caller: &Caller<'_, GuestState>) -> Result<Arc<dyn DatabaseDriver>, DatabaseError> {
    caller.data().services().database().cloned()
}

/// The `_db_query` envelope: `{"ok":true,"rows":[..]}` or `{"ok":false,"error":".."}`.
pub fn query_envelope(result: Result<Vec<Row>, DatabaseError>) -> String {
    match result {
        Ok(rows) => json!({ "ok": true, "rows": rows }).to_string(),
        Err(e) => json!({ "ok": false, "error": e.to_string() }).to_string(),
    }
}

/// Commit or roll back `tx_id` on behalf of the instance whose open
/// transactions are `open`.
///
/// Identifiers the instance did not begin are refused without touching the
/// driver, so one request can never finish another request's transaction.
pub async fn finish_owned(
    db: &dyn DatabaseDriver,
    open: &mut Vec<String>,
    tx_id: &str,
    commit: bool,
) -> Result<(), DatabaseError> {
    if !open.iter().any(|id| id == tx_id) {
        return Err(DatabaseError::TransactionNotFound { id: tx_id.to_string() });
    }

    let finished = if commit {
        db.commit(tx_id).await
    } else {
        db.rollback(tx_id).await
    };
    // The driver drops the transaction even when COMMIT fails.
    open.retain(|id| id != tx_id);
    finished
}

/// Register the `db` capabilities.
#[allow(clippy::too_many_lines)]
pub fn register(linker: &mut Linker<GuestState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            MODULE,
            "_db_query",
            |mut caller: Caller<'_, GuestState>,
             (sql_ptr, sql_len, params_ptr, params_len): (i32, i32, i32, i32)| {
                Box::new(async move {
                    let sql = text_arg(&mut caller, "_db_query", sql_ptr, sql_len);
                    let params = text_arg(&mut caller, "_db_query", params_ptr, params_len);

                    let tx = caller.data().current_transaction().map(str::to_string);

                    let result = match (driver(&caller), parse_params(&params)) {
                        (Ok(db), Ok(params)) => db.query(tx.as_deref(), &sql, params).await,
                        (Err(e), _) | (_, Err(e)) => Err(e),
                    };
                    if let Err(e) = &result {
                        debug!(error = %e, "Query failed");
                    }

                    text_result(&mut caller, "_db_query", &query_envelope(result)).await
                })
            },
        )
        .map_err(|e| link_error(MODULE, "_db_query", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "_db_execute",
            |mut caller: Caller<'_, GuestState>,
             (sql_ptr, sql_len, params_ptr, params_len): (i32, i32, i32, i32)| {
                Box::new(async move {
                    let sql = text_arg(&mut caller, "_db_execute", sql_ptr, sql_len);
                    let params = text_arg(&mut caller, "_db_execute", params_ptr, params_len);

                    let tx = caller.data().current_transaction().map(str::to_string);

                    let result = match (driver(&caller), parse_params(&params)) {
                        (Ok(db), Ok(params)) => db.execute(tx.as_deref(), &sql, params).await,
                        (Err(e), _) | (_, Err(e)) => Err(e),
                    };

                    match result {
                        Ok(affected) => i64::try_from(affected).unwrap_or(i64::MAX),
                        Err(e) => {
                            debug!(error = %e, "Execute failed");
                            -1
                        }
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "_db_execute", &e))?;

    linker
        .func_wrap_async(
            MODULE,
            "_db_begin",
            |mut caller: Caller<'_, GuestState>, (): ()| {
                Box::new(async move {
                    let begun = match driver(&caller) {
                        Ok(db) => db.begin_transaction().await,
                        Err(e) => Err(e),
                    };

                    match begun {
                        Ok(tx_id) => {
                            caller.data_mut().open_transactions.push(tx_id.clone());
                            text_result(&mut caller, "_db_begin", &tx_id).await
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to begin transaction");
                            0
                        }
                    }
                })
            },
        )
        .map_err(|e| link_error(MODULE, "_db_begin", &e))?;

    for (name, commit) in [("_db_commit", true), ("_db_rollback", false)] {
        linker
            .func_wrap_async(
                MODULE,
                name,
                move |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
                    Box::new(async move {
                        let tx_id = text_arg(&mut caller, name, ptr, len);
                        let finished = match driver(&caller) {
                            Ok(db) => {
                                let mut open =
                                    std::mem::take(&mut caller.data_mut().open_transactions);
                                let finished =
                                    finish_owned(db.as_ref(), &mut open, &tx_id, commit).await;
                                caller.data_mut().open_transactions = open;
                                finished
                            }
                            Err(e) => Err(e),
                        };

                        match finished {
                            Ok(()) => flag(true),
                            Err(e) => {
                                warn!(tx_id = %tx_id, error = %e, "{name} failed");
                                flag(false)
                            }
                        }
                    })
                },
            )
            .map_err(|e| link_error(MODULE, name, &e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Arc<dyn DatabaseDriver> {
        let db = connect("sqlite::memory:").unwrap();
        db.execute(
            None,
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL, avatar BLOB)",
            vec![],
        )
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_query_and_execute() {
        let db = db().await;

        let affected = db
            .execute(
                None,
                "INSERT INTO users (name, score) VALUES (?1, ?2), (?3, ?4)",
                vec![json!("alice"), json!(9.5), json!("bob"), json!(7)],
            )
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let rows = db
            .query(
                None,
                "SELECT id, name, score FROM users WHERE name = ?1",
                vec![json!("alice")],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[0]["name"], "alice");
        assert_eq!(rows[0]["score"], 9.5);
    }

    #[tokio::test]
    async fn test_null_and_blob_columns() {
        let db = db().await;
        db.execute(
            None,
            "INSERT INTO users (name, avatar) VALUES (NULL, x'0102')",
            vec![],
        )
        .await
        .unwrap();

        let rows = db.query(None, "SELECT name, avatar FROM users", vec![]).await.unwrap();
        assert_eq!(rows[0]["name"], Value::Null);
        assert_eq!(rows[0]["avatar"], "AQI=");
    }

    async fn count(db: &Arc<dyn DatabaseDriver>) -> i64 {
        let rows = db
            .query(None, "SELECT COUNT(*) AS n FROM users", vec![])
            .await
            .unwrap();
        rows[0]["n"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let db = db().await;

        let tx = db.begin_transaction().await.unwrap();
        db.execute(Some(&tx), "INSERT INTO users (name) VALUES ('carol')", vec![])
            .await
            .unwrap();
        let inside = db
            .query(Some(&tx), "SELECT name FROM users", vec![])
            .await
            .unwrap();
        assert_eq!(inside[0]["name"], "carol");
        db.rollback(&tx).await.unwrap();
        assert_eq!(count(&db).await, 0);

        let tx = db.begin_transaction().await.unwrap();
        db.execute(Some(&tx), "INSERT INTO users (name) VALUES ('dave')", vec![])
            .await
            .unwrap();
        db.commit(&tx).await.unwrap();
        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_interleaved_requests_keep_their_own_transactions() {
        let db = db().await;
        let mut request_a = Vec::new();
        let mut request_b = Vec::new();

        let tx_a = db.begin_transaction().await.unwrap();
        request_a.push(tx_a.clone());

        // B writes outside any transaction while A's is open.
        let affected = db
            .execute(None, "INSERT INTO users (name) VALUES ('bob')", vec![])
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let tx_b = db.begin_transaction().await.unwrap();
        request_b.push(tx_b.clone());
        assert_ne!(tx_a, tx_b);
        let seen = db
            .query(Some(&tx_b), "SELECT name FROM users", vec![])
            .await
            .unwrap();
        assert_eq!(seen.len(), 1);

        // B cannot finish A's transaction.
        let err = finish_owned(db.as_ref(), &mut request_b, &tx_a, false)
            .await
            .unwrap_err();
        assert_eq!(err, DatabaseError::TransactionNotFound { id: tx_a.clone() });
        assert_eq!(request_b, vec![tx_b.clone()]);

        finish_owned(db.as_ref(), &mut request_a, &tx_a, false)
            .await
            .unwrap();
        assert!(request_a.is_empty());
        assert_eq!(count(&db).await, 1);

        finish_owned(db.as_ref(), &mut request_b, &tx_b, true)
            .await
            .unwrap();
        assert!(request_b.is_empty());
        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn test_open_transactions_are_counted() {
        let db = SqliteDriver::in_memory().unwrap();

        let first = db.begin_transaction().await.unwrap();
        let second = db.begin_transaction().await.unwrap();
        assert_eq!(db.open_transactions(), 2);

        db.commit(&first).await.unwrap();
        db.rollback(&second).await.unwrap();
        assert_eq!(db.open_transactions(), 0);
        assert!(db.commit(&first).await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_databases_are_separate() {
        let first = db().await;
        let second = connect("sqlite::memory:").unwrap();

        first
            .execute(None, "INSERT INTO users (name) VALUES ('erin')", vec![])
            .await
            .unwrap();

        assert!(second.query(None, "SELECT * FROM users", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let db = db().await;

        let err = db.commit("nope").await.unwrap_err();
        assert_eq!(err, DatabaseError::TransactionNotFound { id: "nope".into() });

        let err = db.execute(Some("nope"), "SELECT 1", vec![]).await.unwrap_err();
        assert_eq!(err, DatabaseError::TransactionNotFound { id: "nope".into() });
    }

    #[tokio::test]
    async fn test_query_error_is_reported() {
        let db = db().await;

        let result = db.query(None, "SELECT * FROM missing", vec![]).await;
        let envelope: Value = serde_json::from_str(&query_envelope(result)).unwrap();
        assert_eq!(envelope["ok"], false);
        assert!(envelope["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_close() {
        let db = db().await;
        db.close().await.unwrap();

        assert!(db.query(None, "SELECT 1", vec![]).await.is_err());
        assert!(db.begin_transaction().await.is_err());
    }

    #[test]
    fn test_connect_schemes() {
        assert!(connect("sqlite::memory:").is_ok());
        assert!(matches!(
            connect("postgres://localhost/app"),
            Err(DatabaseError::UnsupportedScheme { scheme }) if scheme == "postgres"
        ));
        assert!(matches!(
            connect("no-scheme"),
            Err(DatabaseError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_connect_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");

        assert!(connect(&format!("sqlite://{}", path.display())).is_ok());
        assert!(path.exists());
        assert!(connect(&format!("sqlite:{}", path.display())).is_ok());
    }

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("").unwrap(), Vec::<Value>::new());
        assert_eq!(parse_params(r#"[1,"a"]"#).unwrap(), vec![json!(1), json!("a")]);
        assert!(parse_params(r#"{"a":1}"#).is_err());
        assert!(parse_params("[oops").is_err());
    }
}
