//! Statement execution over the pool or a single held connection.
//!
//! [`ConnectionGate`] runs statements on whichever pooled connection is
//! free. [`HeldConnection`] pins one physical connection until it is
//! released, which is what transactions and session state need.
//!
//! Failed statements are logged with their text and parameter values. With
//! the debug flag set every statement is logged with its elapsed time.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{Executor, PgConnection, PgPool, Postgres};

/// A positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    /// SQL `NULL`, bound as a text-typed null.
    Null,
    /// `boolean`.
    Bool(bool),
    /// `bigint`.
    Int(i64),
    /// `double precision`.
    Float(f64),
    /// `text`.
    Text(String),
    /// `jsonb`.
    Json(serde_json::Value),
    /// `timestamptz`.
    Timestamp(DateTime<Utc>),
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Json(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlParam {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<serde_json::Value> for SqlParam {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<DateTime<Utc>> for SqlParam {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Renders parameter lists for log lines.
struct ParamList<'a>(&'a [SqlParam]);

impl fmt::Display for ParamList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, param) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str("]")
    }
}

/// A statement assembled from SQL fragments and bound values.
///
/// Every [`push_bind`](Self::push_bind) appends the next `$n` placeholder,
/// so values never end up in the statement text.
///
/// ```
/// use pgkeeper::gate::SqlTemplate;
///
/// let mut stmt = SqlTemplate::new("SELECT * FROM users WHERE name = ");
/// stmt.push_bind("alice").push(" AND age > ").push_bind(30_i64);
/// assert_eq!(stmt.text(), "SELECT * FROM users WHERE name = $1 AND age > $2");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlTemplate {
    text: String,
    params: Vec<SqlParam>,
}

impl SqlTemplate {
    /// Starts a statement with a leading fragment.
    #[must_use]
    pub fn new(fragment: &str) -> Self {
        Self {
            text: fragment.to_string(),
            params: Vec::new(),
        }
    }

    /// Appends raw SQL.
    pub fn push(&mut self, fragment: &str) -> &mut Self {
        self.text.push_str(fragment);
        self
    }

    /// Appends a placeholder bound to `value`.
    pub fn push_bind(&mut self, value: impl Into<SqlParam>) -> &mut Self {
        self.params.push(value.into());
        self.text.push('$');
        self.text.push_str(&self.params.len().to_string());
        self
    }

    /// Statement text with placeholders.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Values in placeholder order.
    #[must_use]
    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }
}

/// Options for [`ConnectionGate::run_file`].
#[derive(Debug, Clone, Copy)]
pub struct RunFileOptions {
    /// Reuse file contents read earlier. Default `true`.
    pub cache: bool,
    /// Append `.sql` when the path has another or no extension. Default `true`.
    pub auto_suffix: bool,
}

impl Default for RunFileOptions {
    fn default() -> Self {
        Self {
            cache: true,
            auto_suffix: true,
        }
    }
}

/// Statement executor backed by the whole pool.
#[derive(Debug, Clone)]
pub struct ConnectionGate {
    pool: PgPool,
    debug: bool,
    files: Arc<Mutex<HashMap<PathBuf, Arc<str>>>>,
}

impl ConnectionGate {
    /// Creates a gate over `pool`. With `debug` set every statement is
    /// logged with its values and elapsed time.
    #[must_use]
    pub fn new(pool: PgPool, debug: bool) -> Self {
        Self {
            pool,
            debug,
            files: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether statement logging is on.
    #[must_use]
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Runs a statement on any free connection and returns its rows.
    ///
    /// # Errors
    ///
    /// Returns the driver error after logging the statement and values.
    pub async fn query(&self, text: &str, params: &[SqlParam]) -> Result<Vec<PgRow>, sqlx::Error> {
        run_query(&self.pool, text, params, self.debug).await
    }

    /// Runs a statement built with [`SqlTemplate`].
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionGate::query`].
    pub async fn sql(&self, template: &SqlTemplate) -> Result<Vec<PgRow>, sqlx::Error> {
        self.query(template.text(), template.params()).await
    }

    /// Checks out one connection for exclusive use.
    ///
    /// # Errors
    ///
    /// Returns the pool error if no connection becomes available within the
    /// acquire timeout.
    pub async fn acquire(&self) -> Result<HeldConnection, sqlx::Error> {
        let conn = self.pool.acquire().await?;
        Ok(HeldConnection {
            conn,
            debug: self.debug,
        })
    }

    /// Executes every statement in a SQL file.
    ///
    /// # Errors
    ///
    /// Returns [`sqlx::Error::Io`] if the file cannot be read, or the driver
    /// error of the first failing statement.
    pub async fn run_file(
        &self,
        path: impl AsRef<Path>,
        options: RunFileOptions,
    ) -> Result<PgQueryResult, sqlx::Error> {
        let path = statement_path(path.as_ref(), options.auto_suffix);
        let cached = if options.cache {
            self.files.lock().get(&path).cloned()
        } else {
            None
        };
        let text = match cached {
            Some(text) => text,
            None => {
                let text: Arc<str> = tokio::fs::read_to_string(&path).await?.into();
                self.files.lock().insert(path.clone(), Arc::clone(&text));
                text
            }
        };

        tracing::debug!(file = %path.display(), "running statement file");
        let started = Instant::now();
        let result = sqlx::raw_sql(&text).execute(&self.pool).await;
        match &result {
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "statement file failed"),
            Ok(_) if self.debug => {
                tracing::info!(file = %path.display(), elapsed = ?started.elapsed(), "statement file");
            }
            Ok(_) => {}
        }
        result
    }
}

/// One physical connection checked out of the pool.
///
/// Returned to the pool by [`HeldConnection::release`] or on drop. A
/// transaction left open is rolled back before the session is reused.
#[derive(Debug)]
pub struct HeldConnection {
    conn: PoolConnection<Postgres>,
    debug: bool,
}

impl HeldConnection {
    /// Runs a statement on this connection and returns its rows.
    ///
    /// # Errors
    ///
    /// Returns the driver error after logging the statement and values.
    pub async fn query(&mut self, text: &str, params: &[SqlParam]) -> Result<Vec<PgRow>, sqlx::Error> {
        run_query(&mut *self.conn, text, params, self.debug).await
    }

    /// Runs a statement built with [`SqlTemplate`] on this connection.
    ///
    /// # Errors
    ///
    /// Same as [`HeldConnection::query`].
    pub async fn sql(&mut self, template: &SqlTemplate) -> Result<Vec<PgRow>, sqlx::Error> {
        self.query(template.text(), template.params()).await
    }

    /// Server process id of this session (`pg_backend_pid()`).
    ///
    /// # Errors
    ///
    /// Returns the driver error if the query fails.
    pub async fn backend_pid(&mut self) -> Result<i32, sqlx::Error> {
        sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
            .fetch_one(&mut *self.conn)
            .await
    }

    /// Direct access for `sqlx` queries.
    pub fn as_connection(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    /// Returns the connection to the pool.
    pub fn release(self) {
        drop(self.conn);
    }
}

async fn run_query<'c, E>(
    executor: E,
    text: &str,
    params: &[SqlParam],
    debug: bool,
) -> Result<Vec<PgRow>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let started = Instant::now();
    let result = bind_params(sqlx::query(text), params)
        .fetch_all(executor)
        .await;
    match &result {
        Err(e) => {
            tracing::warn!(statement = text, values = %ParamList(params), error = %e, "query failed");
        }
        Ok(rows) if debug => {
            tracing::info!(
                statement = text,
                values = %ParamList(params),
                rows = rows.len(),
                elapsed = ?started.elapsed(),
                "query"
            );
        }
        Ok(_) => {}
    }
    result
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Bool(v) => query.bind(*v),
            SqlParam::Int(v) => query.bind(*v),
            SqlParam::Float(v) => query.bind(*v),
            SqlParam::Text(v) => query.bind(v.as_str()),
            SqlParam::Json(v) => query.bind(v),
            SqlParam::Timestamp(v) => query.bind(*v),
        };
    }
    query
}

fn statement_path(path: &Path, auto_suffix: bool) -> PathBuf {
    if !auto_suffix || path.extension().is_some_and(|ext| ext == "sql") {
        return path.to_path_buf();
    }
    let mut with_suffix = path.as_os_str().to_owned();
    with_suffix.push(".sql");
    PathBuf::from(with_suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn suffix_is_appended_when_missing() {
        assert_eq!(
            statement_path(Path::new("sql/init_function"), true),
            PathBuf::from("sql/init_function.sql")
        );
        assert_eq!(
            statement_path(Path::new("sql/v1.2"), true),
            PathBuf::from("sql/v1.2.sql")
        );
    }

    #[test]
    fn suffix_is_kept_or_skipped() {
        assert_eq!(
            statement_path(Path::new("a/b.sql"), true),
            PathBuf::from("a/b.sql")
        );
        assert_eq!(
            statement_path(Path::new("a/b"), false),
            PathBuf::from("a/b")
        );
    }

    #[test]
    fn params_render_for_logs() {
        let params = vec![
            SqlParam::from(7_i32),
            SqlParam::from("alice"),
            SqlParam::from(json!({"k": [1, 2]})),
            SqlParam::from(None::<i64>),
            SqlParam::from(true),
        ];
        assert_eq!(
            ParamList(&params).to_string(),
            r#"[7, "alice", {"k":[1,2]}, NULL, true]"#
        );
    }

    #[test]
    fn template_numbers_placeholders_in_bind_order() {
        let mut stmt = SqlTemplate::new("UPDATE items SET data = ");
        stmt.push_bind(json!({"qty": 2}))
            .push(", note = ")
            .push_bind(None::<String>)
            .push(" WHERE order_id = ")
            .push_bind(17_i64);

        assert_eq!(
            stmt.text(),
            "UPDATE items SET data = $1, note = $2 WHERE order_id = $3"
        );
        assert_eq!(
            stmt.params(),
            &[
                SqlParam::Json(json!({"qty": 2})),
                SqlParam::Null,
                SqlParam::Int(17),
            ]
        );
    }

    #[test]
    fn template_without_binds_is_plain_text() {
        let mut stmt = SqlTemplate::new("SELECT 1");
        stmt.push(" -- ping");
        assert_eq!(stmt.text(), "SELECT 1 -- ping");
        assert!(stmt.params().is_empty());
    }

    #[test]
    fn option_params_map_to_inner_or_null() {
        assert_eq!(SqlParam::from(Some("x")), SqlParam::Text("x".to_string()));
        assert_eq!(SqlParam::from(None::<String>), SqlParam::Null);
    }

    #[tokio::test]
    async fn run_file_reports_missing_file_as_io_error() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy_with(crate::config::InstanceConfig::new("/tmp", 1).connect_options());
        let gate = ConnectionGate::new(pool, false);
        let result = gate
            .run_file("/nonexistent/pgkeeper-test/init", RunFileOptions::default())
            .await;
        assert!(matches!(result, Err(sqlx::Error::Io(_))));
    }
}
