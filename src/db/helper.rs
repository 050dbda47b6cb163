use super::record::Record;
use crate::config::StoreConfig;
use crate::errors::{StoreError, StoreResult};
use crate::models::DATABASE_VERSION;
use rusqlite::types::{FromSql, Value, ValueRef};
use rusqlite::{params_from_iter, CachedStatement, Connection, TransactionBehavior};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Column name to bound value, in deterministic column order.
pub type FieldMap = BTreeMap<&'static str, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Metric,
    MetricData,
    InstanceData,
    Notification,
    Annotation,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Annotation,
        Table::Notification,
        Table::MetricData,
        Table::InstanceData,
        Table::Metric,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::MetricData => "metric_data",
            Self::InstanceData => "instance_data",
            Self::Notification => "notification",
            Self::Annotation => "annotation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    Replace,
    Ignore,
    Abort,
}

impl ConflictPolicy {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Replace => "REPLACE",
            Self::Ignore => "IGNORE",
            Self::Abort => "ABORT",
        }
    }
}

/// Conjunctive WHERE clause. Column names are compile-time constants and
/// every value is bound through a `?` placeholder.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    predicates: Vec<String>,
    args: Vec<Value>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.push(column, "=", value.into())
    }

    pub fn at_least(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.push(column, ">=", value.into())
    }

    pub fn at_most(self, column: &'static str, value: impl Into<Value>) -> Self {
        self.push(column, "<=", value.into())
    }

    /// Constant predicate without arguments, e.g. `read = 0`.
    pub fn predicate(mut self, predicate: &'static str) -> Self {
        self.predicates.push(predicate.to_string());
        self
    }

    fn push(mut self, column: &'static str, operator: &str, value: Value) -> Self {
        self.predicates.push(format!("{} {} ?", column, operator));
        self.args.push(value);
        self
    }

    pub fn clause(&self) -> Option<String> {
        if self.predicates.is_empty() {
            None
        } else {
            Some(self.predicates.join(" AND "))
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    fn append_to(&self, sql: &mut String) {
        if let Some(clause) = self.clause() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
    }
}

#[derive(Debug)]
pub struct SqlHelper {
    conn: Mutex<Connection>,
    lock_timeout: Duration,
}

impl SqlHelper {
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout())?;
        let journal: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            config.journal_mode.pragma_value(),
            |row| row.get(0),
        )?;
        conn.pragma_update(None, "synchronous", config.sync_mode.pragma_value())?;
        conn.execute_batch(SCHEMA_SQL)?;
        ensure_schema_version(&conn)?;
        debug!(path = %config.path.display(), journal = %journal, "opened metric store");

        Ok(Self {
            conn: Mutex::new(conn),
            lock_timeout: config.lock_timeout(),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(StoreError::Internal("database mutex poisoned".to_string()))
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Busy(format!(
                            "connection not acquired within {}ms",
                            self.lock_timeout.as_millis()
                        )));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
            }
        }
    }

    /// Runs `body` inside an immediate (write-locking) transaction. Commits on
    /// `Ok`, rolls back on `Err`. Must not be called from inside `body`: the
    /// nested call cannot acquire the connection and fails with `Busy`.
    pub fn with_transaction<T>(&self, body: impl FnOnce(&Statements<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = body(&Statements { conn: &tx });
        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback() {
                    warn!(error = %rollback_error, "rollback failed");
                }
                debug!(error = %error, "transaction rolled back");
                Err(error)
            }
        }
    }

    pub fn with_connection<T>(&self, body: impl FnOnce(&Statements<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.lock()?;
        body(&Statements { conn: &conn })
    }
}

fn ensure_schema_version(conn: &Connection) -> StoreResult<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version == 0 {
        conn.pragma_update(None, "user_version", DATABASE_VERSION)?;
        return Ok(());
    }
    if version != DATABASE_VERSION {
        return Err(StoreError::Storage(format!(
            "schema version {} is not supported (expected {})",
            version, DATABASE_VERSION
        )));
    }
    Ok(())
}

/// Statement surface over a locked connection or an open transaction.
pub struct Statements<'c> {
    conn: &'c Connection,
}

impl<'c> Statements<'c> {
    /// Returns the new rowid, or `None` when the row was skipped by `Ignore`.
    pub fn insert(&self, table: Table, fields: &FieldMap, policy: ConflictPolicy) -> StoreResult<Option<i64>> {
        if fields.is_empty() {
            return Err(StoreError::Validation(format!("insert into {} without fields", table.as_str())));
        }
        let columns: Vec<&'static str> = fields.keys().copied().collect();
        let sql = insert_sql(table, &columns, policy);
        let changed = self.conn.execute(&sql, params_from_iter(fields.values()))?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    pub fn update(&self, table: Table, fields: &FieldMap, selection: &Selection) -> StoreResult<usize> {
        if fields.is_empty() {
            return Err(StoreError::Validation(format!("update of {} without fields", table.as_str())));
        }
        let assignments = fields
            .keys()
            .map(|column| format!("{} = ?", column))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("UPDATE {} SET {}", table.as_str(), assignments);
        selection.append_to(&mut sql);
        let values = fields.values().chain(selection.args().iter());
        Ok(self.conn.execute(&sql, params_from_iter(values))?)
    }

    pub fn delete(&self, table: Table, selection: &Selection) -> StoreResult<usize> {
        let mut sql = format!("DELETE FROM {}", table.as_str());
        selection.append_to(&mut sql);
        Ok(self.conn.execute(&sql, params_from_iter(selection.args().iter()))?)
    }

    pub fn query_distinct(
        &self,
        table: Table,
        columns: Option<&[&'static str]>,
        selection: &Selection,
        order_by: Option<&'static str>,
        limit: Option<u32>,
    ) -> StoreResult<Cursor> {
        self.select(true, table, columns, selection, order_by, limit)
    }

    pub fn query(
        &self,
        table: Table,
        columns: Option<&[&'static str]>,
        selection: &Selection,
        sort_by: Option<&'static str>,
    ) -> StoreResult<Cursor> {
        self.select(false, table, columns, selection, sort_by, None)
    }

    pub fn query_all(&self, table: Table) -> StoreResult<Cursor> {
        self.select(false, table, None, &Selection::new(), None, None)
    }

    pub fn count(&self, table: Table, selection: &Selection) -> StoreResult<u64> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        selection.append_to(&mut sql);
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(selection.args().iter()), |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn prepare_batch_insert(
        &self,
        table: Table,
        columns: &[&'static str],
        policy: ConflictPolicy,
    ) -> StoreResult<BatchInsert<'c>> {
        if columns.is_empty() {
            return Err(StoreError::Validation(format!("batch insert into {} without columns", table.as_str())));
        }
        let statement = self.conn.prepare_cached(&insert_sql(table, columns, policy))?;
        Ok(BatchInsert {
            statement,
            columns: columns.to_vec(),
        })
    }

    /// Executes a fixed statement through the statement cache.
    pub fn execute_cached(&self, sql: &'static str, params: impl rusqlite::Params) -> StoreResult<usize> {
        let mut statement = self.conn.prepare_cached(sql)?;
        Ok(statement.execute(params)?)
    }

    fn select(
        &self,
        distinct: bool,
        table: Table,
        columns: Option<&[&'static str]>,
        selection: &Selection,
        order_by: Option<&'static str>,
        limit: Option<u32>,
    ) -> StoreResult<Cursor> {
        let projection = match columns {
            Some(columns) if !columns.is_empty() => columns.join(", "),
            _ => "*".to_string(),
        };
        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if distinct { "DISTINCT " } else { "" },
            projection,
            table.as_str()
        );
        selection.append_to(&mut sql);
        if let Some(order_by) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        let mut args: Vec<Value> = selection.args().to_vec();
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::Integer(i64::from(limit)));
        }

        let mut statement = self.conn.prepare(&sql)?;
        let names: Vec<String> = statement.column_names().into_iter().map(String::from).collect();
        let mut rows = statement.query(params_from_iter(args.iter()))?;
        let mut buffered = VecDeque::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(names.len());
            for index in 0..names.len() {
                values.push(row.get::<_, Value>(index)?);
            }
            buffered.push_back(values);
        }
        Ok(Cursor {
            columns: Arc::from(names),
            rows: buffered,
        })
    }
}

fn insert_sql(table: Table, columns: &[&'static str], policy: ConflictPolicy) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT OR {} INTO {} ({}) VALUES ({})",
        policy.as_sql(),
        table.as_str(),
        columns.join(", "),
        placeholders
    )
}

/// Insert statement compiled once and executed per batch row.
pub struct BatchInsert<'c> {
    statement: CachedStatement<'c>,
    columns: Vec<&'static str>,
}

impl BatchInsert<'_> {
    /// Returns whether a row was written (`false` when skipped by `Ignore`).
    pub fn execute(&mut self, fields: &FieldMap) -> StoreResult<bool> {
        let mut values = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let value = fields
                .get(column)
                .ok_or_else(|| StoreError::Validation(format!("missing field '{}'", column)))?;
            values.push(value);
        }
        let changed = self.statement.execute(params_from_iter(values))?;
        Ok(changed > 0)
    }
}

/// Forward-only result set. Rows are read eagerly so the cursor does not
/// hold the connection lock.
#[derive(Debug, Clone)]
pub struct Cursor {
    columns: Arc<[String]>,
    rows: VecDeque<Vec<Value>>,
}

impl Cursor {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_records<R: Record>(self) -> StoreResult<Vec<R>> {
        self.map(|row| R::from_row(&row)).collect()
    }
}

impl Iterator for Cursor {
    type Item = CursorRow;

    fn next(&mut self) -> Option<CursorRow> {
        self.rows.pop_front().map(|values| CursorRow {
            columns: Arc::clone(&self.columns),
            values,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorRow {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl CursorRow {
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|index| self.values.get(index))
    }

    pub fn get<T: FromSql>(&self, column: &str) -> StoreResult<T> {
        let value = self
            .value(column)
            .ok_or_else(|| StoreError::MalformedRow(format!("missing column '{}'", column)))?;
        T::column_result(ValueRef::from(value))
            .map_err(|error| StoreError::MalformedRow(format!("column '{}': {}", column, error)))
    }
}
