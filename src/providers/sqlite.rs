// ABOUTME: SQLite source and target providers backed by rusqlite
// ABOUTME: Blocking database work runs on tokio's blocking pool, one transaction per batch

use crate::error::MigrationError;
use crate::providers::{SourceProvider, TargetProvider};
use crate::resolver::{MigrationOrder, OrderCache};
use crate::schema::{ColumnKind, Row, TableDescriptor, Value};
use crate::utils::quote_identifier;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{ffi, params, params_from_iter, Connection, ErrorCode};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared handle to one SQLite database file
#[derive(Clone)]
struct SqliteDb {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl SqliteDb {
    fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database '{}'", path))?;
        conn.busy_timeout(Duration::from_secs(30))
            .context("Failed to set SQLite busy timeout")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_string(),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow!("SQLite connection lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .context("SQLite task failed")?
    }

    async fn ping(&self) -> bool {
        self.call(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await
            .is_ok()
    }

    async fn run_script(&self, script: Option<&Path>) -> Result<()> {
        let Some(script) = script else {
            tracing::debug!("No schema script configured for SQLite '{}'", self.path);
            return Ok(());
        };
        let sql = std::fs::read_to_string(script)
            .with_context(|| format!("Failed to read schema script {}", script.display()))?;
        let label = script.display().to_string();
        self.call(move |conn| {
            conn.execute_batch(&sql)
                .with_context(|| format!("Failed to apply schema script {}", label))
        })
        .await?;
        tracing::info!("✓ Applied schema to SQLite '{}'", self.path);
        Ok(())
    }
}

/// Reads tables from a SQLite database file
pub struct SqliteSource {
    db: SqliteDb,
    tables: Vec<TableDescriptor>,
    schema: Option<PathBuf>,
    order: OrderCache,
}

impl SqliteSource {
    /// Open the database at `path`; `tables` is the priority list used for ordering
    pub fn open(path: &str, tables: Vec<TableDescriptor>, schema: Option<PathBuf>) -> Result<Self> {
        tracing::info!("Opening SQLite source '{}'", path);
        Ok(Self {
            db: SqliteDb::open(path)?,
            tables,
            schema,
            order: OrderCache::new(),
        })
    }
}

#[async_trait]
impl SourceProvider for SqliteSource {
    async fn test_connection(&self) -> bool {
        self.db.ping().await
    }

    async fn apply_schema(&self) -> Result<()> {
        self.db.run_script(self.schema.as_deref()).await
    }

    async fn get_count(&self, table: &TableDescriptor) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&table.name));
        let name = table.name.clone();
        let count: i64 = self
            .db
            .call(move |conn| {
                conn.query_row(&sql, [], |row| row.get(0))
                    .with_context(|| format!("Failed to count rows in '{}'", name))
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn read_page(
        &self,
        table: &TableDescriptor,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let sql = select_page_sql(table);
        let columns = table.columns.clone();
        let name = table.name.clone();

        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare_cached(&sql)
                    .with_context(|| format!("Failed to prepare read of '{}'", name))?;
                let mut cursor = stmt
                    .query(params![limit as i64, offset as i64])
                    .with_context(|| format!("Failed to read '{}' at offset {}", name, offset))?;

                let mut page: Vec<Row> = Vec::new();
                while let Some(row) = cursor
                    .next()
                    .with_context(|| format!("Failed to read '{}' at offset {}", name, offset))?
                {
                    let position = offset + page.len() as u64;
                    let mut values = Vec::with_capacity(columns.len());
                    for (idx, column) in columns.iter().enumerate() {
                        let value = decode(row.get_ref(idx)?, column.kind).with_context(|| {
                            format!(
                                "Cannot read '{}.{}' at row {}",
                                name, column.name, position
                            )
                        })?;
                        values.push(value);
                    }
                    page.push(values);
                }
                Ok(page)
            })
            .await
    }

    async fn existing_tables(&self) -> Result<HashSet<String>> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                )?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<HashSet<String>>>()?;
                Ok(names)
            })
            .await
            .context("Failed to list SQLite tables")
    }

    async fn get_migration_order(&self) -> Result<MigrationOrder> {
        self.order
            .get_or_resolve(&self.tables, || self.existing_tables())
            .await
    }
}

/// Writes tables into a SQLite database file
pub struct SqliteTarget {
    db: SqliteDb,
    schema: Option<PathBuf>,
}

impl SqliteTarget {
    pub fn open(path: &str, schema: Option<PathBuf>) -> Result<Self> {
        tracing::info!("Opening SQLite target '{}'", path);
        Ok(Self {
            db: SqliteDb::open(path)?,
            schema,
        })
    }

    async fn insert(
        &self,
        table: &TableDescriptor,
        rows: &[Row],
        ignore_duplicates: bool,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let sql = insert_sql(table, ignore_duplicates);
        let name = table.name.clone();
        let rows = rows.to_vec();

        self.db
            .call(move |conn| {
                let tx = conn.transaction().context("Failed to begin SQLite transaction")?;
                {
                    let mut stmt = tx.prepare_cached(&sql)?;
                    for row in &rows {
                        let values: Vec<SqlValue> = row.iter().map(encode).collect();
                        stmt.execute(params_from_iter(values))
                            .map_err(|e| write_error(e, &name))?;
                    }
                }
                tx.commit()
                    .with_context(|| format!("Failed to commit batch for '{}'", name))
            })
            .await
    }
}

#[async_trait]
impl TargetProvider for SqliteTarget {
    async fn test_connection(&self) -> bool {
        self.db.ping().await
    }

    async fn apply_schema(&self) -> Result<()> {
        self.db.run_script(self.schema.as_deref()).await
    }

    async fn write_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<()> {
        self.insert(table, rows, false).await
    }

    async fn write_batch_ignore_duplicates(
        &self,
        table: &TableDescriptor,
        rows: &[Row],
    ) -> Result<()> {
        self.insert(table, rows, true).await
    }

    async fn update_sequences(&self, _order: &MigrationOrder) -> Result<()> {
        // Rowid and AUTOINCREMENT counters follow inserted keys on their own
        tracing::debug!("SQLite target needs no sequence resynchronization");
        Ok(())
    }

    fn accepts_non_finite(&self) -> bool {
        // NaN is silently stored as NULL
        false
    }
}

fn select_page_sql(table: &TableDescriptor) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect();
    format!(
        "SELECT {} FROM {} ORDER BY {} LIMIT ?1 OFFSET ?2",
        columns.join(", "),
        quote_identifier(&table.name),
        quote_identifier(&table.primary_key)
    )
}

fn insert_sql(table: &TableDescriptor, ignore_duplicates: bool) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect();
    let placeholders: Vec<String> = (1..=table.columns.len()).map(|i| format!("?{}", i)).collect();
    // OR IGNORE would also swallow NOT NULL and CHECK failures; the upsert clause covers
    // uniqueness conflicts only
    format!(
        "INSERT INTO {} ({}) VALUES ({}){}",
        quote_identifier(&table.name),
        columns.join(", "),
        placeholders.join(", "),
        if ignore_duplicates {
            " ON CONFLICT DO NOTHING"
        } else {
            ""
        }
    )
}

fn decode(value: ValueRef<'_>, kind: ColumnKind) -> Result<Value> {
    let value = match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match kind {
            ColumnKind::Boolean => Value::Bool(i != 0),
            ColumnKind::Real => Value::Real(i as f64),
            _ => Value::Integer(i),
        },
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::Text(text.to_string()),
            Err(e) => bail!("text is not valid UTF-8 ({})", e),
        },
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    };
    Ok(value)
}

fn encode(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    }
}

fn write_error(err: rusqlite::Error, table: &str) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        let duplicate = failure.code == ErrorCode::ConstraintViolation
            && (failure.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE);
        if duplicate {
            return anyhow::Error::new(MigrationError::DuplicateKey {
                table: table.to_string(),
            })
            .context(err.to_string());
        }
    }
    anyhow::Error::new(err).context(format!("Failed to insert into '{}'", table))
}
