// ABOUTME: PostgreSQL source and target providers backed by tokio-postgres
// ABOUTME: Casts every column to a fixed wire type so values map one-to-one onto row values

use crate::error::MigrationError;
use crate::postgres::connect_with_retry;
use crate::providers::{SourceProvider, TargetProvider};
use crate::resolver::{MigrationOrder, OrderCache};
use crate::schema::{ColumnDef, ColumnKind, Row, TableDescriptor, Value};
use crate::utils::quote_identifier;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

type Param = Box<dyn ToSql + Sync + Send>;

fn wire_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Integer => "bigint",
        ColumnKind::Real => "float8",
        ColumnKind::Text => "text",
        ColumnKind::Blob => "bytea",
        ColumnKind::Boolean => "boolean",
    }
}

async fn ping(client: &Client) -> bool {
    match client.simple_query("SELECT 1").await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("PostgreSQL probe failed: {}", e);
            false
        }
    }
}

async fn run_script(client: &Client, script: Option<&Path>) -> Result<()> {
    let Some(script) = script else {
        tracing::debug!("No schema script configured for PostgreSQL endpoint");
        return Ok(());
    };
    let sql = std::fs::read_to_string(script)
        .with_context(|| format!("Failed to read schema script {}", script.display()))?;
    client
        .batch_execute(&sql)
        .await
        .with_context(|| format!("Failed to apply schema script {}", script.display()))?;
    tracing::info!("✓ Applied schema script {}", script.display());
    Ok(())
}

/// Reads tables from a PostgreSQL database
pub struct PostgresSource {
    client: Client,
    tables: Vec<TableDescriptor>,
    schema: Option<PathBuf>,
    order: OrderCache,
}

impl PostgresSource {
    pub async fn connect(
        url: &str,
        tables: Vec<TableDescriptor>,
        schema: Option<PathBuf>,
    ) -> Result<Self> {
        tracing::info!("Connecting to PostgreSQL source...");
        let client = connect_with_retry(url).await?;
        Ok(Self {
            client,
            tables,
            schema,
            order: OrderCache::new(),
        })
    }
}

#[async_trait]
impl SourceProvider for PostgresSource {
    async fn test_connection(&self) -> bool {
        ping(&self.client).await
    }

    async fn apply_schema(&self) -> Result<()> {
        run_script(&self.client, self.schema.as_deref()).await
    }

    async fn get_count(&self, table: &TableDescriptor) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&table.name));
        let row = self
            .client
            .query_one(&sql, &[])
            .await
            .with_context(|| format!("Failed to count rows in '{}'", table.name))?;
        let count: i64 = row.get(0);
        Ok(count.max(0) as u64)
    }

    async fn read_page(
        &self,
        table: &TableDescriptor,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{}::{}", quote_identifier(&c.name), wire_type(c.kind)))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {} LIMIT $1 OFFSET $2",
            columns.join(", "),
            quote_identifier(&table.name),
            quote_identifier(&table.primary_key)
        );

        let rows = self
            .client
            .query(&sql, &[&(limit as i64), &(offset as i64)])
            .await
            .with_context(|| format!("Failed to read '{}' at offset {}", table.name, offset))?;

        rows.iter()
            .map(|row| {
                table
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| decode(row, idx, column.kind))
                    .collect::<Result<Row>>()
            })
            .collect()
    }

    async fn existing_tables(&self) -> Result<HashSet<String>> {
        let rows = self
            .client
            .query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'",
                &[],
            )
            .await
            .context("Failed to list PostgreSQL tables")?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn get_migration_order(&self) -> Result<MigrationOrder> {
        self.order
            .get_or_resolve(&self.tables, || self.existing_tables())
            .await
    }
}

/// Writes tables into a PostgreSQL database
pub struct PostgresTarget {
    client: Mutex<Client>,
    schema: Option<PathBuf>,
}

impl PostgresTarget {
    pub async fn connect(url: &str, schema: Option<PathBuf>) -> Result<Self> {
        tracing::info!("Connecting to PostgreSQL target...");
        let client = connect_with_retry(url).await?;
        Ok(Self {
            client: Mutex::new(client),
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

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin transaction")?;
        let statement = tx
            .prepare(&sql)
            .await
            .with_context(|| format!("Failed to prepare insert into '{}'", table.name))?;

        for row in rows {
            let params = encode_row(table, row)?;
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            tx.execute(&statement, &refs)
                .await
                .map_err(|e| write_error(e, &table.name))?;
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit batch for '{}'", table.name))
    }
}

#[async_trait]
impl TargetProvider for PostgresTarget {
    async fn test_connection(&self) -> bool {
        ping(&*self.client.lock().await).await
    }

    async fn apply_schema(&self) -> Result<()> {
        let client = self.client.lock().await;
        run_script(&client, self.schema.as_deref()).await
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

    async fn update_sequences(&self, order: &MigrationOrder) -> Result<()> {
        let client = self.client.lock().await;
        for table in order.iter() {
            if table.primary_key_kind() != Some(ColumnKind::Integer) {
                continue;
            }
            let row = client
                .query_one(
                    "SELECT pg_get_serial_sequence($1, $2)",
                    &[&quote_identifier(&table.name), &table.primary_key],
                )
                .await
                .with_context(|| format!("Failed to look up sequence for '{}'", table.name))?;
            let Some(sequence) = row.get::<_, Option<String>>(0) else {
                tracing::debug!("Table '{}' has no serial sequence", table.name);
                continue;
            };

            let sql = format!(
                "SELECT setval($1::regclass, COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
                quote_identifier(&table.primary_key),
                quote_identifier(&table.name)
            );
            client
                .query_one(&sql, &[&sequence])
                .await
                .with_context(|| format!("Failed to reset sequence {}", sequence))?;
            tracing::info!("  ✓ Reset sequence {}", sequence);
        }
        Ok(())
    }

    fn accepts_non_finite(&self) -> bool {
        true
    }
}

fn insert_sql(table: &TableDescriptor, ignore_duplicates: bool) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect();
    let placeholders: Vec<String> = table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, c)| format!("${}::{}", idx + 1, wire_type(c.kind)))
        .collect();
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

fn decode(row: &tokio_postgres::Row, idx: usize, kind: ColumnKind) -> Result<Value> {
    let value = match kind {
        ColumnKind::Integer => row.try_get::<_, Option<i64>>(idx)?.map(Value::Integer),
        ColumnKind::Real => row.try_get::<_, Option<f64>>(idx)?.map(Value::Real),
        ColumnKind::Text => row.try_get::<_, Option<String>>(idx)?.map(Value::Text),
        ColumnKind::Blob => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Blob),
        ColumnKind::Boolean => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Largest magnitude below which every integer has an exact `f64`
const MAX_EXACT_F64_INT: u64 = 1 << 53;

/// Whether `f` is an integer that `as i64` carries over without saturating
fn is_whole_i64(f: f64) -> bool {
    // i64::MAX rounds up to 2^63 as f64, so the upper bound is exclusive
    f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
}

fn encode_row(table: &TableDescriptor, row: &Row) -> Result<Vec<Param>> {
    if row.len() != table.columns.len() {
        bail!(
            "Row for '{}' has {} values but the table has {} columns",
            table.name,
            row.len(),
            table.columns.len()
        );
    }
    table
        .columns
        .iter()
        .zip(row)
        .map(|(column, value)| encode(&table.name, column, value))
        .collect()
}

/// Convert one value to the column's wire type; lossless coercions only
fn encode(table: &str, column: &ColumnDef, value: &Value) -> Result<Param> {
    let param: Param = match (column.kind, value) {
        (ColumnKind::Integer, Value::Null) => Box::new(None::<i64>),
        (ColumnKind::Real, Value::Null) => Box::new(None::<f64>),
        (ColumnKind::Text, Value::Null) => Box::new(None::<String>),
        (ColumnKind::Blob, Value::Null) => Box::new(None::<Vec<u8>>),
        (ColumnKind::Boolean, Value::Null) => Box::new(None::<bool>),

        (ColumnKind::Integer, Value::Integer(i)) => Box::new(*i),
        (ColumnKind::Integer, Value::Bool(b)) => Box::new(i64::from(*b)),
        (ColumnKind::Integer, Value::Real(f)) if is_whole_i64(*f) => Box::new(*f as i64),

        (ColumnKind::Real, Value::Real(f)) => Box::new(*f),
        (ColumnKind::Real, Value::Integer(i)) if i.unsigned_abs() <= MAX_EXACT_F64_INT => {
            Box::new(*i as f64)
        }

        (ColumnKind::Text, Value::Text(s)) => Box::new(s.clone()),
        (ColumnKind::Text, Value::Integer(i)) => Box::new(i.to_string()),
        (ColumnKind::Text, Value::Real(f)) => Box::new(f.to_string()),

        (ColumnKind::Blob, Value::Blob(b)) => Box::new(b.clone()),
        (ColumnKind::Blob, Value::Text(s)) => Box::new(s.clone().into_bytes()),

        (ColumnKind::Boolean, Value::Bool(b)) => Box::new(*b),
        (ColumnKind::Boolean, Value::Integer(i)) => Box::new(*i != 0),

        (kind, other) => bail!(
            "Cannot store {:?} in {:?} column '{}.{}'",
            other,
            kind,
            table,
            column.name
        ),
    };
    Ok(param)
}

fn write_error(err: tokio_postgres::Error, table: &str) -> anyhow::Error {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        return anyhow::Error::new(MigrationError::DuplicateKey {
            table: table.to_string(),
        })
        .context(err.to_string());
    }
    anyhow::Error::new(err).context(format!("Failed to insert into '{}'", table))
}
