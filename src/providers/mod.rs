// ABOUTME: Source and target provider interfaces consumed by the migration orchestrator
// ABOUTME: Concrete SQLite and PostgreSQL engines implement them; tests use in-memory fakes

pub mod postgres;
pub mod sqlite;

use crate::resolver::MigrationOrder;
use crate::schema::{Row, TableDescriptor};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Storage engines the migrator can read from or write to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Sqlite,
    Postgres,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Sqlite, ProviderKind::Postgres];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Sqlite => "sqlite",
            ProviderKind::Postgres => "postgres",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(ProviderKind::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(ProviderKind::Postgres),
            other => anyhow::bail!(
                "Unknown storage engine '{}'. Expected one of: sqlite, postgres",
                other
            ),
        }
    }
}

/// Read side of a migration
///
/// Engines implement the primitives (`read_page`, `existing_tables`, ...); the batch streams
/// are built on top of `read_page` and page through the table by primary key.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Probe the connection; `false` means the source is unreachable
    async fn test_connection(&self) -> bool;

    /// Bring the source schema up to date before reading
    async fn apply_schema(&self) -> Result<()>;

    /// Number of rows currently stored in `table`
    async fn get_count(&self, table: &TableDescriptor) -> Result<u64>;

    /// Read at most `limit` rows starting at row `offset`, in primary-key order
    async fn read_page(&self, table: &TableDescriptor, offset: u64, limit: usize)
        -> Result<Vec<Row>>;

    /// Names of the tables that exist in the source schema
    async fn existing_tables(&self) -> Result<HashSet<String>>;

    /// Dependency-safe processing order, resolved once and cached
    async fn get_migration_order(&self) -> Result<MigrationOrder>;

    /// Lazy sequence of row batches from the first row
    fn read_batches<'a>(
        &'a self,
        table: &'a TableDescriptor,
        batch_size: usize,
    ) -> BoxStream<'a, Result<Vec<Row>>> {
        self.read_batches_from_offset(table, batch_size, 0)
    }

    /// Lazy sequence of row batches starting at row `start_offset`
    ///
    /// The stream ends after the first short or empty page. It is not restartable; resuming
    /// mid-table means opening a new stream at the last confirmed offset.
    fn read_batches_from_offset<'a>(
        &'a self,
        table: &'a TableDescriptor,
        batch_size: usize,
        start_offset: u64,
    ) -> BoxStream<'a, Result<Vec<Row>>> {
        let batch_size = batch_size.max(1);
        stream::try_unfold(Some(start_offset), move |next| async move {
            let Some(offset) = next else {
                return Ok(None);
            };
            let rows = self.read_page(table, offset, batch_size).await?;
            if rows.is_empty() {
                return Ok(None);
            }
            let following = if rows.len() < batch_size {
                None
            } else {
                Some(offset + rows.len() as u64)
            };
            Ok(Some((rows, following)))
        })
        .boxed()
    }
}

/// Write side of a migration
#[async_trait]
pub trait TargetProvider: Send + Sync {
    /// Probe the connection; `false` means the target is unreachable
    async fn test_connection(&self) -> bool;

    /// Create the target schema
    async fn apply_schema(&self) -> Result<()>;

    /// Insert `rows` in one transaction
    ///
    /// Fails with [`crate::error::MigrationError::DuplicateKey`] when a row already exists.
    async fn write_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<()>;

    /// Insert `rows`, silently skipping those that already exist
    async fn write_batch_ignore_duplicates(&self, table: &TableDescriptor, rows: &[Row])
        -> Result<()>;

    /// Move key generators past the highest migrated key; no-op where keys track inserts
    async fn update_sequences(&self, order: &MigrationOrder) -> Result<()>;

    /// Whether NaN and infinite reals can be stored as-is
    fn accepts_non_finite(&self) -> bool;
}

/// Opens providers for the engines chosen by the operator or adopted from a checkpoint
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn open_source(&self, kind: ProviderKind) -> Result<Box<dyn SourceProvider>>;

    async fn open_target(&self, kind: ProviderKind) -> Result<Box<dyn TargetProvider>>;

    /// Engines with a configured source endpoint
    fn source_kinds(&self) -> Vec<ProviderKind>;

    /// Engines with a configured target endpoint
    fn target_kinds(&self) -> Vec<ProviderKind>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnKind, Value};
    use futures::TryStreamExt;
    use std::sync::Mutex;

    struct CountingSource {
        rows: u64,
        pages: Mutex<Vec<(u64, usize)>>,
    }

    #[async_trait]
    impl SourceProvider for CountingSource {
        async fn test_connection(&self) -> bool {
            true
        }

        async fn apply_schema(&self) -> Result<()> {
            Ok(())
        }

        async fn get_count(&self, _table: &TableDescriptor) -> Result<u64> {
            Ok(self.rows)
        }

        async fn read_page(
            &self,
            _table: &TableDescriptor,
            offset: u64,
            limit: usize,
        ) -> Result<Vec<Row>> {
            self.pages.lock().unwrap().push((offset, limit));
            let end = (offset + limit as u64).min(self.rows);
            Ok((offset..end).map(|i| vec![Value::Integer(i as i64)]).collect())
        }

        async fn existing_tables(&self) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }

        async fn get_migration_order(&self) -> Result<MigrationOrder> {
            Ok(MigrationOrder::default())
        }
    }

    fn table() -> TableDescriptor {
        TableDescriptor::new("t", "id").column("id", ColumnKind::Integer)
    }

    #[tokio::test]
    async fn test_read_batches_pages_until_short_batch() {
        let source = CountingSource {
            rows: 10,
            pages: Mutex::new(Vec::new()),
        };
        let table = table();
        let batches: Vec<Vec<Row>> = source.read_batches(&table, 4).try_collect().await.unwrap();

        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(*source.pages.lock().unwrap(), vec![(0, 4), (4, 4), (8, 4)]);
    }

    #[tokio::test]
    async fn test_read_batches_from_offset_starts_mid_table() {
        let source = CountingSource {
            rows: 10,
            pages: Mutex::new(Vec::new()),
        };
        let table = table();
        let batches: Vec<Vec<Row>> = source
            .read_batches_from_offset(&table, 4, 6)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].first(), Some(&vec![Value::Integer(6)]));
        assert_eq!(batches[0].len(), 4);
        // Exact multiple: one extra empty read ends the stream
        assert_eq!(*source.pages.lock().unwrap(), vec![(6, 4), (10, 4)]);
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("SQLite".parse::<ProviderKind>().unwrap(), ProviderKind::Sqlite);
        assert_eq!(
            "postgresql".parse::<ProviderKind>().unwrap(),
            ProviderKind::Postgres
        );
        assert!("oracle".parse::<ProviderKind>().is_err());
        assert_eq!(ProviderKind::Postgres.to_string(), "postgres");
    }
}
