// ABOUTME: Dependency resolver computing a foreign-key safe table processing order
// ABOUTME: Visits principals before dependents, following a fixed priority list for ties

use crate::schema::TableDescriptor;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use tokio::sync::OnceCell;

/// Table processing order where every principal precedes the tables referencing it
///
/// Computed once per run and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationOrder {
    tables: Vec<TableDescriptor>,
}

impl MigrationOrder {
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn position(&self, table: &str) -> Option<usize> {
        self.tables.iter().position(|t| t.name == table)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Resolve the processing order for `priority`
///
/// Each table's principals (its `references`) are placed before it. Tables missing from
/// `present` (the tables that actually exist in the source schema) are skipped. A reference
/// that loops back into the branch currently being visited is dropped with a warning, and
/// independent tables keep their priority-list order.
///
/// # Examples
///
/// ```
/// # use seren_table_migrator::resolver::resolve;
/// # use seren_table_migrator::schema::{ColumnKind, TableDescriptor};
/// # use std::collections::HashSet;
/// let tables = vec![
///     TableDescriptor::new("orders", "id").column("id", ColumnKind::Integer).references("customers"),
///     TableDescriptor::new("customers", "id").column("id", ColumnKind::Integer),
/// ];
/// let present: HashSet<String> = ["orders", "customers"].iter().map(|s| s.to_string()).collect();
///
/// let order = resolve(&tables, &present);
/// assert_eq!(order.names(), vec!["customers", "orders"]);
/// ```
pub fn resolve(priority: &[TableDescriptor], present: &HashSet<String>) -> MigrationOrder {
    let by_name: HashMap<&str, &TableDescriptor> =
        priority.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut resolver = Resolver {
        by_name,
        present,
        placed: HashSet::new(),
        order: Vec::new(),
    };

    for table in priority {
        let mut branch = Vec::new();
        resolver.visit(&table.name, &mut branch);
    }

    tracing::debug!(
        "Resolved migration order: {}",
        resolver
            .order
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    MigrationOrder {
        tables: resolver.order,
    }
}

struct Resolver<'a> {
    by_name: HashMap<&'a str, &'a TableDescriptor>,
    present: &'a HashSet<String>,
    placed: HashSet<String>,
    order: Vec<TableDescriptor>,
}

impl<'a> Resolver<'a> {
    fn visit(&mut self, name: &str, branch: &mut Vec<String>) {
        if self.placed.contains(name) {
            return;
        }

        let Some(table) = self.by_name.get(name).copied() else {
            tracing::debug!("Reference to unknown table '{}' ignored", name);
            return;
        };

        if !self.present.contains(name) {
            tracing::warn!(
                "⚠ Table '{}' not found in source schema, it will not be migrated",
                name
            );
            return;
        }

        if branch.iter().any(|visited| visited == name) {
            tracing::warn!(
                "⚠ Circular reference {} -> {} dropped while ordering tables",
                branch.join(" -> "),
                name
            );
            return;
        }

        branch.push(name.to_string());
        for principal in &table.references {
            if principal != name {
                self.visit(principal, branch);
            }
        }
        branch.pop();

        self.placed.insert(name.to_string());
        self.order.push(table.clone());
    }
}

/// Lazily computed, cached migration order for a source provider
#[derive(Debug, Default)]
pub struct OrderCache {
    cell: OnceCell<MigrationOrder>,
}

impl OrderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached order, resolving it on first use
    ///
    /// `present` is only awaited the first time; later calls reuse the stored order.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        priority: &[TableDescriptor],
        present: F,
    ) -> Result<MigrationOrder>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashSet<String>>>,
    {
        let order = self
            .cell
            .get_or_try_init(|| async {
                let present = present().await?;
                Ok::<_, anyhow::Error>(resolve(priority, &present))
            })
            .await?;
        Ok(order.clone())
    }
}
