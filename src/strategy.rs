// ABOUTME: Per-table batch strategies registered once at session start
// ABOUTME: Explicit table-to-strategy mapping that prepares rows for the target engine

use crate::error::MigrationError;
use crate::resolver::MigrationOrder;
use crate::schema::{ColumnKind, Row, TableDescriptor, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Prepares one table's rows before they are written to the target
pub trait BatchStrategy: Send + Sync {
    fn prepare(&self, rows: Vec<Row>) -> Vec<Row>;
}

/// Rows are written exactly as read
#[derive(Debug, Default)]
pub struct PassThrough;

impl BatchStrategy for PassThrough {
    fn prepare(&self, rows: Vec<Row>) -> Vec<Row> {
        rows
    }
}

/// Replaces NaN and infinite reals with the nearest representable finite value
///
/// `+inf` becomes `f64::MAX`; `-inf` and NaN become `f64::MIN`.
#[derive(Debug)]
pub struct ClampNonFinite {
    real_columns: Vec<usize>,
}

impl ClampNonFinite {
    pub fn new(table: &TableDescriptor) -> Self {
        Self {
            real_columns: table
                .columns
                .iter()
                .enumerate()
                .filter(|(_, c)| c.kind == ColumnKind::Real)
                .map(|(idx, _)| idx)
                .collect(),
        }
    }
}

impl BatchStrategy for ClampNonFinite {
    fn prepare(&self, mut rows: Vec<Row>) -> Vec<Row> {
        for row in &mut rows {
            for &idx in &self.real_columns {
                if let Some(Value::Real(v)) = row.get_mut(idx) {
                    *v = clamp_non_finite(*v);
                }
            }
        }
        rows
    }
}

pub fn clamp_non_finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else if value == f64::INFINITY {
        f64::MAX
    } else {
        f64::MIN
    }
}

/// Closed mapping from table name to its batch strategy
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn BatchStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy for every table in `order`
    ///
    /// Tables with real columns are clamped when the target cannot store non-finite values.
    pub fn for_order(order: &MigrationOrder, target_accepts_non_finite: bool) -> Self {
        let mut registry = Self::new();
        for table in order.iter() {
            let has_reals = table.columns.iter().any(|c| c.kind == ColumnKind::Real);
            let strategy: Arc<dyn BatchStrategy> = if has_reals && !target_accepts_non_finite {
                Arc::new(ClampNonFinite::new(table))
            } else {
                Arc::new(PassThrough)
            };
            registry.register(&table.name, strategy);
        }
        registry
    }

    pub fn register(&mut self, table: &str, strategy: Arc<dyn BatchStrategy>) {
        self.strategies.insert(table.to_string(), strategy);
    }

    pub fn get(&self, table: &str) -> Result<Arc<dyn BatchStrategy>, MigrationError> {
        self.strategies
            .get(table)
            .cloned()
            .ok_or_else(|| MigrationError::UnregisteredTable(table.to_string()))
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;
    use std::collections::HashSet;

    fn readings() -> TableDescriptor {
        TableDescriptor::new("readings", "id")
            .column("id", ColumnKind::Integer)
            .column("value", ColumnKind::Real)
            .column("note", ColumnKind::Text)
    }

    fn order_of(tables: &[TableDescriptor]) -> MigrationOrder {
        let present: HashSet<String> = tables.iter().map(|t| t.name.clone()).collect();
        resolve(tables, &present)
    }

    #[test]
    fn test_clamp_non_finite_values() {
        let strategy = ClampNonFinite::new(&readings());
        let rows = vec![
            vec![Value::Integer(1), Value::Real(f64::INFINITY), Value::Null],
            vec![Value::Integer(2), Value::Real(f64::NEG_INFINITY), Value::Null],
            vec![Value::Integer(3), Value::Real(f64::NAN), Value::Null],
            vec![Value::Integer(4), Value::Real(1.5), Value::Null],
            vec![Value::Integer(5), Value::Null, Value::Null],
        ];

        let prepared = strategy.prepare(rows);
        assert_eq!(prepared[0][1], Value::Real(f64::MAX));
        assert_eq!(prepared[1][1], Value::Real(f64::MIN));
        assert_eq!(prepared[2][1], Value::Real(f64::MIN));
        assert_eq!(prepared[3][1], Value::Real(1.5));
        assert_eq!(prepared[4][1], Value::Null);
    }

    #[test]
    fn test_text_columns_untouched() {
        let strategy = ClampNonFinite::new(&readings());
        let rows = vec![vec![
            Value::Integer(1),
            Value::Real(2.0),
            Value::Text("inf".to_string()),
        ]];
        assert_eq!(strategy.prepare(rows.clone()), rows);
    }

    #[test]
    fn test_registry_covers_every_table_in_order() {
        let tables = vec![
            readings(),
            TableDescriptor::new("sites", "id").column("id", ColumnKind::Integer),
        ];
        let registry = StrategyRegistry::for_order(&order_of(&tables), false);
        assert_eq!(registry.len(), 2);

        let clamp = registry.get("readings").unwrap();
        let out = clamp.prepare(vec![vec![
            Value::Integer(1),
            Value::Real(f64::INFINITY),
            Value::Null,
        ]]);
        assert_eq!(out[0][1], Value::Real(f64::MAX));
    }

    #[test]
    fn test_registry_passes_through_when_target_accepts_non_finite() {
        let tables = vec![readings()];
        let registry = StrategyRegistry::for_order(&order_of(&tables), true);
        let out = registry.get("readings").unwrap().prepare(vec![vec![
            Value::Integer(1),
            Value::Real(f64::INFINITY),
            Value::Null,
        ]]);
        assert_eq!(out[0][1], Value::Real(f64::INFINITY));
    }

    #[test]
    fn test_unregistered_table_is_an_error() {
        let registry = StrategyRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(MigrationError::UnregisteredTable(name)) if name == "ghost"
        ));
    }
}
