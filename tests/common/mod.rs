// ABOUTME: In-memory source/target providers and a scripted operator for orchestrator tests
// ABOUTME: Records every read and write attempt together with the checkpoint seen on disk

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use seren_table_migrator::checkpoint::{CheckpointState, CheckpointStore, CheckpointSummary};
use seren_table_migrator::error::MigrationError;
use seren_table_migrator::orchestrator::{Operator, Orchestrator, RunSettings};
use seren_table_migrator::progress::{DisplayState, ProgressChannel, ProgressEvent, ProgressView};
use seren_table_migrator::providers::{
    ProviderFactory, ProviderKind, SourceProvider, TargetProvider,
};
use seren_table_migrator::resolver::{MigrationOrder, OrderCache};
use seren_table_migrator::schema::{ColumnKind, Row, TableDescriptor, Value};
use seren_table_migrator::utils::RetryPolicy;
use seren_table_migrator::watchdog::{Watchdog, WatchdogConfig};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

pub fn table(name: &str) -> TableDescriptor {
    TableDescriptor::new(name, "id")
        .column("id", ColumnKind::Integer)
        .column("label", ColumnKind::Text)
}

/// c → b → a, listed in reverse so the resolver has to reorder them
pub fn chain_catalog() -> Vec<TableDescriptor> {
    vec![
        table("c").references("b"),
        table("b").references("a"),
        table("a"),
    ]
}

/// `count` rows whose id equals their position
pub fn rows(table: &str, count: i64) -> Vec<Row> {
    (0..count)
        .map(|i| vec![Value::Integer(i), Value::Text(format!("{} {}", table, i))])
        .collect()
}

fn id_of(row: &Row) -> i64 {
    match row.first() {
        Some(Value::Integer(id)) => *id,
        _ => -1,
    }
}

#[derive(Default)]
pub struct SourceLog {
    pub reads: Mutex<Vec<(String, u64)>>,
    pub schema_applied: AtomicBool,
}

impl SourceLog {
    pub fn reads_of(&self, table: &str) -> Vec<u64> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

pub struct MemorySource {
    tables: Vec<TableDescriptor>,
    data: Arc<HashMap<String, Vec<Row>>>,
    log: Arc<SourceLog>,
    order: OrderCache,
}

#[async_trait]
impl SourceProvider for MemorySource {
    async fn test_connection(&self) -> bool {
        true
    }

    async fn apply_schema(&self) -> Result<()> {
        self.log.schema_applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_count(&self, table: &TableDescriptor) -> Result<u64> {
        Ok(self.data.get(&table.name).map_or(0, |r| r.len() as u64))
    }

    async fn read_page(
        &self,
        table: &TableDescriptor,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.log
            .reads
            .lock()
            .unwrap()
            .push((table.name.clone(), offset));
        let all = self.data.get(&table.name).cloned().unwrap_or_default();
        Ok(all
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .collect())
    }

    async fn existing_tables(&self) -> Result<HashSet<String>> {
        Ok(self.data.keys().cloned().collect())
    }

    async fn get_migration_order(&self) -> Result<MigrationOrder> {
        self.order
            .get_or_resolve(&self.tables, || self.existing_tables())
            .await
    }
}

#[derive(Debug, Clone)]
pub struct WriteAttempt {
    pub table: String,
    pub first_id: i64,
    pub len: usize,
    pub tolerant: bool,
    pub ok: bool,
    /// Checkpoint as persisted on disk when the write started
    pub checkpoint: Option<CheckpointState>,
}

/// Target contents and behaviour switches shared between the test and the provider
#[derive(Default)]
pub struct TargetState {
    pub rows: Mutex<BTreeMap<String, BTreeMap<i64, Row>>>,
    pub attempts: Mutex<Vec<WriteAttempt>>,
    /// Number of upcoming write attempts that fail with a transient error
    pub transient_failures: AtomicU32,
    /// Writes of this (table, first id) batch always fail
    pub fail_always_at: Mutex<Option<(String, i64)>>,
    pub unreachable: AtomicBool,
    pub accepts_non_finite: AtomicBool,
    pub schema_applied: AtomicBool,
    pub sequence_updates: AtomicU32,
    pub checkpoint_path: Mutex<Option<PathBuf>>,
    /// Flip the cancel flag after this many successful writes
    pub cancel_after: Mutex<Option<(usize, watch::Sender<bool>)>>,
}

impl TargetState {
    pub fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut all = self.rows.lock().unwrap();
        let stored = all.entry(table.to_string()).or_default();
        for row in rows {
            stored.insert(id_of(&row), row);
        }
    }

    pub fn stored(&self, table: &str) -> Vec<Row> {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn attempts(&self) -> Vec<WriteAttempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, table: &str) -> Vec<WriteAttempt> {
        self.attempts()
            .into_iter()
            .filter(|a| a.table == table)
            .collect()
    }

    fn write(&self, table: &TableDescriptor, rows: &[Row], tolerant: bool) -> Result<()> {
        let checkpoint = self
            .checkpoint_path
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|path| CheckpointStore::new(path).load_existing());
        let first_id = rows.first().map_or(-1, id_of);

        let result = self.try_write(table, rows, tolerant, first_id);
        self.attempts.lock().unwrap().push(WriteAttempt {
            table: table.name.clone(),
            first_id,
            len: rows.len(),
            tolerant,
            ok: result.is_ok(),
            checkpoint,
        });

        if result.is_ok() {
            let successes = self.attempts.lock().unwrap().iter().filter(|a| a.ok).count();
            if let Some((after, cancel)) = self.cancel_after.lock().unwrap().as_ref() {
                if successes >= *after {
                    let _ = cancel.send(true);
                }
            }
        }
        result
    }

    fn try_write(
        &self,
        table: &TableDescriptor,
        rows: &[Row],
        tolerant: bool,
        first_id: i64,
    ) -> Result<()> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("connection reset by peer");
        }
        if let Some((t, id)) = self.fail_always_at.lock().unwrap().as_ref() {
            if *t == table.name && *id == first_id {
                bail!("canceling statement due to statement timeout");
            }
        }

        let mut all = self.rows.lock().unwrap();
        let stored = all.entry(table.name.clone()).or_default();
        if !tolerant && rows.iter().any(|r| stored.contains_key(&id_of(r))) {
            return Err(MigrationError::DuplicateKey {
                table: table.name.clone(),
            }
            .into());
        }
        for row in rows {
            stored.entry(id_of(row)).or_insert_with(|| row.clone());
        }
        Ok(())
    }
}

pub struct MemoryTarget(Arc<TargetState>);

#[async_trait]
impl TargetProvider for MemoryTarget {
    async fn test_connection(&self) -> bool {
        !self.0.unreachable.load(Ordering::SeqCst)
    }

    async fn apply_schema(&self) -> Result<()> {
        self.0.schema_applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write_batch(&self, table: &TableDescriptor, rows: &[Row]) -> Result<()> {
        self.0.write(table, rows, false)
    }

    async fn write_batch_ignore_duplicates(
        &self,
        table: &TableDescriptor,
        rows: &[Row],
    ) -> Result<()> {
        self.0.write(table, rows, true)
    }

    async fn update_sequences(&self, _order: &MigrationOrder) -> Result<()> {
        self.0.sequence_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn accepts_non_finite(&self) -> bool {
        self.0.accepts_non_finite.load(Ordering::SeqCst)
    }
}

pub struct MemoryFactory {
    tables: Vec<TableDescriptor>,
    data: Arc<HashMap<String, Vec<Row>>>,
    source_log: Arc<SourceLog>,
    target: Arc<TargetState>,
}

#[async_trait]
impl ProviderFactory for MemoryFactory {
    async fn open_source(&self, _kind: ProviderKind) -> Result<Box<dyn SourceProvider>> {
        Ok(Box::new(MemorySource {
            tables: self.tables.clone(),
            data: Arc::clone(&self.data),
            log: Arc::clone(&self.source_log),
            order: OrderCache::new(),
        }))
    }

    async fn open_target(&self, _kind: ProviderKind) -> Result<Box<dyn TargetProvider>> {
        Ok(Box::new(MemoryTarget(Arc::clone(&self.target))))
    }

    fn source_kinds(&self) -> Vec<ProviderKind> {
        vec![ProviderKind::Sqlite]
    }

    fn target_kinds(&self) -> Vec<ProviderKind> {
        vec![ProviderKind::Postgres]
    }
}

/// Operator with fixed answers that counts how often it was asked
pub struct ScriptedOperator {
    pub resume: bool,
    pub engine_prompts: AtomicU32,
    pub resume_prompts: AtomicU32,
}

impl ScriptedOperator {
    pub fn new(resume: bool) -> Self {
        Self {
            resume,
            engine_prompts: AtomicU32::new(0),
            resume_prompts: AtomicU32::new(0),
        }
    }
}

impl Operator for ScriptedOperator {
    fn select_engines(
        &self,
        sources: &[ProviderKind],
        targets: &[ProviderKind],
    ) -> Result<(ProviderKind, ProviderKind)> {
        self.engine_prompts.fetch_add(1, Ordering::SeqCst);
        Ok((sources[0], targets[0]))
    }

    fn confirm_resume(&self, _summary: &CheckpointSummary) -> Result<bool> {
        self.resume_prompts.fetch_add(1, Ordering::SeqCst);
        Ok(self.resume)
    }
}

/// Everything one orchestrator run needs, backed by a temp directory
/// Progress view keeping every event it renders, in order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl EventLog {
    pub fn all(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressView for EventLog {
    fn render(&mut self, event: &ProgressEvent, _state: &DisplayState) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub events: EventLog,
    pub checkpoint: Arc<CheckpointStore>,
    pub source_log: Arc<SourceLog>,
    pub target: Arc<TargetState>,
    pub operator: Arc<ScriptedOperator>,
    pub settings: RunSettings,
    tables: Vec<TableDescriptor>,
    data: Arc<HashMap<String, Vec<Row>>>,
}

impl Harness {
    pub fn new(tables: Vec<TableDescriptor>, data: HashMap<String, Vec<Row>>) -> Self {
        let dir = TempDir::new().unwrap();
        let checkpoint_path = dir.path().join("checkpoint.json");
        let target = Arc::new(TargetState::default());
        target.accepts_non_finite.store(true, Ordering::SeqCst);
        *target.checkpoint_path.lock().unwrap() = Some(checkpoint_path.clone());

        Self {
            checkpoint: Arc::new(CheckpointStore::new(checkpoint_path)),
            dir,
            events: EventLog::default(),
            source_log: Arc::new(SourceLog::default()),
            target,
            operator: Arc::new(ScriptedOperator::new(true)),
            settings: RunSettings {
                batch_size: 4,
                retry: RetryPolicy::new(3, Duration::ZERO),
            },
            tables,
            data: Arc::new(data),
        }
    }

    /// Tables a, b, c (c → b → a) with `count` rows each
    pub fn chain(count: i64) -> Self {
        let data = ["a", "b", "c"]
            .iter()
            .map(|t| (t.to_string(), rows(t, count)))
            .collect();
        Self::new(chain_catalog(), data)
    }

    pub fn source_rows(&self, table: &str) -> Vec<Row> {
        self.data.get(table).cloned().unwrap_or_default()
    }

    pub fn watchdog(&self) -> Arc<Watchdog> {
        Arc::new(Watchdog::new(WatchdogConfig {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            log_path: Some(self.dir.path().join("watchdog.log")),
        }))
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let factory = Arc::new(MemoryFactory {
            tables: self.tables.clone(),
            data: Arc::clone(&self.data),
            source_log: Arc::clone(&self.source_log),
            target: Arc::clone(&self.target),
        });
        let mut progress = ProgressChannel::new();
        progress.start(self.events.clone());

        Orchestrator::new(
            factory,
            Arc::clone(&self.operator) as Arc<dyn Operator>,
            Arc::clone(&self.checkpoint),
            self.watchdog(),
            progress,
        )
        .with_settings(self.settings)
    }

    /// A second store on the same file, as a fresh process would see it
    pub fn reload_checkpoint(&self) -> Option<CheckpointState> {
        CheckpointStore::new(self.checkpoint.path()).load_existing()
    }
}
