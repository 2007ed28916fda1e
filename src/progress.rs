// ABOUTME: Asynchronous progress reporting from the migration to a live display
// ABOUTME: Many cheap producers feed one consumer task that owns all display state

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Something that happened during the migration
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    TableStart {
        table: String,
        total_rows: u64,
        indeterminate: bool,
    },
    Progress {
        table: String,
        processed_rows: u64,
    },
    TableComplete {
        table: String,
    },
    Error {
        message: String,
    },
    Complete,
}

/// Display-side view of one table
#[derive(Debug, Clone, PartialEq)]
pub struct TableProgress {
    pub table: String,
    pub total_rows: u64,
    pub indeterminate: bool,
    pub processed_rows: u64,
    pub complete: bool,
}

/// Everything the consumer has applied so far
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayState {
    /// Tables in the order they were first announced
    pub tables: Vec<TableProgress>,
    pub errors: Vec<String>,
    pub finished: bool,
}

impl DisplayState {
    pub fn table(&self, name: &str) -> Option<&TableProgress> {
        self.tables.iter().find(|t| t.table == name)
    }

    fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::TableStart {
                table,
                total_rows,
                indeterminate,
            } => match self.tables.iter_mut().find(|t| &t.table == table) {
                // Re-announcement: update bounds in place
                Some(existing) => {
                    existing.total_rows = *total_rows;
                    existing.indeterminate = *indeterminate;
                }
                None => self.tables.push(TableProgress {
                    table: table.clone(),
                    total_rows: *total_rows,
                    indeterminate: *indeterminate,
                    processed_rows: 0,
                    complete: false,
                }),
            },
            ProgressEvent::Progress {
                table,
                processed_rows,
            } => {
                if let Some(existing) = self.tables.iter_mut().find(|t| &t.table == table) {
                    existing.processed_rows = *processed_rows;
                }
            }
            ProgressEvent::TableComplete { table } => {
                if let Some(existing) = self.tables.iter_mut().find(|t| &t.table == table) {
                    existing.complete = true;
                }
            }
            ProgressEvent::Error { message } => self.errors.push(message.clone()),
            ProgressEvent::Complete => self.finished = true,
        }
    }
}

/// Renders display state; only ever called from the consumer task
pub trait ProgressView: Send + 'static {
    fn render(&mut self, event: &ProgressEvent, state: &DisplayState);
}

/// View that draws nothing, for headless runs and tests
#[derive(Debug, Default)]
pub struct NullView;

impl ProgressView for NullView {
    fn render(&mut self, _event: &ProgressEvent, _state: &DisplayState) {}
}

/// Terminal progress bars, one per table
pub struct TerminalView {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl TerminalView {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            bars: HashMap::new(),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:>24} [{bar:40.cyan/blue}] {pos}/{len} rows ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:>24} {spinner} counting rows...")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }
}

impl Default for TerminalView {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressView for TerminalView {
    fn render(&mut self, event: &ProgressEvent, _state: &DisplayState) {
        match event {
            ProgressEvent::TableStart {
                table,
                total_rows,
                indeterminate,
            } => {
                let bar = self.bars.entry(table.clone()).or_insert_with(|| {
                    let bar = self.multi.add(ProgressBar::new_spinner());
                    bar.set_prefix(table.clone());
                    bar
                });
                if *indeterminate {
                    bar.set_style(Self::spinner_style());
                    bar.enable_steady_tick(Duration::from_millis(120));
                } else {
                    bar.disable_steady_tick();
                    bar.set_style(Self::bar_style());
                    bar.set_length(*total_rows);
                }
            }
            ProgressEvent::Progress {
                table,
                processed_rows,
            } => {
                if let Some(bar) = self.bars.get(table) {
                    bar.set_position(*processed_rows);
                }
            }
            ProgressEvent::TableComplete { table } => {
                if let Some(bar) = self.bars.get(table) {
                    bar.finish();
                }
            }
            ProgressEvent::Error { message } => {
                let _ = self.multi.println(format!("⚠ {}", message));
            }
            ProgressEvent::Complete => {
                for bar in self.bars.values() {
                    if !bar.is_finished() {
                        bar.abandon();
                    }
                }
            }
        }
    }
}

/// Cloneable, non-blocking producer handle
///
/// Sends never wait and never fail the caller; once the channel is complete, further events
/// are dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: UnboundedSender<ProgressEvent>,
}

impl ProgressReporter {
    /// Announce a table; `None` means the row count is not known yet
    pub fn table_start(&self, table: &str, total_rows: Option<u64>) {
        self.send(ProgressEvent::TableStart {
            table: table.to_string(),
            total_rows: total_rows.unwrap_or(0),
            indeterminate: total_rows.is_none(),
        });
    }

    pub fn progress(&self, table: &str, processed_rows: u64) {
        self.send(ProgressEvent::Progress {
            table: table.to_string(),
            processed_rows,
        });
    }

    pub fn table_complete(&self, table: &str) {
        self.send(ProgressEvent::TableComplete {
            table: table.to_string(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(ProgressEvent::Error {
            message: message.into(),
        });
    }

    fn send(&self, event: ProgressEvent) {
        // Receiver gone means the display already completed
        let _ = self.tx.send(event);
    }
}

/// Unbounded single-consumer event pipe driving the progress display
///
/// Events reported before [`ProgressChannel::start`] are buffered and applied once the
/// consumer runs.
pub struct ProgressChannel {
    tx: UnboundedSender<ProgressEvent>,
    rx: Option<UnboundedReceiver<ProgressEvent>>,
    consumer: Option<JoinHandle<DisplayState>>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            consumer: None,
        }
    }

    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            tx: self.tx.clone(),
        }
    }

    /// Spawn the consumer task; later calls are ignored
    pub fn start<V: ProgressView>(&mut self, view: V) {
        if let Some(rx) = self.rx.take() {
            self.consumer = Some(tokio::spawn(consume(rx, view)));
        }
    }

    /// Signal completion, wait for the backlog to drain, and return the final display state
    pub async fn complete(mut self) -> DisplayState {
        let _ = self.tx.send(ProgressEvent::Complete);
        if self.consumer.is_none() {
            self.start(NullView);
        }
        match self.consumer.take() {
            Some(handle) => match handle.await {
                Ok(state) => state,
                Err(e) => {
                    tracing::debug!("Progress consumer ended abnormally: {}", e);
                    DisplayState::default()
                }
            },
            None => DisplayState::default(),
        }
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

async fn consume<V: ProgressView>(
    mut rx: UnboundedReceiver<ProgressEvent>,
    mut view: V,
) -> DisplayState {
    let mut state = DisplayState::default();
    while let Some(event) = rx.recv().await {
        state.apply(&event);
        view.render(&event, &state);
        if event == ProgressEvent::Complete {
            break;
        }
    }
    rx.close();
    state
}
