//! The log pipeline: ring buffer, persistence queue and live queue.
//!
//! `write` never blocks on I/O. It updates the ring under a short lock and
//! offers the line to two bounded queues with `try_send`; when a queue is
//! full the line is dropped from that consumer only.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Local};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};

use crate::{error::LogError, persist, ring::LineRing};

/// Default number of lines kept in memory.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default depth of the persistence and live queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default number of lines written per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default interval after which a partial batch is flushed.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Log pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Lines kept for [`LogPipeline::read_all`].
    pub capacity: usize,
    /// Depth of the persistence and live queues.
    pub queue_capacity: usize,
    /// Lines per file write.
    pub batch_size: usize,
    /// Maximum staleness of a partial batch.
    pub flush_interval: Duration,
    /// Backing file. `None` disables persistence only.
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            file_path: None,
        }
    }
}

impl LogConfig {
    /// Replace zero values with defaults.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.capacity == 0 {
            self.capacity = DEFAULT_CAPACITY;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        self
    }
}

/// Format a log line as `[HH:MM:SS] message`.
pub fn format_line(at: DateTime<Local>, message: &str) -> String {
    format!("[{}] {}", at.format("%H:%M:%S"), message)
}

struct State {
    ring: LineRing,
    persist_tx: Option<mpsc::Sender<String>>,
    live_tx: Option<mpsc::Sender<String>>,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    live_rx: Mutex<Option<mpsc::Receiver<String>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded, timestamped line logger.
///
/// Cloning yields another handle to the same pipeline.
#[derive(Clone)]
pub struct LogPipeline {
    inner: Arc<Inner>,
}

impl LogPipeline {
    /// Open a pipeline, spawning the flush task when a file is configured.
    ///
    /// Must be called within a tokio runtime if `file_path` is set.
    pub async fn open(config: LogConfig) -> Result<Self, LogError> {
        let config = config.normalized();

        let (persist_tx, flush_task) = match &config.file_path {
            Some(path) => {
                let file = persist::open_append(path).await?;
                let (tx, rx) = mpsc::channel(config.queue_capacity);
                let task = tokio::spawn(persist::run_flusher(
                    rx,
                    file,
                    config.batch_size,
                    config.flush_interval,
                ));
                (Some(tx), Some(task))
            },
            None => (None, None),
        };

        Ok(Self::assemble(&config, persist_tx, flush_task))
    }

    /// In-memory pipeline without persistence. Does not need a runtime.
    pub fn in_memory(capacity: usize) -> Self {
        let config = LogConfig { capacity, ..LogConfig::default() }.normalized();
        Self::assemble(&config, None, None)
    }

    fn assemble(
        config: &LogConfig,
        persist_tx: Option<mpsc::Sender<String>>,
        flush_task: Option<JoinHandle<()>>,
    ) -> Self {
        let (live_tx, live_rx) = mpsc::channel(config.queue_capacity);
        let state = State {
            ring: LineRing::new(config.capacity),
            persist_tx,
            live_tx: Some(live_tx),
            closed: false,
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                live_rx: Mutex::new(Some(live_rx)),
                flush_task: Mutex::new(flush_task),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a line, stamped with the current local time.
    ///
    /// Ignored after [`close`](Self::close).
    pub fn write(&self, message: impl AsRef<str>) {
        self.write_line(format_line(Local::now(), message.as_ref()));
    }

    /// Record an already formatted line.
    pub fn write_line(&self, line: String) {
        let mut state = self.state();
        if state.closed {
            return;
        }

        // Queue drops are silent: logging must never stall replay.
        if let Some(tx) = &state.persist_tx {
            let _ = tx.try_send(line.clone());
        }
        if let Some(tx) = &state.live_tx {
            let _ = tx.try_send(line.clone());
        }
        state.ring.push(line);
    }

    /// Buffered history, oldest first, one `\n`-terminated line each.
    pub fn read_all(&self) -> String {
        self.state().ring.join()
    }

    /// Buffered history as individual lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.state().ring.iter().map(str::to_string).collect()
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.state().ring.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.state().ring.is_empty()
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.state().ring.capacity()
    }

    /// Returns true if persistence is enabled and the pipeline is open.
    pub fn is_persisting(&self) -> bool {
        self.state().persist_tx.is_some()
    }

    /// Take the live line stream.
    ///
    /// There is exactly one live consumer; later calls return `None`.
    pub fn subscribe(&self) -> Option<LogSubscriber> {
        self.inner
            .live_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|rx| LogSubscriber { rx })
    }

    /// Stop accepting lines, end the live stream and wait for the final
    /// batch to reach disk. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.persist_tx = None;
            state.live_tx = None;
        }

        let task = self.inner.flush_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("log flush task failed: {}", e);
            }
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl std::fmt::Debug for LogPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("LogPipeline")
            .field("lines", &state.ring.len())
            .field("capacity", &state.ring.capacity())
            .field("persisting", &state.persist_tx.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

/// The single live consumer of newly written lines.
#[derive(Debug)]
pub struct LogSubscriber {
    rx: mpsc::Receiver<String>,
}

impl LogSubscriber {
    /// Next line, or `None` once the pipeline is closed and drained.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Next line if one is queued.
    pub fn try_recv(&mut self) -> Option<String> {
        match self.rx.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}
