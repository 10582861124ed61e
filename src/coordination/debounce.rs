use crate::error::PipelineError;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

#[async_trait]
pub trait FlushHandler: Send + Sync {
    async fn on_flush(&self, keys: BTreeSet<String>);
}

enum Command {
    Signal(String),
    FlushNow(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

enum Wake {
    Command(Option<Command>),
    Quiet,
}

/// Coalesces bursts of invalidation signals into one flush.
///
/// A single actor task owns the pending key set and the deadline. Every
/// signal resets the deadline to `now + window`; once the window passes with
/// no new signal the handler runs once with the union of pending keys.
pub struct NotificationDebouncer {
    commands: mpsc::UnboundedSender<Command>,
    flushes: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDebouncer {
    pub fn spawn(window: Duration, handler: Arc<dyn FlushHandler>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let flushes = Arc::new(AtomicU64::new(0));
        let actor = DebounceActor {
            window,
            handler,
            pending: BTreeSet::new(),
            flushes: Arc::clone(&flushes),
        };
        let task = tokio::spawn(actor.run(rx));
        Self {
            commands,
            flushes,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn signal(&self, key: impl Into<String>) -> Result<(), PipelineError> {
        self.commands
            .send(Command::Signal(key.into()))
            .map_err(|_| stopped())
    }

    /// Flushes whatever is pending without waiting for the quiet window.
    pub async fn flush_now(&self) -> Result<(), PipelineError> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::FlushNow(ack))
            .map_err(|_| stopped())?;
        done.await.map_err(|_| stopped())
    }

    /// Flushes pending keys and stops the actor.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            warn!(error = %err, "debounce actor ended abnormally");
        }
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

fn stopped() -> PipelineError {
    PipelineError::unavailable("debouncer is shut down")
}

struct DebounceActor {
    window: Duration,
    handler: Arc<dyn FlushHandler>,
    pending: BTreeSet<String>,
    flushes: Arc<AtomicU64>,
}

impl DebounceActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut deadline: Option<Instant> = None;
        loop {
            let wake = match deadline {
                Some(at) => tokio::select! {
                    biased;
                    command = rx.recv() => Wake::Command(command),
                    () = sleep_until(at) => Wake::Quiet,
                },
                None => Wake::Command(rx.recv().await),
            };
            match wake {
                Wake::Quiet => {
                    deadline = None;
                    self.flush().await;
                }
                Wake::Command(Some(Command::Signal(key))) => {
                    self.pending.insert(key);
                    deadline = Some(Instant::now() + self.window);
                }
                Wake::Command(Some(Command::FlushNow(ack))) => {
                    deadline = None;
                    self.flush().await;
                    let _ = ack.send(());
                }
                Wake::Command(Some(Command::Shutdown(ack))) => {
                    self.flush().await;
                    let _ = ack.send(());
                    break;
                }
                Wake::Command(None) => {
                    self.flush().await;
                    break;
                }
            }
        }
        debug!("debounce actor stopped");
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.pending);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(keys = keys.len(), "flushing invalidations");
        if AssertUnwindSafe(self.handler.on_flush(keys))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!("flush handler panicked");
        }
    }
}
