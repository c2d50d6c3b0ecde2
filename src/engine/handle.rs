//! The public engine handle.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::runner::{FireContext, Runner};
use super::types::{EngineCommand, EngineError, Entry, EntrySnapshot, JobFn, job_fn};
use crate::coordination::DistributedLock;
use crate::core::schedule::Schedule;
use crate::events::EventBus;

/// Buffer size for the command channel between the handle and the run loop.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// How long the run loop sleeps when nothing is scheduled.
const DEFAULT_IDLE_WAIT: Duration = Duration::from_secs(24 * 3600);

/// Default minimum lock hold after a trigger instant.
pub const DEFAULT_LOCK_HOLD: Duration = Duration::from_secs(10);

enum EngineState {
    Stopped(Vec<Entry>),
    Running {
        commands: mpsc::Sender<EngineCommand>,
        task: JoinHandle<Vec<Entry>>,
    },
    /// Transient while the run loop is being joined.
    Stopping,
}

struct EngineInner {
    state: Mutex<EngineState>,
    context: FireContext,
    idle_wait: Duration,
}

/// In-memory cron engine.
///
/// Holds named entries, each a schedule plus a job. Once started, a single
/// run-loop task sleeps until the earliest activation and spawns each due
/// job on its own task. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct CronEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`CronEngine`].
#[derive(Default)]
pub struct CronEngineBuilder {
    lock: Option<Arc<dyn DistributedLock>>,
    events: Option<Arc<EventBus>>,
    lock_hold: Option<Duration>,
    idle_wait: Option<Duration>,
}

impl CronEngineBuilder {
    /// Guard every fire with a distributed lock.
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Report lifecycle events to `events`.
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Keep lock keys at least this long after their trigger instant.
    pub fn lock_hold(mut self, hold: Duration) -> Self {
        self.lock_hold = Some(hold);
        self
    }

    /// Sleep length of an empty run loop.
    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = Some(wait);
        self
    }

    pub fn build(self) -> CronEngine {
        CronEngine {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::Stopped(Vec::new())),
                context: FireContext {
                    lock: self.lock,
                    events: self.events,
                    lock_hold: self.lock_hold.unwrap_or(DEFAULT_LOCK_HOLD),
                },
                idle_wait: self.idle_wait.unwrap_or(DEFAULT_IDLE_WAIT),
            }),
        }
    }
}

impl CronEngine {
    /// An engine without distributed locking.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> CronEngineBuilder {
        CronEngineBuilder::default()
    }

    /// Schedule `job` under `name`.
    pub async fn add_func<F, Fut>(
        &self,
        name: impl Into<String>,
        expr: &str,
        job: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_job(name, expr, job_fn(job)).await
    }

    /// Schedule an already-wrapped job.
    pub async fn add_job(
        &self,
        name: impl Into<String>,
        expr: &str,
        job: JobFn,
    ) -> Result<(), EngineError> {
        let schedule = Schedule::new(expr)?;
        let entry = Entry::new(name.into(), schedule, job);
        self.insert(entry).await
    }

    /// Schedule `job` to run once; the entry removes itself after the job
    /// completes.
    pub async fn add_once_func<F, Fut>(
        &self,
        name: impl Into<String>,
        expr: &str,
        job: F,
    ) -> Result<(), EngineError>
    where
        F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let entry_name = name.clone();
        let job = Arc::new(job);

        self.add_func(name, expr, move |trigger_at| {
            let job = Arc::clone(&job);
            let engine = engine.clone();
            let entry_name = entry_name.clone();
            async move {
                job(trigger_at).await;
                let Some(inner) = engine.upgrade() else {
                    return;
                };
                match (CronEngine { inner }).remove(&entry_name).await {
                    Ok(()) | Err(EngineError::NotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!(entry = %entry_name, error = %e, "failed to remove one-shot entry");
                    }
                }
            }
        })
        .await
    }

    async fn insert(&self, entry: Entry) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        match &mut *state {
            EngineState::Stopped(entries) => {
                if entries.iter().any(|e| e.name == entry.name) {
                    return Err(EngineError::DuplicateName(entry.name));
                }
                entries.push(entry);
                Ok(())
            }
            EngineState::Running { commands, .. } => {
                send_result_command(commands, |response| EngineCommand::Add { entry, response }, "add")
                    .await
            }
            EngineState::Stopping => Err(EngineError::ChannelError("engine is stopping".into())),
        }
    }

    /// Remove the entry named `name`.
    pub async fn remove(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        match &mut *state {
            EngineState::Stopped(entries) => {
                let before = entries.len();
                entries.retain(|e| e.name != name);
                if entries.len() == before {
                    return Err(EngineError::NotFound(name.to_string()));
                }
                Ok(())
            }
            EngineState::Running { commands, .. } => {
                let name = name.to_string();
                send_result_command(
                    commands,
                    |response| EngineCommand::Remove { name, response },
                    "remove",
                )
                .await
            }
            EngineState::Stopping => Err(EngineError::ChannelError("engine is stopping".into())),
        }
    }

    /// Snapshot of every entry.
    pub async fn entries(&self) -> Result<Vec<EntrySnapshot>, EngineError> {
        let state = self.inner.state.lock().await;
        match &*state {
            EngineState::Stopped(entries) => Ok(entries.iter().map(Entry::snapshot).collect()),
            EngineState::Running { commands, .. } => {
                let (response, rx) = oneshot::channel();
                commands
                    .send(EngineCommand::Snapshot { response })
                    .await
                    .map_err(|_| EngineError::ChannelError("failed to send snapshot command".into()))?;
                rx.await.map_err(|_| {
                    EngineError::ChannelError("failed to receive snapshot response".into())
                })
            }
            EngineState::Stopping => Err(EngineError::ChannelError("engine is stopping".into())),
        }
    }

    /// Whether the run loop is active.
    pub async fn is_running(&self) -> bool {
        matches!(*self.inner.state.lock().await, EngineState::Running { .. })
    }

    /// Start the run loop. No-op if already running.
    pub async fn start(&self) {
        let mut state = self.inner.state.lock().await;
        let entries = match std::mem::replace(&mut *state, EngineState::Stopping) {
            EngineState::Stopped(entries) => entries,
            running => {
                *state = running;
                return;
            }
        };

        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let runner = Runner {
            entries,
            commands: receiver,
            context: self.inner.context.clone(),
            idle_wait: self.inner.idle_wait,
        };
        let task = tokio::spawn(runner.run());
        *state = EngineState::Running { commands, task };
        tracing::debug!("cron engine started");
    }

    /// Stop the run loop. Jobs already running are not interrupted.
    /// No-op if not running.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        let (commands, task) = match std::mem::replace(&mut *state, EngineState::Stopping) {
            EngineState::Running { commands, task } => (commands, task),
            other => {
                *state = other;
                return;
            }
        };

        let (response, rx) = oneshot::channel();
        if commands.send(EngineCommand::Stop { response }).await.is_ok() {
            let _ = rx.await;
        }
        drop(commands);

        let entries = match task.await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "cron run loop terminated abnormally");
                Vec::new()
            }
        };
        *state = EngineState::Stopped(entries);
        tracing::debug!("cron engine stopped");
    }

    /// Stop the engine and release the distributed-lock backend.
    pub async fn close(&self) {
        self.stop().await;
        if let Some(lock) = &self.inner.context.lock {
            if let Err(e) = lock.close().await {
                tracing::warn!(error = %e, "failed to close distributed lock");
            }
        }
    }
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Send a command carrying a result responder and wait for the answer.
async fn send_result_command<T>(
    commands: &mpsc::Sender<EngineCommand>,
    build_command: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineCommand,
    operation: &str,
) -> Result<T, EngineError>
where
    T: Send + 'static,
{
    let (response_tx, response_rx) = oneshot::channel();
    commands
        .send(build_command(response_tx))
        .await
        .map_err(|_| EngineError::ChannelError(format!("failed to send {} command", operation)))?;

    response_rx.await.map_err(|_| {
        EngineError::ChannelError(format!("failed to receive {} response", operation))
    })?
}
