//! The engine's run loop and per-fire job execution.
//!
//! While the engine is running, the loop task is the only writer of the
//! entry list. Everything else reaches it through [`EngineCommand`]s.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::types::{EngineCommand, EngineError, Entry, EntrySnapshot, JobFn};
use crate::coordination::{DistributedLock, LockKey};
use crate::events::{Event, EventBus};

/// Collaborators shared by every fired job.
#[derive(Clone)]
pub(crate) struct FireContext {
    pub(crate) lock: Option<Arc<dyn DistributedLock>>,
    pub(crate) events: Option<Arc<EventBus>>,
    /// Minimum time after the trigger instant before a lock key is released.
    pub(crate) lock_hold: Duration,
}

impl FireContext {
    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event).await;
        }
    }
}

pub(crate) struct Runner {
    pub(crate) entries: Vec<Entry>,
    pub(crate) commands: mpsc::Receiver<EngineCommand>,
    pub(crate) context: FireContext,
    pub(crate) idle_wait: Duration,
}

impl Runner {
    /// Run until stopped; returns the entries so a restart keeps them.
    pub(crate) async fn run(mut self) -> Vec<Entry> {
        let now = Utc::now();
        for entry in &mut self.entries {
            entry.next = entry.schedule.next_after(now);
        }

        loop {
            sort_by_next(&mut self.entries);

            let wait = match self.entries.first().and_then(|e| e.next) {
                Some(next) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => self.idle_wait,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.fire_due(Utc::now());
                }
                command = self.commands.recv() => {
                    match command {
                        Some(EngineCommand::Add { entry, response }) => {
                            let _ = response.send(self.insert(entry));
                        }
                        Some(EngineCommand::Remove { name, response }) => {
                            let _ = response.send(self.remove(&name));
                        }
                        Some(EngineCommand::Snapshot { response }) => {
                            let _ = response.send(self.snapshot());
                        }
                        Some(EngineCommand::Stop { response }) => {
                            let _ = response.send(());
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        tracing::debug!(entries = self.entries.len(), "cron run loop stopped");
        self.entries
    }

    /// Fire every entry whose activation is at or before `now`, in order.
    fn fire_due(&mut self, now: DateTime<Utc>) {
        for entry in self.entries.iter_mut() {
            let trigger_at = match entry.next {
                Some(next) if next <= now => next,
                _ => break,
            };

            tokio::spawn(run_with_recovery(
                Arc::clone(&entry.job),
                entry.name.clone(),
                trigger_at,
                self.context.clone(),
            ));

            entry.prev = Some(trigger_at);
            entry.next = entry.schedule.next_after(now);
        }
    }

    fn insert(&mut self, mut entry: Entry) -> Result<(), EngineError> {
        if self.entries.iter().any(|e| e.name == entry.name) {
            return Err(EngineError::DuplicateName(entry.name));
        }
        entry.next = entry.schedule.next_after(Utc::now());
        self.entries.push(entry);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), EngineError> {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        if self.entries.len() == before {
            return Err(EngineError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries.iter().map(Entry::snapshot).collect()
    }
}

/// Ascending by next activation; entries that never fire go last.
pub(crate) fn sort_by_next(entries: &mut [Entry]) {
    entries.sort_by(|a, b| match (a.next, b.next) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Execute one fire of `job`.
///
/// With a lock configured, the job only runs on the replica that creates
/// the `name/trigger_at` key. A panicking job is logged and contained.
pub(crate) async fn run_with_recovery(
    job: JobFn,
    name: String,
    trigger_at: DateTime<Utc>,
    context: FireContext,
) {
    context.emit(Event::entry_fired(&name, trigger_at)).await;

    let key = LockKey::new(&name, trigger_at);
    if let Some(lock) = &context.lock {
        match lock.try_acquire(&key).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(entry = %name, key = %key, "lock held by another replica, skip");
                context.emit(Event::lock_contended(&name, trigger_at)).await;
                return;
            }
            Err(e) => {
                tracing::warn!(entry = %name, key = %key, error = %e, "failed to acquire execution lock, skip");
                context
                    .emit(Event::lock_failed(&name, trigger_at, e.to_string()))
                    .await;
                return;
            }
        }
    }

    if let Err(e) = tokio::spawn(job(trigger_at)).await {
        if e.is_panic() {
            let message = panic_message(e.into_panic());
            tracing::error!(entry = %name, trigger_at = %trigger_at, panic = %message, "cron job panicked");
            context
                .emit(Event::job_panicked(&name, trigger_at, message))
                .await;
        } else {
            tracing::warn!(entry = %name, trigger_at = %trigger_at, "cron job cancelled");
        }
    }

    if let Some(lock) = &context.lock {
        let hold_until = trigger_at
            + chrono::Duration::from_std(context.lock_hold).unwrap_or_else(|_| chrono::Duration::zero());
        if let Ok(remaining) = (hold_until - Utc::now()).to_std() {
            tokio::time::sleep(remaining).await;
        }
        if let Err(e) = lock.release(&key).await {
            tracing::debug!(entry = %name, key = %key, error = %e, "failed to release execution lock");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::Schedule;
    use crate::engine::types::job_fn;
    use chrono::TimeZone;

    fn entry(name: &str, next: Option<DateTime<Utc>>) -> Entry {
        let mut e = Entry::new(
            name.to_string(),
            Schedule::new("* * * * *").unwrap(),
            job_fn(|_| async {}),
        );
        e.next = next;
        e
    }

    #[test]
    fn test_sort_puts_never_firing_last() {
        let t = |s| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, s).unwrap();
        let mut entries = vec![
            entry("never", None),
            entry("late", Some(t(30))),
            entry("early", Some(t(10))),
        ];
        sort_by_next(&mut entries);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["early", "late", "never"]);
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "non-string panic payload");
    }
}
