//! Reconciliation of the engine against the definition store.
//!
//! Two paths keep a replica's engine current:
//! - full reload: rebuild the engine from every enabled definition;
//! - incremental: a watch on the signal prefix rebuilds or drops the entry
//!   of one definition per signal.
//!
//! Both run under one mutex so they never interleave.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

use super::CrondError;
use super::compensate::{COMPENSATOR_ENTRY_NAME, DEFAULT_MAX_INSTANTS, InterruptCompensator};
use super::gc::{BuildCacheGc, DryRunCleaner, GC_ENTRY_NAME, ImageCleaner};
use super::trigger::{PipelineTrigger, TriggerRequest};
use crate::coordination::{
    DEFAULT_SIGNAL_PREFIX, DistributedLock, Signal, SignalKeys, SignalKind, SignalStore,
    SignalStream,
};
use crate::core::definition::{CronDefinition, labels};
use crate::core::types::CronId;
use crate::engine::{CronEngine, DEFAULT_LOCK_HOLD, EngineError, EntrySnapshot, JobFn, job_fn};
use crate::events::{Event, EventBus};
use crate::storage::{CronExtraPatch, Storage, StorageError};

/// Interrupt-compensation settings.
#[derive(Debug, Clone)]
pub struct CompensatorOptions {
    /// Schedule of compensation rounds.
    pub cron: String,
    /// Instants younger than this are left to the regular fire.
    pub grace: Duration,
    pub max_instants: usize,
}

impl Default for CompensatorOptions {
    fn default() -> Self {
        Self {
            cron: "0 */10 * * * *".to_string(),
            grace: Duration::from_secs(300),
            max_instants: DEFAULT_MAX_INSTANTS,
        }
    }
}

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct CrondOptions {
    pub signal_prefix: String,
    /// Actor recorded on definitions that name none.
    pub system_user_id: String,
    pub gc_cron: String,
    pub gc_expire_in: Duration,
    /// `None` disables interrupt compensation.
    pub compensator: Option<CompensatorOptions>,
    /// Pause before resubscribing after the watch stream ends.
    pub watch_retry: Duration,
    /// Periodic full reload; `None` disables it.
    pub reload_interval: Option<Duration>,
    pub lock_hold: Duration,
}

impl Default for CrondOptions {
    fn default() -> Self {
        Self {
            signal_prefix: DEFAULT_SIGNAL_PREFIX.to_string(),
            system_user_id: "1000".to_string(),
            gc_cron: "0 0 0 * * *".to_string(),
            gc_expire_in: Duration::from_secs(168 * 3600),
            compensator: Some(CompensatorOptions::default()),
            watch_retry: Duration::from_secs(5),
            reload_interval: None,
            lock_hold: DEFAULT_LOCK_HOLD,
        }
    }
}

/// What a definition's entry does when it fires.
struct CronFire<S: Storage> {
    storage: Arc<S>,
    trigger: Arc<dyn PipelineTrigger>,
    events: Arc<EventBus>,
    system_user_id: String,
}

impl<S: Storage> CronFire<S> {
    async fn fire(&self, id: CronId, trigger_at: DateTime<Utc>) {
        let mut def = match self.storage.get_cron(id).await {
            Ok(def) => def,
            Err(StorageError::NotFound(_)) => {
                tracing::warn!(cron_id = %id, "cron definition no longer exists, skip trigger");
                return;
            }
            Err(e) => {
                tracing::error!(cron_id = %id, error = %e, "[alert] failed to load cron definition, skip trigger");
                self.events
                    .emit(Event::cron_trigger_failed(id, trigger_at, e.to_string()))
                    .await;
                return;
            }
        };

        if !def.is_schedulable() {
            tracing::info!(cron_id = %id, "cron disabled since scheduled, skip trigger");
            return;
        }

        if let Some(start_from) = def.extra.cron_start_from {
            if trigger_at < start_from {
                tracing::info!(
                    cron_id = %id,
                    trigger_at = %trigger_at,
                    start_from = %start_from,
                    "trigger precedes cron start time, skip"
                );
                self.events
                    .emit(Event::cron_suppressed(id, trigger_at, start_from))
                    .await;
                return;
            }
        }

        self.default_actor(&mut def).await;

        match self
            .trigger
            .create_pipeline(TriggerRequest::for_cron(&def, trigger_at))
            .await
        {
            Ok(pipeline) => {
                tracing::info!(cron_id = %id, trigger_at = %trigger_at, pipeline_id = pipeline.id, "cron triggered pipeline");
                self.events
                    .emit(Event::cron_triggered(id, trigger_at, false))
                    .await;
            }
            Err(e) => {
                tracing::error!(cron_id = %id, trigger_at = %trigger_at, error = %e, "failed to create pipeline for cron");
                self.events
                    .emit(Event::cron_trigger_failed(id, trigger_at, e.to_string()))
                    .await;
            }
        }
    }

    async fn default_actor(&self, def: &mut CronDefinition) {
        if def.extra.normal_labels.contains_key(labels::USER_ID) {
            return;
        }
        def.extra
            .normal_labels
            .insert(labels::USER_ID.to_string(), self.system_user_id.clone());
        let patch = CronExtraPatch::default_label(labels::USER_ID, self.system_user_id.clone());
        if let Err(e) = self.storage.patch_cron_extra(def.id, &patch).await {
            tracing::warn!(cron_id = %def.id, error = %e, "failed to persist default cron actor");
        }
    }
}

struct CrondInner<S: Storage> {
    storage: Arc<S>,
    signals: Arc<dyn SignalStore>,
    lock: Option<Arc<dyn DistributedLock>>,
    events: Arc<EventBus>,
    keys: SignalKeys,
    options: CrondOptions,
    fire: Arc<CronFire<S>>,
    gc: BuildCacheGc<S>,
    compensator: Option<InterruptCompensator<S>>,
    engine: RwLock<CronEngine>,
    reconcile: Mutex<()>,
}

/// The reconciliation daemon of one replica.
pub struct Crond<S: Storage> {
    inner: Arc<CrondInner<S>>,
}

impl<S: Storage> Clone for Crond<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`Crond`].
pub struct CrondBuilder<S: Storage> {
    storage: Arc<S>,
    signals: Arc<dyn SignalStore>,
    trigger: Arc<dyn PipelineTrigger>,
    cleaner: Arc<dyn ImageCleaner>,
    lock: Option<Arc<dyn DistributedLock>>,
    events: Option<Arc<EventBus>>,
    options: CrondOptions,
}

impl<S: Storage + 'static> CrondBuilder<S> {
    /// Guard every fire with `lock`.
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Image cleaner used by the build-cache GC.
    pub fn cleaner(mut self, cleaner: Arc<dyn ImageCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn options(mut self, options: CrondOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Crond<S> {
        let events = self.events.unwrap_or_default();
        let fire = Arc::new(CronFire {
            storage: Arc::clone(&self.storage),
            trigger: Arc::clone(&self.trigger),
            events: Arc::clone(&events),
            system_user_id: self.options.system_user_id.clone(),
        });
        let gc = BuildCacheGc::new(
            Arc::clone(&self.storage),
            self.cleaner,
            self.options.gc_expire_in,
        )
        .with_events(Arc::clone(&events));
        let compensator = self.options.compensator.as_ref().map(|opts| {
            InterruptCompensator::new(Arc::clone(&self.storage), self.trigger, opts.grace)
                .with_max_instants(opts.max_instants)
                .with_events(Arc::clone(&events))
        });

        Crond {
            inner: Arc::new(CrondInner {
                engine: RwLock::new(CronEngine::new()),
                keys: SignalKeys::new(self.options.signal_prefix.clone()),
                storage: self.storage,
                signals: self.signals,
                lock: self.lock,
                events,
                options: self.options,
                fire,
                gc,
                compensator,
                reconcile: Mutex::new(()),
            }),
        }
    }
}

impl<S: Storage + 'static> Crond<S> {
    pub fn builder(
        storage: Arc<S>,
        signals: Arc<dyn SignalStore>,
        trigger: Arc<dyn PipelineTrigger>,
    ) -> CrondBuilder<S> {
        CrondBuilder {
            storage,
            signals,
            trigger,
            cleaner: Arc::new(DryRunCleaner),
            lock: None,
            events: None,
            options: CrondOptions::default(),
        }
    }

    /// The signal keys this daemon publishes and watches.
    pub fn signal_keys(&self) -> &SignalKeys {
        &self.inner.keys
    }

    /// Subscribe to signals, reload the engine, then consume signals until
    /// `cancel` fires.
    ///
    /// Subscribing first means a signal published during the reload is
    /// still delivered afterwards.
    pub async fn run(&self, cancel: CancellationToken) -> Result<JoinHandle<()>, CrondError> {
        let prefix = self.inner.keys.watch_prefix();
        let stream = match self.inner.signals.watch_prefix(&prefix).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::error!(prefix = %prefix, error = %e, "[alert] failed to watch crond signals");
                None
            }
        };
        for line in self.reload_crond().await? {
            tracing::info!("{}", line);
        }
        let crond = self.clone();
        Ok(tokio::spawn(async move { crond.watch_from(stream, cancel).await }))
    }

    fn new_engine(&self) -> CronEngine {
        let mut builder = CronEngine::builder()
            .events(Arc::clone(&self.inner.events))
            .lock_hold(self.inner.options.lock_hold);
        if let Some(lock) = &self.inner.lock {
            builder = builder.lock(Arc::clone(lock));
        }
        builder.build()
    }

    fn cron_job(&self, id: CronId) -> JobFn {
        let fire = Arc::clone(&self.inner.fire);
        job_fn(move |trigger_at| {
            let fire = Arc::clone(&fire);
            async move { fire.fire(id, trigger_at).await }
        })
    }

    fn gc_job(&self) -> JobFn {
        let gc = self.inner.gc.clone();
        job_fn(move |_| {
            let gc = gc.clone();
            async move {
                if let Err(e) = gc.run_once().await {
                    tracing::error!(error = %e, "[alert] build-cache gc failed to list expired records");
                }
            }
        })
    }

    fn compensator_job(&self, compensator: &InterruptCompensator<S>) -> JobFn {
        let compensator = compensator.clone();
        job_fn(move |_| {
            let compensator = compensator.clone();
            async move {
                match compensator.run_at(Utc::now()).await {
                    Ok(report) => tracing::info!(
                        definitions = report.definitions,
                        triggered = report.triggered,
                        failed = report.failed,
                        "interrupt compensation round finished"
                    ),
                    Err(e) => tracing::error!(error = %e, "[alert] interrupt compensation round failed"),
                }
            }
        })
    }

    /// Rebuild the engine from every enabled definition.
    ///
    /// If the store cannot be listed the current engine keeps running and
    /// the error is returned. Definitions that fail to schedule are logged
    /// and skipped. Returns one log line per action.
    pub async fn reload_crond(&self) -> Result<Vec<String>, CrondError> {
        let _guard = self.inner.reconcile.lock().await;

        let definitions = self.inner.storage.list_enabled_crons().await?;
        let engine = self.new_engine();
        let mut logs = Vec::with_capacity(definitions.len() + 2);

        for def in &definitions {
            let name = def.id.entry_name();
            match engine.add_job(&name, &def.cron_expr, self.cron_job(def.id)).await {
                Ok(()) => logs.push(format!(
                    "crond: added {} (source: {}, yml: {}, expr: {})",
                    name, def.pipeline_source, def.pipeline_yml_name, def.cron_expr
                )),
                Err(e) => {
                    tracing::error!(cron_id = %def.id, expr = %def.cron_expr, error = %e, "[alert] failed to add cron to crond");
                    logs.push(format!("crond: failed to add {}: {}", name, e));
                }
            }
        }

        match engine
            .add_job(GC_ENTRY_NAME, &self.inner.options.gc_cron, self.gc_job())
            .await
        {
            Ok(()) => logs.push(format!(
                "crond: added {} (expr: {})",
                GC_ENTRY_NAME, self.inner.options.gc_cron
            )),
            Err(e) => {
                tracing::error!(error = %e, "[alert] failed to add build-cache gc to crond");
                logs.push(format!("crond: failed to add {}: {}", GC_ENTRY_NAME, e));
            }
        }

        if let (Some(compensator), Some(opts)) =
            (&self.inner.compensator, &self.inner.options.compensator)
        {
            match engine
                .add_job(COMPENSATOR_ENTRY_NAME, &opts.cron, self.compensator_job(compensator))
                .await
            {
                Ok(()) => logs.push(format!(
                    "crond: added {} (expr: {})",
                    COMPENSATOR_ENTRY_NAME, opts.cron
                )),
                Err(e) => {
                    tracing::error!(error = %e, "[alert] failed to add compensator to crond");
                    logs.push(format!("crond: failed to add {}: {}", COMPENSATOR_ENTRY_NAME, e));
                }
            }
        }

        // Stop, not close: the lock handle is shared with the new engine and
        // closing it would drop keys still held for recent instants.
        let mut current = self.inner.engine.write().await;
        current.stop().await;
        engine.start().await;
        *current = engine;
        drop(current);

        self.inner
            .events
            .emit(Event::reloaded(definitions.len()))
            .await;
        tracing::info!(definitions = definitions.len(), "crond reloaded");
        Ok(logs)
    }

    /// Publish an add signal for `def`.
    pub async fn add_into_crond(&self, def: &CronDefinition) -> Result<(), CrondError> {
        self.inner
            .signals
            .put_signal(&self.inner.keys.add_key(def.id), "")
            .await?;
        Ok(())
    }

    /// Publish a delete signal for `def`.
    pub async fn delete_from_crond(&self, def: &CronDefinition) -> Result<(), CrondError> {
        self.inner
            .signals
            .put_signal(&self.inner.keys.delete_key(def.id), "")
            .await?;
        Ok(())
    }

    /// Ask every replica for a full reload.
    pub async fn request_reload(&self) -> Result<(), CrondError> {
        self.inner
            .signals
            .put_signal(&self.inner.keys.reload_key(), "")
            .await?;
        Ok(())
    }

    /// Rebuild the entry of `id` from the store.
    ///
    /// A stale entry is removed first; the definition is re-added only if
    /// it still exists, is enabled and has an expression.
    pub async fn reconcile_add(&self, id: CronId) -> Result<(), CrondError> {
        let _guard = self.inner.reconcile.lock().await;
        let engine = self.inner.engine.read().await.clone();

        let def = match self.inner.storage.get_cron(id).await {
            Ok(def) => Some(def),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let name = id.entry_name();
        match engine.remove(&name).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match def {
            Some(def) if def.is_schedulable() => {
                engine.add_job(&name, &def.cron_expr, self.cron_job(id)).await?;
                tracing::info!(cron_id = %id, expr = %def.cron_expr, "cron added into crond");
            }
            _ => tracing::info!(cron_id = %id, "cron not schedulable, entry dropped"),
        }
        Ok(())
    }

    /// Drop the entry of `id`. A missing entry is not an error.
    pub async fn reconcile_delete(&self, id: CronId) -> Result<(), CrondError> {
        let _guard = self.inner.reconcile.lock().await;
        let engine = self.inner.engine.read().await.clone();
        match engine.remove(&id.entry_name()).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {
                tracing::info!(cron_id = %id, "cron deleted from crond");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_signal(&self, key: &str) {
        let Some(signal) = self.inner.keys.parse(key) else {
            tracing::debug!(key = %key, "ignoring unknown crond signal");
            return;
        };

        if let Err(e) = self.inner.signals.delete_signal(key).await {
            tracing::warn!(key = %key, error = %e, "failed to delete crond signal key");
        }

        let result = match signal {
            Signal::Add(raw) => match raw.parse::<CronId>() {
                Ok(id) => self.reconcile_add(id).await,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "invalid cron id in signal key");
                    return;
                }
            },
            Signal::Delete(raw) => match raw.parse::<CronId>() {
                Ok(id) => self.reconcile_delete(id).await,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "invalid cron id in signal key");
                    return;
                }
            },
            Signal::Reload => self.reload_crond().await.map(|_| ()),
        };

        if let Err(e) = result {
            tracing::error!(key = %key, error = %e, "[alert] failed to reconcile crond signal");
        }
    }

    /// Consume signals until `cancel` fires, resubscribing when the stream
    /// ends. Every subscription made here is followed by a full reload, as
    /// signals may have been missed before it.
    pub async fn watch(&self, cancel: CancellationToken) {
        self.watch_from(None, cancel).await
    }

    async fn watch_from(&self, mut initial: Option<SignalStream>, cancel: CancellationToken) {
        let prefix = self.inner.keys.watch_prefix();
        let mut reload_tick = self
            .inner
            .options
            .reload_interval
            .map(|every| tokio::time::interval_at(Instant::now() + every, every));
        let mut resubscribed = initial.is_none();

        loop {
            let subscription = match initial.take() {
                Some(stream) => Ok(stream),
                None => tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = self.inner.signals.watch_prefix(&prefix) => result,
                },
            };

            match subscription {
                Ok(mut stream) => {
                    tracing::info!(prefix = %prefix, "crond watching for signals");
                    if resubscribed {
                        if let Err(e) = self.reload_crond().await {
                            tracing::error!(error = %e, "[alert] failed to reload crond after resubscribe");
                        }
                    }

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = next_tick(&mut reload_tick) => {
                                if let Err(e) = self.reload_crond().await {
                                    tracing::error!(error = %e, "[alert] periodic crond reload failed");
                                }
                            }
                            event = stream.recv() => match event {
                                Some(event) if event.kind == SignalKind::Put => {
                                    self.handle_signal(&event.key).await;
                                }
                                Some(_) => {}
                                None => {
                                    tracing::warn!(prefix = %prefix, "crond watch stream closed");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(prefix = %prefix, error = %e, "[alert] failed to watch crond signals");
                }
            }

            resubscribed = true;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.inner.options.watch_retry) => {}
            }
        }
    }

    /// Entries of the current engine.
    pub async fn crond_snapshot(&self) -> Result<Vec<EntrySnapshot>, CrondError> {
        let engine = self.inner.engine.read().await.clone();
        Ok(engine.entries().await?)
    }

    /// Close the current engine.
    pub async fn shutdown(&self) {
        let engine = self.inner.engine.read().await.clone();
        engine.close().await;
        tracing::info!("crond stopped");
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
