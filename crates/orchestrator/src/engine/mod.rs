//! Activity scheduling engine.
//!
//! The engine keeps one task per live activity. A dispatcher loop pops ready
//! tasks and spawns each run; a run waits on its upstream dependency, takes a
//! token from its class limiter, opens a fresh event stream at the task's
//! tail and invokes the activity. The returned [`ActivityResult`] decides
//! what happens next:
//!
//! | Result | Task |
//! |---|---|
//! | `Ok(())` | removed, completion fires |
//! | `EndOfStream` | sleeps until signalled (always-open: runs again) |
//! | `Cancelled` | removed |
//! | `SilentRetry` / `SilentRetryAfter` | retried by the sweep, not logged |
//! | `Failed` | retried after backoff, logged |
//!
//! A run that panics loses its activity: the task is abandoned and its
//! completion is dropped, which releases downstream waiters.
//!
//! How sleeping tasks are woken depends on the [`Discipline`]: broadcast
//! signals, a periodic poll, or not at all because the stream stays open.

mod dependency;
mod limiter;
mod signals;
pub mod task;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use fso_core::{Clock, Config, Discipline, EngineSettings};
use fso_events::{EntityId, SignalSource};
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use dependency::{Completion, CompletionSender, completion};
pub use limiter::{Limiter, Limiters};
pub use task::{Backoff, Disposition, TaskState, calculate_backoff};

use crate::activity::{ActivityClass, ActivityContext, Runnable};
use crate::error::{ActivityError, ActivityResult, EngineError};
use task::{Job, Tasks};

type BoxedRunnable = Box<dyn Runnable>;

pub(crate) struct Shared {
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    limiters: Limiters,
    tasks: Mutex<Tasks<BoxedRunnable>>,
    ready: Notify,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, Tasks<BoxedRunnable>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_dispatcher(&self, queued: bool) {
        if queued {
            self.ready.notify_one();
        }
    }

    fn signal(&self, entity: EntityId) -> bool {
        let queued = self.tasks().signal(entity);
        self.wake_dispatcher(queued);
        queued
    }

    fn signal_all(&self) -> usize {
        let queued = self.tasks().signal_all();
        self.wake_dispatcher(queued > 0);
        queued
    }

    fn sweep(&self) -> usize {
        let wall = self.clock.now();
        let released = self.tasks().sweep(Instant::now(), wall);
        self.wake_dispatcher(released > 0);
        released
    }

    fn pop_ready(&self) -> Option<Job<BoxedRunnable>> {
        self.tasks().pop_ready()
    }

    fn disposition(&self, result: &ActivityResult) -> Disposition {
        match result {
            Ok(()) => Disposition::Complete,
            Err(ActivityError::EndOfStream) => match self.settings.discipline {
                Discipline::AlwaysOpen => Disposition::Requeue,
                Discipline::Signal | Discipline::Polling => Disposition::Sleep,
            },
            Err(ActivityError::Cancelled) => Disposition::Drop,
            Err(ActivityError::SilentRetry) => Disposition::SilentRetry,
            Err(ActivityError::SilentRetryAfter(at)) => Disposition::SilentRetryAfter(*at),
            Err(ActivityError::Failed(_)) => Disposition::Failed,
        }
    }
}

/// Scheduling engine handle. Clones share the same task table.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
    signal_source: Option<Arc<dyn SignalSource>>,
}

impl Engine {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let settings = config.engine.clone();
        let backoff = Backoff::new(settings.retry_interval(), settings.max_backoff());
        Self {
            shared: Arc::new(Shared {
                limiters: Limiters::from_settings(&config.limits),
                tasks: Mutex::new(Tasks::new(backoff)),
                ready: Notify::new(),
                settings,
                clock,
            }),
            signal_source: None,
        }
    }

    /// Use `source` for the signal discipline.
    pub fn with_signal_source(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.signal_source = Some(source);
        self
    }

    pub fn discipline(&self) -> Discipline {
        self.shared.settings.discipline
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    /// A handle that does not keep the task table alive.
    ///
    /// Activities that start other activities hold this one; the task table
    /// owns them, so a strong handle would never be freed.
    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            shared: Arc::downgrade(&self.shared),
            signal_source: self.signal_source.clone(),
        }
    }

    /// Register an activity for `entity` in the ready state.
    ///
    /// Fails if an activity is already registered for the entity. The
    /// returned [`Completion`] resolves once the activity finishes.
    pub fn start_activity(
        &self,
        entity: EntityId,
        class: ActivityClass,
        runnable: BoxedRunnable,
    ) -> Result<Completion, EngineError> {
        self.register(entity, class, runnable, None)
    }

    /// Like [`Engine::start_activity`], but the first run waits for
    /// `upstream` before it takes a limiter token.
    pub fn start_activity_after(
        &self,
        entity: EntityId,
        class: ActivityClass,
        runnable: BoxedRunnable,
        upstream: Completion,
    ) -> Result<Completion, EngineError> {
        self.register(entity, class, runnable, Some(upstream))
    }

    fn register(
        &self,
        entity: EntityId,
        class: ActivityClass,
        runnable: BoxedRunnable,
        upstream: Option<Completion>,
    ) -> Result<Completion, EngineError> {
        let (sender, done) = completion();
        self.shared
            .tasks()
            .insert(entity, class, runnable, upstream, sender)?;
        debug!(entity = %entity, class = %class, "Activity started");
        self.shared.wake_dispatcher(true);
        Ok(done)
    }

    /// New events exist for `entity`.
    pub fn signal(&self, entity: EntityId) -> bool {
        self.shared.signal(entity)
    }

    /// New events may exist for every entity.
    pub fn signal_all(&self) -> usize {
        self.shared.signal_all()
    }

    pub fn task_state(&self, entity: EntityId) -> Option<TaskState> {
        self.shared.tasks().state(entity)
    }

    pub fn task_count(&self) -> usize {
        self.shared.tasks().len()
    }

    pub fn limiter(&self, class: ActivityClass) -> &Limiter {
        self.shared.limiters.get(class)
    }

    /// Run until `cancel` fires, then wait for every in-flight run.
    ///
    /// Always returns [`EngineError::Cancelled`] once drained.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        let discipline = self.discipline();
        info!(discipline = %discipline, "Engine starting");

        let mut background: JoinSet<()> = JoinSet::new();
        background.spawn(signals::sweep_retries(
            Arc::clone(&self.shared),
            cancel.clone(),
        ));
        match discipline {
            Discipline::Signal => {
                background.spawn(signals::watch_signals(
                    Arc::clone(&self.shared),
                    self.signal_source.clone(),
                    cancel.clone(),
                ));
            }
            Discipline::Polling => {
                background.spawn(signals::poll(Arc::clone(&self.shared), cancel.clone()));
            }
            Discipline::AlwaysOpen => {}
        }

        let watch = discipline == Discipline::AlwaysOpen;
        let mut runs: JoinSet<()> = JoinSet::new();
        loop {
            while let Some(job) = self.shared.pop_ready() {
                runs.spawn(run_job(
                    Arc::clone(&self.shared),
                    job,
                    watch,
                    cancel.clone(),
                ));
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Activity run aborted");
                    }
                }
                () = self.shared.ready.notified() => {}
            }
        }

        info!(in_flight = runs.len(), "Engine draining");
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Activity run aborted");
            }
        }
        while background.join_next().await.is_some() {}
        info!("Engine stopped");
        Err(EngineError::Cancelled)
    }
}

/// Non-owning [`Engine`] handle.
#[derive(Clone)]
pub struct WeakEngine {
    shared: Weak<Shared>,
    signal_source: Option<Arc<dyn SignalSource>>,
}

impl WeakEngine {
    /// The engine, unless every strong handle is gone.
    pub fn upgrade(&self) -> Option<Engine> {
        self.shared.upgrade().map(|shared| Engine {
            shared,
            signal_source: self.signal_source.clone(),
        })
    }
}

/// One run of one task: dependency, limiter, activity, reschedule.
async fn run_job(
    shared: Arc<Shared>,
    job: Job<BoxedRunnable>,
    watch: bool,
    cancel: CancellationToken,
) {
    let Job {
        entity,
        class,
        tail,
        mut runnable,
        upstream,
    } = job;

    let (new_tail, result) = 'run: {
        if let Some(upstream) = upstream {
            trace!(entity = %entity, "Waiting for upstream activity");
            tokio::select! {
                biased;
                () = cancel.cancelled() => break 'run (tail, Err(ActivityError::Cancelled)),
                () = upstream.wait() => {}
            }
        }

        let permit = match shared.limiters.get(class).acquire(&cancel).await {
            Ok(permit) => permit,
            Err(e) => break 'run (tail, Err(e)),
        };

        let ctx = ActivityContext::new(entity, cancel.clone(), Arc::clone(&shared.clock));
        let outcome = AssertUnwindSafe(runnable.run(&ctx, tail, watch))
            .catch_unwind()
            .await;
        drop(permit);
        match outcome {
            Ok(outcome) => outcome,
            Err(payload) => {
                error!(
                    entity = %entity,
                    class = %class,
                    panic = panic_message(payload.as_ref()),
                    "Activity panicked; abandoning task"
                );
                shared.tasks().abandon(entity);
                return;
            }
        }
    };

    let disposition = shared.disposition(&result);
    let finished = shared
        .tasks()
        .finish(entity, runnable, new_tail, disposition, Instant::now());

    match &result {
        Ok(()) => info!(entity = %entity, tail = %new_tail, "Activity completed"),
        Err(ActivityError::EndOfStream) => {
            trace!(entity = %entity, tail = %new_tail, requeued = finished.requeued, "Activity drained its stream");
        }
        Err(ActivityError::Cancelled) => {
            trace!(entity = %entity, "Activity cancelled");
        }
        Err(ActivityError::SilentRetry | ActivityError::SilentRetryAfter(_)) => {}
        Err(ActivityError::Failed(reason)) => {
            let backoff_ms = finished.backoff.map_or(0, task::millis);
            warn!(
                entity = %entity,
                class = %class,
                tail = %new_tail,
                attempt = finished.attempt,
                backoff_ms,
                error = %reason,
                "Activity failed; will retry"
            );
        }
    }
    shared.wake_dispatcher(finished.requeued);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
