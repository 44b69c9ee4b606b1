//! Task bookkeeping of the scheduling engine.
//!
//! [`Tasks`] is a plain state machine over the engine's live activities: it
//! never awaits and never spawns, so the engine can keep it behind one mutex
//! held for O(1) operations.
//!
//! ```text
//!            start                    run finished
//!   ──────────────► Ready ──► Running ─────────────┬──► removed (complete, cancelled)
//!                     ▲                            ├──► Sleeping ──signal──► Ready
//!                     │                            └──► Retrying ──sweep───► Ready
//!                     └── pending signal, always-open end of stream
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fso_events::{EntityId, EventId, advance};
use rand::Rng;
use tokio::time::Instant;

use crate::activity::ActivityClass;
use crate::engine::dependency::{Completion, CompletionSender};
use crate::error::EngineError;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Sleeping,
    Retrying,
}

/// When a retrying task may run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    NextSweep,
    At(Instant),
    After(DateTime<Utc>),
}

/// How a finished run is rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The activity is done; remove the task.
    Complete,
    /// Stream drained; sleep until signalled.
    Sleep,
    /// Stream ended while it should stay open; run again now.
    Requeue,
    /// Shutdown; remove the task without retry.
    Drop,
    /// Retry on the next sweep.
    SilentRetry,
    /// Retry on the first sweep after the given time.
    SilentRetryAfter(DateTime<Utc>),
    /// Retry after backoff.
    Failed,
}

/// What [`Tasks::finish`] did, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Finished {
    /// Backoff applied to a failed run.
    pub backoff: Option<Duration>,
    /// Consecutive failures so far.
    pub attempt: u32,
    /// Whether the task went straight back to ready.
    pub requeued: bool,
}

/// A ready task handed to the dispatcher.
pub struct Job<R> {
    pub entity: EntityId,
    pub class: ActivityClass,
    pub tail: EventId,
    pub runnable: R,
    pub upstream: Option<Completion>,
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Calculate exponential backoff for a retry attempt.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff.min(max_ms))
}

/// Backoff policy for failed runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    /// Disable random jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based), up to 10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = millis(self.base);
        let max_ms = millis(self.max);
        let delay = calculate_backoff(attempt, base_ms, max_ms);
        if !self.jitter {
            return delay;
        }
        let spread = u64::try_from(delay.as_millis() / 10).unwrap_or(0);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        delay.saturating_add(jitter).min(self.max)
    }
}

struct Task<R> {
    class: ActivityClass,
    tail: EventId,
    state: TaskState,
    pending_signal: bool,
    wake: Option<Wake>,
    attempt: u32,
    runnable: Option<R>,
    upstream: Option<Completion>,
    completion: Option<CompletionSender>,
}

/// The engine's live tasks and ready queue.
pub struct Tasks<R> {
    tasks: HashMap<EntityId, Task<R>>,
    ready: VecDeque<EntityId>,
    backoff: Backoff,
}

impl<R> Tasks<R> {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            backoff,
        }
    }

    /// Register a task in `Ready`.
    pub fn insert(
        &mut self,
        entity: EntityId,
        class: ActivityClass,
        runnable: R,
        upstream: Option<Completion>,
        completion: CompletionSender,
    ) -> Result<(), EngineError> {
        if self.tasks.contains_key(&entity) {
            return Err(EngineError::duplicate_task(entity));
        }
        self.tasks.insert(
            entity,
            Task {
                class,
                tail: EventId::NIL,
                state: TaskState::Ready,
                pending_signal: false,
                wake: None,
                attempt: 0,
                runnable: Some(runnable),
                upstream,
                completion: Some(completion),
            },
        );
        self.ready.push_back(entity);
        Ok(())
    }

    /// New events exist for `entity`. Returns whether it was queued.
    ///
    /// Running tasks remember the signal; any number of signals during one
    /// run cause a single re-queue.
    pub fn signal(&mut self, entity: EntityId) -> bool {
        let Some(task) = self.tasks.get_mut(&entity) else {
            return false;
        };
        match task.state {
            TaskState::Sleeping => {
                task.state = TaskState::Ready;
                self.ready.push_back(entity);
                true
            }
            TaskState::Running => {
                task.pending_signal = true;
                false
            }
            TaskState::Ready | TaskState::Retrying => false,
        }
    }

    /// Signal every task. Returns how many were queued.
    pub fn signal_all(&mut self) -> usize {
        let entities: Vec<EntityId> = self.tasks.keys().copied().collect();
        entities
            .into_iter()
            .filter(|entity| self.signal(*entity))
            .count()
    }

    /// Take the next ready task and mark it running.
    pub fn pop_ready(&mut self) -> Option<Job<R>> {
        while let Some(entity) = self.ready.pop_front() {
            let Some(task) = self.tasks.get_mut(&entity) else {
                continue;
            };
            if task.state != TaskState::Ready {
                continue;
            }
            let Some(runnable) = task.runnable.take() else {
                continue;
            };
            task.state = TaskState::Running;
            return Some(Job {
                entity,
                class: task.class,
                tail: task.tail,
                runnable,
                upstream: task.upstream.take(),
            });
        }
        None
    }

    /// Return a run's activity and reschedule it.
    pub fn finish(
        &mut self,
        entity: EntityId,
        runnable: R,
        tail: EventId,
        disposition: Disposition,
        now: Instant,
    ) -> Finished {
        match disposition {
            Disposition::Complete => {
                if let Some(completion) = self.tasks.remove(&entity).and_then(|t| t.completion) {
                    completion.complete();
                }
                return Finished::default();
            }
            Disposition::Drop => {
                self.tasks.remove(&entity);
                return Finished::default();
            }
            _ => {}
        }

        let Some(task) = self.tasks.get_mut(&entity) else {
            return Finished::default();
        };
        advance(&mut task.tail, tail);
        task.runnable = Some(runnable);
        let pending = std::mem::take(&mut task.pending_signal);
        let mut finished = Finished::default();

        match disposition {
            Disposition::Sleep if !pending => {
                task.attempt = 0;
                task.state = TaskState::Sleeping;
            }
            Disposition::Sleep | Disposition::Requeue => {
                task.attempt = 0;
                task.state = TaskState::Ready;
                self.ready.push_back(entity);
                finished.requeued = true;
            }
            Disposition::SilentRetry => {
                task.state = TaskState::Retrying;
                task.wake = Some(Wake::NextSweep);
            }
            Disposition::SilentRetryAfter(at) => {
                task.state = TaskState::Retrying;
                task.wake = Some(Wake::After(at));
            }
            Disposition::Failed => {
                let backoff = self.backoff.delay(task.attempt);
                task.attempt = task.attempt.saturating_add(1);
                task.state = TaskState::Retrying;
                task.wake = Some(Wake::At(now + backoff));
                finished.backoff = Some(backoff);
            }
            Disposition::Complete | Disposition::Drop => {}
        }
        finished.attempt = task.attempt;
        finished
    }

    /// Remove a task whose run was lost. Dropping its completion sender
    /// releases anything waiting on it.
    pub fn abandon(&mut self, entity: EntityId) {
        self.tasks.remove(&entity);
    }

    /// Release retrying tasks that are due. Returns how many were queued.
    pub fn sweep(&mut self, now: Instant, wall: DateTime<Utc>) -> usize {
        let mut released = 0;
        for (entity, task) in &mut self.tasks {
            if task.state != TaskState::Retrying {
                continue;
            }
            let due = match task.wake {
                None | Some(Wake::NextSweep) => true,
                Some(Wake::At(at)) => at <= now,
                Some(Wake::After(at)) => at <= wall,
            };
            if due {
                task.state = TaskState::Ready;
                task.wake = None;
                self.ready.push_back(*entity);
                released += 1;
            }
        }
        released
    }

    pub fn state(&self, entity: EntityId) -> Option<TaskState> {
        self.tasks.get(&entity).map(|t| t.state)
    }

    pub fn tail(&self, entity: EntityId) -> Option<EventId> {
        self.tasks.get(&entity).map(|t| t.tail)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether any task is queued to run.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::dependency::completion;
    use ulid::Ulid;

    fn tasks() -> Tasks<&'static str> {
        Tasks::new(Backoff::new(Duration::from_secs(20), Duration::from_secs(300)).without_jitter())
    }

    fn start(tasks: &mut Tasks<&'static str>) -> (EntityId, Completion) {
        let entity = EntityId::new();
        let (sender, done) = completion();
        tasks
            .insert(entity, ActivityClass::Workflow, "activity", None, sender)
            .unwrap();
        (entity, done)
    }

    fn cursor(ms: u64) -> EventId {
        EventId::from_ulid(Ulid::from_parts(ms, 0))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(calculate_backoff(0, 20_000, 300_000), Duration::from_secs(20));
        assert_eq!(calculate_backoff(1, 20_000, 300_000), Duration::from_secs(40));
        assert_eq!(calculate_backoff(3, 20_000, 300_000), Duration::from_secs(160));
        assert_eq!(calculate_backoff(4, 20_000, 300_000), Duration::from_secs(300));
        assert_eq!(calculate_backoff(60, 20_000, 300_000), Duration::from_secs(300));
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(20)), 20_000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_secs(20), Duration::from_secs(300));
        for _ in 0..50 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_secs(20));
            assert!(delay <= Duration::from_secs(22));
        }
        assert!(backoff.delay(10) <= Duration::from_secs(300));
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let mut tasks = tasks();
        let (entity, _) = start(&mut tasks);
        let (sender, _) = completion();
        let err = tasks
            .insert(entity, ActivityClass::Workflow, "again", None, sender)
            .unwrap_err();
        assert_eq!(err, EngineError::duplicate_task(entity));
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_signals_while_running_coalesce_into_one_requeue() {
        let mut tasks = tasks();
        let (entity, _) = start(&mut tasks);
        let job = tasks.pop_ready().unwrap();

        assert!(!tasks.signal(entity));
        assert!(!tasks.signal(entity));
        assert!(!tasks.signal(entity));

        let finished = tasks.finish(entity, job.runnable, cursor(1), Disposition::Sleep, Instant::now());
        assert!(finished.requeued);
        assert_eq!(tasks.state(entity), Some(TaskState::Ready));

        assert!(tasks.pop_ready().is_some());
        assert!(tasks.pop_ready().is_none());
    }

    #[test]
    fn test_end_of_stream_without_signal_sleeps_until_signalled() {
        let mut tasks = tasks();
        let (entity, _) = start(&mut tasks);
        let job = tasks.pop_ready().unwrap();
        tasks.finish(entity, job.runnable, cursor(5), Disposition::Sleep, Instant::now());

        assert_eq!(tasks.state(entity), Some(TaskState::Sleeping));
        assert!(tasks.pop_ready().is_none());

        assert!(tasks.signal(entity));
        assert!(!tasks.signal(entity));
        let job = tasks.pop_ready().unwrap();
        assert_eq!(job.tail, cursor(5));
        assert!(tasks.pop_ready().is_none());
    }

    #[test]
    fn test_tail_never_moves_backwards() {
        let mut tasks = tasks();
        let (entity, _) = start(&mut tasks);
        let job = tasks.pop_ready().unwrap();
        tasks.finish(entity, job.runnable, cursor(9), Disposition::Requeue, Instant::now());
        let job = tasks.pop_ready().unwrap();
        tasks.finish(entity, job.runnable, cursor(3), Disposition::Sleep, Instant::now());
        assert_eq!(tasks.tail(entity), Some(cursor(9)));
    }

    #[test]
    fn test_complete_removes_task_and_fires_completion() {
        let mut tasks = tasks();
        let (entity, done) = start(&mut tasks);
        let job = tasks.pop_ready().unwrap();
        tasks.finish(entity, job.runnable, cursor(1), Disposition::Complete, Instant::now());

        assert!(tasks.is_empty());
        assert!(done.is_done());
        assert!(!tasks.signal(entity));
    }

    #[test]
    fn test_failed_run_waits_for_backoff() {
        let mut tasks = tasks();
        let (entity, _) = start(&mut tasks);
        let now = Instant::now();
        let wall = Utc::now();

        let job = tasks.pop_ready().unwrap();
        let finished = tasks.finish(entity, job.runnable, EventId::NIL, Disposition::Failed, now);
        assert_eq!(finished.backoff, Some(Duration::from_secs(20)));
        assert_eq!(finished.attempt, 1);
        assert_eq!(tasks.state(entity), Some(TaskState::Retrying));

        assert_eq!(tasks.sweep(now + Duration::from_secs(19), wall), 0);
        assert!(!tasks.signal(entity));
        assert_eq!(tasks.sweep(now + Duration::from_secs(20), wall), 1);

        let job = tasks.pop_ready().unwrap();
        let finished = tasks.finish(entity, job.runnable, EventId::NIL, Disposition::Failed, now);
        assert_eq!(finished.backoff, Some(Duration::from_secs(40)));
        assert_eq!(finished.attempt, 2);
    }

    #[test]
    fn test_silent_retry_released_on_next_sweep() {
        let mut tasks = tasks();
        let (entity, _) = start(&mut tasks);
        let job = tasks.pop_ready().unwrap();
        let finished =
            tasks.finish(entity, job.runnable, EventId::NIL, Disposition::SilentRetry, Instant::now());
        assert_eq!(finished.backoff, None);
        assert_eq!(tasks.state(entity), Some(TaskState::Retrying));

        assert_eq!(tasks.sweep(Instant::now(), Utc::now()), 1);
        assert_eq!(tasks.state(entity), Some(TaskState::Ready));
    }

    #[test]
    fn test_silent_retry_after_waits_for_wall_clock() {
        let mut tasks = tasks();
        let (entity, _) = start(&mut tasks);
        let wall = Utc::now();
        let at = wall + chrono::Duration::days(7);

        let job = tasks.pop_ready().unwrap();
        tasks.finish(
            entity,
            job.runnable,
            EventId::NIL,
            Disposition::SilentRetryAfter(at),
            Instant::now(),
        );

        assert_eq!(tasks.sweep(Instant::now(), wall + chrono::Duration::days(6)), 0);
        assert_eq!(tasks.sweep(Instant::now(), at), 1);
    }

    #[test]
    fn test_drop_removes_without_completing() {
        let mut tasks = tasks();
        let (entity, done) = start(&mut tasks);
        let job = tasks.pop_ready().unwrap();
        tasks.finish(entity, job.runnable, EventId::NIL, Disposition::Drop, Instant::now());

        assert!(tasks.is_empty());
        // The sender is gone, which releases dependants as well.
        assert!(done.is_done());
    }

    #[test]
    fn test_abandoned_running_task_frees_entity_and_releases_waiters() {
        let mut tasks = tasks();
        let (entity, done) = start(&mut tasks);
        let _job = tasks.pop_ready().unwrap();
        tasks.abandon(entity);

        assert!(tasks.is_empty());
        assert!(done.is_done());
        let (sender, _) = completion();
        assert!(tasks.insert(entity, ActivityClass::Workflow, "again", None, sender).is_ok());
    }

    #[test]
    fn test_upstream_is_handed_out_once() {
        let mut tasks = tasks();
        let entity = EntityId::new();
        let (sender, _) = completion();
        tasks
            .insert(entity, ActivityClass::Repo, "activity", Some(Completion::done()), sender)
            .unwrap();

        let job = tasks.pop_ready().unwrap();
        assert!(job.upstream.is_some());
        tasks.finish(entity, job.runnable, EventId::NIL, Disposition::Requeue, Instant::now());
        let job = tasks.pop_ready().unwrap();
        assert!(job.upstream.is_none());
        assert_eq!(job.class, ActivityClass::Repo);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn backoff_is_monotonic_and_capped(
                attempt in 0u32..64,
                base_ms in 1u64..60_000,
                extra_ms in 0u64..600_000,
            ) {
                let max_ms = base_ms + extra_ms;
                let delay = calculate_backoff(attempt, base_ms, max_ms);
                let next = calculate_backoff(attempt + 1, base_ms, max_ms);
                prop_assert!(delay >= Duration::from_millis(base_ms));
                prop_assert!(delay <= Duration::from_millis(max_ms));
                prop_assert!(next >= delay);
            }

            #[test]
            fn jittered_delay_never_exceeds_max(attempt in 0u32..64, base_ms in 1u64..60_000) {
                let max = Duration::from_millis(base_ms * 16);
                let backoff = Backoff::new(Duration::from_millis(base_ms), max);
                let delay = backoff.delay(attempt);
                prop_assert!(delay <= max);
                prop_assert!(delay >= backoff.without_jitter().delay(attempt));
            }
        }
    }
}
