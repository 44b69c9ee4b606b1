//! Shared fixtures: fake aggregates, fake tools, and an engine harness.
//!
//! Every fake records its calls in one [`CallLog`] so tests can assert the
//! exact order of side effects across aggregates and tools.

#![allow(dead_code, clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fso_core::{Config, Discipline, ManualClock, WorkflowSettings};
use fso_events::{EntityId, InMemoryEventStore, SignalHub, Vid};
use fso_orchestrator::clients::{
    AclPolicy, ArchiveTool, DuEntry, DuTool, FreezeTool, HostPinger, RegistryClient, RepoOp,
    ReposClient, Status, ToolError, WorkflowClient, WorkflowCommand,
};
use fso_orchestrator::workflows::archive_repo::{ArchiveCommand, ArchiveEvent};
use fso_orchestrator::workflows::common::Aggregates;
use fso_orchestrator::workflows::du_root::{DuCommand, DuEvent};
use fso_orchestrator::workflows::freeze_repo::{FreezeCommand, FreezeEvent};
use fso_orchestrator::workflows::ping_registry::{PingCommand, PingEvent};
use fso_orchestrator::workflows::split_root::{SplitCommand, SplitEvent};
use fso_orchestrator::workflows::unarchive_repo::{UnarchiveCommand, UnarchiveEvent};
use fso_orchestrator::{
    Backends, ClientError, Engine, EngineError, WorkflowBackend, WorkflowFactory,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

pub fn unwrap_result<T, E: std::fmt::Debug>(result: Result<T, E>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{context}: {e:?}"),
    }
}

/// Poll `check` in virtual time until it holds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..2_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until the stream of `workflow` holds an event matching `matches`.
pub async fn until_event<E, C>(
    workflows: &FakeWorkflows<E, C>,
    workflow: EntityId,
    what: &str,
    matches: impl Fn(&E) -> bool,
) where
    E: Clone + Send + Sync + 'static,
{
    for _ in 0..2_000 {
        if workflows.events(workflow).await.iter().any(&matches) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("timed out waiting for {what}");
}

fn fresh_vid() -> Vid {
    Vid::from_ulid(Ulid::new())
}

// ==========================================================================
// CALL LOG
// ==========================================================================

#[derive(Debug, Default)]
pub struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.count(call) > 0
    }
}

/// Pops one injected failure, if any are left.
fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ==========================================================================
// AGGREGATES
// ==========================================================================

/// One pending operation per repository, owned by one workflow.
#[derive(Debug, Default)]
struct PendingOps(Mutex<HashMap<EntityId, (EntityId, RepoOp)>>);

impl PendingOps {
    fn begin(&self, repo: EntityId, workflow: EntityId, op: RepoOp) -> Result<Vid, ClientError> {
        let mut pending = self.0.lock().unwrap();
        match pending.get(&repo) {
            Some((owner, _)) if *owner != workflow => {
                Err(ClientError::failed_precondition("other workflow pending"))
            }
            _ => {
                pending.insert(repo, (workflow, op));
                Ok(fresh_vid())
            }
        }
    }

    fn end(&self, repo: EntityId, workflow: EntityId) -> Result<Vid, ClientError> {
        let mut pending = self.0.lock().unwrap();
        match pending.get(&repo) {
            Some((owner, _)) if *owner == workflow => {
                pending.remove(&repo);
                Ok(fresh_vid())
            }
            _ => Err(ClientError::failed_precondition("no pending op")),
        }
    }

    fn holds(&self, repo: EntityId) -> bool {
        self.0.lock().unwrap().contains_key(&repo)
    }
}

#[derive(Debug, Default)]
pub struct FakeRegistry {
    log: Arc<CallLog>,
    pending: PendingOps,
    pub refuse_begin: Mutex<Option<ClientError>>,
    pub unavailable: AtomicUsize,
    pub acl: AclPolicy,
}

impl FakeRegistry {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            acl: AclPolicy {
                entries: vec!["group:staff rwx".to_string()],
            },
            ..Self::default()
        }
    }

    pub fn holds(&self, repo: EntityId) -> bool {
        self.pending.holds(repo)
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn begin_repo_op(
        &self,
        _registry: EntityId,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
    ) -> Result<Vid, ClientError> {
        self.log.record(format!("registry.begin({op})"));
        if take(&self.unavailable) {
            return Err(ClientError::unavailable("registry restarting"));
        }
        if let Some(err) = self.refuse_begin.lock().unwrap().clone() {
            return Err(err);
        }
        self.pending.begin(repo, workflow, op)
    }

    async fn commit_repo_op(
        &self,
        _registry: EntityId,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
    ) -> Result<Vid, ClientError> {
        self.log.record(format!("registry.commit({op})"));
        self.pending.end(repo, workflow)
    }

    async fn abort_repo_op(
        &self,
        _registry: EntityId,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
        _status: &Status,
    ) -> Result<Vid, ClientError> {
        self.log.record(format!("registry.abort({op})"));
        self.pending.end(repo, workflow)
    }

    async fn repo_acl_policy(
        &self,
        _registry: EntityId,
        _repo: EntityId,
    ) -> Result<AclPolicy, ClientError> {
        self.log.record("registry.acl_policy");
        Ok(self.acl.clone())
    }
}

#[derive(Debug, Default)]
pub struct FakeRepos {
    log: Arc<CallLog>,
    pending: PendingOps,
    pub refuse_begin: Mutex<Option<ClientError>>,
}

impl FakeRepos {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn holds(&self, repo: EntityId) -> bool {
        self.pending.holds(repo)
    }
}

#[async_trait]
impl ReposClient for FakeRepos {
    async fn begin_op(
        &self,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
    ) -> Result<Vid, ClientError> {
        self.log.record(format!("repos.begin({op})"));
        if let Some(err) = self.refuse_begin.lock().unwrap().clone() {
            return Err(err);
        }
        self.pending.begin(repo, workflow, op)
    }

    async fn commit_op(
        &self,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
    ) -> Result<Vid, ClientError> {
        self.log.record(format!("repos.commit({op})"));
        self.pending.end(repo, workflow)
    }

    async fn abort_op(
        &self,
        repo: EntityId,
        workflow: EntityId,
        op: RepoOp,
        _status: &Status,
    ) -> Result<Vid, ClientError> {
        self.log.record(format!("repos.abort({op})"));
        self.pending.end(repo, workflow)
    }
}

/// Workflow aggregate backed by an in-memory event store.
///
/// Each accepted command appends the event it maps to, at the expected
/// version.
pub struct FakeWorkflows<E, C> {
    pub store: InMemoryEventStore<E>,
    log: Arc<CallLog>,
    to_event: fn(C) -> E,
    pub conflicts: AtomicUsize,
    /// The next command with this name fails once with `Unavailable`.
    pub unavailable_on: Mutex<Option<&'static str>>,
    _command: PhantomData<fn(C)>,
}

impl<E, C> FakeWorkflows<E, C>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(store: InMemoryEventStore<E>, log: Arc<CallLog>, to_event: fn(C) -> E) -> Self {
        Self {
            store,
            log,
            to_event,
            conflicts: AtomicUsize::new(0),
            unavailable_on: Mutex::new(None),
            _command: PhantomData,
        }
    }

    pub async fn events(&self, workflow: EntityId) -> Vec<E> {
        self.store
            .all(workflow)
            .await
            .into_iter()
            .map(|e| e.payload)
            .collect()
    }

    pub async fn last_event(&self, workflow: EntityId) -> Option<E> {
        self.events(workflow).await.pop()
    }
}

#[async_trait]
impl<E, C> WorkflowClient<C> for FakeWorkflows<E, C>
where
    E: Clone + Send + Sync + 'static,
    C: WorkflowCommand + 'static,
{
    async fn command(&self, workflow: EntityId, vid: Vid, command: C) -> Result<Vid, ClientError> {
        self.log.record(format!("workflow.{}", command.name()));
        if take(&self.conflicts) {
            return Err(ClientError::version_conflict("injected conflict"));
        }
        {
            let mut unavailable = self.unavailable_on.lock().unwrap();
            if *unavailable == Some(command.name()) {
                *unavailable = None;
                return Err(ClientError::unavailable("injected outage"));
            }
        }
        let event = (self.to_event)(command);
        self.store
            .append(workflow, Some(vid), event)
            .await
            .map_err(|e| {
                if e.is_version_conflict() {
                    ClientError::version_conflict(e.to_string())
                } else {
                    ClientError::unavailable(e.to_string())
                }
            })
    }
}

// ==========================================================================
// TOOLS
// ==========================================================================

#[derive(Debug, Default)]
pub struct FakeArchiveTool {
    log: Arc<CallLog>,
    pub tartt_failures: AtomicUsize,
    pub swap_failures: AtomicUsize,
}

impl FakeArchiveTool {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ArchiveTool for FakeArchiveTool {
    async fn archive_tartt(
        &self,
        _repo_path: &Path,
        working_dir: &Path,
        _acl: &AclPolicy,
    ) -> Result<PathBuf, ToolError> {
        self.log.record("tool.tartt");
        if take(&self.tartt_failures) {
            return Err(ToolError::new("tartt", "disk full"));
        }
        Ok(working_dir.join("repo.tar"))
    }

    async fn swap(&self, _repo_path: &Path, _working_dir: &Path) -> Result<(), ToolError> {
        self.log.record("tool.swap");
        if take(&self.swap_failures) {
            return Err(ToolError::new("swap", "placeholder busy"));
        }
        Ok(())
    }

    async fn restore(
        &self,
        _repo_path: &Path,
        _tar_path: &Path,
        _working_dir: &Path,
    ) -> Result<(), ToolError> {
        self.log.record("tool.restore");
        Ok(())
    }

    async fn remove_working_dir(&self, _working_dir: &Path) -> Result<(), ToolError> {
        self.log.record("tool.remove_working_dir");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeFreezeTool {
    log: Arc<CallLog>,
    pub broken: AtomicBool,
}

impl FakeFreezeTool {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    fn outcome(&self, tool: &'static str) -> Result<(), ToolError> {
        self.log.record(format!("tool.{tool}"));
        if self.broken.load(Ordering::SeqCst) {
            Err(ToolError::new(tool, "read-only filesystem"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FreezeTool for FakeFreezeTool {
    async fn freeze(&self, _repo_path: &Path) -> Result<(), ToolError> {
        self.outcome("freeze")
    }

    async fn unfreeze(&self, _repo_path: &Path) -> Result<(), ToolError> {
        self.outcome("unfreeze")
    }
}

#[derive(Debug, Default)]
pub struct FakeDuTool {
    log: Arc<CallLog>,
    pub entries: Mutex<Vec<DuEntry>>,
    pub broken: AtomicBool,
}

impl FakeDuTool {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn set_entries(&self, entries: &[(&str, u64)]) {
        *self.entries.lock().unwrap() = entries
            .iter()
            .map(|(path, usage)| DuEntry {
                path: PathBuf::from(path),
                usage: *usage,
            })
            .collect();
    }
}

#[async_trait]
impl DuTool for FakeDuTool {
    async fn du(&self, _root: &Path, _max_depth: usize) -> Result<Vec<DuEntry>, ToolError> {
        self.log.record("tool.du");
        if self.broken.load(Ordering::SeqCst) {
            return Err(ToolError::new("du", "permission denied"));
        }
        Ok(self.entries.lock().unwrap().clone())
    }
}

#[derive(Debug, Default)]
pub struct FakePinger {
    log: Arc<CallLog>,
    pub down: Mutex<HashSet<String>>,
}

impl FakePinger {
    pub fn new(log: Arc<CallLog>) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }
}

#[async_trait]
impl HostPinger for FakePinger {
    async fn ping(&self, host: &str) -> Result<Duration, ToolError> {
        self.log.record(format!("tool.ping({host})"));
        if self.down.lock().unwrap().contains(host) {
            Err(ToolError::new("ping", format!("{host} timed out")))
        } else {
            Ok(Duration::from_millis(4))
        }
    }
}

// ==========================================================================
// HARNESS
// ==========================================================================

/// Engine wired to fakes for every workflow kind.
pub struct Harness {
    pub log: Arc<CallLog>,
    pub hub: SignalHub,
    pub clock: Arc<ManualClock>,
    pub engine: Engine,
    pub cancel: CancellationToken,
    pub registry: Arc<FakeRegistry>,
    pub repos: Arc<FakeRepos>,
    pub archive_tool: Arc<FakeArchiveTool>,
    pub freeze_tool: Arc<FakeFreezeTool>,
    pub du_tool: Arc<FakeDuTool>,
    pub pinger: Arc<FakePinger>,
    pub archive: Arc<FakeWorkflows<ArchiveEvent, ArchiveCommand>>,
    pub unarchive: Arc<FakeWorkflows<UnarchiveEvent, UnarchiveCommand>>,
    pub freeze: Arc<FakeWorkflows<FreezeEvent, FreezeCommand>>,
    pub du: Arc<FakeWorkflows<DuEvent, DuCommand>>,
    pub split: Arc<FakeWorkflows<SplitEvent, SplitCommand>>,
    pub ping: Arc<FakeWorkflows<PingEvent, PingCommand>>,
    pub factory: Arc<WorkflowFactory>,
    running: Option<JoinHandle<Result<(), EngineError>>>,
}

fn backend<E, C>(
    workflows: &Arc<FakeWorkflows<E, C>>,
) -> WorkflowBackend<E, C>
where
    E: Clone + Send + Sync + 'static,
    C: WorkflowCommand + 'static,
{
    WorkflowBackend {
        events: Arc::new(workflows.store.clone()),
        commands: Arc::clone(workflows) as Arc<dyn WorkflowClient<C>>,
    }
}

impl Harness {
    pub fn new(discipline: Discipline) -> Self {
        Self::with_settings(discipline, WorkflowSettings {
            working_dir_root: PathBuf::from("/tmp/fso-test"),
            ..WorkflowSettings::default()
        })
    }

    pub fn with_settings(discipline: Discipline, settings: WorkflowSettings) -> Self {
        let log = Arc::new(CallLog::default());
        let hub = SignalHub::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let mut config = Config::default();
        config.engine.discipline = discipline;
        config.engine.retry_interval_secs = 1;
        config.engine.max_backoff_secs = 8;
        config.engine.poll_interval_secs = 2;
        config.workflows = settings.clone();

        let engine = Engine::new(&config, Arc::clone(&clock) as Arc<dyn fso_core::Clock>)
            .with_signal_source(Arc::new(hub.clone()));

        let registry = Arc::new(FakeRegistry::new(Arc::clone(&log)));
        let repos = Arc::new(FakeRepos::new(Arc::clone(&log)));
        let archive_tool = Arc::new(FakeArchiveTool::new(Arc::clone(&log)));
        let freeze_tool = Arc::new(FakeFreezeTool::new(Arc::clone(&log)));
        let du_tool = Arc::new(FakeDuTool::new(Arc::clone(&log)));
        let pinger = Arc::new(FakePinger::new(Arc::clone(&log)));

        let archive = Arc::new(FakeWorkflows::new(
            InMemoryEventStore::with_signal_hub(hub.clone()),
            Arc::clone(&log),
            ArchiveCommand::into_event,
        ));
        let unarchive = Arc::new(FakeWorkflows::new(
            InMemoryEventStore::with_signal_hub(hub.clone()),
            Arc::clone(&log),
            UnarchiveCommand::into_event,
        ));
        let freeze = Arc::new(FakeWorkflows::new(
            InMemoryEventStore::with_signal_hub(hub.clone()),
            Arc::clone(&log),
            FreezeCommand::into_event,
        ));
        let du = Arc::new(FakeWorkflows::new(
            InMemoryEventStore::with_signal_hub(hub.clone()),
            Arc::clone(&log),
            DuCommand::into_event,
        ));
        let split = Arc::new(FakeWorkflows::new(
            InMemoryEventStore::with_signal_hub(hub.clone()),
            Arc::clone(&log),
            SplitCommand::into_event,
        ));
        let ping = Arc::new(FakeWorkflows::new(
            InMemoryEventStore::with_signal_hub(hub.clone()),
            Arc::clone(&log),
            PingCommand::into_event,
        ));

        let backends = Backends {
            aggregates: Aggregates {
                registry: Arc::clone(&registry) as Arc<dyn RegistryClient>,
                repos: Arc::clone(&repos) as Arc<dyn ReposClient>,
            },
            archive_tool: Arc::clone(&archive_tool) as Arc<dyn ArchiveTool>,
            freeze_tool: Arc::clone(&freeze_tool) as Arc<dyn FreezeTool>,
            du_tool: Arc::clone(&du_tool) as Arc<dyn DuTool>,
            pinger: Arc::clone(&pinger) as Arc<dyn HostPinger>,
            archive: backend(&archive),
            unarchive: backend(&unarchive),
            freeze: backend(&freeze),
            du: backend(&du),
            split: backend(&split),
            ping: backend(&ping),
        };
        let factory = Arc::new(WorkflowFactory::new(&engine, backends, settings));

        Self {
            log,
            hub,
            clock,
            engine,
            cancel: CancellationToken::new(),
            registry,
            repos,
            archive_tool,
            freeze_tool,
            du_tool,
            pinger,
            archive,
            unarchive,
            freeze,
            du,
            split,
            ping,
            factory,
            running: None,
        }
    }

    /// Spawn the engine loop.
    pub fn run(&mut self) {
        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        self.running = Some(tokio::spawn(async move { engine.run(cancel).await }));
    }

    /// Cancel the engine and wait for it to drain.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.cancel.cancel();
        match self.running.take() {
            Some(handle) => unwrap_result(handle.await, "engine task"),
            None => Err(EngineError::Cancelled),
        }
    }

    /// Wait until the engine no longer tracks `workflow`.
    pub async fn until_finished(&self, workflow: EntityId) {
        let engine = self.engine.clone();
        eventually("workflow to finish", move || {
            let done = engine.task_state(workflow).is_none();
            async move { done }
        })
        .await;
    }
}
