//! Workflow index driving the factory on a running engine.
//!
//! Tests verify that:
//! - Outstanding workflows in a snapshot are started once
//! - Workflows on the same repository run one after the other

#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, unwrap_result, until_event};
use fso_core::Discipline;
use fso_events::{EntityId, EventSource, InMemoryEventStore};
use fso_orchestrator::workflows::common::RepoTarget;
use fso_orchestrator::workflows::freeze_repo::FreezeEvent;
use fso_orchestrator::workflows::ping_registry::PingEvent;
use fso_orchestrator::{IndexEntry, IndexEvent, WorkflowKind, WorkflowStarter, start_index};

async fn seed_freeze(h: &Harness, target: RepoTarget) -> EntityId {
    let workflow = EntityId::new();
    unwrap_result(
        h.freeze
            .store
            .append(
                workflow,
                None,
                FreezeEvent::Started {
                    target,
                    repo_path: PathBuf::from("/data/repos/epsilon"),
                },
            )
            .await,
        "append Started",
    );
    workflow
}

fn start(
    h: &Harness,
    registry: EntityId,
    index: &InMemoryEventStore<IndexEvent>,
) {
    unwrap_result(
        start_index(
            &h.engine,
            registry,
            Arc::new(index.clone()) as Arc<dyn EventSource<IndexEvent>>,
            Arc::clone(&h.factory) as Arc<dyn WorkflowStarter>,
        ),
        "start index",
    );
}

#[tokio::test(start_paused = true)]
async fn given_snapshot_when_indexed_then_outstanding_workflows_run_once() {
    // GIVEN: A registry index listing a freeze-repo and a ping-registry workflow
    let mut h = Harness::new(Discipline::Signal);
    let registry = EntityId::new();
    let target = RepoTarget {
        registry,
        repo: EntityId::new(),
    };
    let freeze = seed_freeze(&h, target).await;
    let ping = EntityId::new();
    unwrap_result(
        h.ping
            .store
            .append(
                ping,
                None,
                PingEvent::Started {
                    registry,
                    hosts: vec!["store-1".to_string()],
                },
            )
            .await,
        "append ping Started",
    );

    let index = InMemoryEventStore::with_signal_hub(h.hub.clone());
    unwrap_result(
        index
            .append(
                registry,
                None,
                IndexEvent::Snapshot {
                    entries: vec![
                        IndexEntry {
                            kind: WorkflowKind::FreezeRepo,
                            workflow_id: freeze,
                            repo_id: Some(target.repo),
                        },
                        IndexEntry {
                            kind: WorkflowKind::PingRegistry,
                            workflow_id: ping,
                            repo_id: None,
                        },
                    ],
                },
            )
            .await,
        "append Snapshot",
    );

    // WHEN: The index runs
    start(&h, registry, &index);
    h.run();
    until_event(&h.freeze, freeze, "freeze Completed", |e| *e == FreezeEvent::Completed).await;
    until_event(&h.ping, ping, "ping Completed", |e| *e == PingEvent::Completed).await;

    // AND: The index hears about the completions
    for workflow_id in [freeze, ping] {
        unwrap_result(
            index
                .append(registry, None, IndexEvent::Completed { workflow_id })
                .await,
            "append Completed",
        );
    }
    tokio::time::sleep(Duration::from_secs(60)).await;

    // THEN: Each workflow ran exactly once and the index keeps running
    assert_eq!(h.log.count("tool.freeze"), 1);
    assert_eq!(h.log.count("tool.ping(store-1)"), 1);
    assert_eq!(h.freeze.last_event(freeze).await, Some(FreezeEvent::Completed));
    assert_eq!(h.ping.last_event(ping).await, Some(PingEvent::Completed));
    assert!(h.engine.task_state(registry).is_some());

    let _ = h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn given_two_workflows_on_one_repo_when_indexed_then_they_do_not_overlap() {
    // GIVEN: Two freeze-repo workflows on the same repository
    let mut h = Harness::new(Discipline::Signal);
    let registry = EntityId::new();
    let target = RepoTarget {
        registry,
        repo: EntityId::new(),
    };
    let first = seed_freeze(&h, target).await;
    let second = seed_freeze(&h, target).await;

    let index = InMemoryEventStore::with_signal_hub(h.hub.clone());
    for workflow_id in [first, second] {
        unwrap_result(
            index
                .append(
                    registry,
                    None,
                    IndexEvent::Started(IndexEntry {
                        kind: WorkflowKind::FreezeRepo,
                        workflow_id,
                        repo_id: Some(target.repo),
                    }),
                )
                .await,
            "append Started",
        );
    }

    // WHEN: The index starts both
    start(&h, registry, &index);
    h.run();
    for workflow in [first, second] {
        until_event(&h.freeze, workflow, "freeze Completed", |e| {
            matches!(e, FreezeEvent::Completed | FreezeEvent::Failed { .. })
        })
        .await;
    }

    // THEN: Neither was refused by the other's pending op
    assert_eq!(h.freeze.last_event(first).await, Some(FreezeEvent::Completed));
    assert_eq!(h.freeze.last_event(second).await, Some(FreezeEvent::Completed));
    assert!(!h.log.contains("registry.abort(freeze)"));

    // AND: The second began only after the first committed
    let calls = h.log.calls();
    let first_commit = calls
        .iter()
        .position(|c| c == "registry.commit(freeze)")
        .unwrap();
    let second_begin = calls
        .iter()
        .rposition(|c| c == "registry.begin(freeze)")
        .unwrap();
    assert!(first_commit < second_begin, "overlapping calls: {calls:?}");

    let _ = h.shutdown().await;
}
