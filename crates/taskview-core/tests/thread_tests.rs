use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use taskview_core::prelude::*;
use taskview_core::{BackendOp, ThreadBackend, ThreadError, ThreadState};
use taskview_entity::UserId;
use taskview_test_utils::{fields, Fixture};

const ADA: UserId = UserId(1);
const GRACE: UserId = UserId(2);
const LINUS: UserId = UserId(3);

fn session(fx: &Fixture, entity: Option<EntityId>) -> ThreadSession {
    let backend: Arc<dyn ThreadBackend> = fx.backend.clone();
    ThreadSession::new(fx.orchestrator.clone(), backend, ADA, entity, [GRACE, LINUS])
}

#[tokio::test]
async fn first_message_bootstraps_thread_with_watchers() {
    let fx = Fixture::new();
    let task = fx.seed(fields("needs discussion"));
    let session = session(&fx, Some(task));

    let message = session.send_message("hello").await.unwrap();

    let ThreadState::Real(thread) = session.state() else {
        panic!("thread not created");
    };
    let stored = fx.backend.thread(thread).unwrap();
    assert_eq!(stored.entity, task.real());
    assert_eq!(stored.watchers, BTreeSet::from([GRACE, LINUS]));
    assert_eq!(stored.messages.len(), 1);

    let view = session.view();
    assert_eq!(view.participants, BTreeSet::from([ADA, GRACE, LINUS]));
    assert!(view.pending_participants.is_empty());
    assert_eq!(view.messages, vec![message]);
    assert!(view.messages[0].confirmed);
    assert_eq!(
        fx.orchestrator.registry().thread_for(&task),
        Some(EntityId::Real(thread))
    );
}

#[tokio::test]
async fn second_message_reuses_thread() {
    let fx = Fixture::new();
    let session = session(&fx, None);

    session.send_message("one").await.unwrap();
    session.send_message("two").await.unwrap();

    assert_eq!(fx.backend.calls(BackendOp::CreateThread), 1);
    assert_eq!(fx.backend.calls(BackendOp::AddWatchers), 1);
    let bodies: Vec<_> = session.view().messages.into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["one", "two"]);
}

#[tokio::test]
async fn failed_bootstrap_can_be_retried() {
    let fx = Fixture::new();
    let task = fx.seed(fields("flaky"));
    let session = session(&fx, Some(task));
    let mut notices = fx.orchestrator.subscribe_notices();
    fx.backend.fail_next(BackendOp::CreateThread, 1);

    let err = session.send_message("first try").await.unwrap_err();

    assert!(matches!(err, ThreadError::CreateFailed(_)));
    assert_eq!(session.state(), ThreadState::NoThread);
    assert!(session.view().messages.is_empty());
    assert!(session.view().participants.is_empty());
    assert_eq!(session.view().pending_participants, BTreeSet::from([GRACE, LINUS]));
    assert_eq!(fx.orchestrator.registry().thread_for(&task), None);
    assert!(matches!(
        notices.try_recv().unwrap(),
        MutationNotice::Thread { thread: None, .. }
    ));

    session.send_message("second try").await.unwrap();
    assert!(matches!(session.state(), ThreadState::Real(_)));
    assert_eq!(session.view().messages.len(), 1);
}

#[tokio::test]
async fn watcher_failure_leaves_actor_only() {
    let fx = Fixture::new();
    let session = session(&fx, None);
    fx.backend.fail_next(BackendOp::AddWatchers, 1);

    session.send_message("hi").await.unwrap();

    let ThreadState::Real(thread) = session.state() else {
        panic!("thread should survive a watcher failure");
    };
    assert!(fx.backend.thread(thread).unwrap().watchers.is_empty());
    assert_eq!(session.view().participants, BTreeSet::from([ADA]));
}

#[tokio::test]
async fn participant_changes_on_live_thread() {
    let fx = Fixture::new();
    let backend: Arc<dyn ThreadBackend> = fx.backend.clone();
    let thread = backend.create_thread(None).await.unwrap();
    let session = ThreadSession::existing(
        fx.orchestrator.clone(),
        backend,
        ADA,
        None,
        thread,
        [ADA],
    );

    session.add_participant(GRACE).await.unwrap();
    assert!(fx.backend.thread(thread).unwrap().watchers.contains(&GRACE));

    fx.backend.fail_next(BackendOp::RemoveWatcher, 1);
    let err = session.remove_participant(GRACE).await.unwrap_err();
    assert!(matches!(err, ThreadError::ParticipantFailed { user, .. } if user == GRACE));
    assert!(session.view().participants.contains(&GRACE));

    session.remove_participant(GRACE).await.unwrap();
    assert_eq!(session.view().participants, BTreeSet::from([ADA]));
    assert!(fx.backend.thread(thread).unwrap().watchers.is_empty());
}

#[tokio::test]
async fn thread_links_to_committed_task() {
    let fx = Fixture::new();
    let outcome = fx
        .orchestrator
        .mutate(MutationIntent::create(fields("new task")))
        .await
        .unwrap();
    let task = outcome.entity().unwrap().id;
    let session = session(&fx, Some(task));

    session.send_message("on the new task").await.unwrap();

    let ThreadState::Real(thread) = session.state() else {
        panic!("thread not created");
    };
    assert_eq!(fx.backend.thread(thread).unwrap().entity, task.real());
}

#[tokio::test(start_paused = true)]
async fn thread_waits_for_pending_task_to_confirm() {
    let fx = Fixture::with_backend(MemoryBackend::new().with_latency(Duration::from_millis(50)));
    let intent = MutationIntent::create(fields("drafted"));
    let temp = intent.entity_id;
    let create = fx.orchestrator.spawn(intent);
    tokio::time::sleep(Duration::from_millis(1)).await;

    let session = session(&fx, Some(temp));
    let err = session.send_message("too early").await.unwrap_err();

    assert_eq!(err, ThreadError::UnconfirmedEntity(temp));
    assert_eq!(session.state(), ThreadState::NoThread);
    assert!(session.view().messages.is_empty());
    assert_eq!(session.view().pending_participants, BTreeSet::from([GRACE, LINUS]));
    assert_eq!(fx.backend.calls(BackendOp::CreateThread), 0);
    assert_eq!(fx.orchestrator.registry().thread_for(&temp), None);

    let task = create.await.unwrap().unwrap().entity().unwrap().id;
    session.send_message("now linked").await.unwrap();

    let ThreadState::Real(thread) = session.state() else {
        panic!("thread not created");
    };
    assert_eq!(fx.backend.thread(thread).unwrap().entity, task.real());
    assert_eq!(
        fx.orchestrator.registry().thread_for(&task),
        Some(EntityId::Real(thread))
    );
}
