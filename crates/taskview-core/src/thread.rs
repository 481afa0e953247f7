//! Comment threads with optimistic creation
//!
//! `NoThread -> Pending(temp) -> Real(id)`
//!
//! Participants picked before a thread exists live in a pending set. The
//! first message creates the thread; the pending set (minus the acting
//! user) becomes its watchers in one batch and is then cleared. A failed
//! creation returns to `NoThread` with the pending set intact.

use crate::backend::ThreadBackend;
use crate::error::ThreadError;
use crate::notice::MutationNotice;
use crate::orchestrator::MutationOrchestrator;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use taskview_entity::{EntityId, UserId};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Creation phase of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// No thread yet
    NoThread,
    /// Creation call in flight under a placeholder id
    Pending(EntityId),
    /// Created
    Real(u64),
}

impl ThreadState {
    /// Id the UI should show, if any
    #[must_use]
    pub fn id(&self) -> Option<EntityId> {
        match self {
            Self::NoThread => None,
            Self::Pending(temp) => Some(*temp),
            Self::Real(id) => Some(EntityId::Real(*id)),
        }
    }
}

/// A message as shown in the thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Placeholder until the backend confirms
    pub id: EntityId,
    /// Author
    pub author: UserId,
    /// Body text
    pub body: String,
    /// Local send time, replaced by the server time on confirmation
    pub sent_at: DateTime<Utc>,
    /// Whether the backend stored it
    pub confirmed: bool,
}

/// Everything a thread surface renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    /// Creation phase
    pub state: ThreadState,
    /// Thread members
    pub participants: BTreeSet<UserId>,
    /// Members chosen before the thread exists
    pub pending_participants: BTreeSet<UserId>,
    /// Messages in send order
    pub messages: Vec<Message>,
}

/// One comment thread, optionally linked to a task
pub struct ThreadSession {
    entity: Option<EntityId>,
    actor: UserId,
    backend: Arc<dyn ThreadBackend>,
    orchestrator: MutationOrchestrator,
    view: watch::Sender<ThreadView>,
    creating: Mutex<()>,
}

impl std::fmt::Debug for ThreadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSession")
            .field("entity", &self.entity)
            .field("actor", &self.actor)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ThreadSession {
    /// Session with no thread yet
    ///
    /// `defaults` seeds the pending participants when the engine is
    /// configured to do so (e.g. the watchers of the owning project).
    pub fn new(
        orchestrator: MutationOrchestrator,
        backend: Arc<dyn ThreadBackend>,
        actor: UserId,
        entity: Option<EntityId>,
        defaults: impl IntoIterator<Item = UserId>,
    ) -> Self {
        let pending_participants = if orchestrator.config().seed_thread_participants {
            defaults.into_iter().collect()
        } else {
            BTreeSet::new()
        };
        Self::with_view(
            orchestrator,
            backend,
            actor,
            entity,
            ThreadView {
                state: ThreadState::NoThread,
                participants: BTreeSet::new(),
                pending_participants,
                messages: Vec::new(),
            },
        )
    }

    /// Session over a thread that already exists
    pub fn existing(
        orchestrator: MutationOrchestrator,
        backend: Arc<dyn ThreadBackend>,
        actor: UserId,
        entity: Option<EntityId>,
        thread: u64,
        participants: impl IntoIterator<Item = UserId>,
    ) -> Self {
        if let Some(entity) = entity {
            orchestrator
                .registry()
                .link_thread(entity, EntityId::Real(thread));
        }
        Self::with_view(
            orchestrator,
            backend,
            actor,
            entity,
            ThreadView {
                state: ThreadState::Real(thread),
                participants: participants.into_iter().collect(),
                pending_participants: BTreeSet::new(),
                messages: Vec::new(),
            },
        )
    }

    fn with_view(
        orchestrator: MutationOrchestrator,
        backend: Arc<dyn ThreadBackend>,
        actor: UserId,
        entity: Option<EntityId>,
        view: ThreadView,
    ) -> Self {
        let (view, _) = watch::channel(view);
        Self {
            entity,
            actor,
            backend,
            orchestrator,
            view,
            creating: Mutex::new(()),
        }
    }

    /// Current phase
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.view.borrow().state
    }

    /// Current view
    #[must_use]
    pub fn view(&self) -> ThreadView {
        self.view.borrow().clone()
    }

    /// Stream of thread views
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ThreadView> {
        self.view.subscribe()
    }

    /// Post a message, creating the thread first if needed
    ///
    /// The message shows immediately and is removed again if either call
    /// fails.
    ///
    /// # Errors
    /// - [`ThreadError::UnconfirmedEntity`] when the owning task still has a
    ///   placeholder id; nothing is created and the message is dropped
    /// - [`ThreadError::CreateFailed`] or [`ThreadError::MessageFailed`]
    pub async fn send_message(&self, body: impl Into<String>) -> Result<Message, ThreadError> {
        let body = body.into();
        let placeholder = Message {
            id: EntityId::temp(),
            author: self.actor,
            body: body.clone(),
            sent_at: Utc::now(),
            confirmed: false,
        };
        let temp = placeholder.id;
        self.view.send_modify(|v| v.messages.push(placeholder));

        let thread = match self.ensure_thread().await {
            Ok(thread) => thread,
            Err(error) => {
                self.drop_message(&temp);
                return Err(error);
            }
        };

        match self.backend.post_message(thread, self.actor, body).await {
            Ok(raw) => {
                let confirmed = Message {
                    id: EntityId::Real(raw.id),
                    author: raw.author,
                    body: raw.body,
                    sent_at: raw.sent_at,
                    confirmed: true,
                };
                self.view.send_modify(|v| {
                    if let Some(slot) = v.messages.iter_mut().find(|m| m.id == temp) {
                        *slot = confirmed.clone();
                    }
                });
                debug!(thread, message = raw.id, "message confirmed");
                Ok(confirmed)
            }
            Err(source) => {
                self.drop_message(&temp);
                let error = ThreadError::MessageFailed(source);
                self.report(Some(EntityId::Real(thread)), error.clone());
                Err(error)
            }
        }
    }

    /// Add a participant
    ///
    /// Before the thread exists this only edits the pending set.
    ///
    /// # Errors
    /// [`ThreadError::ParticipantFailed`]; the addition is reverted.
    pub async fn add_participant(&self, user: UserId) -> Result<(), ThreadError> {
        let ThreadState::Real(thread) = self.state() else {
            self.view.send_modify(|v| {
                v.pending_participants.insert(user);
                if matches!(v.state, ThreadState::Pending(_)) {
                    v.participants.insert(user);
                }
            });
            return Ok(());
        };

        let mut added = false;
        self.view.send_modify(|v| added = v.participants.insert(user));
        if !added {
            return Ok(());
        }

        if let Err(source) = self.backend.add_watchers(thread, vec![user]).await {
            self.view.send_modify(|v| {
                v.participants.remove(&user);
            });
            let error = ThreadError::ParticipantFailed { user, source };
            self.report(Some(EntityId::Real(thread)), error.clone());
            return Err(error);
        }
        Ok(())
    }

    /// Remove a participant
    ///
    /// # Errors
    /// [`ThreadError::ParticipantFailed`]; the removal is reverted.
    pub async fn remove_participant(&self, user: UserId) -> Result<(), ThreadError> {
        let ThreadState::Real(thread) = self.state() else {
            self.view.send_modify(|v| {
                v.pending_participants.remove(&user);
                if matches!(v.state, ThreadState::Pending(_)) && user != self.actor {
                    v.participants.remove(&user);
                }
            });
            return Ok(());
        };

        let mut removed = false;
        self.view.send_modify(|v| removed = v.participants.remove(&user));
        if !removed {
            return Ok(());
        }

        if let Err(source) = self.backend.remove_watcher(thread, user).await {
            self.view.send_modify(|v| {
                v.participants.insert(user);
            });
            let error = ThreadError::ParticipantFailed { user, source };
            self.report(Some(EntityId::Real(thread)), error.clone());
            return Err(error);
        }
        Ok(())
    }

    async fn ensure_thread(&self) -> Result<u64, ThreadError> {
        let _creating = self.creating.lock().await;
        if let ThreadState::Real(thread) = self.state() {
            return Ok(thread);
        }

        // The backend links threads by server id only
        let entity = self.entity.map(|e| self.orchestrator.resolve(e));
        if let Some(unconfirmed) = entity.filter(EntityId::is_temp) {
            debug!(entity = %unconfirmed, "thread creation deferred, task not confirmed");
            return Err(ThreadError::UnconfirmedEntity(unconfirmed));
        }

        let temp = EntityId::temp();
        let actor = self.actor;
        self.view.send_modify(|v| {
            v.state = ThreadState::Pending(temp);
            v.participants = v.pending_participants.clone();
            v.participants.insert(actor);
        });
        if let Some(entity) = entity {
            self.orchestrator.registry().link_thread(entity, temp);
        }
        debug!(thread = %temp, "thread creation issued");

        let thread = match self
            .backend
            .create_thread(entity.and_then(|e| e.real()))
            .await
        {
            Ok(thread) => thread,
            Err(source) => {
                self.view.send_modify(|v| {
                    v.state = ThreadState::NoThread;
                    v.participants.clear();
                });
                if let Some(entity) = entity {
                    self.orchestrator.registry().unlink_thread(&entity);
                }
                let error = ThreadError::CreateFailed(source);
                warn!(%error, "thread creation failed");
                self.report(None, error.clone());
                return Err(error);
            }
        };

        self.orchestrator
            .reconciler()
            .reconcile_id(temp, EntityId::Real(thread));
        let mut watchers = Vec::new();
        self.view.send_modify(|v| {
            v.state = ThreadState::Real(thread);
            watchers = v
                .pending_participants
                .iter()
                .copied()
                .filter(|u| *u != actor)
                .collect();
            v.pending_participants.clear();
        });
        info!(thread, watchers = watchers.len(), "thread created");

        if !watchers.is_empty() {
            if let Err(source) = self.backend.add_watchers(thread, watchers).await {
                self.view.send_modify(|v| {
                    v.participants = BTreeSet::from([actor]);
                });
                let error = ThreadError::WatchersFailed { thread, source };
                warn!(%error, "watchers not added, thread kept");
                self.report(Some(EntityId::Real(thread)), error);
            }
        }
        Ok(thread)
    }

    fn drop_message(&self, id: &EntityId) {
        self.view.send_modify(|v| v.messages.retain(|m| m.id != *id));
    }

    fn report(&self, thread: Option<EntityId>, error: ThreadError) {
        self.orchestrator
            .notify(MutationNotice::Thread { thread, error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, MockThreadBackend, RawMessage};
    use crate::config::EngineConfig;
    use crate::error::BackendError;
    use pretty_assertions::assert_eq;

    const ACTOR: UserId = UserId(1);

    fn orchestrator() -> MutationOrchestrator {
        MutationOrchestrator::new(EngineConfig::default(), Arc::new(MockBackend::new()))
    }

    fn echo_messages(backend: &mut MockThreadBackend) {
        backend.expect_post_message().returning(|_, author, body| {
            Ok(RawMessage {
                id: 500,
                author,
                body,
                sent_at: Utc::now(),
            })
        });
    }

    fn session(orch: &MutationOrchestrator, backend: MockThreadBackend) -> ThreadSession {
        ThreadSession::new(
            orch.clone(),
            Arc::new(backend),
            ACTOR,
            Some(EntityId::Real(7)),
            [ACTOR, UserId(2), UserId(3)],
        )
    }

    #[tokio::test]
    async fn first_message_creates_thread_and_adds_watchers() {
        let mut backend = MockThreadBackend::new();
        backend
            .expect_create_thread()
            .times(1)
            .returning(|entity| {
                assert_eq!(entity, Some(7));
                Ok(90)
            });
        backend
            .expect_add_watchers()
            .times(1)
            .withf(|thread, users| *thread == 90 && users == &vec![UserId(2), UserId(3)])
            .returning(|_, _| Ok(()));
        echo_messages(&mut backend);
        let orch = orchestrator();
        let thread = session(&orch, backend);

        let message = thread.send_message("hello").await.unwrap();
        thread.send_message("again").await.unwrap();

        let view = thread.view();
        assert_eq!(view.state, ThreadState::Real(90));
        assert!(view.pending_participants.is_empty());
        assert_eq!(view.participants, BTreeSet::from([ACTOR, UserId(2), UserId(3)]));
        assert!(message.confirmed);
        assert_eq!(view.messages.len(), 2);
        assert_eq!(
            orch.registry().thread_for(&EntityId::Real(7)),
            Some(EntityId::Real(90))
        );
    }

    #[tokio::test]
    async fn failed_creation_restores_no_thread() {
        let mut backend = MockThreadBackend::new();
        backend
            .expect_create_thread()
            .returning(|_| Err(BackendError::Unavailable("down".into())));
        backend.expect_post_message().never();
        let orch = orchestrator();
        let mut notices = orch.subscribe_notices();
        let thread = session(&orch, backend);

        let err = thread.send_message("hello").await.unwrap_err();

        assert!(matches!(err, ThreadError::CreateFailed(_)));
        let view = thread.view();
        assert_eq!(view.state, ThreadState::NoThread);
        assert_eq!(view.pending_participants, BTreeSet::from([ACTOR, UserId(2), UserId(3)]));
        assert!(view.messages.is_empty());
        assert_eq!(orch.registry().thread_for(&EntityId::Real(7)), None);
        assert!(matches!(
            notices.try_recv().unwrap(),
            MutationNotice::Thread { thread: None, .. }
        ));
    }

    #[tokio::test]
    async fn watcher_failure_keeps_thread_with_actor_only() {
        let mut backend = MockThreadBackend::new();
        backend.expect_create_thread().returning(|_| Ok(91));
        backend
            .expect_add_watchers()
            .returning(|_, _| Err(BackendError::Rejected("quota".into())));
        echo_messages(&mut backend);
        let orch = orchestrator();
        let mut notices = orch.subscribe_notices();
        let thread = session(&orch, backend);

        thread.send_message("hello").await.unwrap();

        let view = thread.view();
        assert_eq!(view.state, ThreadState::Real(91));
        assert_eq!(view.participants, BTreeSet::from([ACTOR]));
        assert!(matches!(
            notices.try_recv().unwrap(),
            MutationNotice::Thread {
                error: ThreadError::WatchersFailed { thread: 91, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failed_message_is_removed() {
        let mut backend = MockThreadBackend::new();
        backend
            .expect_post_message()
            .returning(|_, _, _| Err(BackendError::Unavailable("timeout".into())));
        let orch = orchestrator();
        let thread = ThreadSession::existing(
            orch.clone(),
            Arc::new(backend),
            ACTOR,
            None,
            12,
            [ACTOR],
        );

        let err = thread.send_message("lost").await.unwrap_err();
        assert!(matches!(err, ThreadError::MessageFailed(_)));
        assert!(thread.view().messages.is_empty());
    }

    #[tokio::test]
    async fn participant_add_reverts_on_failure() {
        let mut backend = MockThreadBackend::new();
        backend
            .expect_add_watchers()
            .returning(|_, _| Err(BackendError::Rejected("no".into())));
        backend.expect_remove_watcher().returning(|_, _| Ok(()));
        let orch = orchestrator();
        let thread = ThreadSession::existing(
            orch.clone(),
            Arc::new(backend),
            ACTOR,
            None,
            12,
            [ACTOR, UserId(4)],
        );

        let err = thread.add_participant(UserId(5)).await.unwrap_err();
        assert_eq!(
            err,
            ThreadError::ParticipantFailed {
                user: UserId(5),
                source: BackendError::Rejected("no".into())
            }
        );
        thread.remove_participant(UserId(4)).await.unwrap();
        assert_eq!(thread.view().participants, BTreeSet::from([ACTOR]));
    }

    #[tokio::test]
    async fn participants_before_creation_edit_pending_set() {
        let orch = orchestrator();
        let thread = session(&orch, MockThreadBackend::new());

        thread.add_participant(UserId(9)).await.unwrap();
        thread.remove_participant(UserId(2)).await.unwrap();

        assert_eq!(
            thread.view().pending_participants,
            BTreeSet::from([ACTOR, UserId(3), UserId(9)])
        );
        assert_eq!(thread.state(), ThreadState::NoThread);
    }

    #[tokio::test]
    async fn seeding_can_be_disabled() {
        let orch = MutationOrchestrator::new(
            EngineConfig::default().with_seed_thread_participants(false),
            Arc::new(MockBackend::new()),
        );
        let thread = session(&orch, MockThreadBackend::new());
        assert!(thread.view().pending_participants.is_empty());
    }
}
