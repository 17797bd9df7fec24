//! Requester search view.
//!
//! The requester never sees individual offers, only the projection
//! `Searching -> {Matched | Failed | Cancelled}`. The search radius shown to the
//! requester grows on a timer and is purely advisory.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskmatch_client::{ClientError, TaskApi};
use taskmatch_core::event::names;
use taskmatch_core::{
    CoreError, FailureCategory, SearchState, ServerEvent, TaskId, TaskSnapshot, TaskStatus,
    WorkerProfile,
};

use crate::channel::{forward_events, ChannelManager, HandlerId};
use crate::config::SearchConfig;
use crate::error::RealtimeError;
use crate::timer::Timer;

#[derive(Debug)]
pub enum SearchInput {
    Start,
    Escalate { generation: u64 },
    TimedOut { generation: u64 },
    Assigned { worker: WorkerProfile },
    MatchFailed { reason: Option<String> },
    TaskCancelled,
    Cancel { reason: Option<String> },
    CancelResolved(Result<(), ClientError>),
    Reconciled(Result<TaskSnapshot, ClientError>),
    AckResolved(Result<(), ClientError>),
    Reconnected,
    Teardown,
}

/// Events emitted to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchEvent {
    Started {
        task_id: TaskId,
        radius_m: u32,
    },
    RadiusExpanded {
        task_id: TaskId,
        radius_m: u32,
        elapsed_secs: u64,
    },
    Matched {
        task_id: TaskId,
        worker: WorkerProfile,
    },
    Failed {
        task_id: TaskId,
        reason: String,
        category: Option<FailureCategory>,
    },
    Cancelled {
        task_id: TaskId,
    },
}

/// Observable search state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSnapshot {
    pub task_id: TaskId,
    pub state: SearchState,
    pub radius_m: u32,
    pub elapsed_secs: u64,
    pub worker: Option<WorkerProfile>,
}

/// One search for one task.
pub struct MatchSession {
    task_id: TaskId,
    config: SearchConfig,
    channel: ChannelManager,
    api: Arc<dyn TaskApi>,
    state: SearchState,
    radius_m: u32,
    started_at: Option<Instant>,
    worker: Option<WorkerProfile>,
    reconciling: bool,
    subscribed: bool,
    generation: u64,
    escalation: Timer,
    timeout: Timer,
    inputs: mpsc::UnboundedSender<SearchInput>,
    events: mpsc::UnboundedSender<SearchEvent>,
    snapshot: watch::Sender<SearchSnapshot>,
    handlers: Vec<HandlerId>,
    stopped: bool,
}

impl MatchSession {
    pub fn spawn(
        task_id: TaskId,
        config: SearchConfig,
        channel: ChannelManager,
        api: Arc<dyn TaskApi>,
    ) -> (MatchHandle, mpsc::UnboundedReceiver<SearchEvent>) {
        let (session, inputs, events) = Self::new(task_id, config, channel, api);
        let handle = MatchHandle {
            inputs: session.inputs.clone(),
            snapshot: session.snapshot.subscribe(),
        };
        tokio::spawn(session.run(inputs));
        (handle, events)
    }

    fn new(
        task_id: TaskId,
        config: SearchConfig,
        channel: ChannelManager,
        api: Arc<dyn TaskApi>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<SearchInput>,
        mpsc::UnboundedReceiver<SearchEvent>,
    ) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(SearchSnapshot {
            task_id: task_id.clone(),
            state: SearchState::Idle,
            radius_m: config.min_radius_m,
            elapsed_secs: 0,
            worker: None,
        });

        let own_task = task_id.clone();
        let handlers = forward_events(
            &channel,
            &[
                names::TASK_ASSIGNED,
                names::TASK_MATCH_FAILED,
                names::TASK_CANCELLED,
            ],
            input_tx.clone(),
            move |event| {
                if event.task_id().is_some_and(|id| id != &own_task) {
                    return None;
                }
                match event {
                    ServerEvent::TaskAssigned(assigned) => Some(SearchInput::Assigned {
                        worker: assigned.worker,
                    }),
                    ServerEvent::MatchFailed(failed) => Some(SearchInput::MatchFailed {
                        reason: failed.reason,
                    }),
                    ServerEvent::TaskCancelled(_) => Some(SearchInput::TaskCancelled),
                    _ => None,
                }
            },
        );

        let session = Self {
            radius_m: config.min_radius_m,
            task_id,
            config,
            channel,
            api,
            state: SearchState::Idle,
            started_at: None,
            worker: None,
            reconciling: false,
            subscribed: false,
            generation: 0,
            escalation: Timer::idle(),
            timeout: Timer::idle(),
            inputs: input_tx,
            events: event_tx,
            snapshot,
            handlers,
            stopped: false,
        };
        (session, input_rx, event_rx)
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<SearchInput>) {
        let mut reconnects = self.channel.reconnects();
        while !self.stopped {
            let input = tokio::select! {
                Some(input) = inputs.recv() => input,
                Some(_) = reconnects.next() => SearchInput::Reconnected,
                else => break,
            };
            self.handle(input);
        }
        self.shutdown();
    }

    pub(crate) fn handle(&mut self, input: SearchInput) {
        if self.stopped {
            return;
        }
        match input {
            SearchInput::Start => self.start(),
            SearchInput::Escalate { generation } => self.escalate(generation),
            SearchInput::TimedOut { generation } => {
                if generation == self.generation && self.state == SearchState::Searching {
                    info!(task_id = %self.task_id, "Search timed out");
                    self.fail("timeout".to_string(), None);
                }
            }
            SearchInput::Assigned { worker } => self.matched(worker),
            SearchInput::MatchFailed { reason } => {
                if self.state == SearchState::Searching {
                    let reason = reason.unwrap_or_else(|| "no worker available".to_string());
                    info!(task_id = %self.task_id, reason = %reason, "Match failed");
                    self.fail(reason, None);
                }
            }
            SearchInput::TaskCancelled => {
                if self.state == SearchState::Searching {
                    info!(task_id = %self.task_id, "Task cancelled by server");
                    self.cancelled();
                }
            }
            SearchInput::Cancel { reason } => self.cancel(reason),
            SearchInput::CancelResolved(result) => {
                if let Err(e) = result {
                    warn!(task_id = %self.task_id, error = %e, "Cancel not persisted");
                }
            }
            SearchInput::Reconnected => self.reconcile(),
            SearchInput::Reconciled(result) => self.on_reconciled(result),
            SearchInput::AckResolved(result) => {
                if let Err(e) = result {
                    warn!(task_id = %self.task_id, error = %e, "Match acknowledgement failed");
                }
            }
            SearchInput::Teardown => self.shutdown(),
        }
    }

    fn start(&mut self) {
        if self.state == SearchState::Matched {
            warn!(task_id = %self.task_id, "Already matched, not restarting search");
            return;
        }
        if !self.subscribed {
            self.channel.subscribe(self.task_id.topic());
            self.subscribed = true;
        }

        self.state = SearchState::Searching;
        self.radius_m = self.config.min_radius_m;
        self.started_at = Some(Instant::now());
        self.generation += 1;
        let generation = self.generation;
        self.escalation = Timer::every(
            self.config.escalation_interval(),
            self.inputs.clone(),
            move || SearchInput::Escalate { generation },
        );
        self.timeout = match self.config.search_timeout() {
            Some(limit) => {
                Timer::once(limit, self.inputs.clone(), SearchInput::TimedOut { generation })
            }
            None => Timer::idle(),
        };

        info!(task_id = %self.task_id, radius_m = self.radius_m, "Searching for a worker");
        self.emit(SearchEvent::Started {
            task_id: self.task_id.clone(),
            radius_m: self.radius_m,
        });
        self.publish();
    }

    fn escalate(&mut self, generation: u64) {
        if generation != self.generation || self.state != SearchState::Searching {
            return;
        }
        // Never shrinks, even when the ceiling sits below the start radius.
        let next = self
            .radius_m
            .saturating_add(self.config.radius_step_m)
            .min(self.config.max_radius_m)
            .max(self.radius_m);
        if next == self.radius_m {
            return;
        }
        self.radius_m = next;
        debug!(task_id = %self.task_id, radius_m = next, "Search radius expanded");
        self.emit(SearchEvent::RadiusExpanded {
            task_id: self.task_id.clone(),
            radius_m: next,
            elapsed_secs: self.elapsed_secs(),
        });
        self.publish();
    }

    fn matched(&mut self, worker: WorkerProfile) {
        if self.state != SearchState::Searching {
            debug!(task_id = %self.task_id, state = ?self.state, "Ignoring assignment");
            return;
        }
        info!(task_id = %self.task_id, worker_id = %worker.id, "Worker matched");
        self.stop_timers();
        self.state = SearchState::Matched;
        self.worker = Some(worker.clone());
        self.emit(SearchEvent::Matched {
            task_id: self.task_id.clone(),
            worker,
        });
        self.publish();
    }

    fn fail(&mut self, reason: String, category: Option<FailureCategory>) {
        self.stop_timers();
        self.state = SearchState::Failed;
        self.emit(SearchEvent::Failed {
            task_id: self.task_id.clone(),
            reason,
            category,
        });
        self.publish();
    }

    fn cancelled(&mut self) {
        self.stop_timers();
        self.state = SearchState::Cancelled;
        self.emit(SearchEvent::Cancelled {
            task_id: self.task_id.clone(),
        });
        self.publish();
    }

    fn cancel(&mut self, reason: Option<String>) {
        if self.state != SearchState::Searching {
            warn!(task_id = %self.task_id, state = ?self.state, "Nothing to cancel");
            return;
        }
        info!(task_id = %self.task_id, "Cancelling search");
        self.cancelled();

        let api = self.api.clone();
        let inputs = self.inputs.clone();
        let task_id = self.task_id.clone();
        tokio::spawn(async move {
            let result = api.cancel_task(&task_id, reason.as_deref()).await;
            let _ = inputs.send(SearchInput::CancelResolved(result));
        });
    }

    fn reconcile(&mut self) {
        if self.state != SearchState::Searching || self.reconciling {
            return;
        }
        info!(task_id = %self.task_id, "Reconciling search after reconnect");
        self.reconciling = true;
        let api = self.api.clone();
        let inputs = self.inputs.clone();
        let task_id = self.task_id.clone();
        tokio::spawn(async move {
            let result = api.get_task(&task_id).await;
            let _ = inputs.send(SearchInput::Reconciled(result));
        });
    }

    fn on_reconciled(&mut self, result: Result<TaskSnapshot, ClientError>) {
        self.reconciling = false;
        if self.state != SearchState::Searching {
            return;
        }
        match result {
            Ok(snapshot) if snapshot.status == Some(TaskStatus::Cancelled) => self.cancelled(),
            Ok(snapshot) if snapshot.is_matched() => {
                if let Some(worker) = snapshot.worker {
                    self.matched(worker);
                    self.acknowledge();
                }
            }
            Ok(_) => debug!(task_id = %self.task_id, "Still searching"),
            Err(e) if e.category() == FailureCategory::StaleState => {
                warn!(task_id = %self.task_id, "Task unknown to server, discarding search");
                self.fail("unknown task".to_string(), Some(FailureCategory::StaleState));
            }
            Err(e) => warn!(task_id = %self.task_id, error = %e, "Reconciliation failed"),
        }
    }

    /// Acknowledge a match that was only seen through reconciliation.
    fn acknowledge(&self) {
        let api = self.api.clone();
        let inputs = self.inputs.clone();
        let task_id = self.task_id.clone();
        tokio::spawn(async move {
            let result = api.accept_task(&task_id).await;
            let _ = inputs.send(SearchInput::AckResolved(result));
        });
    }

    fn stop_timers(&mut self) {
        self.escalation.cancel();
        self.timeout.cancel();
        self.generation += 1;
    }

    fn shutdown(&mut self) {
        self.stop_timers();
        for id in self.handlers.drain(..) {
            self.channel.off(id);
        }
        if self.subscribed {
            self.channel.unsubscribe(&self.task_id.topic());
            self.subscribed = false;
        }
        self.stopped = true;
    }

    fn elapsed_secs(&self) -> u64 {
        self.started_at.map_or(0, |t| t.elapsed().as_secs())
    }

    fn emit(&self, event: SearchEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(SearchSnapshot {
            task_id: self.task_id.clone(),
            state: self.state,
            radius_m: self.radius_m,
            elapsed_secs: self.elapsed_secs(),
            worker: self.worker.clone(),
        });
    }
}

/// Command side of a running [`MatchSession`].
#[derive(Clone)]
pub struct MatchHandle {
    inputs: mpsc::UnboundedSender<SearchInput>,
    snapshot: watch::Receiver<SearchSnapshot>,
}

impl MatchHandle {
    /// Start (or restart) the search. The radius resets to its minimum.
    pub fn start(&self) -> Result<(), RealtimeError> {
        let state = self.snapshot.borrow().state;
        if state == SearchState::Matched || state == SearchState::Searching {
            return Err(CoreError::transition(state, SearchState::Searching).into());
        }
        self.send(SearchInput::Start)
    }

    pub fn cancel(&self, reason: Option<String>) -> Result<(), RealtimeError> {
        let state = self.snapshot.borrow().state;
        if state != SearchState::Searching {
            return Err(CoreError::transition(state, SearchState::Cancelled).into());
        }
        self.send(SearchInput::Cancel { reason })
    }

    pub fn teardown(&self) {
        let _ = self.inputs.send(SearchInput::Teardown);
    }

    pub fn snapshot(&self) -> SearchSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SearchSnapshot> {
        self.snapshot.clone()
    }

    fn send(&self, input: SearchInput) -> Result<(), RealtimeError> {
        self.inputs
            .send(input)
            .map_err(|_| RealtimeError::Stopped("match session"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::channel::{Frame, MemoryPeer};
    use crate::testing::{connected_channel, drain, settle, ApiCall, MockApi};
    use serde_json::json;

    async fn spawn_session(
        config: SearchConfig,
    ) -> (
        MatchHandle,
        mpsc::UnboundedReceiver<SearchEvent>,
        MemoryPeer,
        mpsc::UnboundedReceiver<MemoryPeer>,
        Arc<MockApi>,
    ) {
        let (channel, peer, peers) = connected_channel().await;
        let api = MockApi::new();
        let (handle, events) = MatchSession::spawn(TaskId::new("T2"), config, channel, api.clone());
        (handle, events, peer, peers, api)
    }

    fn radii(events: &[SearchEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                SearchEvent::Started { radius_m, .. } => Some(*radius_m),
                SearchEvent::RadiusExpanded { radius_m, .. } => Some(*radius_m),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_then_immediate_match() {
        let (handle, mut events, mut peer, _peers, _api) =
            spawn_session(SearchConfig::default()).await;
        handle.start().unwrap();
        settle().await;
        assert_eq!(
            peer.drain(),
            vec![Frame::Subscribe {
                topic: "task:T2".into()
            }]
        );

        tokio::time::sleep(Duration::from_secs(65)).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, SearchState::Searching);
        assert_eq!(snapshot.radius_m, 3_000);

        peer.push(
            "task:assigned",
            json!({ "worker": { "id": "w7", "name": "Ana" } }),
        )
        .await;
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, SearchState::Matched);
        assert_eq!(snapshot.worker.unwrap().id.as_str(), "w7");

        // Escalation has stopped.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.snapshot().radius_m, 3_000);
        let events = drain(&mut events);
        assert_eq!(radii(&events), vec![1_000, 2_000, 3_000]);
        assert!(matches!(events.last(), Some(SearchEvent::Matched { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_radius_monotonic_capped_and_reset() {
        let config = SearchConfig {
            search_timeout_secs: 0,
            ..SearchConfig::default()
        };
        let (handle, mut events, peer, _peers, _api) = spawn_session(config).await;
        handle.start().unwrap();

        tokio::time::sleep(Duration::from_secs(30 * 15 + 1)).await;
        let seen = radii(&drain(&mut events));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&10_000));
        assert_eq!(handle.snapshot().radius_m, 10_000);

        peer.push("task:match_failed", json!({})).await;
        settle().await;
        assert_eq!(handle.snapshot().state, SearchState::Failed);

        handle.start().unwrap();
        settle().await;
        assert_eq!(handle.snapshot().state, SearchState::Searching);
        assert_eq!(handle.snapshot().radius_m, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radius_never_shrinks_below_start() {
        let config = SearchConfig {
            min_radius_m: 5_000,
            max_radius_m: 3_000,
            search_timeout_secs: 0,
            ..SearchConfig::default()
        };
        let (handle, mut events, _peer, _peers, _api) = spawn_session(config).await;
        handle.start().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(handle.snapshot().radius_m, 5_000);
        assert_eq!(radii(&drain(&mut events)), vec![5_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_timeout_fails() {
        let config = SearchConfig {
            search_timeout_secs: 90,
            ..SearchConfig::default()
        };
        let (handle, mut events, _peer, _peers, _api) = spawn_session(config).await;
        handle.start().unwrap();

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(handle.snapshot().state, SearchState::Failed);
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SearchEvent::Failed { reason, .. } if reason == "timeout"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_posts_and_unsubscribes_on_teardown() {
        let (handle, _events, mut peer, _peers, api) =
            spawn_session(SearchConfig::default()).await;
        handle.start().unwrap();
        settle().await;
        peer.drain();

        handle.cancel(Some("changed my mind".into())).unwrap();
        settle().await;
        assert_eq!(handle.snapshot().state, SearchState::Cancelled);
        assert_eq!(api.calls(), vec![ApiCall::CancelTask(TaskId::new("T2"))]);
        assert!(handle.cancel(None).is_err());

        handle.teardown();
        settle().await;
        assert_eq!(
            peer.drain(),
            vec![Frame::Unsubscribe {
                topic: "task:T2".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_for_other_tasks_ignored() {
        let (handle, _events, peer, _peers, _api) = spawn_session(SearchConfig::default()).await;
        handle.start().unwrap();
        peer.push("task:cancelled", json!({ "taskId": "T9" })).await;
        settle().await;
        assert_eq!(handle.snapshot().state, SearchState::Searching);

        peer.push("task:cancelled", json!({ "taskId": "T2" })).await;
        settle().await;
        assert_eq!(handle.snapshot().state, SearchState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reconciles_missed_match() {
        let (handle, _events, peer, mut peers, api) =
            spawn_session(SearchConfig::default()).await;
        handle.start().unwrap();
        settle().await;

        api.snapshot(Ok(TaskSnapshot {
            id: TaskId::new("T2"),
            status: Some(TaskStatus::Assigned),
            worker: Some(WorkerProfile::new("w3", "Bo")),
            destination: None,
            worker_location: None,
        }));
        drop(peer);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(peers.try_recv().is_ok());

        assert_eq!(handle.snapshot().state, SearchState::Matched);
        assert_eq!(
            api.calls(),
            vec![
                ApiCall::GetTask(TaskId::new("T2")),
                ApiCall::AcceptTask(TaskId::new("T2")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_unknown_task_discards() {
        let (handle, mut events, peer, _peers, api) =
            spawn_session(SearchConfig::default()).await;
        handle.start().unwrap();
        settle().await;

        api.snapshot(Err(404));
        drop(peer);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(handle.snapshot().state, SearchState::Failed);
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SearchEvent::Failed {
                category: Some(FailureCategory::StaleState),
                ..
            }
        )));
    }
}
