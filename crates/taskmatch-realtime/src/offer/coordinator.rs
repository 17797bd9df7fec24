//! Worker alert view.
//!
//! Holds at most one live offer, runs its countdown, and resolves the
//! accept / decline / expire / cancel race to exactly one outcome. The first
//! committed terminal transition wins; every later attempt is a no-op, with
//! one exception: an expiry decided only by the local clock is held for a
//! short grace period, during which a server confirmation for the same offer
//! turns it into an accept. Either way the offer is reported resolved once.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskmatch_client::{ClientError, HelperApi};
use taskmatch_core::event::names;
use taskmatch_core::offer::is_valid_window;
use taskmatch_core::{
    ClientEvent, CoreError, FailureCategory, OfferId, OfferOutcome, OfferState, ServerEvent, TaskId,
    TaskOffer, TaskStatus, TaskSummary, WorkerId,
};

use crate::channel::{forward_events, ChannelManager, HandlerId};
use crate::config::OfferConfig;
use crate::error::RealtimeError;
use crate::optimistic::Optimistic;
use crate::timer::Timer;

/// How many resolved task ids are remembered for alert idempotency.
const RESOLVED_MEMORY: usize = 64;

/// Inputs processed by the coordinator, in arrival order.
#[derive(Debug)]
pub enum OfferInput {
    Alert(TaskSummary),
    Accept,
    Decline { reason: String },
    Dismiss,
    Countdown { generation: u64 },
    /// The grace period after a clock expiry ran out.
    ExpiryGrace { generation: u64 },
    Tick { generation: u64 },
    AcceptResolved {
        offer: OfferId,
        result: Result<(), ClientError>,
    },
    DeclineResolved {
        task_id: TaskId,
        result: Result<(), ClientError>,
    },
    TaskCancelled { task_id: TaskId },
    /// The server reports the task as assigned to this worker.
    AcceptConfirmed { task_id: TaskId },
    Reconnected,
    Available,
    Unavailable,
    Teardown,
}

impl OfferInput {
    fn from_server(event: ServerEvent) -> Option<Self> {
        match event {
            ServerEvent::TaskAlert(alert) => Some(Self::Alert(alert.task)),
            ServerEvent::TaskCancelled(cancelled) => Some(Self::TaskCancelled {
                task_id: cancelled.task_id,
            }),
            ServerEvent::StatusUpdate(update) if update.status == TaskStatus::Cancelled => {
                Some(Self::TaskCancelled {
                    task_id: update.task_id,
                })
            }
            ServerEvent::StatusUpdate(update) => Some(Self::AcceptConfirmed {
                task_id: update.task_id,
            }),
            _ => None,
        }
    }
}

/// Events emitted to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OfferEvent {
    Offered {
        offer: TaskOffer,
    },
    Tick {
        task_id: TaskId,
        remaining_secs: u64,
    },
    Resolved {
        offer: TaskOffer,
        outcome: OfferOutcome,
    },
    /// An alert arrived while another offer was outstanding.
    Dropped {
        task_id: TaskId,
    },
    /// The server refused the accept for a reason the worker can act on.
    AcceptRejected {
        task_id: TaskId,
        category: FailureCategory,
        message: String,
    },
}

/// Observable coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OfferSnapshot {
    pub state: OfferState,
    /// The state is a local proposal awaiting the server.
    pub pending: bool,
    pub offer: Option<TaskOffer>,
    pub last_outcome: Option<OfferOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpiryCause {
    Clock,
    Dismissed,
}

/// Worker-side offer state machine.
pub struct OfferCoordinator {
    worker_id: WorkerId,
    config: OfferConfig,
    channel: ChannelManager,
    api: Arc<dyn HelperApi>,
    status: Optimistic<OfferState>,
    offer: Option<TaskOffer>,
    deadline: Option<Instant>,
    /// Offer whose expiry came only from the local clock and is not yet
    /// reported.
    clock_expired: Option<TaskOffer>,
    resolved: VecDeque<TaskId>,
    available: bool,
    last_outcome: Option<OfferOutcome>,
    retry_accept: bool,
    generation: u64,
    countdown: Timer,
    ticker: Timer,
    inputs: mpsc::UnboundedSender<OfferInput>,
    events: mpsc::UnboundedSender<OfferEvent>,
    snapshot: watch::Sender<OfferSnapshot>,
    handlers: Vec<HandlerId>,
    stopped: bool,
}

impl OfferCoordinator {
    /// Start a coordinator listening on the worker's channel events.
    pub fn spawn(
        worker_id: WorkerId,
        config: OfferConfig,
        channel: ChannelManager,
        api: Arc<dyn HelperApi>,
    ) -> (OfferHandle, mpsc::UnboundedReceiver<OfferEvent>) {
        let (coordinator, inputs, events) = Self::new(worker_id, config, channel, api);
        let handle = OfferHandle {
            inputs: coordinator.inputs.clone(),
            snapshot: coordinator.snapshot.subscribe(),
        };
        tokio::spawn(coordinator.run(inputs));
        (handle, events)
    }

    fn new(
        worker_id: WorkerId,
        config: OfferConfig,
        channel: ChannelManager,
        api: Arc<dyn HelperApi>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<OfferInput>,
        mpsc::UnboundedReceiver<OfferEvent>,
    ) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(OfferSnapshot::default());
        let handlers = forward_events(
            &channel,
            &[
                names::TASK_ALERT,
                names::TASK_CANCELLED,
                names::TASK_STATUS_UPDATE,
            ],
            input_tx.clone(),
            OfferInput::from_server,
        );

        let coordinator = Self {
            worker_id,
            config,
            channel,
            api,
            status: Optimistic::new(OfferState::Idle),
            offer: None,
            deadline: None,
            clock_expired: None,
            resolved: VecDeque::new(),
            available: false,
            last_outcome: None,
            retry_accept: false,
            generation: 0,
            countdown: Timer::idle(),
            ticker: Timer::idle(),
            inputs: input_tx,
            events: event_tx,
            snapshot,
            handlers,
            stopped: false,
        };
        (coordinator, input_rx, event_rx)
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<OfferInput>) {
        let mut reconnects = self.channel.reconnects();
        while !self.stopped {
            let input = tokio::select! {
                Some(input) = inputs.recv() => input,
                Some(_) = reconnects.next() => OfferInput::Reconnected,
                else => break,
            };
            self.handle(input);
        }
        self.shutdown();
        debug!(worker_id = %self.worker_id, "Offer coordinator stopped");
    }

    pub(crate) fn handle(&mut self, input: OfferInput) {
        if self.stopped {
            return;
        }
        match input {
            OfferInput::Alert(task) => self.on_alert(task),
            OfferInput::Accept => self.on_accept(),
            OfferInput::Decline { reason } => self.on_decline(reason),
            OfferInput::Dismiss => self.on_dismiss(),
            OfferInput::Countdown { generation } => self.on_countdown(generation),
            OfferInput::ExpiryGrace { generation } => self.on_expiry_grace(generation),
            OfferInput::Tick { generation } => self.on_tick(generation),
            OfferInput::AcceptResolved { offer, result } => {
                self.on_accept_resolved(offer, result)
            }
            OfferInput::DeclineResolved { task_id, result } => {
                if let Err(e) = result {
                    warn!(
                        task_id = %task_id,
                        error = %e,
                        category = ?e.category(),
                        "Decline not persisted"
                    );
                }
            }
            OfferInput::TaskCancelled { task_id } => self.on_task_cancelled(task_id),
            OfferInput::AcceptConfirmed { task_id } => self.on_accept_confirmed(task_id),
            OfferInput::Reconnected => self.on_reconnected(),
            OfferInput::Available => self.set_available(true),
            OfferInput::Unavailable => self.set_available(false),
            OfferInput::Teardown => {
                info!(worker_id = %self.worker_id, "Tearing down offer coordinator");
                self.shutdown();
            }
        }
    }

    /// The offer still awaiting a final outcome, if any.
    fn live_offer(&self) -> Option<&TaskOffer> {
        match self.status.current() {
            OfferState::Offered => self.offer.as_ref(),
            OfferState::Accepted if self.status.is_pending() => self.offer.as_ref(),
            _ => None,
        }
    }

    fn on_alert(&mut self, task: TaskSummary) {
        if self.resolved.contains(&task.id) {
            debug!(task_id = %task.id, "Ignoring alert for resolved task");
            return;
        }
        if let Some(expired) = &self.clock_expired {
            if expired.task_id() == &task.id {
                debug!(task_id = %task.id, "Ignoring alert for expiring offer");
                return;
            }
            self.finish_clock_expiry();
        }
        if let Some(live) = self.live_offer() {
            if live.task_id() == &task.id {
                debug!(task_id = %task.id, "Duplicate alert for live offer");
                return;
            }
            warn!(
                task_id = %task.id,
                live_task_id = %live.task_id(),
                "Offer already outstanding, dropping alert"
            );
            self.emit(OfferEvent::Dropped { task_id: task.id });
            return;
        }
        if self.status.current() == OfferState::Accepted {
            warn!(task_id = %task.id, "Busy with an accepted task, dropping alert");
            self.emit(OfferEvent::Dropped { task_id: task.id });
            return;
        }

        if let Some(window) = task.offer_window_secs.filter(|w| !is_valid_window(*w)) {
            warn!(
                task_id = %task.id,
                window_secs = window,
                "Alert window out of range, using configured window"
            );
        }
        let offer = TaskOffer::new(task, self.worker_id.clone(), self.config.window_secs);
        let window = offer.window();
        info!(
            task_id = %offer.task_id(),
            window_secs = window.as_secs(),
            urgency = ?offer.urgency(),
            "Offer received"
        );

        self.status.settle(OfferState::Offered);
        self.clock_expired = None;
        self.deadline = Some(Instant::now() + window);
        self.arm(window);
        self.offer = Some(offer.clone());
        self.emit(OfferEvent::Offered { offer });
        self.publish();
    }

    /// Start the countdown and the display ticker for the live offer.
    fn arm(&mut self, remaining: Duration) {
        self.generation += 1;
        let generation = self.generation;
        self.countdown = Timer::once(
            remaining,
            self.inputs.clone(),
            OfferInput::Countdown { generation },
        );
        if self.config.countdown_ticks {
            self.ticker = Timer::every(Duration::from_secs(1), self.inputs.clone(), move || {
                OfferInput::Tick { generation }
            });
        }
    }

    fn stop_timers(&mut self) {
        self.countdown.cancel();
        self.ticker.cancel();
        self.generation += 1;
    }

    fn on_accept(&mut self) {
        if self.status.current() != OfferState::Offered {
            warn!(state = ?self.status.current(), "Accept without a live offer");
            return;
        }
        let Some(offer) = self.offer.clone() else {
            return;
        };
        if let Err(e) = self.status.propose(OfferState::Accepted) {
            warn!(error = %e, "Accept refused");
            return;
        }
        // Lock out the countdown before anything leaves the device.
        self.stop_timers();

        info!(task_id = %offer.task_id(), "Accepting offer");
        self.channel.send_event(&ClientEvent::Accept {
            task_id: offer.task_id().clone(),
        });
        self.persist_accept(&offer);
        self.publish();
    }

    fn persist_accept(&self, offer: &TaskOffer) {
        let api = self.api.clone();
        let inputs = self.inputs.clone();
        let task_id = offer.task_id().clone();
        let offer_id = offer.id.clone();
        tokio::spawn(async move {
            let result = api.accept(&task_id).await;
            let _ = inputs.send(OfferInput::AcceptResolved {
                offer: offer_id,
                result,
            });
        });
    }

    fn on_accept_resolved(&mut self, offer_id: OfferId, result: Result<(), ClientError>) {
        let Some(offer) = self.offer.clone().filter(|o| o.id == offer_id) else {
            debug!(offer_id = %offer_id, "Ignoring accept result for another offer");
            return;
        };
        if self.status.pending() != Some(OfferState::Accepted) {
            debug!(task_id = %offer.task_id(), "Accept already resolved");
            return;
        }

        let err = match result {
            Ok(()) => {
                self.commit_accepted(offer);
                return;
            }
            Err(e) => e,
        };

        match &err {
            ClientError::Conflict(_) => {
                info!(task_id = %offer.task_id(), "Accept lost the race");
                self.finish(offer, OfferState::Expired, OfferOutcome::NoLongerAvailable);
            }
            ClientError::Gone(_) | ClientError::NotFound(_) => {
                info!(task_id = %offer.task_id(), "Task no longer exists");
                self.finish(offer, OfferState::Cancelled, OfferOutcome::NoLongerAvailable);
            }
            e if e.category() == FailureCategory::Transport => {
                warn!(
                    task_id = %offer.task_id(),
                    error = %e,
                    "Accept not persisted, will retry after reconnect"
                );
                self.retry_accept = true;
            }
            e => {
                warn!(task_id = %offer.task_id(), error = %e, "Accept rejected");
                self.status.reject();
                self.emit(OfferEvent::AcceptRejected {
                    task_id: offer.task_id().clone(),
                    category: e.category(),
                    message: e.to_string(),
                });
                let remaining = self
                    .deadline
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or_default();
                if remaining.is_zero() {
                    self.resolve_expired(offer, ExpiryCause::Clock);
                } else {
                    self.arm(remaining);
                    self.publish();
                }
            }
        }
    }

    fn on_reconnected(&mut self) {
        if !self.retry_accept || self.status.pending() != Some(OfferState::Accepted) {
            return;
        }
        if let Some(offer) = self.offer.clone() {
            info!(task_id = %offer.task_id(), "Retrying accept after reconnect");
            self.retry_accept = false;
            self.persist_accept(&offer);
        }
    }

    fn on_decline(&mut self, reason: String) {
        if self.status.current() != OfferState::Offered {
            warn!(state = ?self.status.current(), "Decline without a live offer");
            return;
        }
        let Some(offer) = self.offer.clone() else {
            return;
        };
        let task_id = offer.task_id().clone();
        self.channel.send_event(&ClientEvent::Decline {
            task_id: task_id.clone(),
            reason: reason.clone(),
        });

        let api = self.api.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = api.decline(&task_id, &reason).await;
            let _ = inputs.send(OfferInput::DeclineResolved { task_id, result });
        });

        self.finish(offer, OfferState::Declined, OfferOutcome::Declined);
    }

    fn on_dismiss(&mut self) {
        if self.status.current() != OfferState::Offered {
            return;
        }
        if let Some(offer) = self.offer.clone() {
            self.resolve_expired(offer, ExpiryCause::Dismissed);
        }
    }

    fn on_countdown(&mut self, generation: u64) {
        if generation != self.generation || self.status.current() != OfferState::Offered {
            debug!(generation = generation, "Ignoring stale countdown");
            return;
        }
        if let Some(offer) = self.offer.clone() {
            self.resolve_expired(offer, ExpiryCause::Clock);
        }
    }

    fn on_tick(&mut self, generation: u64) {
        if generation != self.generation || self.status.current() != OfferState::Offered {
            return;
        }
        let (Some(offer), Some(deadline)) = (&self.offer, self.deadline) else {
            return;
        };
        let remaining_secs = deadline.saturating_duration_since(Instant::now()).as_secs();
        let task_id = offer.task_id().clone();
        self.emit(OfferEvent::Tick {
            task_id,
            remaining_secs,
        });
    }

    /// Timeout and dismissal share this path.
    ///
    /// A clock expiry is held as a pending `Expired` for the grace period; the
    /// offer is reported only once that runs out or the server decides.
    fn resolve_expired(&mut self, offer: TaskOffer, cause: ExpiryCause) {
        let grace = self.config.expiry_grace();
        if cause == ExpiryCause::Dismissed
            || grace.is_zero()
            || self.status.propose(OfferState::Expired).is_err()
        {
            self.finish(offer, OfferState::Expired, OfferOutcome::Expired);
            return;
        }

        self.stop_timers();
        self.deadline = None;
        debug!(
            task_id = %offer.task_id(),
            grace_secs = grace.as_secs(),
            "Offer expired locally, awaiting late confirmation"
        );
        self.countdown = Timer::once(
            grace,
            self.inputs.clone(),
            OfferInput::ExpiryGrace {
                generation: self.generation,
            },
        );
        self.clock_expired = Some(offer);
        self.publish();
    }

    fn on_expiry_grace(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        self.finish_clock_expiry();
    }

    fn finish_clock_expiry(&mut self) {
        if let Some(offer) = self.clock_expired.take() {
            self.finish(offer, OfferState::Expired, OfferOutcome::Expired);
        }
    }

    fn on_task_cancelled(&mut self, task_id: TaskId) {
        if let Some(offer) = self
            .live_offer()
            .filter(|o| o.task_id() == &task_id)
            .cloned()
        {
            info!(task_id = %task_id, "Task cancelled while offered");
            self.finish(offer, OfferState::Cancelled, OfferOutcome::NoLongerAvailable);
            return;
        }
        if let Some(offer) = self.take_clock_expired(&task_id) {
            info!(task_id = %task_id, "Task cancelled after local expiry");
            self.finish(offer, OfferState::Cancelled, OfferOutcome::NoLongerAvailable);
            return;
        }
        debug!(task_id = %task_id, "Ignoring cancellation for task without a live offer");
    }

    fn on_accept_confirmed(&mut self, task_id: TaskId) {
        if let Some(offer) = self
            .live_offer()
            .filter(|o| o.task_id() == &task_id)
            .cloned()
        {
            self.commit_accepted(offer);
            return;
        }
        if let Some(offer) = self.take_clock_expired(&task_id) {
            info!(task_id = %task_id, "Server confirmed accept after local expiry");
            self.commit_accepted(offer);
            return;
        }
        debug!(task_id = %task_id, "Ignoring confirmation for task without a live offer");
    }

    fn take_clock_expired(&mut self, task_id: &TaskId) -> Option<TaskOffer> {
        if self
            .clock_expired
            .as_ref()
            .is_some_and(|o| o.task_id() == task_id)
        {
            self.clock_expired.take()
        } else {
            None
        }
    }

    fn commit_accepted(&mut self, offer: TaskOffer) {
        self.offer = Some(offer.clone());
        self.finish(offer, OfferState::Accepted, OfferOutcome::Accepted);
    }

    /// Apply a terminal state for `offer` and report it once.
    fn finish(&mut self, offer: TaskOffer, terminal: OfferState, outcome: OfferOutcome) {
        self.stop_timers();
        self.retry_accept = false;
        self.deadline = None;
        self.clock_expired = None;
        self.status.settle(terminal);
        self.last_outcome = Some(outcome);

        let task_id = offer.task_id().clone();
        info!(task_id = %task_id, state = ?terminal, outcome = ?outcome, "Offer resolved");
        if !self.resolved.contains(&task_id) {
            self.resolved.push_back(task_id);
            if self.resolved.len() > RESOLVED_MEMORY {
                self.resolved.pop_front();
            }
        }
        self.emit(OfferEvent::Resolved { offer, outcome });

        if terminal != OfferState::Accepted {
            self.offer = None;
            self.status.settle(self.pool_state());
        }
        self.publish();
    }

    fn pool_state(&self) -> OfferState {
        if self.available {
            OfferState::Searching
        } else {
            OfferState::Idle
        }
    }

    fn set_available(&mut self, available: bool) {
        self.available = available;
        match self.status.current() {
            OfferState::Idle | OfferState::Searching => {}
            // Callers leave Accepted only once the accepted task has ended.
            OfferState::Accepted if !self.status.is_pending() => {
                self.offer = None;
            }
            _ => return,
        }
        self.status.settle(self.pool_state());
        self.publish();
    }

    fn shutdown(&mut self) {
        self.stop_timers();
        for id in self.handlers.drain(..) {
            self.channel.off(id);
        }
        self.stopped = true;
    }

    fn emit(&self, event: OfferEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(OfferSnapshot {
            state: self.status.current(),
            pending: self.status.is_pending(),
            offer: self.offer.clone(),
            last_outcome: self.last_outcome,
        });
    }
}

/// Command side of a running [`OfferCoordinator`].
#[derive(Clone)]
pub struct OfferHandle {
    inputs: mpsc::UnboundedSender<OfferInput>,
    snapshot: watch::Receiver<OfferSnapshot>,
}

impl OfferHandle {
    /// Accept the live offer.
    pub fn accept(&self) -> Result<(), RealtimeError> {
        self.require_offered(OfferState::Accepted)?;
        self.send(OfferInput::Accept)
    }

    pub fn decline(&self, reason: impl Into<String>) -> Result<(), RealtimeError> {
        self.require_offered(OfferState::Declined)?;
        self.send(OfferInput::Decline {
            reason: reason.into(),
        })
    }

    /// Close the offer without answering. Resolves as expired.
    pub fn dismiss(&self) -> Result<(), RealtimeError> {
        self.require_offered(OfferState::Expired)?;
        self.send(OfferInput::Dismiss)
    }

    /// Return to the pool, e.g. after the active task ends.
    pub fn available(&self) -> Result<(), RealtimeError> {
        self.send(OfferInput::Available)
    }

    pub fn unavailable(&self) -> Result<(), RealtimeError> {
        self.send(OfferInput::Unavailable)
    }

    pub fn teardown(&self) {
        let _ = self.inputs.send(OfferInput::Teardown);
    }

    pub fn snapshot(&self) -> OfferSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<OfferSnapshot> {
        self.snapshot.clone()
    }

    fn require_offered(&self, to: OfferState) -> Result<(), RealtimeError> {
        let snapshot = self.snapshot.borrow();
        if snapshot.state != OfferState::Offered || snapshot.pending {
            return Err(CoreError::transition(snapshot.state, to).into());
        }
        Ok(())
    }

    fn send(&self, input: OfferInput) -> Result<(), RealtimeError> {
        self.inputs
            .send(input)
            .map_err(|_| RealtimeError::Stopped("offer coordinator"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryPeer;
    use crate::testing::{connected_channel, drain, sent, settle, ApiCall, MockApi};
    use serde_json::json;

    struct Harness {
        coordinator: OfferCoordinator,
        inputs: mpsc::UnboundedReceiver<OfferInput>,
        events: mpsc::UnboundedReceiver<OfferEvent>,
        api: Arc<MockApi>,
        peer: MemoryPeer,
    }

    async fn harness() -> Harness {
        let (channel, peer, _peers) = connected_channel().await;
        let api = MockApi::new();
        let (mut coordinator, inputs, events) = OfferCoordinator::new(
            WorkerId::new("w1"),
            OfferConfig {
                countdown_ticks: false,
                ..OfferConfig::default()
            },
            channel,
            api.clone(),
        );
        coordinator.handle(OfferInput::Available);
        Harness {
            coordinator,
            inputs,
            events,
            api,
            peer,
        }
    }

    fn alert(id: &str) -> OfferInput {
        OfferInput::Alert(TaskSummary::new(id))
    }

    fn outcomes(events: &[OfferEvent]) -> Vec<OfferOutcome> {
        events
            .iter()
            .filter_map(|e| match e {
                OfferEvent::Resolved { outcome, .. } => Some(*outcome),
                _ => None,
            })
            .collect()
    }

    fn state(c: &OfferCoordinator) -> OfferSnapshot {
        c.snapshot.borrow().clone()
    }

    /// Feed queued timer and REST results back into the coordinator.
    async fn pump(h: &mut Harness) {
        settle().await;
        for input in drain(&mut h.inputs) {
            h.coordinator.handle(input);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_before_deadline() {
        let (channel, mut peer, _peers) = connected_channel().await;
        let api = MockApi::new();
        let (handle, mut events) = OfferCoordinator::spawn(
            WorkerId::new("w1"),
            OfferConfig::default(),
            channel,
            api.clone(),
        );
        handle.available().unwrap();
        peer.push(
            "task:alert",
            json!({ "task": { "id": "T1", "offerWindowSecs": 30 } }),
        )
        .await;
        settle().await;
        assert_eq!(handle.snapshot().state, OfferState::Offered);

        tokio::time::sleep(Duration::from_secs(29)).await;
        handle.accept().unwrap();
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, OfferState::Accepted);
        assert!(!snapshot.pending);
        assert_eq!(
            sent(&peer.drain(), "task:accept"),
            vec![json!({ "taskId": "T1" })]
        );
        assert_eq!(api.count(|c| matches!(c, ApiCall::Accept(_))), 1);

        // The countdown is gone: nothing else resolves.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let events = drain(&mut events);
        assert_eq!(outcomes(&events), vec![OfferOutcome::Accepted]);
        assert!(events.iter().any(|e| matches!(
            e,
            OfferEvent::Tick { remaining_secs: 1, .. }
        )));
        assert_eq!(handle.snapshot().state, OfferState::Accepted);
        assert!(handle.accept().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_then_server_confirmation_resolves_accepted() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));
        let generation = h.coordinator.generation;

        h.coordinator.handle(OfferInput::Countdown { generation });
        h.coordinator.handle(OfferInput::AcceptConfirmed {
            task_id: TaskId::new("T1"),
        });

        let snapshot = state(&h.coordinator);
        assert_eq!(snapshot.state, OfferState::Accepted);
        assert_eq!(snapshot.last_outcome, Some(OfferOutcome::Accepted));
        assert_eq!(
            outcomes(&drain(&mut h.events)),
            vec![OfferOutcome::Accepted]
        );
        assert!(h.api.calls().is_empty());
        assert!(h.peer.drain().is_empty());

        // The grace timer was cancelled with the accept.
        tokio::time::sleep(Duration::from_secs(10)).await;
        pump(&mut h).await;
        assert_eq!(state(&h.coordinator).state, OfferState::Accepted);
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_expiry_reported_once_after_grace() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        pump(&mut h).await;
        let snapshot = state(&h.coordinator);
        assert_eq!(snapshot.state, OfferState::Expired);
        assert!(snapshot.pending);
        assert!(outcomes(&drain(&mut h.events)).is_empty());
        h.coordinator.handle(OfferInput::Accept);
        assert!(sent(&h.peer.drain(), "task:accept").is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        pump(&mut h).await;
        assert_eq!(
            outcomes(&drain(&mut h.events)),
            vec![OfferOutcome::Expired]
        );
        assert_eq!(state(&h.coordinator).state, OfferState::Searching);

        // Past the grace period the confirmation no longer applies.
        h.coordinator.handle(OfferInput::AcceptConfirmed {
            task_id: TaskId::new("T1"),
        });
        assert_eq!(state(&h.coordinator).state, OfferState::Searching);
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_during_grace_reports_expiry_first() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));
        let generation = h.coordinator.generation;
        h.coordinator.handle(OfferInput::Countdown { generation });

        h.coordinator.handle(alert("T1"));
        assert_eq!(state(&h.coordinator).state, OfferState::Expired);

        h.coordinator.handle(alert("T2"));
        let events = drain(&mut h.events);
        assert_eq!(outcomes(&events), vec![OfferOutcome::Expired]);
        assert!(matches!(
            events.last(),
            Some(OfferEvent::Offered { offer }) if offer.task_id().as_str() == "T2"
        ));
        assert_eq!(state(&h.coordinator).state, OfferState::Offered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_alert_window_keeps_coordinator_alive() {
        let (channel, peer, _peers) = connected_channel().await;
        let (handle, mut events) = OfferCoordinator::spawn(
            WorkerId::new("w1"),
            OfferConfig::default(),
            channel,
            MockApi::new(),
        );
        handle.available().unwrap();
        peer.push(
            "task:alert",
            json!({ "task": { "id": "T1", "offerWindowSecs": u64::MAX } }),
        )
        .await;
        peer.push("task:alert", json!({ "task": { "id": "T2" } }))
            .await;
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, OfferState::Offered);
        let offer = snapshot.offer.unwrap();
        assert_eq!(offer.task_id().as_str(), "T1");
        assert_eq!(offer.window(), Duration::from_secs(30));
        assert!(drain(&mut events).contains(&OfferEvent::Dropped {
            task_id: TaskId::new("T2")
        }));

        tokio::time::sleep(Duration::from_secs(33)).await;
        assert_eq!(handle.snapshot().state, OfferState::Searching);
        assert_eq!(
            outcomes(&drain(&mut events)),
            vec![OfferOutcome::Expired]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_confirmation_then_expiry_resolves_accepted() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));
        let generation = h.coordinator.generation;

        h.coordinator.handle(OfferInput::AcceptConfirmed {
            task_id: TaskId::new("T1"),
        });
        h.coordinator.handle(OfferInput::Countdown { generation });

        let snapshot = state(&h.coordinator);
        assert_eq!(snapshot.state, OfferState::Accepted);
        assert_eq!(snapshot.last_outcome, Some(OfferOutcome::Accepted));
        assert_eq!(
            outcomes(&drain(&mut h.events)),
            vec![OfferOutcome::Accepted]
        );
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_accept_races_countdown_once() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));
        let generation = h.coordinator.generation;

        h.coordinator.handle(OfferInput::Accept);
        h.coordinator.handle(OfferInput::Countdown { generation });
        h.coordinator.handle(OfferInput::Accept);
        h.coordinator.handle(OfferInput::AcceptConfirmed {
            task_id: TaskId::new("T1"),
        });
        pump(&mut h).await;

        assert_eq!(state(&h.coordinator).state, OfferState::Accepted);
        assert_eq!(
            outcomes(&drain(&mut h.events)),
            vec![OfferOutcome::Accepted]
        );
        assert_eq!(sent(&h.peer.drain(), "task:accept").len(), 1);
        assert_eq!(h.api.count(|c| matches!(c, ApiCall::Accept(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_all_timers() {
        let mut h = harness().await;
        h.coordinator.config.countdown_ticks = true;
        h.coordinator.handle(alert("T1"));
        h.coordinator.handle(OfferInput::Teardown);
        drain(&mut h.events);
        let before = state(&h.coordinator);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(drain(&mut h.inputs).is_empty());
        h.coordinator.handle(OfferInput::Countdown {
            generation: h.coordinator.generation,
        });
        assert_eq!(state(&h.coordinator), before);
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_expires_and_returns_to_pool() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        pump(&mut h).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        pump(&mut h).await;

        let snapshot = state(&h.coordinator);
        assert_eq!(snapshot.state, OfferState::Searching);
        assert_eq!(snapshot.last_outcome, Some(OfferOutcome::Expired));
        assert!(snapshot.offer.is_none());
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_is_no_longer_available() {
        let mut h = harness().await;
        h.api.fail("accept", 409);
        h.coordinator.handle(alert("T1"));
        h.coordinator.handle(OfferInput::Accept);
        assert!(state(&h.coordinator).pending);
        pump(&mut h).await;

        let events = drain(&mut h.events);
        assert_eq!(outcomes(&events), vec![OfferOutcome::NoLongerAvailable]);
        assert_eq!(state(&h.coordinator).state, OfferState::Searching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_is_no_longer_available() {
        let mut h = harness().await;
        h.api.fail("accept", 410);
        h.coordinator.handle(alert("T1"));
        h.coordinator.handle(OfferInput::Accept);
        pump(&mut h).await;

        assert_eq!(
            outcomes(&drain(&mut h.events)),
            vec![OfferOutcome::NoLongerAvailable]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_reopens_offer() {
        let mut h = harness().await;
        h.api.fail("accept", 403);
        h.coordinator.handle(alert("T1"));
        h.coordinator.handle(OfferInput::Accept);
        pump(&mut h).await;

        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            OfferEvent::AcceptRejected {
                category: FailureCategory::Validation,
                ..
            }
        )));
        assert_eq!(state(&h.coordinator).state, OfferState::Offered);

        tokio::time::sleep(Duration::from_secs(31)).await;
        pump(&mut h).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        pump(&mut h).await;
        assert_eq!(
            state(&h.coordinator).last_outcome,
            Some(OfferOutcome::Expired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_retries_after_reconnect() {
        let (channel, peer, mut peers) = connected_channel().await;
        let api = MockApi::new();
        api.fail("accept", 503);
        let (handle, mut events) = OfferCoordinator::spawn(
            WorkerId::new("w1"),
            OfferConfig::default(),
            channel,
            api.clone(),
        );
        handle.available().unwrap();
        peer.push("task:alert", json!({ "task": { "id": "T1" } }))
            .await;
        settle().await;
        handle.accept().unwrap();
        settle().await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.state, OfferState::Accepted);
        assert!(snapshot.pending);

        drop(peer);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(peers.try_recv().is_ok());

        assert_eq!(api.count(|c| matches!(c, ApiCall::Accept(_))), 2);
        assert!(!handle.snapshot().pending);
        assert_eq!(
            outcomes(&drain(&mut events)),
            vec![OfferOutcome::Accepted]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_alert_is_dropped() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));
        h.coordinator.handle(alert("T2"));

        let events = drain(&mut h.events);
        assert!(events.contains(&OfferEvent::Dropped {
            task_id: TaskId::new("T2")
        }));
        let offer = state(&h.coordinator).offer.unwrap();
        assert_eq!(offer.task_id().as_str(), "T1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_cancellation_resolves_live_offer() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));
        h.coordinator.handle(OfferInput::TaskCancelled {
            task_id: TaskId::new("T9"),
        });
        assert_eq!(state(&h.coordinator).state, OfferState::Offered);

        h.coordinator.handle(OfferInput::TaskCancelled {
            task_id: TaskId::new("T1"),
        });
        assert_eq!(
            outcomes(&drain(&mut h.events)),
            vec![OfferOutcome::NoLongerAvailable]
        );

        // A repeated alert for the same task is ignored.
        h.coordinator.handle(alert("T1"));
        assert_eq!(state(&h.coordinator).state, OfferState::Searching);
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decline_cancels_countdown() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));
        h.coordinator.handle(OfferInput::Decline {
            reason: "too far".into(),
        });

        tokio::time::sleep(Duration::from_secs(40)).await;
        pump(&mut h).await;

        assert_eq!(
            outcomes(&drain(&mut h.events)),
            vec![OfferOutcome::Declined]
        );
        assert_eq!(
            sent(&h.peer.drain(), "task:decline"),
            vec![json!({ "taskId": "T1", "reason": "too far" })]
        );
        assert_eq!(
            h.api.calls(),
            vec![ApiCall::Decline(TaskId::new("T1"), "too far".into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_resolves_as_expired() {
        let mut h = harness().await;
        h.coordinator.handle(alert("T1"));
        h.coordinator.handle(OfferInput::Dismiss);
        h.coordinator.handle(OfferInput::Dismiss);

        assert_eq!(
            outcomes(&drain(&mut h.events)),
            vec![OfferOutcome::Expired]
        );
        // Dismissal is not a clock expiry, so no server override applies.
        h.coordinator.handle(OfferInput::AcceptConfirmed {
            task_id: TaskId::new("T1"),
        });
        assert_eq!(state(&h.coordinator).state, OfferState::Searching);
    }
}
