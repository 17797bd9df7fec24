//! Active-task tracking.
//!
//! Follows one matched task from assignment to completion for either side of
//! the match. Server status pushes are authoritative and forward-only; local
//! actions are applied optimistically and rolled back if the server rejects
//! them.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use taskmatch_client::{ClientError, HelperApi, TaskApi};
use taskmatch_core::event::names;
use taskmatch_core::{
    ActiveTask, ClientEvent, CoreError, FailureCategory, GeoPoint, ServerEvent, TaskId,
    TaskSnapshot, TaskStatus,
};

use crate::channel::{forward_events, ChannelManager, HandlerId};
use crate::config::TrackerConfig;
use crate::error::RealtimeError;
use crate::optimistic::Optimistic;

/// Distance and travel time to a destination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteEstimate {
    pub distance_m: f64,
    pub eta_secs: u64,
}

/// Routed-distance collaborator.
pub trait RouteEstimator: Send + Sync {
    fn estimate(&self, from: &GeoPoint, to: &GeoPoint) -> RouteEstimate;
}

/// Great-circle distance at a constant average speed.
#[derive(Debug, Clone)]
pub struct StraightLineEstimator {
    speed_mps: f64,
}

impl StraightLineEstimator {
    pub fn new(speed_mps: f64) -> Self {
        Self { speed_mps }
    }
}

impl RouteEstimator for StraightLineEstimator {
    fn estimate(&self, from: &GeoPoint, to: &GeoPoint) -> RouteEstimate {
        let distance_m = from.distance_to(to);
        let eta_secs = if self.speed_mps > 0.0 {
            (distance_m / self.speed_mps).round() as u64
        } else {
            0
        };
        RouteEstimate {
            distance_m,
            eta_secs,
        }
    }
}

/// Which side of the match this tracker serves.
pub enum TrackerRole {
    /// The worker: own position comes from the location reporter.
    Worker {
        api: Arc<dyn HelperApi>,
        position: watch::Receiver<Option<GeoPoint>>,
    },
    /// The requester: worker position comes from `helper:location` pushes.
    Requester,
}

/// Collaborators shared by every tracker.
#[derive(Clone)]
pub struct TrackerDeps {
    pub channel: ChannelManager,
    pub tasks: Arc<dyn TaskApi>,
    pub estimator: Arc<dyn RouteEstimator>,
    pub config: TrackerConfig,
}

impl TrackerDeps {
    pub fn new(channel: ChannelManager, tasks: Arc<dyn TaskApi>, config: TrackerConfig) -> Self {
        Self {
            estimator: Arc::new(StraightLineEstimator::new(config.average_speed_mps)),
            channel,
            tasks,
            config,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn RouteEstimator>) -> Self {
        self.estimator = estimator;
        self
    }
}

/// A local action that waits for server confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerAction {
    Arrive,
    Start,
    Complete,
    Cancel,
}

impl TrackerAction {
    fn target(&self) -> TaskStatus {
        match self {
            Self::Arrive => TaskStatus::WorkerArrived,
            Self::Start => TaskStatus::InProgress,
            Self::Complete => TaskStatus::Completed,
            Self::Cancel => TaskStatus::Cancelled,
        }
    }
}

#[derive(Debug)]
pub enum TrackerInput {
    Status(TaskStatus),
    HelperLocation {
        location: GeoPoint,
        eta: Option<u64>,
        distance: Option<f64>,
    },
    Position(GeoPoint),
    Action {
        action: TrackerAction,
        otp: Option<String>,
        reason: Option<String>,
    },
    ActionResolved {
        action: TrackerAction,
        result: Result<(), ClientError>,
    },
    Reconciled(Result<TaskSnapshot, ClientError>),
    /// Fetch the server's view once, e.g. right after a handoff.
    Refresh,
    Reconnected,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerEvent {
    Status {
        task_id: TaskId,
        status: TaskStatus,
        confirmed: bool,
    },
    Location {
        task_id: TaskId,
        location: GeoPoint,
        eta_secs: Option<u64>,
        distance_m: Option<f64>,
    },
    NearDestination {
        task_id: TaskId,
        distance_m: f64,
    },
    ActionRejected {
        task_id: TaskId,
        action: TrackerAction,
        category: FailureCategory,
        message: String,
    },
    /// The server no longer knows the task; local state was dropped.
    Discarded {
        task_id: TaskId,
    },
    Finished {
        task_id: TaskId,
        status: TaskStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub task: ActiveTask,
    pub pending: Option<TaskStatus>,
    pub finished: bool,
}

enum Role {
    Worker(Arc<dyn HelperApi>),
    Requester,
}

pub struct ActiveTaskTracker {
    role: Role,
    deps: TrackerDeps,
    task: ActiveTask,
    status: Optimistic<TaskStatus>,
    position: Option<watch::Receiver<Option<GeoPoint>>>,
    near_notified: bool,
    reconciling: bool,
    /// Bumped for every local action.
    action_seq: u64,
    /// Action whose REST call has not answered yet.
    in_flight: Option<TrackerAction>,
    /// Pending action the running reconciliation may roll back.
    checked_action: Option<u64>,
    subscribed: bool,
    inputs: mpsc::UnboundedSender<TrackerInput>,
    events: mpsc::UnboundedSender<TrackerEvent>,
    snapshot: watch::Sender<TrackerSnapshot>,
    handlers: Vec<HandlerId>,
    stopped: bool,
}

impl ActiveTaskTracker {
    /// Start tracking `task`. The task topic is subscribed before this returns.
    pub fn spawn(
        task: ActiveTask,
        role: TrackerRole,
        deps: TrackerDeps,
    ) -> (TrackerHandle, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (tracker, inputs, events) = Self::new(task, role, deps);
        let handle = TrackerHandle {
            task_id: tracker.task.task_id.clone(),
            is_worker: tracker.is_worker(),
            inputs: tracker.inputs.clone(),
            snapshot: tracker.snapshot.subscribe(),
        };
        tokio::spawn(tracker.run(inputs));
        (handle, events)
    }

    fn new(
        task: ActiveTask,
        role: TrackerRole,
        deps: TrackerDeps,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<TrackerInput>,
        mpsc::UnboundedReceiver<TrackerEvent>,
    ) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let (role, position) = match role {
            TrackerRole::Worker { api, position } => (Role::Worker(api), Some(position)),
            TrackerRole::Requester => (Role::Requester, None),
        };

        let mut events: Vec<&'static str> = vec![names::TASK_STATUS_UPDATE, names::TASK_CANCELLED];
        if matches!(role, Role::Requester) {
            events.push(names::HELPER_LOCATION);
        }
        let own_task = task.task_id.clone();
        let handlers = forward_events(&deps.channel, &events, input_tx.clone(), move |event| {
            if event.task_id().is_some_and(|id| id != &own_task) {
                return None;
            }
            match event {
                ServerEvent::StatusUpdate(update) => Some(TrackerInput::Status(update.status)),
                ServerEvent::TaskCancelled(_) => Some(TrackerInput::Status(TaskStatus::Cancelled)),
                ServerEvent::HelperLocation(loc) => Some(TrackerInput::HelperLocation {
                    location: loc.location,
                    eta: loc.eta,
                    distance: loc.distance,
                }),
                _ => None,
            }
        });

        deps.channel.subscribe(task.task_id.topic());

        let status = Optimistic::new(task.confirmed_status);
        let (snapshot, _) = watch::channel(TrackerSnapshot {
            task: task.clone(),
            pending: None,
            finished: false,
        });
        let tracker = Self {
            role,
            deps,
            task,
            status,
            position,
            near_notified: false,
            reconciling: false,
            action_seq: 0,
            in_flight: None,
            checked_action: None,
            subscribed: true,
            inputs: input_tx,
            events: event_tx,
            snapshot,
            handlers,
            stopped: false,
        };
        (tracker, input_rx, event_rx)
    }

    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<TrackerInput>) {
        let mut reconnects = self.deps.channel.reconnects();
        let mut position = self.position.take();
        let initial = position.as_ref().and_then(|rx| *rx.borrow());
        if let Some(point) = initial {
            self.handle(TrackerInput::Position(point));
        }
        while !self.stopped {
            let input = tokio::select! {
                Some(input) = inputs.recv() => input,
                Some(_) = reconnects.next() => TrackerInput::Reconnected,
                Some(point) = next_position(&mut position) => TrackerInput::Position(point),
                else => break,
            };
            self.handle(input);
        }
        self.shutdown();
        debug!(task_id = %self.task.task_id, "Tracker stopped");
    }

    pub(crate) fn handle(&mut self, input: TrackerInput) {
        if self.stopped {
            return;
        }
        match input {
            TrackerInput::Status(status) => {
                self.apply_status(status);
                self.finish_if_terminal();
            }
            TrackerInput::HelperLocation {
                location,
                eta,
                distance,
            } => self.on_location(location, eta, distance),
            TrackerInput::Position(point) => self.on_location(point, None, None),
            TrackerInput::Action {
                action,
                otp,
                reason,
            } => {
                if let Err(e) = self.begin(action, otp, reason) {
                    warn!(
                        task_id = %self.task.task_id,
                        action = ?action,
                        error = %e,
                        "Action refused"
                    );
                }
            }
            TrackerInput::ActionResolved { action, result } => {
                self.on_action_resolved(action, result)
            }
            TrackerInput::Refresh => self.reconcile("Fetching task state"),
            TrackerInput::Reconnected => self.reconcile("Reconciling task after reconnect"),
            TrackerInput::Reconciled(result) => self.on_reconciled(result),
            TrackerInput::Teardown => self.shutdown(),
        }
    }

    /// Apply a server status. Returns true if it moved the confirmed state.
    fn apply_status(&mut self, next: TaskStatus) -> bool {
        let confirmed = self.status.confirmed();
        if !confirmed.precedes(next) {
            debug!(
                task_id = %self.task.task_id,
                confirmed = confirmed.as_str(),
                status = next.as_str(),
                "Ignoring stale status"
            );
            return false;
        }

        match self.status.pending() {
            Some(pending) if next == TaskStatus::Cancelled || next.rank() >= pending.rank() => {
                self.status.settle(next)
            }
            Some(_) => self.status.advance(next),
            None => self.status.settle(next),
        }
        info!(task_id = %self.task.task_id, status = next.as_str(), "Task status confirmed");
        self.emit_status(true);
        self.publish();
        true
    }

    fn on_location(&mut self, location: GeoPoint, eta: Option<u64>, distance: Option<f64>) {
        if !location.is_valid() {
            warn!(task_id = %self.task.task_id, "Ignoring invalid location");
            return;
        }
        let estimate = self
            .task
            .destination
            .map(|dest| self.deps.estimator.estimate(&location, &dest));
        let eta = eta.or(estimate.map(|e| e.eta_secs));
        let distance = distance.or(estimate.map(|e| e.distance_m));

        self.task.record_location(location, eta, distance);
        self.emit(TrackerEvent::Location {
            task_id: self.task.task_id.clone(),
            location,
            eta_secs: eta,
            distance_m: distance,
        });

        if let Some(distance_m) = distance {
            if !self.near_notified
                && self.status.confirmed() == TaskStatus::WorkerArriving
                && distance_m <= self.deps.config.arrival_radius_m
            {
                self.near_notified = true;
                info!(task_id = %self.task.task_id, distance_m, "Worker near destination");
                self.emit(TrackerEvent::NearDestination {
                    task_id: self.task.task_id.clone(),
                    distance_m,
                });
            }
        }
        self.publish();
    }

    fn begin(
        &mut self,
        action: TrackerAction,
        otp: Option<String>,
        reason: Option<String>,
    ) -> Result<(), CoreError> {
        check_action(
            action,
            self.status.confirmed(),
            self.status.pending(),
            self.is_worker(),
        )?;
        self.status.propose(action.target())?;
        self.action_seq += 1;
        info!(task_id = %self.task.task_id, action = ?action, "Applying action optimistically");
        self.emit_status(false);
        self.publish();

        let task_id = self.task.task_id.clone();
        let inputs = self.inputs.clone();
        match action {
            TrackerAction::Arrive => {
                self.deps.channel.send_event(&ClientEvent::Arrived { task_id });
            }
            TrackerAction::Start => {
                self.deps.channel.send_event(&ClientEvent::Start {
                    task_id: task_id.clone(),
                });
                if let Role::Worker(api) = &self.role {
                    self.in_flight = Some(action);
                    let api = api.clone();
                    tokio::spawn(async move {
                        let result = api.start(&task_id).await;
                        let _ = inputs.send(TrackerInput::ActionResolved { action, result });
                    });
                }
            }
            TrackerAction::Complete => {
                let otp = otp.unwrap_or_default();
                self.deps.channel.send_event(&ClientEvent::Complete {
                    task_id: task_id.clone(),
                    otp: otp.clone(),
                });
                if let Role::Worker(api) = &self.role {
                    self.in_flight = Some(action);
                    let api = api.clone();
                    tokio::spawn(async move {
                        let result = api.complete(&task_id, &otp).await;
                        let _ = inputs.send(TrackerInput::ActionResolved { action, result });
                    });
                }
            }
            TrackerAction::Cancel => {
                self.in_flight = Some(action);
                let tasks = self.deps.tasks.clone();
                tokio::spawn(async move {
                    let result = tasks.cancel_task(&task_id, reason.as_deref()).await;
                    let _ = inputs.send(TrackerInput::ActionResolved { action, result });
                });
            }
        }
        Ok(())
    }

    fn on_action_resolved(&mut self, action: TrackerAction, result: Result<(), ClientError>) {
        if self.in_flight == Some(action) {
            self.in_flight = None;
        }
        if self.status.pending() != Some(action.target()) {
            debug!(task_id = %self.task.task_id, action = ?action, "Action already settled");
            return;
        }
        match result {
            Ok(()) => {
                self.status.confirm();
                info!(task_id = %self.task.task_id, action = ?action, "Action confirmed");
                self.emit_status(true);
                self.publish();
                self.finish_if_terminal();
            }
            Err(e) if e.category() == FailureCategory::Transport => {
                warn!(
                    task_id = %self.task.task_id,
                    action = ?action,
                    error = %e,
                    "Action not persisted, awaiting server"
                );
            }
            Err(e) => self.roll_back(action, e.category(), e.to_string()),
        }
    }

    fn roll_back(&mut self, action: TrackerAction, category: FailureCategory, message: String) {
        self.status.reject();
        warn!(
            task_id = %self.task.task_id,
            action = ?action,
            category = ?category,
            message = %message,
            "Action rejected, rolled back"
        );
        self.emit(TrackerEvent::ActionRejected {
            task_id: self.task.task_id.clone(),
            action,
            category,
            message,
        });
        self.emit_status(true);
        self.publish();
    }

    /// Fetch the task once. A pending action may only be rolled back by a
    /// fetch that was requested after the action began.
    fn reconcile(&mut self, reason: &'static str) {
        if self.reconciling {
            return;
        }
        info!(task_id = %self.task.task_id, "{}", reason);
        self.reconciling = true;
        self.checked_action = self.status.is_pending().then_some(self.action_seq);
        let tasks = self.deps.tasks.clone();
        let inputs = self.inputs.clone();
        let task_id = self.task.task_id.clone();
        tokio::spawn(async move {
            let result = tasks.get_task(&task_id).await;
            let _ = inputs.send(TrackerInput::Reconciled(result));
        });
    }

    fn on_reconciled(&mut self, result: Result<TaskSnapshot, ClientError>) {
        self.reconciling = false;
        let checked = self.checked_action.take();
        match result {
            Ok(snapshot) => {
                if self.task.destination.is_none() {
                    self.task.destination = snapshot.destination;
                }
                if let Some(status) = snapshot.status {
                    self.apply_status(status);
                }
                if let Some(pending) = self.status.pending() {
                    let action = match pending {
                        TaskStatus::WorkerArrived => TrackerAction::Arrive,
                        TaskStatus::InProgress => TrackerAction::Start,
                        TaskStatus::Completed => TrackerAction::Complete,
                        _ => TrackerAction::Cancel,
                    };
                    let stale = checked == Some(self.action_seq) && self.in_flight != Some(action);
                    if stale {
                        self.roll_back(
                            action,
                            FailureCategory::StaleState,
                            "not confirmed by server".to_string(),
                        );
                    } else {
                        debug!(
                            task_id = %self.task.task_id,
                            action = ?action,
                            "Pending action still awaiting its answer"
                        );
                    }
                }
                if let Some(location) = snapshot.worker_location {
                    self.on_location(location, None, None);
                }
                self.finish_if_terminal();
            }
            Err(e) if e.category() == FailureCategory::StaleState => {
                warn!(task_id = %self.task.task_id, "Task unknown to server, discarding");
                self.emit(TrackerEvent::Discarded {
                    task_id: self.task.task_id.clone(),
                });
                self.shutdown();
                self.publish();
            }
            Err(e) => warn!(task_id = %self.task.task_id, error = %e, "Reconciliation failed"),
        }
    }

    fn finish_if_terminal(&mut self) {
        let status = self.status.confirmed();
        if self.stopped || !status.is_terminal() {
            return;
        }
        info!(task_id = %self.task.task_id, status = status.as_str(), "Task finished");
        self.emit(TrackerEvent::Finished {
            task_id: self.task.task_id.clone(),
            status,
        });
        self.shutdown();
        self.publish();
    }

    fn shutdown(&mut self) {
        for id in self.handlers.drain(..) {
            self.deps.channel.off(id);
        }
        if self.subscribed {
            self.deps.channel.unsubscribe(&self.task.task_id.topic());
            self.subscribed = false;
        }
        self.stopped = true;
    }

    fn is_worker(&self) -> bool {
        matches!(self.role, Role::Worker(_))
    }

    fn emit_status(&self, confirmed: bool) {
        let status = if confirmed {
            self.status.confirmed()
        } else {
            self.status.current()
        };
        self.emit(TrackerEvent::Status {
            task_id: self.task.task_id.clone(),
            status,
            confirmed,
        });
    }

    fn emit(&self, event: TrackerEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        self.task.status = self.status.current();
        self.task.confirmed_status = self.status.confirmed();
        self.snapshot.send_replace(TrackerSnapshot {
            task: self.task.clone(),
            pending: self.status.pending(),
            finished: self.stopped,
        });
    }
}

async fn next_position(
    position: &mut Option<watch::Receiver<Option<GeoPoint>>>,
) -> Option<GeoPoint> {
    let Some(rx) = position else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        *position = None;
        return None;
    }
    *rx.borrow_and_update()
}

/// Check that `action` may start from the given state.
fn check_action(
    action: TrackerAction,
    confirmed: TaskStatus,
    pending: Option<TaskStatus>,
    is_worker: bool,
) -> Result<(), CoreError> {
    if let Some(pending) = pending {
        return Err(CoreError::ActionPending(pending.as_str().to_string()));
    }
    let allowed = match action {
        TrackerAction::Arrive => {
            is_worker && matches!(confirmed, TaskStatus::Assigned | TaskStatus::WorkerArriving)
        }
        TrackerAction::Start => is_worker && confirmed == TaskStatus::WorkerArrived,
        TrackerAction::Complete => is_worker && confirmed == TaskStatus::InProgress,
        TrackerAction::Cancel => !is_worker && confirmed.is_active(),
    };
    if allowed {
        Ok(())
    } else {
        Err(CoreError::transition(confirmed, action.target()))
    }
}

/// Command side of a running [`ActiveTaskTracker`].
#[derive(Clone)]
pub struct TrackerHandle {
    task_id: TaskId,
    is_worker: bool,
    inputs: mpsc::UnboundedSender<TrackerInput>,
    snapshot: watch::Receiver<TrackerSnapshot>,
}

impl TrackerHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Worker: confirm arrival at the task location.
    pub fn confirm_arrival(&self) -> Result<(), RealtimeError> {
        self.request(TrackerAction::Arrive, None, None)
    }

    /// Worker: start the work.
    pub fn start(&self) -> Result<(), RealtimeError> {
        self.request(TrackerAction::Start, None, None)
    }

    /// Worker: finish with the requester's one-time code.
    pub fn complete(&self, otp: impl Into<String>) -> Result<(), RealtimeError> {
        let otp = otp.into();
        if otp.trim().is_empty() {
            return Err(CoreError::InvalidInput("completion code is empty".to_string()).into());
        }
        self.request(TrackerAction::Complete, Some(otp), None)
    }

    /// Requester: cancel the task.
    pub fn cancel(&self, reason: Option<String>) -> Result<(), RealtimeError> {
        self.request(TrackerAction::Cancel, None, reason)
    }

    /// Fetch the server's view of the task once.
    pub fn refresh(&self) {
        let _ = self.inputs.send(TrackerInput::Refresh);
    }

    pub fn teardown(&self) {
        let _ = self.inputs.send(TrackerInput::Teardown);
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TrackerSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.snapshot.borrow().finished
    }

    fn request(
        &self,
        action: TrackerAction,
        otp: Option<String>,
        reason: Option<String>,
    ) -> Result<(), RealtimeError> {
        {
            let snapshot = self.snapshot.borrow();
            if snapshot.finished {
                return Err(RealtimeError::Stopped("tracker"));
            }
            check_action(
                action,
                snapshot.task.confirmed_status,
                snapshot.pending,
                self.is_worker,
            )?;
        }
        self.inputs
            .send(TrackerInput::Action {
                action,
                otp,
                reason,
            })
            .map_err(|_| RealtimeError::Stopped("tracker"))
    }
}
