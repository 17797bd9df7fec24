//! Per-actor wiring of the components.
//!
//! A [`WorkerSession`] owns presence, the offer coordinator, and the tracker
//! of an accepted task. A [`RequesterSession`] owns the search for one task and
//! hands over to a tracker once matched. Both merge their components' events
//! into one [`SessionEvent`] stream.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use taskmatch_client::{HelperApi, TaskApi};
use taskmatch_core::{
    ActiveTask, ConnectionState, CoreError, OfferOutcome, Presence, TaskId, WorkerId,
};

use crate::channel::ChannelManager;
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::location::{LocationReporter, LocationSource};
use crate::offer::{
    MatchHandle, MatchSession, OfferCoordinator, OfferEvent, OfferHandle, SearchEvent,
};
use crate::presence::PresenceController;
use crate::tracker::{ActiveTaskTracker, TrackerDeps, TrackerEvent, TrackerHandle, TrackerRole};

/// Everything a session reports, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SessionEvent {
    Connection { state: ConnectionState },
    Presence { presence: Presence },
    Offer(OfferEvent),
    Search(SearchEvent),
    Task(TrackerEvent),
}

impl SessionEvent {
    /// Short name for line-oriented output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Presence { .. } => "presence",
            Self::Offer(_) => "offer",
            Self::Search(_) => "search",
            Self::Task(_) => "task",
        }
    }
}

struct Tracked {
    handle: TrackerHandle,
    events: mpsc::UnboundedReceiver<TrackerEvent>,
}

impl Tracked {
    /// Start a tracker for a task that was just handed over.
    ///
    /// Pushes that arrived before the tracker listened are not replayed, so
    /// the tracker fetches the task once.
    fn spawn(task: ActiveTask, role: TrackerRole, deps: TrackerDeps) -> Self {
        let (handle, events) = ActiveTaskTracker::spawn(task, role, deps);
        handle.refresh();
        Self { handle, events }
    }
}

async fn next_tracker_event(tracked: &mut Option<Tracked>) -> Option<TrackerEvent> {
    let Some(current) = tracked else {
        return std::future::pending().await;
    };
    match current.events.recv().await {
        Some(event) => Some(event),
        None => {
            *tracked = None;
            None
        }
    }
}

async fn changed<T: Copy>(rx: &mut watch::Receiver<T>) -> Option<T> {
    rx.changed().await.ok()?;
    Some(*rx.borrow_and_update())
}

fn require_channel(channel: &ChannelManager) -> Result<(), RealtimeError> {
    if channel.state() == ConnectionState::Disconnected {
        return Err(RealtimeError::Offline);
    }
    Ok(())
}

fn no_active_task() -> RealtimeError {
    CoreError::TaskNotFound("no active task".to_string()).into()
}

pub struct WorkerSession {
    worker_id: WorkerId,
    config: RealtimeConfig,
    channel: ChannelManager,
    api: Arc<dyn HelperApi>,
    tasks: Arc<dyn TaskApi>,
    presence: PresenceController,
    presence_rx: watch::Receiver<Presence>,
    offers: OfferHandle,
    offer_events: mpsc::UnboundedReceiver<OfferEvent>,
    tracked: Option<Tracked>,
    connection: watch::Receiver<ConnectionState>,
}

impl WorkerSession {
    pub fn new(
        worker_id: WorkerId,
        config: RealtimeConfig,
        channel: ChannelManager,
        api: Arc<dyn HelperApi>,
        tasks: Arc<dyn TaskApi>,
        source: Arc<dyn LocationSource>,
    ) -> Self {
        let reporter = LocationReporter::new(
            config.location.clone(),
            channel.clone(),
            api.clone(),
            source,
        );
        let presence =
            PresenceController::new(worker_id.clone(), channel.clone(), api.clone(), reporter);
        let (offers, offer_events) = OfferCoordinator::spawn(
            worker_id.clone(),
            config.offer.clone(),
            channel.clone(),
            api.clone(),
        );
        Self {
            presence_rx: presence.watch(),
            connection: channel.connection_state(),
            worker_id,
            config,
            channel,
            api,
            tasks,
            presence,
            offers,
            offer_events,
            tracked: None,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn go_online(&mut self) -> Result<(), RealtimeError> {
        self.presence.go_online()?;
        if self.tracked.is_none() {
            self.offers.available()?;
        }
        Ok(())
    }

    pub fn go_offline(&mut self) -> Result<(), RealtimeError> {
        self.presence.go_offline();
        if self.tracked.is_none() {
            self.offers.unavailable()?;
        }
        Ok(())
    }

    pub fn accept(&self) -> Result<(), RealtimeError> {
        require_channel(&self.channel)?;
        self.offers.accept()
    }

    pub fn decline(&self, reason: impl Into<String>) -> Result<(), RealtimeError> {
        require_channel(&self.channel)?;
        self.offers.decline(reason)
    }

    pub fn dismiss(&self) -> Result<(), RealtimeError> {
        self.offers.dismiss()
    }

    pub fn confirm_arrival(&self) -> Result<(), RealtimeError> {
        require_channel(&self.channel)?;
        self.tracker().ok_or_else(no_active_task)?.confirm_arrival()
    }

    pub fn start(&self) -> Result<(), RealtimeError> {
        require_channel(&self.channel)?;
        self.tracker().ok_or_else(no_active_task)?.start()
    }

    pub fn complete(&self, otp: impl Into<String>) -> Result<(), RealtimeError> {
        require_channel(&self.channel)?;
        self.tracker().ok_or_else(no_active_task)?.complete(otp)
    }

    pub fn presence(&self) -> Presence {
        self.presence.presence()
    }

    pub fn is_tracking_location(&self) -> bool {
        self.presence.is_tracking()
    }

    pub fn offers(&self) -> &OfferHandle {
        &self.offers
    }

    pub fn tracker(&self) -> Option<&TrackerHandle> {
        self.tracked.as_ref().map(|t| &t.handle)
    }

    /// Wait for the next event from any component.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = tokio::select! {
            Some(event) = self.offer_events.recv() => SessionEvent::Offer(event),
            Some(event) = next_tracker_event(&mut self.tracked) => SessionEvent::Task(event),
            Some(state) = changed(&mut self.connection) => SessionEvent::Connection { state },
            Some(presence) = changed(&mut self.presence_rx) => SessionEvent::Presence { presence },
            else => return None,
        };
        match &event {
            SessionEvent::Offer(OfferEvent::Resolved {
                offer,
                outcome: OfferOutcome::Accepted,
            }) => self.begin_task(
                ActiveTask::new(offer.task_id().clone()).with_destination(offer.task.location),
            ),
            SessionEvent::Task(TrackerEvent::Status {
                status,
                confirmed: true,
                ..
            }) => self.presence.set_active_status(Some(*status)),
            SessionEvent::Task(TrackerEvent::Finished { .. } | TrackerEvent::Discarded { .. }) => {
                self.end_task()
            }
            _ => {}
        }
        Some(event)
    }

    fn begin_task(&mut self, task: ActiveTask) {
        if let Some(previous) = self.tracked.take() {
            warn!(task_id = %previous.handle.task_id(), "Replacing tracker for a new task");
            previous.handle.teardown();
        }
        info!(worker_id = %self.worker_id, task_id = %task.task_id, "Tracking accepted task");
        let role = TrackerRole::Worker {
            api: self.api.clone(),
            position: self.presence.reporter().position(),
        };
        let deps = TrackerDeps::new(
            self.channel.clone(),
            self.tasks.clone(),
            self.config.tracker.clone(),
        );
        self.presence.set_active_status(Some(task.confirmed_status));
        self.tracked = Some(Tracked::spawn(task, role, deps));
    }

    fn end_task(&mut self) {
        self.tracked = None;
        self.presence.set_active_status(None);
        let result = if self.presence.presence().is_online() {
            self.offers.available()
        } else {
            self.offers.unavailable()
        };
        if let Err(e) = result {
            warn!(error = %e, "Offer coordinator unavailable");
        }
    }

    pub fn shutdown(&mut self) {
        if let Some(tracked) = self.tracked.take() {
            tracked.handle.teardown();
        }
        self.offers.teardown();
        self.presence.go_offline();
        self.presence.set_active_status(None);
    }
}

pub struct RequesterSession {
    task_id: TaskId,
    config: RealtimeConfig,
    channel: ChannelManager,
    tasks: Arc<dyn TaskApi>,
    search: Option<(MatchHandle, mpsc::UnboundedReceiver<SearchEvent>)>,
    tracked: Option<Tracked>,
    connection: watch::Receiver<ConnectionState>,
}

impl RequesterSession {
    pub fn new(
        task_id: TaskId,
        config: RealtimeConfig,
        channel: ChannelManager,
        tasks: Arc<dyn TaskApi>,
    ) -> Self {
        let search = MatchSession::spawn(
            task_id.clone(),
            config.search.clone(),
            channel.clone(),
            tasks.clone(),
        );
        Self {
            connection: channel.connection_state(),
            task_id,
            config,
            channel,
            tasks,
            search: Some(search),
            tracked: None,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Start or restart the search.
    pub fn start_search(&self) -> Result<(), RealtimeError> {
        let (search, _) = self.search.as_ref().ok_or_else(no_active_task)?;
        search.start()
    }

    /// Cancel the search, or the task once matched.
    pub fn cancel(&self, reason: Option<String>) -> Result<(), RealtimeError> {
        if let Some(tracked) = &self.tracked {
            return tracked.handle.cancel(reason);
        }
        let (search, _) = self.search.as_ref().ok_or_else(no_active_task)?;
        search.cancel(reason)
    }

    pub fn search(&self) -> Option<&MatchHandle> {
        self.search.as_ref().map(|(handle, _)| handle)
    }

    pub fn tracker(&self) -> Option<&TrackerHandle> {
        self.tracked.as_ref().map(|t| &t.handle)
    }

    /// Returns true once the task has nothing left to follow.
    pub fn is_done(&self) -> bool {
        self.search.is_none() && self.tracked.is_none()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let event = tokio::select! {
            Some(event) = next_search_event(&mut self.search) => SessionEvent::Search(event),
            Some(event) = next_tracker_event(&mut self.tracked) => SessionEvent::Task(event),
            Some(state) = changed(&mut self.connection) => SessionEvent::Connection { state },
            else => return None,
        };
        match &event {
            SessionEvent::Search(SearchEvent::Matched { worker, .. }) => {
                let task = ActiveTask::new(self.task_id.clone()).with_worker(Some(worker.clone()));
                self.begin_task(task)
            }
            SessionEvent::Search(SearchEvent::Cancelled { .. }) => self.end_search(),
            SessionEvent::Task(TrackerEvent::Finished { .. } | TrackerEvent::Discarded { .. }) => {
                self.tracked = None;
            }
            _ => {}
        }
        Some(event)
    }

    fn begin_task(&mut self, task: ActiveTask) {
        info!(task_id = %self.task_id, "Matched, tracking task");
        let deps = TrackerDeps::new(
            self.channel.clone(),
            self.tasks.clone(),
            self.config.tracker.clone(),
        );
        // The tracker takes its own reference on the task topic before the
        // search lets go of it.
        self.tracked = Some(Tracked::spawn(task, TrackerRole::Requester, deps));
        self.end_search();
    }

    fn end_search(&mut self) {
        if let Some((search, _)) = self.search.take() {
            search.teardown();
        }
    }

    pub fn shutdown(&mut self) {
        self.end_search();
        if let Some(tracked) = self.tracked.take() {
            tracked.handle.teardown();
        }
    }
}

async fn next_search_event(
    search: &mut Option<(MatchHandle, mpsc::UnboundedReceiver<SearchEvent>)>,
) -> Option<SearchEvent> {
    let Some((_, events)) = search else {
        return std::future::pending().await;
    };
    match events.recv().await {
        Some(event) => Some(event),
        None => {
            *search = None;
            None
        }
    }
}
