//! Worker presence.
//!
//! Online/offline toggle with its side effects: the personal topic
//! subscription, the `online:status` event, and location reporting. Location
//! keeps running while an active task is unfinished, even when offline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use taskmatch_client::HelperApi;
use taskmatch_core::{ClientEvent, ConnectionState, Presence, TaskStatus, WorkerId};

use crate::channel::ChannelManager;
use crate::error::RealtimeError;
use crate::location::LocationReporter;

/// Decides whether location reporting runs.
pub struct LocationGate;

impl LocationGate {
    /// Online, or an active task that has not reached a confirmed end.
    pub fn should_track(presence: Presence, active: Option<TaskStatus>) -> bool {
        presence.is_online() || active.is_some_and(|status| status.is_active())
    }
}

pub struct PresenceController {
    worker_id: WorkerId,
    channel: ChannelManager,
    api: Arc<dyn HelperApi>,
    reporter: LocationReporter,
    presence: watch::Sender<Presence>,
    active: Option<TaskStatus>,
}

impl PresenceController {
    pub fn new(
        worker_id: WorkerId,
        channel: ChannelManager,
        api: Arc<dyn HelperApi>,
        reporter: LocationReporter,
    ) -> Self {
        let (presence, _) = watch::channel(Presence::Offline);
        Self {
            worker_id,
            channel,
            api,
            reporter,
            presence,
            active: None,
        }
    }

    pub fn go_online(&mut self) -> Result<(), RealtimeError> {
        if self.presence().is_online() {
            return Ok(());
        }
        if self.channel.state() == ConnectionState::Disconnected {
            return Err(RealtimeError::Offline);
        }
        info!(worker_id = %self.worker_id, "Going online");
        self.channel.subscribe(self.worker_id.topic());
        self.announce(true);
        self.presence.send_replace(Presence::Online);
        self.update_tracking();
        Ok(())
    }

    pub fn go_offline(&mut self) {
        if !self.presence().is_online() {
            return;
        }
        info!(worker_id = %self.worker_id, "Going offline");
        self.channel.unsubscribe(&self.worker_id.topic());
        self.announce(false);
        self.presence.send_replace(Presence::Offline);
        self.update_tracking();
    }

    /// Confirmed status of the worker's active task, `None` when there is none.
    pub fn set_active_status(&mut self, status: Option<TaskStatus>) {
        self.active = status;
        self.update_tracking();
    }

    pub fn presence(&self) -> Presence {
        *self.presence.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Presence> {
        self.presence.subscribe()
    }

    pub fn is_tracking(&self) -> bool {
        self.reporter.is_running()
    }

    pub fn reporter(&self) -> &LocationReporter {
        &self.reporter
    }

    fn update_tracking(&mut self) {
        if LocationGate::should_track(self.presence(), self.active) {
            self.reporter.start();
        } else {
            self.reporter.stop();
        }
    }

    fn announce(&self, online: bool) {
        self.channel
            .send_event(&ClientEvent::OnlineStatus { is_online: online });
        let api = self.api.clone();
        tokio::spawn(async move {
            if let Err(e) = api.set_online_status(online).await {
                warn!(online, error = %e, category = ?e.category(), "Online status not persisted");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::channel::{Frame, MemoryTransport};
    use crate::config::LocationConfig;
    use crate::location::StaticLocationSource;
    use crate::testing::{connected_channel, sent, settle, test_channel_config, ApiCall, MockApi};
    use serde_json::json;
    use taskmatch_core::GeoPoint;

    fn controller(channel: ChannelManager, api: Arc<MockApi>) -> PresenceController {
        let source = Arc::new(StaticLocationSource::new(GeoPoint::new(40.0, -3.0)));
        let reporter =
            LocationReporter::new(LocationConfig::default(), channel.clone(), api.clone(), source);
        PresenceController::new(WorkerId::new("w1"), channel, api, reporter)
    }

    #[test]
    fn test_should_track() {
        assert!(LocationGate::should_track(Presence::Online, None));
        assert!(!LocationGate::should_track(Presence::Offline, None));
        assert!(LocationGate::should_track(
            Presence::Offline,
            Some(TaskStatus::WorkerArriving)
        ));
        assert!(!LocationGate::should_track(
            Presence::Offline,
            Some(TaskStatus::Completed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_offline_side_effects() {
        let (channel, mut peer, _peers) = connected_channel().await;
        let api = MockApi::new();
        let mut presence = controller(channel, api.clone());

        presence.go_online().unwrap();
        settle().await;
        assert!(presence.is_tracking());
        let frames = peer.drain();
        assert_eq!(
            frames[0],
            Frame::Subscribe {
                topic: "helper:w1".into()
            }
        );
        assert_eq!(sent(&frames, "online:status"), vec![json!({ "isOnline": true })]);

        presence.go_offline();
        settle().await;
        assert!(!presence.is_tracking());
        assert!(peer.drain().contains(&Frame::Unsubscribe {
            topic: "helper:w1".into()
        }));
        assert_eq!(
            api.calls()
                .into_iter()
                .filter(|c| matches!(c, ApiCall::OnlineStatus(_)))
                .collect::<Vec<_>>(),
            vec![ApiCall::OnlineStatus(true), ApiCall::OnlineStatus(false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_task_keeps_tracking_offline() {
        let (channel, _peer, _peers) = connected_channel().await;
        let mut presence = controller(channel, MockApi::new());
        presence.go_online().unwrap();
        presence.set_active_status(Some(TaskStatus::WorkerArriving));

        presence.go_offline();
        assert_eq!(presence.presence(), Presence::Offline);
        assert!(presence.is_tracking());

        presence.set_active_status(Some(TaskStatus::Completed));
        assert!(!presence.is_tracking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_refused_when_channel_gave_up() {
        let (transport, _peers) = MemoryTransport::new();
        let channel = ChannelManager::new(transport, test_channel_config());
        let mut presence = controller(channel, MockApi::new());
        assert!(matches!(presence.go_online(), Err(RealtimeError::Offline)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(presence.presence(), Presence::Offline);
    }
}
