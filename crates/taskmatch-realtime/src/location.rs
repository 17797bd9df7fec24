//! Location Reporter.
//!
//! Samples the device position on a fixed interval and pushes it on the
//! channel. Sends never block: a full outbound queue drops the sample. While
//! the channel is down, positions go to the REST fallback at a slower rate.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskmatch_client::HelperApi;
use taskmatch_core::{ClientEvent, GeoPoint};

use crate::channel::ChannelManager;
use crate::config::LocationConfig;
use crate::error::RealtimeError;

/// Supplies the device position.
#[async_trait]
pub trait LocationSource: Send + Sync + 'static {
    async fn current(&self) -> Result<GeoPoint, RealtimeError>;
}

/// A position set by hand.
#[derive(Debug, Default)]
pub struct StaticLocationSource {
    point: Mutex<Option<GeoPoint>>,
}

impl StaticLocationSource {
    pub fn new(point: GeoPoint) -> Self {
        Self {
            point: Mutex::new(Some(point)),
        }
    }

    pub fn set(&self, point: GeoPoint) {
        *self.point.lock().unwrap_or_else(PoisonError::into_inner) = Some(point);
    }
}

#[async_trait]
impl LocationSource for StaticLocationSource {
    async fn current(&self) -> Result<GeoPoint, RealtimeError> {
        let point = *self.point.lock().unwrap_or_else(PoisonError::into_inner);
        point.ok_or_else(|| RealtimeError::Location("no fix yet".to_string()))
    }
}

pub struct LocationReporter {
    config: LocationConfig,
    channel: ChannelManager,
    api: Arc<dyn HelperApi>,
    source: Arc<dyn LocationSource>,
    position: watch::Sender<Option<GeoPoint>>,
    running: Option<CancellationToken>,
}

impl LocationReporter {
    pub fn new(
        config: LocationConfig,
        channel: ChannelManager,
        api: Arc<dyn HelperApi>,
        source: Arc<dyn LocationSource>,
    ) -> Self {
        let (position, _) = watch::channel(None);
        Self {
            config,
            channel,
            api,
            source,
            position,
            running: None,
        }
    }

    /// Start sampling. No-op if already running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        info!(
            interval_secs = self.config.sample_interval_secs,
            min_displacement_m = self.config.min_displacement_m,
            "Starting location reporting"
        );
        let token = CancellationToken::new();
        let sampler = Sampler {
            config: self.config.clone(),
            channel: self.channel.clone(),
            api: self.api.clone(),
            source: self.source.clone(),
            position: self.position.clone(),
            last_pushed: None,
            last_fallback: None,
        };
        tokio::spawn(sampler.run(token.clone()));
        self.running = Some(token);
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.running.take() {
            info!("Stopping location reporting");
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Latest sampled position.
    pub fn position(&self) -> watch::Receiver<Option<GeoPoint>> {
        self.position.subscribe()
    }
}

impl Drop for LocationReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Sampler {
    config: LocationConfig,
    channel: ChannelManager,
    api: Arc<dyn HelperApi>,
    source: Arc<dyn LocationSource>,
    position: watch::Sender<Option<GeoPoint>>,
    last_pushed: Option<GeoPoint>,
    last_fallback: Option<Instant>,
}

impl Sampler {
    async fn run(mut self, token: CancellationToken) {
        let mut ticks = interval(self.config.sample_interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticks.tick() => {}
            }
            match self.source.current().await {
                Ok(point) => self.sample(point),
                Err(e) => warn!(error = %e, "Skipping location sample"),
            }
        }
        debug!("Location sampler stopped");
    }

    fn sample(&mut self, point: GeoPoint) {
        self.position.send_if_modified(|current| {
            if *current == Some(point) {
                return false;
            }
            *current = Some(point);
            true
        });

        if self.channel.is_connected() {
            let moved = self
                .last_pushed
                .map_or(true, |last| last.distance_to(&point) >= self.config.min_displacement_m);
            if moved && self.channel.send_event(&ClientEvent::location(point)) {
                self.last_pushed = Some(point);
            }
            return;
        }

        let due = self
            .last_fallback
            .map_or(true, |at| at.elapsed() >= self.config.rest_fallback_interval());
        if due {
            debug!(lat = point.lat, lng = point.lng, "Channel down, posting location over REST");
            self.last_fallback = Some(Instant::now());
            let api = self.api.clone();
            tokio::spawn(async move {
                if let Err(e) = api.post_location(&point).await {
                    warn!(error = %e, category = ?e.category(), "Location fallback failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::channel::{ChannelManager, Credential, MemoryTransport};
    use crate::config::ChannelConfig;
    use crate::testing::{connected_channel, sent, settle, test_channel_config, ApiCall, MockApi};

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticLocationSource::default();
        assert!(source.current().await.is_err());
        source.set(GeoPoint::new(1.0, 2.0));
        assert_eq!(source.current().await.unwrap(), GeoPoint::new(1.0, 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushes_first_sample_and_real_moves() {
        let (channel, mut peer, _peers) = connected_channel().await;
        let source = Arc::new(StaticLocationSource::new(GeoPoint::new(40.0, -3.0)));
        let mut reporter = LocationReporter::new(
            LocationConfig::default(),
            channel,
            MockApi::new(),
            source.clone(),
        );
        reporter.start();
        settle().await;
        assert_eq!(sent(&peer.drain(), "location:update").len(), 1);

        // Under the displacement threshold.
        source.set(GeoPoint::new(40.00003, -3.0));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sent(&peer.drain(), "location:update").is_empty());

        source.set(GeoPoint::new(40.001, -3.0));
        tokio::time::sleep(Duration::from_secs(5)).await;
        let pushed = sent(&peer.drain(), "location:update");
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["coords"]["lat"], 40.001);
        assert_eq!(*reporter.position().borrow(), Some(GeoPoint::new(40.001, -3.0)));

        reporter.stop();
        assert!(!reporter.is_running());
        source.set(GeoPoint::new(41.0, -3.0));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(sent(&peer.drain(), "location:update").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_push_is_not_counted_as_sent() {
        let (transport, mut peers) = MemoryTransport::new();
        let channel = ChannelManager::new(
            transport,
            ChannelConfig {
                outbound_queue: 1,
                ..test_channel_config()
            },
        );
        channel.connect(Credential::bearer("test-token"));
        let mut peer = peers.recv().await.unwrap();
        settle().await;

        let (position, _) = watch::channel(None);
        let mut sampler = Sampler {
            config: LocationConfig::default(),
            channel: channel.clone(),
            api: MockApi::new(),
            source: Arc::new(StaticLocationSource::default()),
            position,
            last_pushed: None,
            last_fallback: None,
        };

        // The queue is full, so this sample never leaves.
        assert!(channel.send("filler", serde_json::json!({})));
        sampler.sample(GeoPoint::new(40.0, -3.0));
        assert_eq!(sampler.last_pushed, None);
        settle().await;

        // A move under the threshold still goes out: nothing was pushed yet.
        sampler.sample(GeoPoint::new(40.00003, -3.0));
        settle().await;
        let pushed = sent(&peer.drain(), "location:update");
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["coords"]["lat"], 40.00003);
        assert_eq!(sampler.last_pushed, Some(GeoPoint::new(40.00003, -3.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_fallback_while_disconnected() {
        let (transport, _peers) = MemoryTransport::new();
        let channel = ChannelManager::new(transport, test_channel_config());
        let api = MockApi::new();
        let source = Arc::new(StaticLocationSource::new(GeoPoint::new(40.0, -3.0)));
        let mut reporter = LocationReporter::new(
            LocationConfig::default(),
            channel,
            api.clone(),
            source,
        );
        reporter.start();

        tokio::time::sleep(Duration::from_secs(61)).await;
        let posts = api.count(|c| matches!(c, ApiCall::Location(_)));
        assert_eq!(posts, 3);
    }
}
