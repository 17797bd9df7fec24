//! Channel Manager: one duplex connection per actor.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use taskmatch_core::{ClientEvent, ConnectionState};

use super::frame::Frame;
use super::transport::{Credential, Link, Transport};
use crate::config::ChannelConfig;

/// Identifies a registered event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Calculate the next backoff duration.
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

fn jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

struct Shared {
    /// Topic reference counts.
    topics: BTreeMap<String, usize>,
    /// Outbound queue of the live link, if any.
    outbound: Option<mpsc::Sender<Frame>>,
    handlers: Vec<(HandlerId, String, Handler)>,
    next_handler: u64,
    supervisor: Option<CancellationToken>,
}

impl Shared {
    /// Queue `frame` for the open link. Returns false if it was dropped.
    fn push(&self, frame: Frame) -> bool {
        let Some(tx) = &self.outbound else {
            debug!(frame = ?frame, "Channel closed, dropping frame");
            return false;
        };
        if let Err(e) = tx.try_send(frame) {
            debug!(error = %e, "Dropping outbound frame");
            return false;
        }
        true
    }
}

struct Inner {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    state: watch::Sender<ConnectionState>,
    /// Number of successful opens so far.
    opened: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a state unless the supervisor has been cancelled.
    fn publish(&self, token: &CancellationToken, state: ConnectionState) {
        let _shared = self.lock();
        if token.is_cancelled() {
            return;
        }
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    fn dispatch(&self, event: &str, payload: Value) {
        let handlers: Vec<Handler> = self
            .lock()
            .handlers
            .iter()
            .filter(|(_, name, _)| name == event)
            .map(|(_, _, handler)| handler.clone())
            .collect();

        if handlers.is_empty() {
            debug!(event = %event, "No handler for event");
            return;
        }
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

/// Handle to the duplex channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl ChannelManager {
    pub fn new(transport: impl Transport, config: ChannelConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (opened, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                transport: Arc::new(transport),
                shared: Mutex::new(Shared {
                    topics: BTreeMap::new(),
                    outbound: None,
                    handlers: Vec::new(),
                    next_handler: 0,
                    supervisor: None,
                }),
                state,
                opened,
            }),
        }
    }

    /// Open the channel in the background.
    ///
    /// The credential is kept for every reconnect until `disconnect`.
    pub fn connect(&self, credential: Credential) {
        let token = CancellationToken::new();
        {
            let mut shared = self.inner.lock();
            if let Some(previous) = shared.supervisor.replace(token.clone()) {
                previous.cancel();
            }
            shared.outbound = None;
            self.inner
                .state
                .send_replace(ConnectionState::Connecting { attempt: 0 });
        }
        info!("Connecting channel");
        tokio::spawn(supervise(self.inner.clone(), credential, token));
    }

    /// Close the channel. Subscribed topics are kept for the next `connect`.
    pub fn disconnect(&self) {
        let mut shared = self.inner.lock();
        if let Some(token) = shared.supervisor.take() {
            token.cancel();
        }
        shared.outbound = None;
        self.inner.state.send_replace(ConnectionState::Disconnected);
        info!("Channel disconnected");
    }

    /// Subscribe to a topic. Only the first subscriber reaches the wire.
    pub fn subscribe(&self, topic: impl Into<String>) {
        let topic = topic.into();
        let mut shared = self.inner.lock();
        let first = {
            let count = shared.topics.entry(topic.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            debug!(topic = %topic, "Subscribing");
            shared.push(Frame::Subscribe { topic });
        }
    }

    /// Release a subscription. The last release reaches the wire.
    pub fn unsubscribe(&self, topic: &str) {
        let mut shared = self.inner.lock();
        let last = match shared.topics.get_mut(topic) {
            Some(count) => {
                *count -= 1;
                *count == 0
            }
            None => {
                debug!(topic = %topic, "Unsubscribe for unknown topic");
                return;
            }
        };
        if last {
            shared.topics.remove(topic);
            debug!(topic = %topic, "Unsubscribing");
            shared.push(Frame::Unsubscribe {
                topic: topic.to_string(),
            });
        }
    }

    /// Currently subscribed topics.
    pub fn topics(&self) -> Vec<String> {
        self.inner.lock().topics.keys().cloned().collect()
    }

    /// Send an event. A closed or saturated channel drops it silently.
    ///
    /// Returns whether the frame was queued for the open link. That is not a
    /// delivery confirmation.
    pub fn send(&self, event: &str, payload: Value) -> bool {
        self.inner.lock().push(Frame::event(event, payload))
    }

    pub fn send_event(&self, event: &ClientEvent) -> bool {
        self.inner.lock().push(Frame::from(event))
    }

    /// Register a handler for an inbound event name.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut shared = self.inner.lock();
        let id = HandlerId(shared.next_handler);
        shared.next_handler += 1;
        shared
            .handlers
            .push((id, event.to_string(), Arc::new(handler)));
        id
    }

    pub fn off(&self, id: HandlerId) {
        self.inner.lock().handlers.retain(|(h, _, _)| *h != id);
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Notifications for every open after the first one.
    pub fn reconnects(&self) -> Reconnects {
        Reconnects {
            opened: self.inner.opened.subscribe(),
        }
    }
}

/// Yields each time the channel reopens after a loss.
pub struct Reconnects {
    opened: watch::Receiver<u64>,
}

impl Reconnects {
    /// Wait for the next reopen. Returns the open count.
    pub async fn next(&mut self) -> Option<u64> {
        loop {
            self.opened.changed().await.ok()?;
            let opened = *self.opened.borrow_and_update();
            if opened > 1 {
                return Some(opened);
            }
        }
    }
}

enum LinkEnd {
    Lost,
    Cancelled,
}

async fn supervise(inner: Arc<Inner>, credential: Credential, token: CancellationToken) {
    let config = inner.config.clone();
    let mut attempt: u32 = 0;
    let mut backoff = config.initial_backoff();

    loop {
        inner.publish(&token, ConnectionState::Connecting { attempt });

        let opened = tokio::select! {
            _ = token.cancelled() => return,
            opened = inner.transport.open(&credential) => opened,
        };

        match opened {
            Ok(link) => {
                attempt = 0;
                backoff = config.initial_backoff();
                if let LinkEnd::Cancelled = run_link(&inner, link, &token).await {
                    return;
                }
                warn!("Channel closed unexpectedly");
            }
            Err(e) => {
                warn!(error = %e, attempt = attempt, "Channel open failed");
            }
        }

        attempt += 1;
        if attempt > config.max_reconnect_attempts {
            error!(
                attempts = config.max_reconnect_attempts,
                "Reconnect attempts exhausted, channel offline"
            );
            inner.publish(&token, ConnectionState::Disconnected);
            return;
        }

        inner.publish(&token, ConnectionState::Connecting { attempt });
        let delay = backoff + jitter(config.backoff_jitter_ms);
        info!(
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting channel"
        );
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        backoff = next_backoff(backoff, config.max_backoff());
    }
}

async fn run_link(inner: &Arc<Inner>, link: Link, token: &CancellationToken) -> LinkEnd {
    let Link {
        outbound: wire,
        mut inbound,
    } = link;

    let (queue_tx, mut queue_rx) = {
        let mut shared = inner.lock();
        if token.is_cancelled() {
            return LinkEnd::Cancelled;
        }
        let capacity = inner.config.outbound_queue.max(shared.topics.len() + 1);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        for topic in shared.topics.keys() {
            let _ = queue_tx.try_send(Frame::Subscribe {
                topic: topic.clone(),
            });
        }
        shared.outbound = Some(queue_tx.clone());
        inner.state.send_replace(ConnectionState::Connected);
        inner.opened.send_modify(|n| *n += 1);
        info!(topics = shared.topics.len(), "Channel connected");
        (queue_tx, queue_rx)
    };

    let period = inner.config.heartbeat_interval();
    let mut heartbeat = interval_at(Instant::now() + period, period);

    let end = loop {
        tokio::select! {
            _ = token.cancelled() => break LinkEnd::Cancelled,
            frame = inbound.recv() => match frame {
                Some(Frame::Event { event, payload }) => inner.dispatch(&event, payload),
                Some(other) => debug!(frame = ?other, "Ignoring non-event frame"),
                None => break LinkEnd::Lost,
            },
            Some(frame) = queue_rx.recv() => {
                if wire.send(frame).await.is_err() {
                    break LinkEnd::Lost;
                }
            }
            _ = heartbeat.tick() => {
                if *inner.state.borrow() == ConnectionState::Connected {
                    let _ = queue_tx.try_send(Frame::from(&ClientEvent::heartbeat()));
                } else {
                    debug!("Skipping heartbeat, channel not open");
                }
            }
        }
    };

    if let LinkEnd::Lost = end {
        let mut shared = inner.lock();
        if !token.is_cancelled() {
            shared.outbound = None;
        }
    }
    end
}
