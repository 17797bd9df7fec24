//! Test doubles shared by the component tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use taskmatch_client::{ClientError, HelperApi, TaskApi};
use taskmatch_core::{GeoPoint, TaskId, TaskSnapshot};

use crate::channel::{ChannelManager, Credential, Frame, MemoryPeer, MemoryTransport};
use crate::config::ChannelConfig;

/// Let every ready task run before continuing.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn test_channel_config() -> ChannelConfig {
    ChannelConfig {
        backoff_jitter_ms: 0,
        ..ChannelConfig::default()
    }
}

/// A connected channel plus the server side of its link.
pub async fn connected_channel(
) -> (ChannelManager, MemoryPeer, mpsc::UnboundedReceiver<MemoryPeer>) {
    let (transport, mut peers) = MemoryTransport::new();
    let channel = ChannelManager::new(transport, test_channel_config());
    channel.connect(Credential::bearer("test-token"));
    let peer = peers.recv().await.expect("peer");
    settle().await;
    (channel, peer, peers)
}

/// Payloads of sent events named `name`.
pub fn sent(frames: &[Frame], name: &str) -> Vec<Value> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Event { event, payload } if event == name => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    CancelTask(TaskId),
    AcceptTask(TaskId),
    GetTask(TaskId),
    Accept(TaskId),
    Decline(TaskId, String),
    Start(TaskId),
    Complete(TaskId, String),
    OnlineStatus(bool),
    Location(GeoPoint),
}

/// Records every call; scripted failures are keyed by method name.
#[derive(Default)]
pub struct MockApi {
    calls: Mutex<Vec<ApiCall>>,
    failures: Mutex<Vec<(&'static str, u16)>>,
    snapshots: Mutex<VecDeque<Result<TaskSnapshot, u16>>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next call to `method` with an HTTP status.
    pub fn fail(&self, method: &'static str, status: u16) {
        self.failures.lock().unwrap().push((method, status));
    }

    /// Queue a result for the next `get_task`.
    pub fn snapshot(&self, result: Result<TaskSnapshot, u16>) {
        self.snapshots.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&ApiCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, method: &'static str, call: ApiCall) -> Result<(), ClientError> {
        self.calls.lock().unwrap().push(call);
        let mut failures = self.failures.lock().unwrap();
        match failures.iter().position(|(m, _)| *m == method) {
            Some(index) => {
                let (_, status) = failures.remove(index);
                Err(ClientError::from_status(status, method))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TaskApi for MockApi {
    async fn cancel_task(
        &self,
        task_id: &TaskId,
        _reason: Option<&str>,
    ) -> Result<(), ClientError> {
        self.record("cancel_task", ApiCall::CancelTask(task_id.clone()))
    }

    async fn accept_task(&self, task_id: &TaskId) -> Result<(), ClientError> {
        self.record("accept_task", ApiCall::AcceptTask(task_id.clone()))
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<TaskSnapshot, ClientError> {
        self.calls
            .lock()
            .unwrap()
            .push(ApiCall::GetTask(task_id.clone()));
        match self.snapshots.lock().unwrap().pop_front() {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(status)) => Err(ClientError::from_status(status, "get_task")),
            None => Err(ClientError::from_status(503, "no snapshot scripted")),
        }
    }
}

#[async_trait]
impl HelperApi for MockApi {
    async fn accept(&self, task_id: &TaskId) -> Result<(), ClientError> {
        self.record("accept", ApiCall::Accept(task_id.clone()))
    }

    async fn decline(&self, task_id: &TaskId, reason: &str) -> Result<(), ClientError> {
        self.record("decline", ApiCall::Decline(task_id.clone(), reason.to_string()))
    }

    async fn start(&self, task_id: &TaskId) -> Result<(), ClientError> {
        self.record("start", ApiCall::Start(task_id.clone()))
    }

    async fn complete(&self, task_id: &TaskId, otp: &str) -> Result<(), ClientError> {
        self.record("complete", ApiCall::Complete(task_id.clone(), otp.to_string()))
    }

    async fn set_online_status(&self, online: bool) -> Result<(), ClientError> {
        self.record("online_status", ApiCall::OnlineStatus(online))
    }

    async fn post_location(&self, location: &GeoPoint) -> Result<(), ClientError> {
        self.record("location", ApiCall::Location(*location))
    }
}

/// Everything currently queued on `rx`.
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}
