//! REST collaborator traits.
//!
//! The coordination core only talks to persistence through these traits so it
//! can run headless against in-memory doubles.

use async_trait::async_trait;

use taskmatch_core::{GeoPoint, TaskId, TaskSnapshot};

use crate::error::ClientError;

/// Requester-facing task endpoints.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// `POST /tasks/{id}/cancel`
    async fn cancel_task(&self, task_id: &TaskId, reason: Option<&str>) -> Result<(), ClientError>;

    /// `POST /tasks/{id}/accept`, used when a match push may have been missed.
    async fn accept_task(&self, task_id: &TaskId) -> Result<(), ClientError>;

    /// `GET /tasks/{id}`, the reconciliation source.
    async fn get_task(&self, task_id: &TaskId) -> Result<TaskSnapshot, ClientError>;
}

/// Worker-facing endpoints.
#[async_trait]
pub trait HelperApi: Send + Sync {
    /// `POST /helper/tasks/{id}/accept`
    async fn accept(&self, task_id: &TaskId) -> Result<(), ClientError>;

    /// `POST /helper/tasks/{id}/decline`
    async fn decline(&self, task_id: &TaskId, reason: &str) -> Result<(), ClientError>;

    /// `POST /helper/tasks/{id}/start`
    async fn start(&self, task_id: &TaskId) -> Result<(), ClientError>;

    /// `POST /helper/tasks/{id}/complete`
    async fn complete(&self, task_id: &TaskId, otp: &str) -> Result<(), ClientError>;

    /// `POST /helper/online-status`
    async fn set_online_status(&self, online: bool) -> Result<(), ClientError>;

    /// `POST /helper/location`
    async fn post_location(&self, location: &GeoPoint) -> Result<(), ClientError>;
}
