//! HTTP client for REST endpoints.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use taskmatch_core::{GeoPoint, TaskId, TaskSnapshot};

use crate::api::{HelperApi, TaskApi};
use crate::error::ClientError;

/// HTTP client for the task and helper REST APIs.
#[derive(Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpClient {
    /// Create a new HTTP client authenticating with a bearer token.
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Use a preconfigured reqwest client (timeouts, proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.inner = client;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Get JSON from an endpoint.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self.inner.get(&url).bearer_auth(&self.token).send().await?;
        let response = check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::Serialization(e.to_string()))
    }

    /// POST a JSON body, ignoring any response body.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self
            .inner
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::from_status(status.as_u16(), message))
}

#[async_trait]
impl TaskApi for HttpClient {
    async fn cancel_task(&self, task_id: &TaskId, reason: Option<&str>) -> Result<(), ClientError> {
        self.post_json(
            &format!("/tasks/{}/cancel", task_id),
            &json!({ "reason": reason }),
        )
        .await
    }

    async fn accept_task(&self, task_id: &TaskId) -> Result<(), ClientError> {
        self.post_json(&format!("/tasks/{}/accept", task_id), &json!({}))
            .await
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<TaskSnapshot, ClientError> {
        self.get_json(&format!("/tasks/{}", task_id)).await
    }
}

#[async_trait]
impl HelperApi for HttpClient {
    async fn accept(&self, task_id: &TaskId) -> Result<(), ClientError> {
        self.post_json(&format!("/helper/tasks/{}/accept", task_id), &json!({}))
            .await
    }

    async fn decline(&self, task_id: &TaskId, reason: &str) -> Result<(), ClientError> {
        self.post_json(
            &format!("/helper/tasks/{}/decline", task_id),
            &json!({ "reason": reason }),
        )
        .await
    }

    async fn start(&self, task_id: &TaskId) -> Result<(), ClientError> {
        self.post_json(&format!("/helper/tasks/{}/start", task_id), &json!({}))
            .await
    }

    async fn complete(&self, task_id: &TaskId, otp: &str) -> Result<(), ClientError> {
        self.post_json(
            &format!("/helper/tasks/{}/complete", task_id),
            &json!({ "otp": otp }),
        )
        .await
    }

    async fn set_online_status(&self, online: bool) -> Result<(), ClientError> {
        self.post_json("/helper/online-status", &json!({ "isOnline": online }))
            .await
    }

    async fn post_location(&self, location: &GeoPoint) -> Result<(), ClientError> {
        self.post_json(
            "/helper/location",
            &json!({
                "lat": location.lat,
                "lng": location.lng,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
        )
        .await
    }
}
