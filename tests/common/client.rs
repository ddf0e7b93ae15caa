//! HTTP client for end-to-end tests
//!
//! Wraps reqwest and provides methods for all task endpoints. Identity is
//! asserted with the same headers the upstream proxy sets.

use super::constants::*;
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;

/// HTTP test client acting as one user
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
    pub user_id: Option<String>,
    pub is_admin: bool,
}

impl TestClient {
    fn build(base_url: String, user_id: Option<&str>, is_admin: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            client,
            base_url,
            user_id: user_id.map(str::to_string),
            is_admin,
        }
    }

    /// A client that sends no identity headers
    pub fn anonymous(base_url: String) -> Self {
        Self::build(base_url, None, false)
    }

    pub fn as_user(base_url: String, user_id: &str) -> Self {
        Self::build(base_url, Some(user_id), false)
    }

    pub fn as_admin(base_url: String) -> Self {
        Self::build(base_url, Some(ADMIN_USER), true)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(user_id) = &self.user_id {
            builder = builder.header("x-user-id", user_id);
        }
        if self.is_admin {
            builder = builder.header("x-user-role", "admin");
        }
        builder
    }

    // ========================================================================
    // Task Endpoints
    // ========================================================================

    /// POST /tasks with an arbitrary body
    pub async fn submit(&self, body: Value) -> Response {
        self.request(reqwest::Method::POST, "/tasks")
            .json(&body)
            .send()
            .await
            .expect("Submit request failed")
    }

    /// POST /tasks and return the new task id
    pub async fn submit_task(&self, job_type: &str, parameters: Value) -> String {
        let response = self
            .submit(json!({ "type": job_type, "parameters": parameters }))
            .await;
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let body: Value = response.json().await.expect("Invalid submit response");
        body["id"]
            .as_str()
            .expect("Submit response without id")
            .to_string()
    }

    /// GET /tasks with a raw query string
    pub async fn list_tasks(&self, query: &str) -> Response {
        self.request(reqwest::Method::GET, &format!("/tasks?{}", query))
            .send()
            .await
            .expect("List request failed")
    }

    /// GET /tasks/{id}
    pub async fn get_task(&self, id: &str) -> Response {
        self.request(reqwest::Method::GET, &format!("/tasks/{}", id))
            .send()
            .await
            .expect("Get request failed")
    }

    /// GET /tasks/{id}/statistics
    pub async fn get_task_statistics(&self, id: &str) -> Response {
        self.request(reqwest::Method::GET, &format!("/tasks/{}/statistics", id))
            .send()
            .await
            .expect("Task statistics request failed")
    }

    /// GET /tasks/statistics with a raw query string
    pub async fn get_statistics(&self, query: &str) -> Response {
        self.request(reqwest::Method::GET, &format!("/tasks/statistics?{}", query))
            .send()
            .await
            .expect("Statistics request failed")
    }

    /// POST /tasks/{id}/retry
    pub async fn retry_task(&self, id: &str, reason: Option<&str>) -> Response {
        self.request(reqwest::Method::POST, &format!("/tasks/{}/retry", id))
            .json(&json!({ "reason": reason }))
            .send()
            .await
            .expect("Retry request failed")
    }

    /// DELETE /tasks/{id}
    pub async fn cancel_task(&self, id: &str, reason: Option<&str>) -> Response {
        let mut builder = self.request(reqwest::Method::DELETE, &format!("/tasks/{}", id));
        if let Some(reason) = reason {
            builder = builder.query(&[("reason", reason)]);
        }
        builder.send().await.expect("Cancel request failed")
    }

    /// POST /tasks/batch
    pub async fn batch(&self, operation: &str, task_ids: &[&str]) -> Response {
        self.request(reqwest::Method::POST, "/tasks/batch")
            .json(&json!({ "operation": operation, "task_ids": task_ids }))
            .send()
            .await
            .expect("Batch request failed")
    }

    /// GET /admin/queue
    pub async fn inspect_queue(&self) -> Response {
        self.request(reqwest::Method::GET, "/admin/queue")
            .send()
            .await
            .expect("Queue inspection request failed")
    }

    /// Poll GET /tasks/{id} until the task reaches `status`.
    ///
    /// # Panics
    ///
    /// Panics if the status is not reached within `TASK_SETTLE_TIMEOUT_MS`.
    pub async fn wait_for_status(&self, id: &str, status: &str) -> Value {
        let start = std::time::Instant::now();
        let mut last = Value::Null;
        while start.elapsed() < Duration::from_millis(TASK_SETTLE_TIMEOUT_MS) {
            let response = self.get_task(id).await;
            last = response.json().await.expect("Invalid task response");
            if last["status"] == status {
                return last;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Task {} never reached {}; last seen {}", id, status, last);
    }
}
