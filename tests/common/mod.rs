//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestServer, TestClient, TEST_USER};
//! use reqwest::StatusCode;
//!
//! #[tokio::test]
//! async fn test_list_tasks() {
//!     let server = TestServer::spawn().await;
//!     let client = TestClient::as_user(server.base_url.clone(), TEST_USER);
//!
//!     let response = client.list_tasks("").await;
//!     assert_eq!(response.status(), StatusCode::OK);
//! }
//! ```

mod client;
mod constants;
mod handlers;
mod server;

// Public API - this is what tests import
pub use client::TestClient;
pub use constants::*;
pub use server::TestServer;
