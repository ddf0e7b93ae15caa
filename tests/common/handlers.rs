//! Job handlers registered on the test server
//!
//! - OCR: reports 50%, waits `delay_ms` (default 0) and echoes its parameters
//! - LLM: always fails
//! - KG_EXTRACTION: runs until cancelled

use async_trait::async_trait;
use jobhub_server::jobs::worker::{HandlerContext, HandlerError, JobHandler};
use jobhub_server::jobs::{JobType, Payload};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn job_type(&self) -> JobType {
        JobType::Ocr
    }

    async fn run(&self, ctx: HandlerContext) -> Result<Payload, HandlerError> {
        let params: Value = ctx.parameters.decode()?;
        let _ = ctx.report(50, Some((1, 2)), Some("halfway"));
        if let Some(delay) = params.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(Payload::from(json!({ "echo": params })))
    }
}

pub struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    fn job_type(&self) -> JobType {
        JobType::Llm
    }

    async fn run(&self, _ctx: HandlerContext) -> Result<Payload, HandlerError> {
        Err(HandlerError::new("model unavailable").with_details(json!({ "code": 503 })))
    }
}

pub struct BlockingHandler;

#[async_trait]
impl JobHandler for BlockingHandler {
    fn job_type(&self) -> JobType {
        JobType::KgExtraction
    }

    async fn run(&self, ctx: HandlerContext) -> Result<Payload, HandlerError> {
        let _ = ctx.report(10, None, Some("waiting"));
        ctx.cancelled().await;
        Err(HandlerError::new("cancelled"))
    }
}

pub fn test_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(EchoHandler),
        Arc::new(FailingHandler),
        Arc::new(BlockingHandler),
    ]
}
