use axum::extract::FromRef;

use crate::config::JobsSettings;
use crate::jobs::{
    JobQueue, JobStore, QueryService, RetryPolicy, SubmissionGateway, TaskController,
};
use crate::notifications::NotificationHub;
use std::sync::Arc;
use std::time::Instant;

use super::ServerConfig;

pub type GuardedJobStore = Arc<dyn JobStore>;
pub type GuardedJobQueue = Arc<dyn JobQueue>;
pub type GuardedNotificationHub = Arc<NotificationHub>;
pub type GuardedSubmissionGateway = Arc<SubmissionGateway>;
pub type GuardedTaskController = Arc<TaskController>;
pub type GuardedQueryService = Arc<QueryService>;

/// The job services the HTTP layer is built on, wired together once.
#[derive(Clone)]
pub struct JobServices {
    pub store: GuardedJobStore,
    pub queue: GuardedJobQueue,
    pub hub: GuardedNotificationHub,
    pub gateway: GuardedSubmissionGateway,
    pub controller: GuardedTaskController,
    pub query: GuardedQueryService,
}

impl JobServices {
    pub fn new(
        store: GuardedJobStore,
        queue: GuardedJobQueue,
        hub: GuardedNotificationHub,
        settings: &JobsSettings,
    ) -> Self {
        let gateway = Arc::new(SubmissionGateway::new(
            store.clone(),
            queue.clone(),
            settings.clone(),
        ));
        let controller = Arc::new(TaskController::new(
            store.clone(),
            queue.clone(),
            hub.clone(),
            RetryPolicy::new(settings),
            settings.revoke_timeout(),
        ));
        let query = Arc::new(QueryService::new(store.clone()));
        Self {
            store,
            queue,
            hub,
            gateway,
            controller,
            query,
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub store: GuardedJobStore,
    pub queue: GuardedJobQueue,
    pub hub: GuardedNotificationHub,
    pub gateway: GuardedSubmissionGateway,
    pub controller: GuardedTaskController,
    pub query: GuardedQueryService,
    pub hash: String,
}

impl ServerState {
    pub fn new(config: ServerConfig, services: JobServices) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            store: services.store,
            queue: services.queue,
            hub: services.hub,
            gateway: services.gateway,
            controller: services.controller,
            query: services.query,
            hash: env!("GIT_HASH").to_string(),
        }
    }
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for GuardedJobStore {
    fn from_ref(input: &ServerState) -> Self {
        input.store.clone()
    }
}

impl FromRef<ServerState> for GuardedJobQueue {
    fn from_ref(input: &ServerState) -> Self {
        input.queue.clone()
    }
}

impl FromRef<ServerState> for GuardedNotificationHub {
    fn from_ref(input: &ServerState) -> Self {
        input.hub.clone()
    }
}

impl FromRef<ServerState> for GuardedSubmissionGateway {
    fn from_ref(input: &ServerState) -> Self {
        input.gateway.clone()
    }
}

impl FromRef<ServerState> for GuardedTaskController {
    fn from_ref(input: &ServerState) -> Self {
        input.controller.clone()
    }
}

impl FromRef<ServerState> for GuardedQueryService {
    fn from_ref(input: &ServerState) -> Self {
        input.query.clone()
    }
}
