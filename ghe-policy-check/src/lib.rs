#[macro_use]
extern crate tracing;

pub mod api;
pub mod commands;
pub mod config;
pub mod extract;
pub mod http;
pub mod job_queue;
pub mod jobs;
pub mod listener;
pub mod log;
pub mod repo_polling;
pub mod service;
pub mod sync_collaborators;
pub mod sync_users;
pub mod utils;
pub mod webhook;

use std::sync::Arc;

use anyhow::Context as _;
use github_api::GitHubInstance;
use policy_store::DynPolicyStore;

use crate::config::{Conf, ConfHandle};
use crate::job_queue::{JobQueueHandle, JobQueueReceiver};
use crate::sync_collaborators::KeyedLocks;
use crate::webhook::WebhookDispatcher;

#[derive(Clone)]
pub struct PolicyState {
    pub conf_handle: ConfHandle,
    pub store: DynPolicyStore,
    /// Rotating site admin tokens, used for impersonation
    pub github: GitHubInstance,
    /// Owner token, used to list organization admins
    pub owner_github: GitHubInstance,
    pub job_queue_handle: JobQueueHandle,
    pub sync_locks: KeyedLocks,
    pub webhooks: Arc<WebhookDispatcher>,
}

impl PolicyState {
    pub fn new(conf_handle: ConfHandle, store: DynPolicyStore, job_queue_handle: JobQueueHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let github = GitHubInstance::new(conf.github.admin_tokens.clone(), &conf.github.api_url)
            .context("failed to create the admin GitHub client")?;

        let owner_github = GitHubInstance::new(vec![conf.github.owner_token.clone()], &conf.github.api_url)
            .context("failed to create the owner GitHub client")?;

        Ok(Self {
            conf_handle,
            store,
            github,
            owner_github,
            job_queue_handle,
            sync_locks: KeyedLocks::default(),
            webhooks: Arc::new(webhook::default_dispatcher().context("failed to register webhook handlers")?),
        })
    }

    /// Opens the store configured in `DatabaseFile` and builds the state around it.
    pub async fn open(conf_handle: ConfHandle, job_queue_handle: JobQueueHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let store = policy_store_libsql::LibSqlPolicyStore::open(conf.database_file.as_str())
            .await
            .with_context(|| format!("failed to open database at {}", conf.database_file))?;

        let store: DynPolicyStore = Arc::new(store);

        store.setup().await.context("database setup")?;

        Self::new(conf_handle, store, job_queue_handle)
    }

    /// In-memory state for tests; the returned receiver observes the enqueued jobs.
    pub async fn mock(json_config: &str) -> anyhow::Result<(Self, JobQueueReceiver)> {
        let conf_handle = ConfHandle::mock(json_config)?;

        let store = policy_store_libsql::LibSqlPolicyStore::open(":memory:").await?;
        let store: DynPolicyStore = Arc::new(store);
        store.setup().await?;

        let (job_queue_handle, job_queue_rx) = JobQueueHandle::new();

        let state = Self::new(conf_handle, store, job_queue_handle)?;

        Ok((state, job_queue_rx))
    }

    #[must_use]
    pub fn with_webhooks(mut self, webhooks: WebhookDispatcher) -> Self {
        self.webhooks = Arc::new(webhooks);
        self
    }

    pub fn conf(&self) -> Arc<Conf> {
        self.conf_handle.get_conf()
    }
}

pub fn make_http_service(state: PolicyState) -> axum::Router<()> {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/health", get(api::health::get_health))
        .nest("/api/v1", api::make_router(state.clone()))
        .route("/webhooks", post(webhook::post_webhook))
        .route("/webhooks/", post(webhook::post_webhook))
        .with_state(state)
}
