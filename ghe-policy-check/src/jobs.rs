//! Background jobs, persisted in the job queue until they succeed.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use job_queue::{DynJob, Job, JobReader, RetryPolicy};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use crate::PolicyState;
use crate::{sync_collaborators, utils};

/// Events may reach us before the objects they refer to, retry shortly.
const OUT_OF_ORDER_BACKOFF: Duration = Duration::from_secs(10);

#[async_trait]
pub trait PolicyJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::DEFAULT
    }

    async fn run(&self, state: &PolicyState) -> anyhow::Result<()>;
}

/// A deserialized job along with the state it runs against.
struct BoundJob<J> {
    job: J,
    state: PolicyState,
}

#[async_trait]
impl<J: PolicyJob> Job for BoundJob<J> {
    fn name(&self) -> &str {
        J::NAME
    }

    fn write_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(&self.job).context("failed to serialize job")
    }

    fn retry_policy(&self) -> RetryPolicy {
        J::retry_policy()
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        self.job.run(&self.state).await
    }
}

pub struct PolicyJobReader {
    state: PolicyState,
}

impl PolicyJobReader {
    pub fn new(state: PolicyState) -> Self {
        Self { state }
    }

    fn bind<J: PolicyJob>(&self, json: &str) -> anyhow::Result<DynJob> {
        let job: J = serde_json::from_str(json).with_context(|| format!("failed to deserialize {}", J::NAME))?;

        Ok(Box::new(BoundJob {
            job,
            state: self.state.clone(),
        }))
    }
}

impl JobReader for PolicyJobReader {
    fn read_json(&self, name: &str, json: &str) -> anyhow::Result<DynJob> {
        match name {
            SyncRepoCollaboratorsJob::NAME => self.bind::<SyncRepoCollaboratorsJob>(json),
            DeleteRepositoryJob::NAME => self.bind::<DeleteRepositoryJob>(json),
            AddMembershipJob::NAME => self.bind::<AddMembershipJob>(json),
            AddOrgMemberJob::NAME => self.bind::<AddOrgMemberJob>(json),
            _ => anyhow::bail!("unknown job name: {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct SyncRepoCollaboratorsJob {
    pub github_id: i64,
    /// When the sync was requested, see [`utils::format_sent`]
    pub sent: String,
}

impl SyncRepoCollaboratorsJob {
    pub fn now(github_id: i64) -> anyhow::Result<Self> {
        Ok(Self {
            github_id,
            sent: utils::format_sent(OffsetDateTime::now_utc())?,
        })
    }
}

#[async_trait]
impl PolicyJob for SyncRepoCollaboratorsJob {
    const NAME: &'static str = "sync-repo-collaborators";

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::DEFAULT.with_max_attempts(2)
    }

    async fn run(&self, state: &PolicyState) -> anyhow::Result<()> {
        match sync_collaborators::run_sync_repo_collaborators(state, self.github_id, &self.sent).await {
            Err(error) if utils::is_github_not_found(&error) => {
                info!(github_id = self.github_id, error = format!("{error:#}"), "Could not access repository");
                Ok(())
            }
            result => result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct DeleteRepositoryJob {
    pub github_id: i64,
}

#[async_trait]
impl PolicyJob for DeleteRepositoryJob {
    const NAME: &'static str = "delete-repository";

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::DEFAULT.with_backoff(OUT_OF_ORDER_BACKOFF)
    }

    async fn run(&self, state: &PolicyState) -> anyhow::Result<()> {
        let repo = state
            .store
            .get_repo_by_github_id(self.github_id)
            .await?
            .with_context(|| format!("repository {} not found", self.github_id))?;

        state.store.delete_repo(repo.id).await?;

        info!(repo = %repo.repo_name, "Deleted repository");

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct AddMembershipJob {
    pub team_github_id: i64,
    pub user_github_id: i64,
}

#[async_trait]
impl PolicyJob for AddMembershipJob {
    const NAME: &'static str = "add-membership";

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::DEFAULT.with_backoff(OUT_OF_ORDER_BACKOFF)
    }

    async fn run(&self, state: &PolicyState) -> anyhow::Result<()> {
        let team = state
            .store
            .get_team_by_github_id(self.team_github_id)
            .await?
            .with_context(|| format!("team {} not found", self.team_github_id))?;

        let user = state
            .store
            .get_user_by_github_id(self.user_github_id)
            .await?
            .with_context(|| format!("user {} not found", self.user_github_id))?;

        state.store.add_team_member(team.id, user.id).await?;

        for repo in state.store.team_repos(team.id).await? {
            state.store.add_repo_collaborator(repo.id, user.id).await?;
        }

        info!(team = %team.team_slug, user = %user.username, "Added team member");

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct AddOrgMemberJob {
    pub org_github_id: i64,
    pub user_github_id: i64,
}

#[async_trait]
impl PolicyJob for AddOrgMemberJob {
    const NAME: &'static str = "add-org-member";

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::DEFAULT.with_backoff(OUT_OF_ORDER_BACKOFF)
    }

    async fn run(&self, state: &PolicyState) -> anyhow::Result<()> {
        let org = state
            .store
            .get_org_by_github_id(self.org_github_id)
            .await?
            .with_context(|| format!("organization {} not found", self.org_github_id))?;

        let user = state
            .store
            .get_user_by_github_id(self.user_github_id)
            .await?
            .with_context(|| format!("user {} not found", self.user_github_id))?;

        state.store.add_org_member(org.id, user.id).await?;

        for repo in state.store.org_repos(org.id).await? {
            state
                .job_queue_handle
                .enqueue(&SyncRepoCollaboratorsJob::now(repo.github_id)?)
                .await?;
        }

        info!(org = %org.org_name, user = %user.username, "Added organization member");

        Ok(())
    }
}
