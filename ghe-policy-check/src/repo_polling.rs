use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use github_api::{GitHubRepo, GithubError};
use policy_store::{Repo, Visibility};
use policy_task::{ShutdownSignal, Task, run_every};
use time::OffsetDateTime;

use crate::PolicyState;
use crate::utils;

/// Decisions taken by each polling round.
///
/// Every method has a default behavior; implementors override the parts of the policy
/// they need, typically [`PollingPolicy::is_non_compliant`].
#[async_trait]
pub trait PollingPolicy: Send + Sync {
    /// Repositories to visit during this round
    async fn get_polling_repos(&self, state: &PolicyState) -> anyhow::Result<Vec<Repo>> {
        default_polling_repos(state).await
    }

    /// Refreshes `repo` from GitHub, returning `None` when it's gone or blocked
    async fn get_and_update_repo(
        &self,
        state: &PolicyState,
        repo: &mut Repo,
        now: OffsetDateTime,
    ) -> anyhow::Result<Option<GitHubRepo>> {
        default_get_and_update_repo(state, repo, now).await
    }

    /// Labels the repository with the compliance topic it deserves, if any
    async fn remind_repo(&self, state: &PolicyState, repo: &Repo, github_repo: &GitHubRepo) -> anyhow::Result<()> {
        let conf = state.conf();

        let topic = if !repo.is_classified() {
            &conf.policy.not_classified_topic
        } else if self.is_non_compliant(repo) {
            &conf.policy.non_compliant_topic
        } else {
            return Ok(());
        };

        add_topic(state, repo, github_repo, topic).await
    }

    fn is_non_compliant(&self, repo: &Repo) -> bool {
        repo.is_non_compliant()
    }
}

pub struct DefaultPollingPolicy;

impl PollingPolicy for DefaultPollingPolicy {}

pub async fn default_polling_repos(state: &PolicyState) -> anyhow::Result<Vec<Repo>> {
    let total = state.store.count_repos().await?;
    let limit = state.conf().policy.polling_chunk(total);

    state.store.polling_repos(limit).await
}

enum Fetched {
    Repo(GitHubRepo),
    Blocked,
    NotFound,
}

async fn fetch_as(state: &PolicyState, login: &str, github_id: i64) -> Result<Fetched, GithubError> {
    match utils::get_github_repo(state, login, github_id).await {
        Ok(github_repo) => Ok(Fetched::Repo(github_repo)),
        Err(GithubError::RepositoryBlocked) => Ok(Fetched::Blocked),
        Err(GithubError::NotFound(_)) => Ok(Fetched::NotFound),
        Err(error) => Err(error),
    }
}

pub async fn default_get_and_update_repo(
    state: &PolicyState,
    repo: &mut Repo,
    now: OffsetDateTime,
) -> anyhow::Result<Option<GitHubRepo>> {
    repo.last_polling_check = Some(now);
    state.store.save_repo(repo).await?;

    let login = utils::owner_login(state, repo).await?;

    let mut fetched = fetch_as(state, &login, repo.github_id)
        .await
        .with_context(|| format!("failed to fetch {}", repo.repo_name))?;

    if let Fetched::NotFound = fetched
        && let Some(org_id) = repo.org_id
    {
        let org = state
            .store
            .get_org(org_id)
            .await?
            .context("organization of the repository is missing")?;

        let owner = utils::get_org_owner(state, &org.org_name).await?;

        debug!(repo = %repo.repo_name, owner = %owner.username, "Retrying as the organization owner");

        repo.owner_id = owner.id;
        state.store.save_repo(repo).await?;

        fetched = fetch_as(state, &owner.username, repo.github_id)
            .await
            .with_context(|| format!("failed to fetch {}", repo.repo_name))?;
    }

    let github_repo = match fetched {
        Fetched::Repo(github_repo) => github_repo,
        Fetched::Blocked => {
            info!(repo = %repo.repo_name, "Repository is blocked");
            repo.disabled = true;
            state.store.save_repo(repo).await?;
            return Ok(None);
        }
        Fetched::NotFound => {
            info!(repo = %repo.repo_name, "Repository is gone, deleting it");
            state.store.delete_repo(repo.id).await?;
            return Ok(None);
        }
    };

    let classification = utils::get_classification(&state.conf().policy, &github_repo.topics);

    repo.repo_name = github_repo.full_name.clone();
    repo.size = github_repo.size;
    repo.description = github_repo.description.clone();
    repo.set_classification(classification, now);
    repo.visibility = github_repo.effective_visibility().parse::<Visibility>()?;
    repo.disabled = github_repo.disabled;
    repo.html_url = github_repo.html_url.clone();

    state.store.save_repo(repo).await?;

    Ok(Some(github_repo))
}

/// Adds `topic` to the repository while impersonating its owner; GitHub errors are only logged.
pub async fn add_topic(state: &PolicyState, repo: &Repo, github_repo: &GitHubRepo, topic: &str) -> anyhow::Result<()> {
    let login = utils::owner_login(state, repo).await?;

    let owner = github_repo.owner.login.clone();
    let name = github_repo.name.clone();
    let topics = vec![topic.to_owned()];

    let result = state
        .github
        .impersonate_user(&login, |gh| async move {
            gh.add_repository_topics(&owner, &name, &topics).await
        })
        .await;

    match result {
        Ok(_) => info!(repo = %repo.repo_name, topic, "Reminded repository owner"),
        Err(error) => debug!(repo = %repo.repo_name, error = format!("{error:#}"), "Couldn't add topic"),
    }

    Ok(())
}

/// Visits one chunk of the repositories, oldest checks first.
pub async fn run_repo_polling(state: &PolicyState, policy: &dyn PollingPolicy) -> anyhow::Result<()> {
    let now = OffsetDateTime::now_utc();
    let reminder_minutes = state.conf().policy.reminder_minutes;

    let repos = policy.get_polling_repos(state).await?;

    debug!(count = repos.len(), "Polling repositories");

    for mut repo in repos {
        info!(repo = %repo.repo_name, "Syncing repository");

        let needs_reminder = repo.is_reminder_candidate(now, reminder_minutes);

        let github_repo = match policy.get_and_update_repo(state, &mut repo, now).await {
            Ok(Some(github_repo)) => github_repo,
            Ok(None) => {
                info!(repo = %repo.repo_name, "Couldn't update repository");
                continue;
            }
            Err(error) => {
                warn!(repo = %repo.repo_name, error = format!("{error:#}"), "Failed to update repository");
                continue;
            }
        };

        if needs_reminder && let Err(error) = policy.remind_repo(state, &repo, &github_repo).await {
            warn!(repo = %repo.repo_name, error = format!("{error:#}"), "Failed to remind repository owner");
        }
    }

    Ok(())
}

pub struct RepoPollingTask {
    state: PolicyState,
    policy: Arc<dyn PollingPolicy>,
}

impl RepoPollingTask {
    pub fn new(state: PolicyState, policy: Arc<dyn PollingPolicy>) -> Self {
        Self { state, policy }
    }
}

#[async_trait]
impl Task for RepoPollingTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "repository polling";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        repo_polling_task(self, shutdown_signal).await;
        Ok(())
    }
}

#[instrument(skip_all)]
async fn repo_polling_task(task: RepoPollingTask, shutdown_signal: ShutdownSignal) {
    debug!("Task started");

    let RepoPollingTask { state, policy } = task;
    let period = state.conf().policy.polling_period();

    run_every(period, shutdown_signal, || {
        let state = state.clone();
        let policy = Arc::clone(&policy);

        async move {
            if let Err(error) = run_repo_polling(&state, policy.as_ref()).await {
                error!(error = format!("{error:#}"), "Repository polling failed");
            }
        }
    })
    .await;

    debug!("Task terminated");
}
