use github_api::{GitHubRepo, GithubError};
use policy_store::Repo;
use time::OffsetDateTime;

use crate::PolicyState;
use crate::utils;

/// Links every known fork to its source repository.
///
/// Repositories are visited in creation order, optionally starting at `created`.
pub async fn sync_forks(state: &PolicyState, created: Option<OffsetDateTime>) -> anyhow::Result<()> {
    let repos = state.store.repos_created_since(created).await?;

    info!(count = repos.len(), "Synchronizing forks");

    for repo in repos {
        let forks = match get_forks(state, &repo).await {
            Ok(Some(forks)) => forks,
            Ok(None) => continue,
            Err(error) => {
                warn!(repo = %repo.repo_name, error = format!("{error:#}"), "Couldn't list forks");
                continue;
            }
        };

        for fork in forks {
            let Some(mut local_fork) = state.store.get_repo_by_name(&fork.full_name).await? else {
                info!(fork = %fork.full_name, source = %repo.repo_name, "Fork is not known locally");
                continue;
            };

            local_fork.fork_source_id = Some(repo.id);
            state.store.save_repo(&local_fork).await?;

            debug!(fork = %local_fork.repo_name, source = %repo.repo_name, "Fork linked");
        }
    }

    Ok(())
}

/// Lists the forks of `repo` as its owner; `None` when the repository can't be read.
async fn get_forks(state: &PolicyState, repo: &Repo) -> anyhow::Result<Option<Vec<GitHubRepo>>> {
    let login = utils::owner_login(state, repo).await?;

    let mut retried = false;

    loop {
        let (owner, name) = repo.owner_and_name();
        let (owner, name) = (owner.to_owned(), name.to_owned());

        let result = state
            .github
            .impersonate_user(&login, |gh| async move { gh.get_repository_forks(&owner, &name).await })
            .await;

        match result {
            Ok(forks) => return Ok(Some(forks)),
            Err(GithubError::Client(message)) if !retried => {
                debug!(repo = %repo.repo_name, %message, "Retrying fork listing");
                retried = true;
            }
            Err(GithubError::RepositoryBlocked) => {
                info!(repo = %repo.repo_name, "Repository is blocked");
                return Ok(None);
            }
            Err(GithubError::NotFound(_)) => {
                info!(repo = %repo.repo_name, "Repository not found on GitHub");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }
    }
}
