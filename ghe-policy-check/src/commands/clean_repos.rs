use github_api::GithubError;
use policy_store::Visibility;

use crate::PolicyState;
use crate::utils;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
}

/// Drops the repositories GitHub no longer knows and refreshes the visibility of the others.
pub async fn clean_repos(state: &PolicyState) -> anyhow::Result<CleanReport> {
    let repos = state.store.repos_created_since(None).await?;

    let mut report = CleanReport::default();

    for mut repo in repos {
        let login = match utils::owner_login(state, &repo).await {
            Ok(login) => login,
            Err(error) => {
                warn!(repo = %repo.repo_name, error = format!("{error:#}"), "Skipping repository");
                report.skipped += 1;
                continue;
            }
        };

        match utils::get_github_repo(state, &login, repo.github_id).await {
            Ok(github_repo) => {
                repo.visibility = github_repo.effective_visibility().parse::<Visibility>()?;
                state.store.save_repo(&repo).await?;
                report.updated += 1;
            }
            Err(GithubError::RepositoryBlocked) => {
                debug!(repo = %repo.repo_name, "Repository is blocked");
                report.skipped += 1;
            }
            Err(GithubError::NotFound(_)) => {
                info!(repo = %repo.repo_name, "Deleting repository");
                state.store.delete_repo(repo.id).await?;
                report.deleted += 1;
            }
            Err(error) => {
                warn!(repo = %repo.repo_name, error = format!("{error:#}"), "Couldn't fetch repository");
                report.skipped += 1;
            }
        }
    }

    Ok(report)
}
