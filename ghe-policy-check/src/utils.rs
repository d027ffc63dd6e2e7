use anyhow::Context as _;
use github_api::{GitHubRepo, GitHubUser, GithubError};
use policy_store::{Repo, User};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::PolicyState;
use crate::config::PolicyConf;

/// `%Y%m%d%H%M%S%f`, always UTC.
const SENT_FORMAT: &[FormatItem<'_>] =
    format_description!("[year][month][day][hour][minute][second][subsecond digits:6]");

#[derive(Debug, thiserror::Error)]
#[error("GitHub owner user {0} doesn't exist locally")]
pub struct GithubOwnerDoesNotExist(pub String);

pub fn format_sent(at: OffsetDateTime) -> anyhow::Result<String> {
    at.to_offset(UtcOffset::UTC)
        .format(SENT_FORMAT)
        .context("failed to format timestamp")
}

pub fn parse_sent(sent: &str) -> anyhow::Result<OffsetDateTime> {
    PrimitiveDateTime::parse(sent, SENT_FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .with_context(|| format!("invalid timestamp: {sent}"))
}

/// First topic that is a configured classification value.
pub fn get_classification(policy: &PolicyConf, topics: &[String]) -> Option<String> {
    topics.iter().find(|topic| policy.is_classification(topic)).cloned()
}

/// Picks the local user standing as owner of an organization.
///
/// The first admin which isn't the global owner account wins. The global owner is only
/// used as a fallback, and must already exist locally.
pub async fn get_org_owner(state: &PolicyState, org: &str) -> anyhow::Result<User> {
    let conf = state.conf();
    let owner_user = conf.github.owner_user.as_str();

    let admins = state
        .owner_github
        .get_org_admins(org)
        .await
        .with_context(|| format!("failed to list admins of {org}"))?;

    if let Some(admin) = admins.iter().find(|admin| admin.login != owner_user) {
        return state
            .store
            .user_from_github(admin.id, &admin.login, admin.suspended_at)
            .await;
    }

    state
        .store
        .get_user_by_username(owner_user)
        .await?
        .ok_or_else(|| GithubOwnerDoesNotExist(owner_user.to_owned()).into())
}

/// Contact address of a repository owner, user or organization.
pub async fn get_email(state: &PolicyState, github_repo: &GitHubRepo) -> Result<Option<String>, GithubError> {
    let owner = &github_repo.owner;

    if owner.is_organization() {
        Ok(state.github.get_org(&owner.login).await?.email)
    } else {
        Ok(state.github.get_user(&owner.login).await?.email)
    }
}

/// Login of the local owner of a repository, used for impersonation.
pub async fn owner_login(state: &PolicyState, repo: &Repo) -> anyhow::Result<String> {
    let owner = state
        .store
        .get_user(repo.owner_id)
        .await?
        .with_context(|| format!("owner of {} is missing", repo.repo_name))?;

    Ok(owner.username)
}

/// Fetches a repository by id while impersonating `login`.
pub async fn get_github_repo(state: &PolicyState, login: &str, github_id: i64) -> Result<GitHubRepo, GithubError> {
    state
        .github
        .impersonate_user(login, |gh| async move { gh.get_repo_by_id(github_id).await })
        .await
}

/// Returns the local user for a GitHub account, creating it when needed.
pub async fn ensure_user(state: &PolicyState, user: &GitHubUser) -> anyhow::Result<User> {
    state.store.user_from_github(user.id, &user.login, user.suspended_at).await
}

/// Tells whether an error chain carries a GitHub NotFound.
pub fn is_github_not_found(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<GithubError>()
        .is_some_and(GithubError::is_not_found)
}
