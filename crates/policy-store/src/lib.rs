//! Entities mirrored from GitHub Enterprise and the storage interface used to persist them.

mod model;
mod query;

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

pub use model::{NewRepo, Org, Repo, Team, User, Visibility};
pub use query::{
    InvalidOrdering, Listing, OrderField, OrgFilter, OrgOrderField, Ordering, Page, RepoFilter, RepoOrderField,
    TeamFilter, TeamOrderField, UserFilter, UserOrderField,
};

pub type DynPolicyStore = Arc<dyn PolicyStore>;

/// Persistence of users, organizations, teams and repositories.
///
/// Lookups return `Ok(None)` when nothing matches. Deleting an owner cascades to what it
/// owns, deleting a fork source only clears the link.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Performs initial setup required before actually using the store
    ///
    /// This function should be called first, before using any of the other functions.
    async fn setup(&self) -> anyhow::Result<()>;

    // -- Users -- //

    async fn get_user(&self, id: i64) -> anyhow::Result<Option<User>>;

    async fn get_user_by_github_id(&self, github_id: i64) -> anyhow::Result<Option<User>>;

    async fn get_user_by_username(&self, username: &str) -> anyhow::Result<Option<User>>;

    /// Returns the user with this GitHub id, creating or re-linking it by username if needed
    async fn user_from_github(
        &self,
        github_id: i64,
        login: &str,
        suspended_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<User>;

    async fn save_user(&self, user: &User) -> anyhow::Result<()>;

    async fn delete_user(&self, id: i64) -> anyhow::Result<()>;

    async fn list_users(&self, filter: &UserFilter, page: Page) -> anyhow::Result<Listing<User>>;

    /// Users synced the longest time ago first, never synced users before anything else
    async fn polling_users(&self, limit: u64) -> anyhow::Result<Vec<User>>;

    async fn count_users(&self) -> anyhow::Result<u64>;

    async fn users_by_github_ids(&self, github_ids: &[i64]) -> anyhow::Result<Vec<User>>;

    // -- Organizations -- //

    async fn get_org(&self, id: i64) -> anyhow::Result<Option<Org>>;

    async fn get_org_by_github_id(&self, github_id: i64) -> anyhow::Result<Option<Org>>;

    async fn get_org_by_name(&self, org_name: &str) -> anyhow::Result<Option<Org>>;

    /// Returns the organization with this GitHub id, creating it with `owner_id` if needed
    async fn org_from_github(&self, github_id: i64, org_name: &str, owner_id: i64) -> anyhow::Result<Org>;

    async fn save_org(&self, org: &Org) -> anyhow::Result<()>;

    async fn delete_org(&self, id: i64) -> anyhow::Result<()>;

    async fn add_org_member(&self, org_id: i64, user_id: i64) -> anyhow::Result<()>;

    async fn remove_org_member(&self, org_id: i64, user_id: i64) -> anyhow::Result<()>;

    async fn org_members(&self, org_id: i64) -> anyhow::Result<Vec<User>>;

    async fn list_orgs(&self, filter: &OrgFilter, page: Page) -> anyhow::Result<Listing<Org>>;

    // -- Teams -- //

    async fn get_team(&self, id: i64) -> anyhow::Result<Option<Team>>;

    async fn get_team_by_github_id(&self, github_id: i64) -> anyhow::Result<Option<Team>>;

    /// Returns the team with this GitHub id, creating it if needed
    async fn team_from_github(
        &self,
        github_id: i64,
        team_name: &str,
        team_slug: &str,
        org_id: i64,
    ) -> anyhow::Result<Team>;

    async fn save_team(&self, team: &Team) -> anyhow::Result<()>;

    async fn delete_team(&self, id: i64) -> anyhow::Result<()>;

    async fn add_team_member(&self, team_id: i64, user_id: i64) -> anyhow::Result<()>;

    async fn remove_team_member(&self, team_id: i64, user_id: i64) -> anyhow::Result<()>;

    async fn team_members(&self, team_id: i64) -> anyhow::Result<Vec<User>>;

    async fn add_team_repo(&self, team_id: i64, repo_id: i64) -> anyhow::Result<()>;

    async fn remove_team_repo(&self, team_id: i64, repo_id: i64) -> anyhow::Result<()>;

    async fn team_repos(&self, team_id: i64) -> anyhow::Result<Vec<Repo>>;

    async fn list_teams(&self, filter: &TeamFilter, page: Page) -> anyhow::Result<Listing<Team>>;

    // -- Repositories -- //

    async fn get_repo(&self, id: i64) -> anyhow::Result<Option<Repo>>;

    async fn get_repo_by_github_id(&self, github_id: i64) -> anyhow::Result<Option<Repo>>;

    async fn get_repo_by_name(&self, repo_name: &str) -> anyhow::Result<Option<Repo>>;

    async fn insert_repo(&self, repo: NewRepo) -> anyhow::Result<Repo>;

    async fn save_repo(&self, repo: &Repo) -> anyhow::Result<()>;

    async fn delete_repo(&self, id: i64) -> anyhow::Result<()>;

    async fn list_repos(&self, filter: &RepoFilter, page: Page) -> anyhow::Result<Listing<Repo>>;

    /// Repositories polled the longest time ago first, never polled ones before anything else
    async fn polling_repos(&self, limit: u64) -> anyhow::Result<Vec<Repo>>;

    async fn count_repos(&self) -> anyhow::Result<u64>;

    /// Repositories ordered by creation date, optionally only those created at or after `since`
    async fn repos_created_since(&self, since: Option<OffsetDateTime>) -> anyhow::Result<Vec<Repo>>;

    async fn org_repos(&self, org_id: i64) -> anyhow::Result<Vec<Repo>>;

    /// Replaces the whole collaborator set of a repository
    async fn set_repo_collaborators(&self, repo_id: i64, user_ids: &[i64]) -> anyhow::Result<()>;

    async fn add_repo_collaborator(&self, repo_id: i64, user_id: i64) -> anyhow::Result<()>;

    async fn remove_repo_collaborator(&self, repo_id: i64, user_id: i64) -> anyhow::Result<()>;

    async fn repo_collaborators(&self, repo_id: i64) -> anyhow::Result<Vec<User>>;

    async fn repo_teams(&self, repo_id: i64) -> anyhow::Result<Vec<Team>>;
}
