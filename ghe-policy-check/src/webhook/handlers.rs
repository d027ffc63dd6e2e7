use anyhow::Context as _;
use axum::http::StatusCode;
use axum::response::{IntoResponse as _, Response};
use github_api::{GitHubOrg, GitHubRepo, GitHubTeam, GitHubUser};
use policy_store::{NewRepo, Org, Repo, Team, Visibility};
use serde::Deserialize;

use super::{WebhookDispatcher, WebhookEvent, handler};
use crate::PolicyState;
use crate::http::HttpError;
use crate::jobs::{AddMembershipJob, AddOrgMemberJob, DeleteRepositoryJob, SyncRepoCollaboratorsJob};
use crate::utils;

#[derive(Deserialize)]
struct RepositoryPayload {
    repository: GitHubRepo,
}

#[derive(Deserialize)]
struct ForkPayload {
    forkee: GitHubRepo,
    repository: GitHubRepo,
}

#[derive(Deserialize)]
struct MembershipPayload {
    member: GitHubUser,
    team: GitHubTeam,
    organization: GitHubOrg,
}

#[derive(Deserialize)]
struct OrgMembership {
    user: GitHubUser,
}

#[derive(Deserialize)]
struct OrganizationPayload {
    organization: GitHubOrg,
    #[serde(default)]
    membership: Option<OrgMembership>,
}

#[derive(Deserialize)]
struct TeamPayload {
    team: GitHubTeam,
    organization: GitHubOrg,
    #[serde(default)]
    repository: Option<GitHubRepo>,
}

/// Handlers keeping the local mirror in sync with GitHub.
pub fn default_dispatcher() -> anyhow::Result<WebhookDispatcher> {
    let mut dispatcher = WebhookDispatcher::default();

    dispatcher.on_event("ping", handler(ping));
    dispatcher.on_event("fork", handler(fork));

    for action in ["created", "transferred", "renamed", "edited", "publicized", "privatized"] {
        dispatcher.on_action("repository", action, handler(repository_changed))?;
    }
    dispatcher.on_action("repository", "deleted", handler(repository_deleted))?;
    dispatcher.on_action("repository", "archived", handler(repository_archived))?;
    dispatcher.on_action("repository", "unarchived", handler(repository_archived))?;

    for action in ["added", "removed", "edited"] {
        dispatcher.on_action("member", action, handler(member_changed))?;
    }

    dispatcher.on_action("membership", "added", handler(membership_added))?;
    dispatcher.on_action("membership", "removed", handler(membership_removed))?;

    dispatcher.on_action("organization", "member_added", handler(organization_member_added))?;
    dispatcher.on_action("organization", "member_removed", handler(organization_member_removed))?;
    dispatcher.on_action("organization", "deleted", handler(organization_deleted))?;

    dispatcher.on_action("team", "created", handler(team_created))?;
    dispatcher.on_action("team", "deleted", handler(team_deleted))?;
    dispatcher.on_action("team", "edited", handler(team_edited))?;
    dispatcher.on_action("team", "added_to_repository", handler(team_added_to_repository))?;
    dispatcher.on_action("team", "removed_from_repository", handler(team_removed_from_repository))?;

    Ok(dispatcher)
}

fn ok() -> Response {
    StatusCode::OK.into_response()
}

async fn enqueue_sync(state: &PolicyState, github_id: i64) -> Result<(), HttpError> {
    let job = SyncRepoCollaboratorsJob::now(github_id).map_err(HttpError::internal().err())?;

    state
        .job_queue_handle
        .enqueue(&job)
        .await
        .map_err(HttpError::internal().err())
}

async fn enqueue_syncs(state: &PolicyState, repos: Vec<Repo>) -> Result<(), HttpError> {
    for repo in repos {
        enqueue_sync(state, repo.github_id).await?;
    }
    Ok(())
}

async fn ensure_org(state: &PolicyState, github_org: &GitHubOrg) -> anyhow::Result<Org> {
    ensure_org_by_id(state, github_org.id, &github_org.login).await
}

async fn ensure_org_by_id(state: &PolicyState, github_id: i64, login: &str) -> anyhow::Result<Org> {
    if let Some(org) = state.store.get_org_by_github_id(github_id).await? {
        return Ok(org);
    }

    let owner = utils::get_org_owner(state, login).await?;

    state.store.org_from_github(github_id, login, owner.id).await
}

async fn ensure_team(state: &PolicyState, github_team: &GitHubTeam, github_org: &GitHubOrg) -> anyhow::Result<Team> {
    let org = ensure_org(state, github_org).await?;

    state
        .store
        .team_from_github(github_team.id, &github_team.name, &github_team.slug, org.id)
        .await
}

/// Creates or refreshes the local copy of a repository from a webhook payload.
async fn upsert_repo(state: &PolicyState, github_repo: &GitHubRepo, fork_source_id: Option<i64>) -> anyhow::Result<Repo> {
    let (owner_id, org_id) = if github_repo.owner.is_organization() {
        let org = ensure_org_by_id(state, github_repo.owner.id, &github_repo.owner.login).await?;
        (org.owner_id, Some(org.id))
    } else {
        (utils::ensure_user(state, &github_repo.owner).await?.id, None)
    };

    let classification = utils::get_classification(&state.conf().policy, &github_repo.topics);
    let visibility = github_repo.effective_visibility().parse::<Visibility>()?;

    let Some(mut repo) = state.store.get_repo_by_github_id(github_repo.id).await? else {
        let new_repo = NewRepo::builder()
            .repo_name(github_repo.full_name.as_str())
            .github_id(github_repo.id)
            .owner_id(owner_id)
            .org_id(org_id)
            .description(github_repo.description.clone())
            .classification(classification)
            .visibility(visibility)
            .html_url(github_repo.html_url.clone())
            .fork_source_id(fork_source_id)
            .size(github_repo.size)
            .disabled(github_repo.disabled)
            .build();

        let repo = state.store.insert_repo(new_repo).await?;
        info!(repo = %repo.repo_name, "Created repository");

        return Ok(repo);
    };

    repo.repo_name = github_repo.full_name.clone();
    repo.description = github_repo.description.clone();
    repo.visibility = visibility;
    repo.html_url = github_repo.html_url.clone();
    repo.size = github_repo.size;
    repo.disabled = github_repo.disabled;
    repo.owner_id = owner_id;
    repo.org_id = org_id;
    repo.set_classification(classification, time::OffsetDateTime::now_utc());

    if fork_source_id.is_some() {
        repo.fork_source_id = fork_source_id;
    }

    state.store.save_repo(&repo).await?;
    debug!(repo = %repo.repo_name, "Updated repository");

    Ok(repo)
}

async fn ping(_: PolicyState, _: WebhookEvent) -> Result<Response, HttpError> {
    Ok(ok())
}

async fn fork(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: ForkPayload = event.payload()?;

    let source = state
        .store
        .get_repo_by_github_id(payload.repository.id)
        .await
        .map_err(HttpError::internal().err())?;

    if source.is_none() {
        warn!(repo = %payload.repository.full_name, "Fork source is unknown");
    }

    let fork = upsert_repo(&state, &payload.forkee, source.map(|source| source.id))
        .await
        .map_err(HttpError::internal().err())?;

    enqueue_sync(&state, fork.github_id).await?;

    Ok(ok())
}

async fn repository_changed(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: RepositoryPayload = event.payload()?;

    let repo = upsert_repo(&state, &payload.repository, None)
        .await
        .map_err(HttpError::internal().err())?;

    enqueue_sync(&state, repo.github_id).await?;

    Ok(ok())
}

async fn repository_deleted(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: RepositoryPayload = event.payload()?;

    state
        .job_queue_handle
        .enqueue(&DeleteRepositoryJob {
            github_id: payload.repository.id,
        })
        .await
        .map_err(HttpError::internal().err())?;

    Ok(ok())
}

async fn repository_archived(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: RepositoryPayload = event.payload()?;

    upsert_repo(&state, &payload.repository, None)
        .await
        .map_err(HttpError::internal().err())?;

    Ok(ok())
}

async fn member_changed(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: RepositoryPayload = event.payload()?;

    enqueue_sync(&state, payload.repository.id).await?;

    Ok(ok())
}

async fn membership_added(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: MembershipPayload = event.payload()?;

    utils::ensure_user(&state, &payload.member)
        .await
        .map_err(HttpError::internal().err())?;

    state
        .job_queue_handle
        .enqueue(&AddMembershipJob {
            team_github_id: payload.team.id,
            user_github_id: payload.member.id,
        })
        .await
        .map_err(HttpError::internal().err())?;

    debug!(org = %payload.organization.login, team = %payload.team.slug, "Team membership queued");

    Ok(ok())
}

async fn membership_removed(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: MembershipPayload = event.payload()?;

    let repos = remove_team_member(&state, &payload)
        .await
        .map_err(HttpError::internal().err())?;

    enqueue_syncs(&state, repos).await?;

    Ok(ok())
}

/// Returns the repositories of the team, whose collaborators need a refresh.
async fn remove_team_member(state: &PolicyState, payload: &MembershipPayload) -> anyhow::Result<Vec<Repo>> {
    let Some(team) = state.store.get_team_by_github_id(payload.team.id).await? else {
        info!(team = %payload.team.slug, "Unknown team");
        return Ok(Vec::new());
    };

    if let Some(user) = state.store.get_user_by_github_id(payload.member.id).await? {
        state.store.remove_team_member(team.id, user.id).await?;
        info!(team = %team.team_slug, user = %user.username, "Removed team member");
    }

    state.store.team_repos(team.id).await
}

async fn organization_member_added(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: OrganizationPayload = event.payload()?;

    let membership = payload
        .membership
        .ok_or_else(|| HttpError::bad_request().msg("membership is missing"))?;

    async {
        ensure_org(&state, &payload.organization).await?;
        utils::ensure_user(&state, &membership.user).await?;

        state
            .job_queue_handle
            .enqueue(&AddOrgMemberJob {
                org_github_id: payload.organization.id,
                user_github_id: membership.user.id,
            })
            .await
    }
    .await
    .map_err(HttpError::internal().err())?;

    Ok(ok())
}

async fn organization_member_removed(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: OrganizationPayload = event.payload()?;

    let membership = payload
        .membership
        .ok_or_else(|| HttpError::bad_request().msg("membership is missing"))?;

    let repos = async {
        let Some(org) = state.store.get_org_by_github_id(payload.organization.id).await? else {
            info!(org = %payload.organization.login, "Unknown organization");
            return Ok(Vec::new());
        };

        if let Some(user) = state.store.get_user_by_github_id(membership.user.id).await? {
            state.store.remove_org_member(org.id, user.id).await?;
            info!(org = %org.org_name, user = %user.username, "Removed organization member");
        }

        state.store.org_repos(org.id).await
    }
    .await
    .map_err(HttpError::internal().err())?;

    enqueue_syncs(&state, repos).await?;

    Ok(ok())
}

async fn organization_deleted(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: OrganizationPayload = event.payload()?;

    async {
        if let Some(org) = state.store.get_org_by_github_id(payload.organization.id).await? {
            state.store.delete_org(org.id).await?;
            info!(org = %org.org_name, "Deleted organization");
        }
        anyhow::Ok(())
    }
    .await
    .map_err(HttpError::internal().err())?;

    Ok(ok())
}

async fn team_created(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: TeamPayload = event.payload()?;

    let team = ensure_team(&state, &payload.team, &payload.organization)
        .await
        .map_err(HttpError::internal().err())?;

    info!(team = %team.team_slug, "Created team");

    Ok(ok())
}

async fn team_deleted(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: TeamPayload = event.payload()?;

    async {
        if let Some(team) = state.store.get_team_by_github_id(payload.team.id).await? {
            state.store.delete_team(team.id).await?;
            info!(team = %team.team_slug, "Deleted team");
        }
        anyhow::Ok(())
    }
    .await
    .map_err(HttpError::internal().err())?;

    Ok(ok())
}

async fn team_edited(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: TeamPayload = event.payload()?;

    async {
        let mut team = ensure_team(&state, &payload.team, &payload.organization).await?;

        team.team_name = payload.team.name.clone();
        team.team_slug = payload.team.slug.clone();

        state.store.save_team(&team).await
    }
    .await
    .map_err(HttpError::internal().err())?;

    Ok(ok())
}

async fn team_added_to_repository(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: TeamPayload = event.payload()?;

    let github_repo = payload
        .repository
        .as_ref()
        .ok_or_else(|| HttpError::bad_request().msg("repository is missing"))?;

    async {
        let team = ensure_team(&state, &payload.team, &payload.organization).await?;

        let repo = match state.store.get_repo_by_github_id(github_repo.id).await? {
            Some(repo) => repo,
            None => upsert_repo(&state, github_repo, None).await?,
        };

        state
            .store
            .add_team_repo(team.id, repo.id)
            .await
            .with_context(|| format!("failed to link {} to {}", team.team_slug, repo.repo_name))
    }
    .await
    .map_err(HttpError::internal().err())?;

    enqueue_sync(&state, github_repo.id).await?;

    Ok(ok())
}

async fn team_removed_from_repository(state: PolicyState, event: WebhookEvent) -> Result<Response, HttpError> {
    let payload: TeamPayload = event.payload()?;

    let github_repo = payload
        .repository
        .as_ref()
        .ok_or_else(|| HttpError::bad_request().msg("repository is missing"))?;

    async {
        let team = state.store.get_team_by_github_id(payload.team.id).await?;
        let repo = state.store.get_repo_by_github_id(github_repo.id).await?;

        if let (Some(team), Some(repo)) = (team, repo) {
            state.store.remove_team_repo(team.id, repo.id).await?;
        }

        anyhow::Ok(())
    }
    .await
    .map_err(HttpError::internal().err())?;

    enqueue_sync(&state, github_repo.id).await?;

    Ok(ok())
}
