use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use policy_store::{Repo, RepoFilter, Visibility};
use serde::{Deserialize, Serialize};

use super::{ListParams, Paginated};
use crate::PolicyState;
use crate::extract::ApiAccess;
use crate::http::HttpError;

pub fn make_router<S>(state: PolicyState) -> Router<S> {
    Router::new()
        .route("/repos", get(list_repos))
        .route("/repos/", get(list_repos))
        .route("/repos/{id}", get(get_repo))
        .route("/repos/{id}/", get(get_repo))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct RepoDto {
    pub id: i64,
    pub repo_name: String,
    pub description: Option<String>,
    pub classification: Option<String>,
    pub visibility: &'static str,
    pub github_id: i64,
    pub html_url: Option<String>,
    pub owner: i64,
    pub fork_source: Option<i64>,
    pub size: i64,
    pub disabled: bool,
    pub org: Option<i64>,
    pub collaborators: Vec<i64>,
    pub teams: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RepoQuery {
    repo_name: Option<String>,
    #[serde(rename = "repo_name__icontains")]
    repo_name_icontains: Option<String>,
    github_id: Option<i64>,
    classification: Option<String>,
    visibility: Option<String>,
    html_url: Option<String>,
    #[serde(rename = "owner__github_id")]
    owner_github_id: Option<i64>,
    fork_source: Option<i64>,
    size: Option<i64>,
    #[serde(rename = "size__gte")]
    size_gte: Option<i64>,
    #[serde(rename = "size__lte")]
    size_lte: Option<i64>,
    disabled: Option<bool>,
    ordering: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

async fn to_dto(state: &PolicyState, repo: Repo) -> anyhow::Result<RepoDto> {
    let collaborators = state.store.repo_collaborators(repo.id).await?;
    let teams = state.store.repo_teams(repo.id).await?;

    Ok(RepoDto {
        id: repo.id,
        repo_name: repo.repo_name,
        description: repo.description,
        classification: repo.classification,
        visibility: repo.visibility.as_str(),
        github_id: repo.github_id,
        html_url: repo.html_url,
        owner: repo.owner_id,
        fork_source: repo.fork_source_id,
        size: repo.size,
        disabled: repo.disabled,
        org: repo.org_id,
        collaborators: collaborators.into_iter().map(|user| user.id).collect(),
        teams: teams.into_iter().map(|team| team.id).collect(),
    })
}

pub(crate) async fn list_repos(
    State(state): State<PolicyState>,
    _access: ApiAccess,
    Query(query): Query<RepoQuery>,
) -> Result<Json<Paginated<RepoDto>>, HttpError> {
    let params = ListParams {
        ordering: query.ordering,
        limit: query.limit,
        offset: query.offset,
    };

    let visibility = query
        .visibility
        .as_deref()
        .map(str::parse::<Visibility>)
        .transpose()
        .map_err(HttpError::bad_request().with_msg("invalid visibility").err())?;

    let filter = RepoFilter {
        repo_name: query.repo_name,
        repo_name_icontains: query.repo_name_icontains,
        github_id: query.github_id,
        classification: query.classification,
        visibility,
        html_url: query.html_url,
        owner_github_id: query.owner_github_id,
        fork_source: query.fork_source,
        size: query.size,
        size_gte: query.size_gte,
        size_lte: query.size_lte,
        disabled: query.disabled,
        ordering: params.ordering()?,
    };

    let listing = state
        .store
        .list_repos(&filter, params.page())
        .await
        .map_err(HttpError::internal().err())?;

    let mut results = Vec::with_capacity(listing.results.len());
    for repo in listing.results.iter().cloned() {
        results.push(to_dto(&state, repo).await.map_err(HttpError::internal().err())?);
    }

    Ok(Json(Paginated::from_listing(listing, results)))
}

pub(crate) async fn get_repo(
    State(state): State<PolicyState>,
    _access: ApiAccess,
    Path(id): Path<i64>,
) -> Result<Json<RepoDto>, HttpError> {
    let repo = state
        .store
        .get_repo(id)
        .await
        .map_err(HttpError::internal().err())?
        .ok_or_else(|| HttpError::not_found().msg("repository not found"))?;

    let repo = to_dto(&state, repo).await.map_err(HttpError::internal().err())?;

    Ok(Json(repo))
}
