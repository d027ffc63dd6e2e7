use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use policy_store::{Team, TeamFilter};
use serde::{Deserialize, Serialize};

use super::{ListParams, Paginated};
use crate::PolicyState;
use crate::extract::ApiAccess;
use crate::http::HttpError;

pub fn make_router<S>(state: PolicyState) -> Router<S> {
    Router::new()
        .route("/teams", get(list_teams))
        .route("/teams/", get(list_teams))
        .route("/teams/{id}", get(get_team))
        .route("/teams/{id}/", get(get_team))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct TeamDto {
    pub id: i64,
    pub team_name: String,
    pub team_slug: String,
    pub github_id: i64,
    pub org: i64,
    pub members: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TeamQuery {
    team_name: Option<String>,
    team_slug: Option<String>,
    github_id: Option<i64>,
    ordering: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

async fn to_dto(state: &PolicyState, team: Team) -> anyhow::Result<TeamDto> {
    let members = state.store.team_members(team.id).await?;

    Ok(TeamDto {
        id: team.id,
        team_name: team.team_name,
        team_slug: team.team_slug,
        github_id: team.github_id,
        org: team.org_id,
        members: members.into_iter().map(|user| user.id).collect(),
    })
}

pub(crate) async fn list_teams(
    State(state): State<PolicyState>,
    _access: ApiAccess,
    Query(query): Query<TeamQuery>,
) -> Result<Json<Paginated<TeamDto>>, HttpError> {
    let params = ListParams {
        ordering: query.ordering,
        limit: query.limit,
        offset: query.offset,
    };

    let filter = TeamFilter {
        team_name: query.team_name,
        team_slug: query.team_slug,
        github_id: query.github_id,
        ordering: params.ordering()?,
    };

    let listing = state
        .store
        .list_teams(&filter, params.page())
        .await
        .map_err(HttpError::internal().err())?;

    let mut results = Vec::with_capacity(listing.results.len());
    for team in listing.results.iter().cloned() {
        results.push(to_dto(&state, team).await.map_err(HttpError::internal().err())?);
    }

    Ok(Json(Paginated::from_listing(listing, results)))
}

pub(crate) async fn get_team(
    State(state): State<PolicyState>,
    _access: ApiAccess,
    Path(id): Path<i64>,
) -> Result<Json<TeamDto>, HttpError> {
    let team = state
        .store
        .get_team(id)
        .await
        .map_err(HttpError::internal().err())?
        .ok_or_else(|| HttpError::not_found().msg("team not found"))?;

    let team = to_dto(&state, team).await.map_err(HttpError::internal().err())?;

    Ok(Json(team))
}
