use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use policy_store::{Org, OrgFilter};
use serde::{Deserialize, Serialize};

use super::{ListParams, Paginated};
use crate::PolicyState;
use crate::extract::ApiAccess;
use crate::http::HttpError;

pub fn make_router<S>(state: PolicyState) -> Router<S> {
    Router::new()
        .route("/orgs", get(list_orgs))
        .route("/orgs/", get(list_orgs))
        .route("/orgs/{id}", get(get_org))
        .route("/orgs/{id}/", get(get_org))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct OrgDto {
    pub id: i64,
    pub org_name: String,
    pub github_id: i64,
    /// Local id of the owner
    pub owner: i64,
    pub members: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct OrgQuery {
    org_name: Option<String>,
    github_id: Option<i64>,
    #[serde(rename = "owner__github_id")]
    owner_github_id: Option<i64>,
    ordering: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

async fn to_dto(state: &PolicyState, org: Org) -> anyhow::Result<OrgDto> {
    let members = state.store.org_members(org.id).await?;

    Ok(OrgDto {
        id: org.id,
        org_name: org.org_name,
        github_id: org.github_id,
        owner: org.owner_id,
        members: members.into_iter().map(|user| user.id).collect(),
    })
}

pub(crate) async fn list_orgs(
    State(state): State<PolicyState>,
    _access: ApiAccess,
    Query(query): Query<OrgQuery>,
) -> Result<Json<Paginated<OrgDto>>, HttpError> {
    let params = ListParams {
        ordering: query.ordering,
        limit: query.limit,
        offset: query.offset,
    };

    let filter = OrgFilter {
        org_name: query.org_name,
        github_id: query.github_id,
        owner_github_id: query.owner_github_id,
        ordering: params.ordering()?,
    };

    let listing = state
        .store
        .list_orgs(&filter, params.page())
        .await
        .map_err(HttpError::internal().err())?;

    let mut results = Vec::with_capacity(listing.results.len());
    for org in listing.results.iter().cloned() {
        results.push(to_dto(&state, org).await.map_err(HttpError::internal().err())?);
    }

    Ok(Json(Paginated::from_listing(listing, results)))
}

pub(crate) async fn get_org(
    State(state): State<PolicyState>,
    _access: ApiAccess,
    Path(id): Path<i64>,
) -> Result<Json<OrgDto>, HttpError> {
    let org = state
        .store
        .get_org(id)
        .await
        .map_err(HttpError::internal().err())?
        .ok_or_else(|| HttpError::not_found().msg("organization not found"))?;

    let org = to_dto(&state, org).await.map_err(HttpError::internal().err())?;

    Ok(Json(org))
}
