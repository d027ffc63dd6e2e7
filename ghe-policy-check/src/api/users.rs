use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use policy_store::{User, UserFilter};
use serde::{Deserialize, Serialize};

use super::{ListParams, Paginated};
use crate::PolicyState;
use crate::extract::ApiAccess;
use crate::http::HttpError;

pub fn make_router<S>(state: PolicyState) -> Router<S> {
    Router::new()
        .route("/users", get(list_users))
        .route("/users/", get(list_users))
        .route("/users/{id}", get(get_user))
        .route("/users/{id}/", get(get_user))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct UserDto {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub github_id: i64,
}

impl From<User> for UserDto {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            github_id: user.github_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UserQuery {
    username: Option<String>,
    github_id: Option<i64>,
    email: Option<String>,
    ordering: Option<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

pub(crate) async fn list_users(
    State(state): State<PolicyState>,
    _access: ApiAccess,
    Query(query): Query<UserQuery>,
) -> Result<Json<Paginated<UserDto>>, HttpError> {
    let params = ListParams {
        ordering: query.ordering,
        limit: query.limit,
        offset: query.offset,
    };

    let filter = UserFilter {
        username: query.username,
        github_id: query.github_id,
        email: query.email,
        ordering: params.ordering()?,
    };

    let listing = state
        .store
        .list_users(&filter, params.page())
        .await
        .map_err(HttpError::internal().err())?;

    Ok(Json(Paginated {
        count: listing.count,
        results: listing.results.into_iter().map(UserDto::from).collect(),
    }))
}

pub(crate) async fn get_user(
    State(state): State<PolicyState>,
    _access: ApiAccess,
    Path(id): Path<i64>,
) -> Result<Json<UserDto>, HttpError> {
    let user = state
        .store
        .get_user(id)
        .await
        .map_err(HttpError::internal().err())?
        .ok_or_else(|| HttpError::not_found().msg("user not found"))?;

    Ok(Json(user.into()))
}
