//! Read-only REST API over the local mirror.

pub mod health;
pub mod orgs;
pub mod repos;
pub mod teams;
pub mod users;

use core::str::FromStr;

use policy_store::{Listing, OrderField, Ordering, Page};
use serde::Serialize;

use crate::PolicyState;
use crate::http::HttpError;

/// Collections answer with and without a trailing slash, `/repos/` being the canonical form.
pub fn make_router<S>(state: PolicyState) -> axum::Router<S> {
    axum::Router::new()
        .merge(orgs::make_router(state.clone()))
        .merge(repos::make_router(state.clone()))
        .merge(teams::make_router(state.clone()))
        .merge(users::make_router(state.clone()))
        .with_state(state)
}

/// `{count, results}` envelope of the listings.
#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub count: u64,
    pub results: Vec<T>,
}

impl<T> Paginated<T> {
    pub(crate) fn from_listing<U>(listing: Listing<U>, results: Vec<T>) -> Self {
        Self {
            count: listing.count,
            results,
        }
    }
}

/// Pagination and sorting parameters shared by every listing.
///
/// Query structs repeat these fields instead of flattening this struct: flattened fields
/// lose their type through the URL-encoded deserializer.
#[derive(Debug, Default, Clone)]
pub struct ListParams {
    pub ordering: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl ListParams {
    pub(crate) fn page(&self) -> Page {
        Page {
            limit: self.limit,
            offset: self.offset,
        }
    }

    pub(crate) fn ordering<F: OrderField>(&self) -> Result<Option<Ordering<F>>, HttpError> {
        self.ordering
            .as_deref()
            .map(Ordering::<F>::from_str)
            .transpose()
            .map_err(HttpError::bad_request().with_msg("invalid ordering field").err())
    }
}
