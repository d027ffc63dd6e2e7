use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use subtle::ConstantTimeEq as _;

use crate::PolicyState;
use crate::http::HttpError;

/// Grants access to the REST API.
///
/// When an `ApiToken` is configured, the request must carry it as a bearer token. Without
/// one the API is open.
#[derive(Clone, Copy)]
pub struct ApiAccess;

impl FromRequestParts<PolicyState> for ApiAccess {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &PolicyState) -> Result<Self, Self::Rejection> {
        let conf = state.conf();

        let Some(expected) = conf.api_token.as_deref() else {
            return Ok(Self);
        };

        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| HttpError::unauthorized().msg("missing authorization token"))?;

        if bool::from(token.trim().as_bytes().ct_eq(expected.as_bytes())) {
            Ok(Self)
        } else {
            Err(HttpError::unauthorized().msg("invalid authorization token"))
        }
    }
}
