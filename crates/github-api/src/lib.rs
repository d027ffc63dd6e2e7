//! GitHub Enterprise REST client.
//!
//! [`GitHubInstance`] wraps a ring of site admin tokens. Rate limited tokens are rotated
//! out, and once every token is exhausted requests wait for the rate limit window to
//! reset. Site admin instances can impersonate users, which is how private repositories
//! are read on behalf of their owners.

#[macro_use]
extern crate tracing;

mod client;
mod error;
pub mod signature;
pub mod types;

pub use client::{
    ALL_SCOPES, DEFAULT_ACCEPT, GitHubInstance, IMPERSONATION_RESUSPEND_REASON, IMPERSONATION_UNSUSPEND_REASON,
    endpoints, next_link,
};
pub use error::{ACCOUNT_SUSPENDED_MESSAGE, BAD_CREDENTIALS_MESSAGE, GithubError, REPOSITORY_BLOCKED_MESSAGE};
pub use types::{GitHubOrg, GitHubRepo, GitHubTeam, GitHubUser, Topics};
