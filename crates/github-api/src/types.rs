//! Subsets of the JSON documents returned by the GitHub REST API.
//!
//! Only the fields this service reads are declared; everything else is ignored when
//! deserializing, which keeps the types stable across GitHub Enterprise versions.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubUser {
    pub login: String,
    pub id: i64,
    #[serde(rename = "type", default = "default_user_type")]
    pub kind: String,
    #[serde(default)]
    pub site_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldap_dn: Option<String>,
}

fn default_user_type() -> String {
    "User".to_owned()
}

impl GitHubUser {
    pub fn is_organization(&self) -> bool {
        self.kind == "Organization"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubParentRepo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub owner: GitHubUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubRepo {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub owner: GitHubUser,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub disabled: bool,
    /// `public`, `internal` or `private`; absent on very old GHE releases.
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<GitHubParentRepo>>,
}

impl GitHubRepo {
    /// Visibility reported by GitHub, derived from `private` when the field is missing.
    pub fn effective_visibility(&self) -> &str {
        match self.visibility.as_deref() {
            Some(visibility) => visibility,
            None if self.private => "private",
            None => "public",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubOrg {
    pub login: String,
    pub id: i64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubTeam {
    pub id: i64,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub privacy: Option<String>,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub ldap_dn: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimit {
    pub resources: RateLimitResources,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitResources {
    pub core: RateLimitWindow,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitWindow {
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub remaining: i64,
    /// Epoch seconds at which the window resets.
    pub reset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpersonationToken {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResults<T> {
    #[serde(default)]
    pub total_count: i64,
    pub items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub(crate) message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_payload_ignores_unknown_fields() {
        let repo: GitHubRepo = serde_json::from_value(serde_json::json!({
            "id": 42,
            "node_id": "MDEwOlJlcG9zaXRvcnk0Mg==",
            "name": "hello",
            "full_name": "octo/hello",
            "owner": { "login": "octo", "id": 7, "type": "Organization", "site_admin": false },
            "private": true,
            "html_url": "https://ghe.example.com/octo/hello",
            "description": null,
            "size": 120,
            "topics": ["high"],
            "disabled": false,
            "visibility": "internal",
            "created_at": "2021-03-04T05:06:07Z",
            "stargazers_count": 3
        }))
        .unwrap();

        assert_eq!(repo.full_name, "octo/hello");
        assert!(repo.owner.is_organization());
        assert_eq!(repo.effective_visibility(), "internal");
        assert_eq!(repo.topics, vec!["high".to_owned()]);
        assert!(repo.created_at.is_some());
    }

    #[test]
    fn missing_visibility_falls_back_on_private_flag() {
        let repo: GitHubRepo = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "a",
            "full_name": "u/a",
            "owner": { "login": "u", "id": 2 },
            "private": false
        }))
        .unwrap();

        assert_eq!(repo.owner.kind, "User");
        assert_eq!(repo.effective_visibility(), "public");
    }

    #[test]
    fn suspended_user_timestamp_is_parsed() {
        let user: GitHubUser = serde_json::from_value(serde_json::json!({
            "login": "sus",
            "id": 9,
            "suspended_at": "2022-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(user.suspended_at.map(|at| at.unix_timestamp()), Some(1_640_995_200));
    }
}
