//! Row models and conversions between SQL values and domain types.

use anyhow::Context as _;
use libsql::Value;
use policy_store::{Org, Repo, Team, User};
use serde::Deserialize;
use time::OffsetDateTime;

pub(crate) const USER_COLUMNS: &str = "id, username, github_id, email, suspended_at, last_synced, created, modified";

pub(crate) const ORG_COLUMNS: &str = "id, org_name, github_id, owner_id, created, modified";

pub(crate) const TEAM_COLUMNS: &str = "id, github_id, team_name, team_slug, org_id, created, modified";

pub(crate) const REPO_COLUMNS: &str = "id, repo_name, description, github_id, classification, \
    classification_modified, visibility, html_url, owner_id, fork_source_id, size, disabled, org_id, \
    collaborators_synced, last_polling_check, created, modified";

/// Timestamps are stored as microseconds since the UNIX epoch.
pub(crate) fn to_micros(value: OffsetDateTime) -> i64 {
    value.unix_timestamp() * 1_000_000 + i64::from(value.microsecond())
}

pub(crate) fn from_micros(micros: i64) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000).context("invalid stored timestamp")
}

fn opt_from_micros(micros: Option<i64>) -> anyhow::Result<Option<OffsetDateTime>> {
    micros.map(from_micros).transpose()
}

pub(crate) fn opt<T: Into<Value>>(value: Option<T>) -> Value {
    value.map_or(Value::Null, Into::into)
}

pub(crate) fn opt_time(value: Option<OffsetDateTime>) -> Value {
    opt(value.map(to_micros))
}

/// Rows that can be converted into a domain entity.
pub(crate) trait FromRowModel: Sized {
    type Row: for<'de> Deserialize<'de>;

    fn from_model(row: Self::Row) -> anyhow::Result<Self>;
}

#[derive(Deserialize)]
pub(crate) struct UserRow {
    id: i64,
    username: String,
    github_id: i64,
    email: Option<String>,
    suspended_at: Option<i64>,
    last_synced: Option<i64>,
    created: i64,
    modified: i64,
}

impl FromRowModel for User {
    type Row = UserRow;

    fn from_model(row: UserRow) -> anyhow::Result<Self> {
        Ok(User {
            id: row.id,
            username: row.username,
            github_id: row.github_id,
            email: row.email,
            suspended_at: opt_from_micros(row.suspended_at)?,
            last_synced: opt_from_micros(row.last_synced)?,
            created: from_micros(row.created)?,
            modified: from_micros(row.modified)?,
        })
    }
}

#[derive(Deserialize)]
pub(crate) struct OrgRow {
    id: i64,
    org_name: String,
    github_id: i64,
    owner_id: i64,
    created: i64,
    modified: i64,
}

impl FromRowModel for Org {
    type Row = OrgRow;

    fn from_model(row: OrgRow) -> anyhow::Result<Self> {
        Ok(Org {
            id: row.id,
            org_name: row.org_name,
            github_id: row.github_id,
            owner_id: row.owner_id,
            created: from_micros(row.created)?,
            modified: from_micros(row.modified)?,
        })
    }
}

#[derive(Deserialize)]
pub(crate) struct TeamRow {
    id: i64,
    github_id: i64,
    team_name: String,
    team_slug: String,
    org_id: i64,
    created: i64,
    modified: i64,
}

impl FromRowModel for Team {
    type Row = TeamRow;

    fn from_model(row: TeamRow) -> anyhow::Result<Self> {
        Ok(Team {
            id: row.id,
            github_id: row.github_id,
            team_name: row.team_name,
            team_slug: row.team_slug,
            org_id: row.org_id,
            created: from_micros(row.created)?,
            modified: from_micros(row.modified)?,
        })
    }
}

#[derive(Deserialize)]
pub(crate) struct RepoRow {
    id: i64,
    repo_name: String,
    description: Option<String>,
    github_id: i64,
    classification: Option<String>,
    classification_modified: i64,
    visibility: String,
    html_url: Option<String>,
    owner_id: i64,
    fork_source_id: Option<i64>,
    size: i64,
    disabled: i64,
    org_id: Option<i64>,
    collaborators_synced: Option<i64>,
    last_polling_check: Option<i64>,
    created: i64,
    modified: i64,
}

impl FromRowModel for Repo {
    type Row = RepoRow;

    fn from_model(row: RepoRow) -> anyhow::Result<Self> {
        Ok(Repo {
            id: row.id,
            repo_name: row.repo_name,
            description: row.description,
            github_id: row.github_id,
            classification: row.classification,
            classification_modified: from_micros(row.classification_modified)?,
            visibility: row.visibility.parse()?,
            html_url: row.html_url,
            owner_id: row.owner_id,
            fork_source_id: row.fork_source_id,
            size: row.size,
            disabled: row.disabled != 0,
            org_id: row.org_id,
            collaborators_synced: opt_from_micros(row.collaborators_synced)?,
            last_polling_check: opt_from_micros(row.last_polling_check)?,
            created: from_micros(row.created)?,
            modified: from_micros(row.modified)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn microsecond_precision_is_kept() {
        let value = datetime!(2024-05-06 07:08:09.123456 UTC);
        let micros = to_micros(value);
        assert_eq!(micros, 1_714_979_289_123_456);
        assert_eq!(from_micros(micros).unwrap(), value);
    }

    #[test]
    fn timestamps_before_epoch() {
        let value = datetime!(1969-12-31 23:59:59.5 UTC);
        assert_eq!(from_micros(to_micros(value)).unwrap(), value);
    }
}
