#[macro_use]
extern crate tracing;

mod rows;

use anyhow::Context as _;
use async_trait::async_trait;
use libsql::{Connection, Value};
use policy_store::{
    Listing, NewRepo, OrderField as _, Org, OrgFilter, Page, PolicyStore, Repo, RepoFilter, Team, TeamFilter, User,
    UserFilter,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::rows::{
    FromRowModel, ORG_COLUMNS, REPO_COLUMNS, TEAM_COLUMNS, USER_COLUMNS, opt, opt_time, to_micros,
};

#[rustfmt::skip]
pub use libsql;

// Typically, migrations should not be modified once released, and we should only be appending to this list.
const MIGRATIONS: &[&str] = &[
    // Migration 0
    include_str!("../migrations/01_initial_schema.sql"),
];

/// Implementation of [`PolicyStore`] using libSQL as the backend
///
/// The connection sits behind an async mutex: SQLite transactions are bound to a connection,
/// so two concurrent callers must never interleave statements on it.
///
/// We use the 'user_version' value to store the migration state.
/// - <https://sqlite.org/pragma.html#pragma_user_version>
pub struct LibSqlPolicyStore {
    conn: Mutex<Connection>,
}

impl LibSqlPolicyStore {
    /// Opens the database at `path`.
    ///
    /// `":memory:"` opens a private in-memory database, handy for tests.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        let conn = libsql::Builder::new_local(path)
            .build()
            .await
            .context("failed to open libSQL database")?
            .connect()
            .context("failed to connect to libSQL")?;

        Ok(Self::new(conn))
    }

    pub fn new(conn: Connection) -> Self {
        Self { conn: Mutex::new(conn) }
    }

    async fn apply_pragmas(conn: &Connection) -> anyhow::Result<()> {
        const PRAGMAS: &str = "
            -- https://www.sqlite.org/pragma.html#pragma_journal_mode
            -- Use a write-ahead log instead of a rollback journal to implement transactions.
            PRAGMA journal_mode = WAL;

            -- https://www.sqlite.org/pragma.html#pragma_synchronous
            PRAGMA synchronous = NORMAL;

            -- https://www.sqlite.org/pragma.html#pragma_foreign_keys
            -- Required for the ON DELETE CASCADE / SET NULL clauses of the schema.
            PRAGMA foreign_keys = ON;

            -- https://www.sqlite.org/pragma.html#pragma_busy_timeout
            -- The job queue database is a different file, but the CLI commands may run
            -- next to the service.
            PRAGMA busy_timeout = 15000;

            -- https://www.sqlite.org/pragma.html#pragma_cache_size
            PRAGMA cache_size = -3000;

            -- https://www.sqlite.org/pragma.html#pragma_temp_store
            PRAGMA temp_store = MEMORY;
        ";

        trace!(sql_query = %PRAGMAS, "PRAGMAs query");

        let mut batch_rows = conn
            .execute_batch(PRAGMAS)
            .await
            .context("failed to batch execute SQL query")?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else {
                continue;
            };

            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        Ok(())
    }

    async fn migrate(conn: &Connection) -> anyhow::Result<()> {
        let user_version = query_user_version(conn).await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    trace!(migration_id, %sql_query, "Apply migration");

                    conn.execute_batch(sql_query)
                        .await
                        .with_context(|| format!("failed to execute migration {migration_id}"))?;

                    update_user_version(conn, migration_id + 1)
                        .await
                        .context("failed to update user version")?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        Ok(())
    }
}

async fn query_user_version(conn: &Connection) -> anyhow::Result<usize> {
    let sql_query = "PRAGMA user_version";

    trace!(%sql_query, "Query user_version");

    let row = conn
        .query(sql_query, ())
        .await
        .context("failed to execute SQL query")?
        .next()
        .await
        .context("failed to read the row")?
        .context("no row returned")?;

    let value = row.get::<u64>(0).context("failed to read user_version value")?;

    usize::try_from(value).context("user_version is too big")
}

async fn update_user_version(conn: &Connection, value: usize) -> anyhow::Result<()> {
    let sql_query = format!("PRAGMA user_version = {value}");

    trace!(%sql_query, "Update user_version");

    conn.execute(&sql_query, ())
        .await
        .context("failed to execute SQL query")?;

    Ok(())
}

#[async_trait]
impl PolicyStore for LibSqlPolicyStore {
    async fn setup(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        Self::apply_pragmas(&conn).await?;
        Self::migrate(&conn).await?;
        Ok(())
    }

    // -- Users -- //

    async fn get_user(&self, id: i64) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "users", USER_COLUMNS, "id = ?", id).await
    }

    async fn get_user_by_github_id(&self, github_id: i64) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "users", USER_COLUMNS, "github_id = ?", github_id).await
    }

    async fn get_user_by_username(&self, username: &str) -> anyhow::Result<Option<User>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "users", USER_COLUMNS, "username = ?", username).await
    }

    async fn user_from_github(
        &self,
        github_id: i64,
        login: &str,
        suspended_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<User> {
        let conn = self.conn.lock().await;

        if let Some(user) = find_by::<User>(&conn, "users", USER_COLUMNS, "github_id = ?", github_id).await? {
            return Ok(user);
        }

        // The login may already be known under an older GitHub id (deleted then recreated account).
        let sql_query = format!(
            "INSERT INTO users (username, github_id, suspended_at, created, modified)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT (username) DO UPDATE SET
                github_id = excluded.github_id,
                suspended_at = excluded.suspended_at,
                modified = excluded.modified
            RETURNING {USER_COLUMNS}"
        );

        let now = to_micros(OffsetDateTime::now_utc());
        let params = vec![
            Value::from(login),
            Value::from(github_id),
            opt_time(suspended_at),
            Value::from(now),
        ];

        match fetch_optional::<User>(&conn, &sql_query, params).await {
            Ok(Some(user)) => Ok(user),
            Ok(None) => anyhow::bail!("upsert of user {login} returned nothing"),
            Err(error) => {
                debug!(error = format!("{error:#}"), login, "User upsert failed, reading it back");
                find_by(&conn, "users", USER_COLUMNS, "github_id = ?", github_id)
                    .await?
                    .ok_or(error)
            }
        }
    }

    async fn save_user(&self, user: &User) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;

        let sql_query = "UPDATE users SET
                username = ?, github_id = ?, email = ?, suspended_at = ?, last_synced = ?, modified = ?
            WHERE id = ?";

        let params = vec![
            Value::from(user.username.as_str()),
            Value::from(user.github_id),
            opt(user.email.as_deref()),
            opt_time(user.suspended_at),
            opt_time(user.last_synced),
            Value::from(to_micros(OffsetDateTime::now_utc())),
            Value::from(user.id),
        ];

        execute(&conn, sql_query, params).await?;

        Ok(())
    }

    async fn delete_user(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        execute(&conn, "DELETE FROM users WHERE id = ?", vec![Value::from(id)]).await?;
        Ok(())
    }

    async fn list_users(&self, filter: &UserFilter, page: Page) -> anyhow::Result<Listing<User>> {
        let mut conditions = Conditions::default();
        conditions.push_opt("username = ?", filter.username.as_deref());
        conditions.push_opt("github_id = ?", filter.github_id);
        conditions.push_opt("email = ?", filter.email.as_deref());

        let ordering = filter.ordering.map(|o| (o.field.column(), o.descending));

        let conn = self.conn.lock().await;
        list(&conn, "users", USER_COLUMNS, conditions, ordering, page).await
    }

    async fn polling_users(&self, limit: u64) -> anyhow::Result<Vec<User>> {
        let conn = self.conn.lock().await;

        let sql_query = format!("SELECT {USER_COLUMNS} FROM users ORDER BY last_synced ASC NULLS FIRST, id LIMIT ?");

        fetch_all(&conn, &sql_query, vec![limit_value(Some(limit))]).await
    }

    async fn count_users(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;
        fetch_count(&conn, "SELECT COUNT(*) FROM users", Vec::new()).await
    }

    async fn users_by_github_ids(&self, github_ids: &[i64]) -> anyhow::Result<Vec<User>> {
        if github_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().await;

        let mut users = Vec::with_capacity(github_ids.len());

        for chunk in github_ids.chunks(MAX_IN_LIST_LEN) {
            let sql_query = format!(
                "SELECT {USER_COLUMNS} FROM users WHERE github_id IN ({})",
                repeat_qm(chunk.len())
            );

            let params = chunk.iter().copied().map(Value::from).collect();

            users.extend(fetch_all::<User>(&conn, &sql_query, params).await?);
        }

        users.sort_by_key(|user| user.id);

        Ok(users)
    }

    // -- Organizations -- //

    async fn get_org(&self, id: i64) -> anyhow::Result<Option<Org>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "orgs", ORG_COLUMNS, "id = ?", id).await
    }

    async fn get_org_by_github_id(&self, github_id: i64) -> anyhow::Result<Option<Org>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "orgs", ORG_COLUMNS, "github_id = ?", github_id).await
    }

    async fn get_org_by_name(&self, org_name: &str) -> anyhow::Result<Option<Org>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "orgs", ORG_COLUMNS, "org_name = ?", org_name).await
    }

    async fn org_from_github(&self, github_id: i64, org_name: &str, owner_id: i64) -> anyhow::Result<Org> {
        let conn = self.conn.lock().await;

        if let Some(org) = find_by::<Org>(&conn, "orgs", ORG_COLUMNS, "github_id = ?", github_id).await? {
            return Ok(org);
        }

        let sql_query = format!(
            "INSERT INTO orgs (org_name, github_id, owner_id, created, modified)
            VALUES (?1, ?2, ?3, ?4, ?4)
            RETURNING {ORG_COLUMNS}"
        );

        let params = vec![
            Value::from(org_name),
            Value::from(github_id),
            Value::from(owner_id),
            Value::from(to_micros(OffsetDateTime::now_utc())),
        ];

        match fetch_optional::<Org>(&conn, &sql_query, params).await {
            Ok(Some(org)) => Ok(org),
            Ok(None) => anyhow::bail!("insertion of organization {org_name} returned nothing"),
            Err(error) => {
                debug!(error = format!("{error:#}"), org_name, "Organization insert failed, reading it back");
                find_by(&conn, "orgs", ORG_COLUMNS, "github_id = ?", github_id)
                    .await?
                    .ok_or(error)
            }
        }
    }

    async fn save_org(&self, org: &Org) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;

        let sql_query = "UPDATE orgs SET org_name = ?, github_id = ?, owner_id = ?, modified = ? WHERE id = ?";

        let params = vec![
            Value::from(org.org_name.as_str()),
            Value::from(org.github_id),
            Value::from(org.owner_id),
            Value::from(to_micros(OffsetDateTime::now_utc())),
            Value::from(org.id),
        ];

        execute(&conn, sql_query, params).await?;

        Ok(())
    }

    async fn delete_org(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        execute(&conn, "DELETE FROM orgs WHERE id = ?", vec![Value::from(id)]).await?;
        Ok(())
    }

    async fn add_org_member(&self, org_id: i64, user_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        link(&conn, "org_members", "org_id", org_id, user_id).await
    }

    async fn remove_org_member(&self, org_id: i64, user_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        unlink(&conn, "org_members", "org_id", org_id, user_id).await
    }

    async fn org_members(&self, org_id: i64) -> anyhow::Result<Vec<User>> {
        let conn = self.conn.lock().await;

        let sql_query = format!(
            "SELECT {USER_COLUMNS} FROM users
            WHERE id IN (SELECT user_id FROM org_members WHERE org_id = ?)
            ORDER BY id"
        );

        fetch_all(&conn, &sql_query, vec![Value::from(org_id)]).await
    }

    async fn list_orgs(&self, filter: &OrgFilter, page: Page) -> anyhow::Result<Listing<Org>> {
        let mut conditions = Conditions::default();
        conditions.push_opt("org_name = ?", filter.org_name.as_deref());
        conditions.push_opt("github_id = ?", filter.github_id);
        conditions.push_opt(
            "owner_id IN (SELECT id FROM users WHERE github_id = ?)",
            filter.owner_github_id,
        );

        let ordering = filter.ordering.map(|o| (o.field.column(), o.descending));

        let conn = self.conn.lock().await;
        list(&conn, "orgs", ORG_COLUMNS, conditions, ordering, page).await
    }

    // -- Teams -- //

    async fn get_team(&self, id: i64) -> anyhow::Result<Option<Team>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "teams", TEAM_COLUMNS, "id = ?", id).await
    }

    async fn get_team_by_github_id(&self, github_id: i64) -> anyhow::Result<Option<Team>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "teams", TEAM_COLUMNS, "github_id = ?", github_id).await
    }

    async fn team_from_github(
        &self,
        github_id: i64,
        team_name: &str,
        team_slug: &str,
        org_id: i64,
    ) -> anyhow::Result<Team> {
        let conn = self.conn.lock().await;

        if let Some(team) = find_by::<Team>(&conn, "teams", TEAM_COLUMNS, "github_id = ?", github_id).await? {
            return Ok(team);
        }

        let sql_query = format!(
            "INSERT INTO teams (github_id, team_name, team_slug, org_id, created, modified)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            RETURNING {TEAM_COLUMNS}"
        );

        let params = vec![
            Value::from(github_id),
            Value::from(team_name),
            Value::from(team_slug),
            Value::from(org_id),
            Value::from(to_micros(OffsetDateTime::now_utc())),
        ];

        match fetch_optional::<Team>(&conn, &sql_query, params).await {
            Ok(Some(team)) => Ok(team),
            Ok(None) => anyhow::bail!("insertion of team {team_slug} returned nothing"),
            Err(error) => {
                debug!(error = format!("{error:#}"), team_slug, "Team insert failed, reading it back");
                find_by(&conn, "teams", TEAM_COLUMNS, "github_id = ?", github_id)
                    .await?
                    .ok_or(error)
            }
        }
    }

    async fn save_team(&self, team: &Team) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;

        let sql_query = "UPDATE teams SET
                github_id = ?, team_name = ?, team_slug = ?, org_id = ?, modified = ?
            WHERE id = ?";

        let params = vec![
            Value::from(team.github_id),
            Value::from(team.team_name.as_str()),
            Value::from(team.team_slug.as_str()),
            Value::from(team.org_id),
            Value::from(to_micros(OffsetDateTime::now_utc())),
            Value::from(team.id),
        ];

        execute(&conn, sql_query, params).await?;

        Ok(())
    }

    async fn delete_team(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        execute(&conn, "DELETE FROM teams WHERE id = ?", vec![Value::from(id)]).await?;
        Ok(())
    }

    async fn add_team_member(&self, team_id: i64, user_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        link(&conn, "team_members", "team_id", team_id, user_id).await
    }

    async fn remove_team_member(&self, team_id: i64, user_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        unlink(&conn, "team_members", "team_id", team_id, user_id).await
    }

    async fn team_members(&self, team_id: i64) -> anyhow::Result<Vec<User>> {
        let conn = self.conn.lock().await;

        let sql_query = format!(
            "SELECT {USER_COLUMNS} FROM users
            WHERE id IN (SELECT user_id FROM team_members WHERE team_id = ?)
            ORDER BY id"
        );

        fetch_all(&conn, &sql_query, vec![Value::from(team_id)]).await
    }

    async fn add_team_repo(&self, team_id: i64, repo_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;

        execute(
            &conn,
            "INSERT OR IGNORE INTO team_repos (team_id, repo_id) VALUES (?, ?)",
            vec![Value::from(team_id), Value::from(repo_id)],
        )
        .await?;

        Ok(())
    }

    async fn remove_team_repo(&self, team_id: i64, repo_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;

        execute(
            &conn,
            "DELETE FROM team_repos WHERE team_id = ? AND repo_id = ?",
            vec![Value::from(team_id), Value::from(repo_id)],
        )
        .await?;

        Ok(())
    }

    async fn team_repos(&self, team_id: i64) -> anyhow::Result<Vec<Repo>> {
        let conn = self.conn.lock().await;

        let sql_query = format!(
            "SELECT {REPO_COLUMNS} FROM repos
            WHERE id IN (SELECT repo_id FROM team_repos WHERE team_id = ?)
            ORDER BY id"
        );

        fetch_all(&conn, &sql_query, vec![Value::from(team_id)]).await
    }

    async fn list_teams(&self, filter: &TeamFilter, page: Page) -> anyhow::Result<Listing<Team>> {
        let mut conditions = Conditions::default();
        conditions.push_opt("team_name = ?", filter.team_name.as_deref());
        conditions.push_opt("team_slug = ?", filter.team_slug.as_deref());
        conditions.push_opt("github_id = ?", filter.github_id);

        let ordering = filter.ordering.map(|o| (o.field.column(), o.descending));

        let conn = self.conn.lock().await;
        list(&conn, "teams", TEAM_COLUMNS, conditions, ordering, page).await
    }

    // -- Repositories -- //

    async fn get_repo(&self, id: i64) -> anyhow::Result<Option<Repo>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "repos", REPO_COLUMNS, "id = ?", id).await
    }

    async fn get_repo_by_github_id(&self, github_id: i64) -> anyhow::Result<Option<Repo>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "repos", REPO_COLUMNS, "github_id = ?", github_id).await
    }

    async fn get_repo_by_name(&self, repo_name: &str) -> anyhow::Result<Option<Repo>> {
        let conn = self.conn.lock().await;
        find_by(&conn, "repos", REPO_COLUMNS, "repo_name = ?", repo_name).await
    }

    async fn insert_repo(&self, repo: NewRepo) -> anyhow::Result<Repo> {
        let conn = self.conn.lock().await;

        let sql_query = format!(
            "INSERT INTO repos (
                repo_name, description, github_id, classification, classification_modified, visibility,
                html_url, owner_id, fork_source_id, size, disabled, org_id, created, modified
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?5, ?5)
            RETURNING {REPO_COLUMNS}"
        );

        let params = vec![
            Value::from(repo.repo_name.as_str()),
            opt(repo.description),
            Value::from(repo.github_id),
            opt(repo.classification),
            Value::from(to_micros(OffsetDateTime::now_utc())),
            Value::from(repo.visibility.as_str()),
            opt(repo.html_url),
            Value::from(repo.owner_id),
            opt(repo.fork_source_id),
            Value::from(repo.size),
            Value::from(i64::from(repo.disabled)),
            opt(repo.org_id),
        ];

        trace!(repo_name = %repo.repo_name, github_id = repo.github_id, "Inserting repository");

        fetch_optional(&conn, &sql_query, params)
            .await
            .with_context(|| format!("failed to insert repository {}", repo.repo_name))?
            .context("insertion returned nothing")
    }

    async fn save_repo(&self, repo: &Repo) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;

        let sql_query = "UPDATE repos SET
                repo_name = ?, description = ?, github_id = ?, classification = ?,
                classification_modified = ?, visibility = ?, html_url = ?, owner_id = ?,
                fork_source_id = ?, size = ?, disabled = ?, org_id = ?, collaborators_synced = ?,
                last_polling_check = ?, modified = ?
            WHERE id = ?";

        let params = vec![
            Value::from(repo.repo_name.as_str()),
            opt(repo.description.as_deref()),
            Value::from(repo.github_id),
            opt(repo.classification.as_deref()),
            Value::from(to_micros(repo.classification_modified)),
            Value::from(repo.visibility.as_str()),
            opt(repo.html_url.as_deref()),
            Value::from(repo.owner_id),
            opt(repo.fork_source_id),
            Value::from(repo.size),
            Value::from(i64::from(repo.disabled)),
            opt(repo.org_id),
            opt_time(repo.collaborators_synced),
            opt_time(repo.last_polling_check),
            Value::from(to_micros(OffsetDateTime::now_utc())),
            Value::from(repo.id),
        ];

        execute(&conn, sql_query, params)
            .await
            .with_context(|| format!("failed to save repository {}", repo.repo_name))?;

        Ok(())
    }

    async fn delete_repo(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        execute(&conn, "DELETE FROM repos WHERE id = ?", vec![Value::from(id)]).await?;
        Ok(())
    }

    async fn list_repos(&self, filter: &RepoFilter, page: Page) -> anyhow::Result<Listing<Repo>> {
        let mut conditions = Conditions::default();
        conditions.push_opt("repo_name = ?", filter.repo_name.as_deref());
        conditions.push_opt(
            r"repo_name LIKE ? ESCAPE '\'",
            filter.repo_name_icontains.as_deref().map(like_pattern),
        );
        conditions.push_opt("github_id = ?", filter.github_id);
        conditions.push_opt("classification = ?", filter.classification.as_deref());
        conditions.push_opt("visibility = ?", filter.visibility.map(|v| v.as_str()));
        conditions.push_opt("html_url = ?", filter.html_url.as_deref());
        conditions.push_opt(
            "owner_id IN (SELECT id FROM users WHERE github_id = ?)",
            filter.owner_github_id,
        );
        conditions.push_opt("fork_source_id = ?", filter.fork_source);
        conditions.push_opt("size = ?", filter.size);
        conditions.push_opt("size >= ?", filter.size_gte);
        conditions.push_opt("size <= ?", filter.size_lte);
        conditions.push_opt("disabled = ?", filter.disabled.map(i64::from));

        let ordering = filter.ordering.map(|o| (o.field.column(), o.descending));

        let conn = self.conn.lock().await;
        list(&conn, "repos", REPO_COLUMNS, conditions, ordering, page).await
    }

    async fn polling_repos(&self, limit: u64) -> anyhow::Result<Vec<Repo>> {
        let conn = self.conn.lock().await;

        let sql_query =
            format!("SELECT {REPO_COLUMNS} FROM repos ORDER BY last_polling_check ASC NULLS FIRST, id LIMIT ?");

        fetch_all(&conn, &sql_query, vec![limit_value(Some(limit))]).await
    }

    async fn count_repos(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().await;
        fetch_count(&conn, "SELECT COUNT(*) FROM repos", Vec::new()).await
    }

    async fn repos_created_since(&self, since: Option<OffsetDateTime>) -> anyhow::Result<Vec<Repo>> {
        let conn = self.conn.lock().await;

        match since {
            Some(since) => {
                let sql_query = format!("SELECT {REPO_COLUMNS} FROM repos WHERE created >= ? ORDER BY created, id");
                fetch_all(&conn, &sql_query, vec![Value::from(to_micros(since))]).await
            }
            None => {
                let sql_query = format!("SELECT {REPO_COLUMNS} FROM repos ORDER BY created, id");
                fetch_all(&conn, &sql_query, Vec::new()).await
            }
        }
    }

    async fn org_repos(&self, org_id: i64) -> anyhow::Result<Vec<Repo>> {
        let conn = self.conn.lock().await;

        let sql_query = format!("SELECT {REPO_COLUMNS} FROM repos WHERE org_id = ? ORDER BY id");

        fetch_all(&conn, &sql_query, vec![Value::from(org_id)]).await
    }

    async fn set_repo_collaborators(&self, repo_id: i64, user_ids: &[i64]) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;

        begin(&conn).await?;

        let result: anyhow::Result<()> = async {
            execute(
                &conn,
                "DELETE FROM repo_collaborators WHERE repo_id = ?",
                vec![Value::from(repo_id)],
            )
            .await?;

            if user_ids.is_empty() {
                return Ok(());
            }

            let sql_query = format!(
                "INSERT OR IGNORE INTO repo_collaborators (repo_id, user_id) VALUES {}",
                vec!["(?, ?)"; user_ids.len()].join(", ")
            );

            let params = user_ids
                .iter()
                .flat_map(|user_id| [Value::from(repo_id), Value::from(*user_id)])
                .collect();

            execute(&conn, &sql_query, params).await?;

            Ok(())
        }
        .await;

        finish(&conn, result).await
    }

    async fn add_repo_collaborator(&self, repo_id: i64, user_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        link(&conn, "repo_collaborators", "repo_id", repo_id, user_id).await
    }

    async fn remove_repo_collaborator(&self, repo_id: i64, user_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        unlink(&conn, "repo_collaborators", "repo_id", repo_id, user_id).await
    }

    async fn repo_collaborators(&self, repo_id: i64) -> anyhow::Result<Vec<User>> {
        let conn = self.conn.lock().await;

        let sql_query = format!(
            "SELECT {USER_COLUMNS} FROM users
            WHERE id IN (SELECT user_id FROM repo_collaborators WHERE repo_id = ?)
            ORDER BY id"
        );

        fetch_all(&conn, &sql_query, vec![Value::from(repo_id)]).await
    }

    async fn repo_teams(&self, repo_id: i64) -> anyhow::Result<Vec<Team>> {
        let conn = self.conn.lock().await;

        let sql_query = format!(
            "SELECT {TEAM_COLUMNS} FROM teams
            WHERE id IN (SELECT team_id FROM team_repos WHERE repo_id = ?)
            ORDER BY id"
        );

        fetch_all(&conn, &sql_query, vec![Value::from(repo_id)]).await
    }
}

/// `WHERE` clause built from the filters that are set.
#[derive(Default)]
struct Conditions {
    clauses: Vec<&'static str>,
    params: Vec<Value>,
}

impl Conditions {
    fn push_opt(&mut self, clause: &'static str, value: Option<impl Into<Value>>) {
        if let Some(value) = value {
            self.clauses.push(clause);
            self.params.push(value.into());
        }
    }

    fn to_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// SQLite reads a negative `LIMIT` as no limit at all.
fn limit_value(limit: Option<u64>) -> Value {
    Value::from(limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX)))
}

async fn list<T: FromRowModel>(
    conn: &Connection,
    table: &str,
    columns: &str,
    conditions: Conditions,
    ordering: Option<(&'static str, bool)>,
    page: Page,
) -> anyhow::Result<Listing<T>> {
    let where_clause = conditions.to_sql();

    let count = fetch_count(
        conn,
        &format!("SELECT COUNT(*) FROM {table}{where_clause}"),
        conditions.params.clone(),
    )
    .await?;

    let order_by = match ordering {
        Some((column, true)) => format!("{column} DESC, id ASC"),
        Some((column, false)) => format!("{column} ASC, id ASC"),
        None => "id ASC".to_owned(),
    };

    let sql_query = format!("SELECT {columns} FROM {table}{where_clause} ORDER BY {order_by} LIMIT ? OFFSET ?");

    let mut params = conditions.params;
    params.push(limit_value(page.limit));
    params.push(Value::from(
        i64::try_from(page.offset.unwrap_or(0)).context("offset is too big")?,
    ));

    let results = fetch_all(conn, &sql_query, params).await?;

    Ok(Listing { count, results })
}

async fn find_by<T: FromRowModel>(
    conn: &Connection,
    table: &str,
    columns: &str,
    clause: &str,
    value: impl Into<Value>,
) -> anyhow::Result<Option<T>> {
    let sql_query = format!("SELECT {columns} FROM {table} WHERE {clause}");
    fetch_optional(conn, &sql_query, vec![value.into()]).await
}

async fn fetch_optional<T: FromRowModel>(
    conn: &Connection,
    sql_query: &str,
    params: Vec<Value>,
) -> anyhow::Result<Option<T>> {
    Ok(fetch_all(conn, sql_query, params).await?.into_iter().next())
}

async fn fetch_all<T: FromRowModel>(conn: &Connection, sql_query: &str, params: Vec<Value>) -> anyhow::Result<Vec<T>> {
    trace!(%sql_query, ?params, "Query");

    let mut rows = conn
        .query(sql_query, params)
        .await
        .context("failed to execute SQL query")?;

    let mut items = Vec::new();

    while let Some(row) = rows.next().await.context("failed to read the row")? {
        let model = libsql::de::from_row::<'_, T::Row>(&row).context("failed to deserialize row")?;
        items.push(T::from_model(model)?);
    }

    Ok(items)
}

async fn fetch_count(conn: &Connection, sql_query: &str, params: Vec<Value>) -> anyhow::Result<u64> {
    trace!(%sql_query, ?params, "Count");

    let row = conn
        .query(sql_query, params)
        .await
        .context("failed to execute SQL query")?
        .next()
        .await
        .context("failed to read the row")?
        .context("no row returned")?;

    let count = row.get::<i64>(0).context("failed to read count")?;

    u64::try_from(count).context("negative count")
}

async fn execute(conn: &Connection, sql_query: &str, params: Vec<Value>) -> anyhow::Result<u64> {
    trace!(%sql_query, ?params, "Execute");

    conn.execute(sql_query, params)
        .await
        .context("failed to execute SQL query")
}

async fn link(conn: &Connection, table: &str, owner_column: &str, owner_id: i64, user_id: i64) -> anyhow::Result<()> {
    let sql_query = format!("INSERT OR IGNORE INTO {table} ({owner_column}, user_id) VALUES (?, ?)");
    execute(conn, &sql_query, vec![Value::from(owner_id), Value::from(user_id)]).await?;
    Ok(())
}

async fn unlink(conn: &Connection, table: &str, owner_column: &str, owner_id: i64, user_id: i64) -> anyhow::Result<()> {
    let sql_query = format!("DELETE FROM {table} WHERE {owner_column} = ? AND user_id = ?");
    execute(conn, &sql_query, vec![Value::from(owner_id), Value::from(user_id)]).await?;
    Ok(())
}

async fn begin(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .context("failed to begin transaction")?;
    Ok(())
}

async fn finish<T>(conn: &Connection, result: anyhow::Result<T>) -> anyhow::Result<T> {
    match result {
        Ok(value) => {
            conn.execute("COMMIT", ())
                .await
                .context("failed to commit transaction")?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = conn.execute("ROLLBACK", ()).await {
                warn!(%rollback_error, "Failed to rollback transaction");
            }
            Err(error)
        }
    }
}

/// Stays well below `SQLITE_MAX_VARIABLE_NUMBER`, which is 999 on older builds.
const MAX_IN_LIST_LEN: usize = 500;

fn repeat_qm(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(like_pattern("my_repo"), r"%my\_repo%");
        assert_eq!(like_pattern("100%"), r"%100\%%");
        assert_eq!(like_pattern("plain"), "%plain%");
    }

    #[test]
    fn conditions_render_in_order() {
        let mut conditions = Conditions::default();
        assert_eq!(conditions.to_sql(), "");

        conditions.push_opt("a = ?", Some(1_i64));
        conditions.push_opt("b = ?", None::<i64>);
        conditions.push_opt("c = ?", Some("x"));

        assert_eq!(conditions.to_sql(), " WHERE a = ? AND c = ?");
        assert_eq!(conditions.params.len(), 2);
    }
}
