use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, HeaderMap, LINK};
use reqwest::{Method, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::error::GithubError;
use crate::types::{
    GitHubOrg, GitHubRepo, GitHubTeam, GitHubUser, ImpersonationToken, RateLimit, SearchResults, Topics,
};

pub const DEFAULT_ACCEPT: &str =
    "application/vnd.github.nebula-preview+json,application/vnd.github.mercy-preview+json";

/// Scopes granted to impersonation tokens.
pub const ALL_SCOPES: &[&str] = &["repo", "admin:org", "user", "site_admin"];

pub const IMPERSONATION_UNSUSPEND_REASON: &str = "Temporary unsuspension for impersonation";
pub const IMPERSONATION_RESUSPEND_REASON: &str = "Resuspending after temporary suspension.";

const USER_AGENT: &str = concat!("ghe-policy-check/", env!("CARGO_PKG_VERSION"));

pub mod endpoints {
    pub const AUTHENTICATED_USER_REPOS: &str = "/user/repos";
    pub const LICENSE_INFO: &str = "/enterprise/settings/license";
    pub const ORGANIZATIONS: &str = "/organizations";
    pub const RATE_LIMIT: &str = "/rate_limit";
    pub const SEARCH_REPOS: &str = "/search/repositories";
    pub const USERS: &str = "/users";

    pub fn impersonate(login: &str) -> String {
        format!("/admin/users/{login}/authorizations")
    }

    pub fn organization(org: &str) -> String {
        format!("/orgs/{org}")
    }

    pub fn organization_members(org: &str) -> String {
        format!("/orgs/{org}/members")
    }

    pub fn organization_repos(org: &str) -> String {
        format!("/orgs/{org}/repos")
    }

    pub fn organization_membership(org: &str, login: &str) -> String {
        format!("/orgs/{org}/memberships/{login}")
    }

    pub fn repo(owner: &str, name: &str) -> String {
        format!("/repos/{owner}/{name}")
    }

    pub fn repo_by_id(id: i64) -> String {
        format!("/repositories/{id}")
    }

    pub fn repo_collaborators(owner: &str, name: &str) -> String {
        format!("/repos/{owner}/{name}/collaborators")
    }

    pub fn repo_forks(owner: &str, name: &str) -> String {
        format!("/repos/{owner}/{name}/forks")
    }

    pub fn repo_topics(owner: &str, name: &str) -> String {
        format!("/repos/{owner}/{name}/topics")
    }

    pub fn suspend_user(login: &str) -> String {
        format!("/users/{login}/suspended")
    }

    pub fn teams(org: &str) -> String {
        format!("/orgs/{org}/teams")
    }

    pub fn team_members(org: &str, team_slug: &str) -> String {
        format!("/orgs/{org}/teams/{team_slug}/members")
    }

    pub fn team_repos(org_id: i64, team_id: i64) -> String {
        format!("/organizations/{org_id}/team/{team_id}/repos")
    }

    pub fn user(login: &str) -> String {
        format!("/users/{login}")
    }

    pub fn user_repos(login: &str) -> String {
        format!("/users/{login}/repos")
    }
}

/// Client for one GitHub Enterprise instance.
///
/// Cloning is cheap and clones share the token ring, so a rotation performed by one
/// clone is visible to the others.
#[derive(Clone)]
pub struct GitHubInstance {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    base_url: String,
    accept: String,
    tokens: Mutex<Vec<String>>,
    impersonating: Option<Impersonating>,
}

struct Impersonating {
    login: String,
    /// Instance that minted the impersonation token, used to mint a fresh one.
    admin: GitHubInstance,
}

impl GitHubInstance {
    pub fn new(tokens: Vec<String>, base_url: &str) -> Result<Self, GithubError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Self::with_client(client, tokens, base_url)
    }

    pub fn with_client(client: reqwest::Client, tokens: Vec<String>, base_url: &str) -> Result<Self, GithubError> {
        if tokens.is_empty() {
            return Err(GithubError::NoToken);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url: base_url.trim_end_matches('/').to_owned(),
                accept: DEFAULT_ACCEPT.to_owned(),
                tokens: Mutex::new(tokens),
                impersonating: None,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Login of the impersonated user, if any.
    pub fn impersonating(&self) -> Option<&str> {
        self.inner.impersonating.as_ref().map(|imp| imp.login.as_str())
    }

    pub fn active_token(&self) -> Result<String, GithubError> {
        self.inner.tokens.lock().first().cloned().ok_or(GithubError::NoToken)
    }

    /// Moves the active token at the back of the ring.
    pub fn rotate_token(&self) {
        info!("Rotating GitHub API token");
        self.inner.tokens.lock().rotate_left(1);
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.inner.base_url)
    }

    fn impersonated(&self, login: &str, token: String) -> GitHubInstance {
        GitHubInstance {
            inner: Arc::new(Inner {
                client: self.inner.client.clone(),
                base_url: self.inner.base_url.clone(),
                accept: self.inner.accept.clone(),
                tokens: Mutex::new(vec![token]),
                impersonating: Some(Impersonating {
                    login: login.to_owned(),
                    admin: self.clone(),
                }),
            }),
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        token: &str,
        body: Option<&Value>,
    ) -> Result<Response, GithubError> {
        let mut request = self
            .inner
            .client
            .request(method, url)
            .header(ACCEPT, &self.inner.accept)
            .bearer_auth(token);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();

        Err(GithubError::from_response(status, &body))
    }

    /// Sends a request, recovering from rate limiting and expired impersonation tokens.
    pub async fn request(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Response, GithubError> {
        let mut retry = 0usize;

        loop {
            let token = self.active_token()?;

            debug!(%method, url, retry, "GitHub request");

            match self.send_once(method.clone(), url, &token, body).await {
                Ok(response) => return Ok(response),
                Err(GithubError::RateLimit(message)) => {
                    debug!(message, "Rate limited");
                    self.wait_for_rate_limit(retry).await?;
                    retry += 1;
                }
                Err(GithubError::BadCredentials) => {
                    let Some(impersonating) = self.inner.impersonating.as_ref() else {
                        return Err(GithubError::BadCredentials);
                    };

                    if retry != 0 {
                        return Err(GithubError::BadCredentials);
                    }

                    info!(login = %impersonating.login, "Impersonation token rejected, minting a new one");

                    let token = impersonating.admin.mint_token(impersonating.login.clone()).await?;
                    *self.inner.tokens.lock() = vec![token];
                    retry = 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn wait_for_rate_limit(&self, retry: usize) -> Result<(), GithubError> {
        let token_count = self.inner.tokens.lock().len();

        // Never rotate back onto the token that just got limited.
        if retry + 1 < token_count {
            self.rotate_token();
            return Ok(());
        }

        if retry > 2 * token_count {
            return Err(GithubError::RateLimitRetriesExhausted);
        }

        let reset = self.rate_limit_reset().await?;
        let wait = reset + 5 - OffsetDateTime::now_utc().unix_timestamp();

        info!(reset, "Rate limit reached, retrying after reset");

        if let Ok(wait) = u64::try_from(wait)
            && wait > 0
        {
            warn!(wait_secs = wait, "All GitHub tokens rate limited");
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }

        Ok(())
    }

    /// Epoch second at which the core rate limit window of the active token resets.
    pub async fn rate_limit_reset(&self) -> Result<i64, GithubError> {
        let token = self.active_token()?;
        let response = self
            .send_once(Method::GET, &self.url(endpoints::RATE_LIMIT), &token, None)
            .await?;
        let rate_limit: RateLimit = decode(response).await?;
        Ok(rate_limit.resources.core.reset)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, GithubError> {
        let response = self.request(Method::GET, &self.url(path), None).await?;
        decode(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, method: Method, path: &str, body: &Value) -> Result<T, GithubError> {
        let response = self.request(method, &self.url(path), Some(body)).await?;
        decode(response).await
    }

    async fn send_discard(&self, method: Method, path: &str, body: Option<&Value>) -> Result<(), GithubError> {
        self.request(method, &self.url(path), body).await?;
        Ok(())
    }

    /// Follows `Link: rel="next"` headers, collecting every page of a list endpoint.
    pub async fn get_paginated<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, GithubError> {
        let mut items = Vec::new();
        let mut next = Some(with_per_page(&self.url(path)));

        while let Some(url) = next {
            let response = self.request(Method::GET, &url, None).await?;
            next = next_link(response.headers());
            let page: Vec<T> = decode(response).await?;
            items.extend(page);
        }

        Ok(items)
    }

    async fn get_paginated_search<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, GithubError> {
        let mut items = Vec::new();
        let mut next = Some(with_per_page(url.as_str()));

        while let Some(url) = next {
            let response = self.request(Method::GET, &url, None).await?;
            next = next_link(response.headers());
            let page: SearchResults<T> = decode(response).await?;
            items.extend(page.items);
        }

        Ok(items)
    }

    pub async fn get_organizations(&self, since: Option<i64>) -> Result<Vec<GitHubOrg>, GithubError> {
        self.get_paginated(&with_since(endpoints::ORGANIZATIONS, since)).await
    }

    pub async fn get_users(&self, since: Option<i64>) -> Result<Vec<GitHubUser>, GithubError> {
        self.get_paginated(&with_since(endpoints::USERS, since)).await
    }

    /// `parameters` is appended verbatim, e.g. `?visibility=private`.
    pub async fn get_authenticated_user_repos(&self, parameters: &str) -> Result<Vec<GitHubRepo>, GithubError> {
        self.get_paginated(&format!("{}{parameters}", endpoints::AUTHENTICATED_USER_REPOS))
            .await
    }

    pub async fn get_user_public_repos(&self, login: &str) -> Result<Vec<GitHubRepo>, GithubError> {
        self.get_paginated(&endpoints::user_repos(login)).await
    }

    pub async fn get_organization_repos(&self, org: &str, parameters: &str) -> Result<Vec<GitHubRepo>, GithubError> {
        self.get_paginated(&format!("{}{parameters}", endpoints::organization_repos(org)))
            .await
    }

    pub async fn create_org_repo(&self, org: &str, data: &Value) -> Result<GitHubRepo, GithubError> {
        self.send_json(Method::POST, &endpoints::organization_repos(org), data).await
    }

    pub async fn get_repository_topics(&self, owner: &str, repo: &str) -> Result<Topics, GithubError> {
        self.get(&endpoints::repo_topics(owner, repo)).await
    }

    pub async fn set_repository_topics(&self, owner: &str, repo: &str, topics: &[String]) -> Result<Topics, GithubError> {
        self.send_json(Method::PUT, &endpoints::repo_topics(owner, repo), &json!({ "names": topics }))
            .await
    }

    /// Prepends `new_topics` to the topics currently set on the repository.
    pub async fn add_repository_topics(
        &self,
        owner: &str,
        repo: &str,
        new_topics: &[String],
    ) -> Result<Topics, GithubError> {
        let current = self.get_repository_topics(owner, repo).await?;

        let mut topics = new_topics.to_vec();
        topics.extend(current.names);

        self.set_repository_topics(owner, repo, &topics).await
    }

    pub async fn get_repository_forks(&self, owner: &str, repo: &str) -> Result<Vec<GitHubRepo>, GithubError> {
        self.get_paginated(&endpoints::repo_forks(owner, repo)).await
    }

    pub async fn get_repo_by_id(&self, repo_id: i64) -> Result<GitHubRepo, GithubError> {
        self.get(&endpoints::repo_by_id(repo_id)).await
    }

    pub async fn get_repo(&self, owner: &str, repo: &str) -> Result<GitHubRepo, GithubError> {
        self.get(&endpoints::repo(owner, repo)).await
    }

    pub async fn get_repo_collaborators(&self, owner: &str, repo: &str) -> Result<Vec<GitHubUser>, GithubError> {
        self.get_paginated(&endpoints::repo_collaborators(owner, repo)).await
    }

    pub async fn search_repositories(&self, query: &str) -> Result<Vec<GitHubRepo>, GithubError> {
        let url = Url::parse_with_params(&self.url(endpoints::SEARCH_REPOS), &[("q", query)])
            .map_err(|error| GithubError::Client(format!("invalid search URL: {error}")))?;
        self.get_paginated_search(url).await
    }

    pub async fn get_user(&self, login: &str) -> Result<GitHubUser, GithubError> {
        self.get(&endpoints::user(login)).await
    }

    pub async fn get_org(&self, org: &str) -> Result<GitHubOrg, GithubError> {
        self.get(&endpoints::organization(org)).await
    }

    pub async fn get_org_members(&self, org: &str) -> Result<Vec<GitHubUser>, GithubError> {
        self.get_paginated(&endpoints::organization_members(org)).await
    }

    pub async fn get_org_admins(&self, org: &str) -> Result<Vec<GitHubUser>, GithubError> {
        self.get_paginated(&format!("{}?role=admin", endpoints::organization_members(org)))
            .await
    }

    pub async fn get_teams(&self, org: &str) -> Result<Vec<GitHubTeam>, GithubError> {
        self.get_paginated(&endpoints::teams(org)).await
    }

    pub async fn get_team_repos(&self, org_id: i64, team_id: i64) -> Result<Vec<GitHubRepo>, GithubError> {
        self.get_paginated(&endpoints::team_repos(org_id, team_id)).await
    }

    pub async fn get_team_members(&self, org: &str, team_slug: &str) -> Result<Vec<GitHubUser>, GithubError> {
        self.get_paginated(&endpoints::team_members(org, team_slug)).await
    }

    pub async fn get_license_info(&self) -> Result<Value, GithubError> {
        self.get(endpoints::LICENSE_INFO).await
    }

    pub async fn set_organization_membership(&self, org: &str, login: &str) -> Result<Value, GithubError> {
        self.send_json(
            Method::PUT,
            &endpoints::organization_membership(org, login),
            &json!({ "role": "admin" }),
        )
        .await
    }

    pub async fn suspend_user(&self, login: &str, reason: &str) -> Result<(), GithubError> {
        self.send_discard(Method::PUT, &endpoints::suspend_user(login), Some(&json!({ "reason": reason })))
            .await
    }

    pub async fn unsuspend_user(&self, login: &str, reason: &str) -> Result<(), GithubError> {
        self.send_discard(
            Method::DELETE,
            &endpoints::suspend_user(login),
            Some(&json!({ "reason": reason })),
        )
        .await
    }

    pub async fn create_impersonation_token(
        &self,
        login: &str,
        scopes: &[&str],
    ) -> Result<ImpersonationToken, GithubError> {
        self.send_json(Method::POST, &endpoints::impersonate(login), &json!({ "scopes": scopes }))
            .await
    }

    pub async fn delete_impersonation_token(&self, login: &str) -> Result<(), GithubError> {
        self.send_discard(Method::DELETE, &endpoints::impersonate(login), None).await
    }

    /// Mints an impersonation token for `login` and checks it is usable.
    ///
    /// The check is a single rate limit query made with the new token; it is what surfaces
    /// suspended accounts as [`GithubError::AccountSuspended`].
    pub async fn get_impersonation_token(&self, login: &str) -> Result<String, GithubError> {
        if self.impersonating().is_some() {
            return Err(GithubError::InvalidImpersonation);
        }

        let ImpersonationToken { token } = self.create_impersonation_token(login, ALL_SCOPES).await?;

        self.send_once(Method::GET, &self.url(endpoints::RATE_LIMIT), &token, None)
            .await?;

        Ok(token)
    }

    fn mint_token(&self, login: String) -> BoxFuture<'_, Result<String, GithubError>> {
        async move { self.get_impersonation_token(&login).await }.boxed()
    }

    /// Runs `f` with a client acting as `login`.
    ///
    /// Suspended users are unsuspended for the duration of `f` and suspended again
    /// afterwards, whatever `f` returned.
    pub async fn impersonate_user<T, E, F, Fut>(&self, login: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(GitHubInstance) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<GithubError>,
    {
        match self.get_impersonation_token(login).await {
            Ok(token) => f(self.impersonated(login, token)).await,
            Err(GithubError::AccountSuspended) => {
                info!(login, "Impersonating a suspended user");

                let during = async {
                    let token = self.get_impersonation_token(login).await?;
                    f(self.impersonated(login, token)).await
                };

                self.temporarily_unsuspend_user(
                    login,
                    IMPERSONATION_UNSUSPEND_REASON,
                    IMPERSONATION_RESUSPEND_REASON,
                    during,
                )
                .await
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Unsuspends `login`, awaits `during`, then suspends `login` again.
    pub async fn temporarily_unsuspend_user<T, E, Fut>(
        &self,
        login: &str,
        unsuspend_reason: &str,
        suspend_reason: &str,
        during: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: From<GithubError>,
    {
        self.unsuspend_user(login, unsuspend_reason).await?;

        let result = during.await;

        match self.suspend_user(login, suspend_reason).await {
            Ok(()) => result,
            Err(error) => {
                error!(login, error = format!("{error:#}"), "Failed to suspend user again");
                match result {
                    Ok(_) => Err(error.into()),
                    Err(original) => Err(original),
                }
            }
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GithubError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(GithubError::Decode)
}

fn with_per_page(url: &str) -> String {
    if url.contains('?') {
        format!("{url}&per_page=100")
    } else {
        format!("{url}?per_page=100")
    }
}

fn with_since(path: &str, since: Option<i64>) -> String {
    match since {
        Some(since) => format!("{path}?since={since}"),
        None => path.to_owned(),
    }
}

/// Extracts the `rel="next"` target of a `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;

    link.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let url = parts.next()?.trim().strip_prefix('<')?.strip_suffix('>')?;
        parts
            .map(str::trim)
            .any(|param| param == r#"rel="next""# || param == "rel=next")
            .then(|| url.to_owned())
    })
}
