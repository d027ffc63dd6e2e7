use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use github_api::{GitHubUser, GithubError};
use parking_lot::Mutex;
use policy_store::Repo;
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;

use crate::PolicyState;
use crate::utils;

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Named async locks, local to this process.
///
/// Entries are dropped once nobody holds nor waits on them.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: LockMap,
}

pub struct KeyedLockGuard {
    key: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: String) -> KeyedLockGuard {
        let mutex = Arc::clone(self.inner.lock().entry(key.clone()).or_default());

        let guard = mutex.lock_owned().await;

        KeyedLockGuard {
            key,
            locks: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();

        drop(self.guard.take());

        // Only the map itself still points to the mutex.
        if locks.get(&self.key).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
            locks.remove(&self.key);
        }
    }
}

pub fn sync_lock_key(github_id: i64) -> String {
    format!("{github_id}-sync-repo-lock")
}

/// Replaces the collaborators of a repository with the ones GitHub reports.
///
/// Requests sent before the last sync started are skipped: a newer request already
/// covers them.
#[instrument(skip(state, sent))]
pub async fn run_sync_repo_collaborators(state: &PolicyState, github_id: i64, sent: &str) -> anyhow::Result<()> {
    let sent = utils::parse_sent(sent)?;

    let mut repo = {
        let _guard = state.sync_locks.lock(sync_lock_key(github_id)).await;

        let Some(mut repo) = state.store.get_repo_by_github_id(github_id).await? else {
            error!("Could not find repository");
            return Ok(());
        };

        if let Some(synced) = repo.collaborators_synced
            && sent < synced
        {
            info!(repo = %repo.repo_name, "Collaborators already synced after this request, skipping");
            return Ok(());
        }

        repo.collaborators_synced = Some(OffsetDateTime::now_utc());
        state.store.save_repo(&repo).await?;

        repo
    };

    info!(repo = %repo.repo_name, "Syncing collaborators");

    let collaborators = match get_repo_collaborators(state, &mut repo).await {
        Err(error) if utils::is_github_not_found(&error) => {
            let Some(org_id) = repo.org_id else {
                return Err(error);
            };

            let org = state
                .store
                .get_org(org_id)
                .await?
                .context("organization of the repository is missing")?;

            debug!(repo = %repo.repo_name, org = %org.org_name, "Retrying as the organization owner");

            repo.owner_id = org.owner_id;
            state.store.save_repo(&repo).await?;

            get_repo_collaborators(state, &mut repo).await?
        }
        result => result?,
    };

    let Some(collaborators) = collaborators.filter(|collaborators| !collaborators.is_empty()) else {
        info!(repo = %repo.repo_name, "Could not access collaborators");
        return Ok(());
    };

    let github_ids = collaborators.iter().map(|user| user.id).collect::<Vec<_>>();

    let user_ids = state
        .store
        .users_by_github_ids(&github_ids)
        .await?
        .into_iter()
        .map(|user| user.id)
        .collect::<Vec<_>>();

    state.store.set_repo_collaborators(repo.id, &user_ids).await?;

    info!(repo = %repo.repo_name, count = user_ids.len(), "Finished syncing collaborators");

    Ok(())
}

/// Lists collaborators as the repository owner.
///
/// Returns `None` when the repository is blocked, or when the owner keeps being suspended
/// again while we're working.
async fn get_repo_collaborators(state: &PolicyState, repo: &mut Repo) -> anyhow::Result<Option<Vec<GitHubUser>>> {
    let max_sync_retry = state.conf().policy.max_sync_retry;
    let mut retry = 0;

    loop {
        repo.collaborators_synced = Some(OffsetDateTime::now_utc());
        state.store.save_repo(repo).await?;

        let login = utils::owner_login(state, repo).await?;
        let (owner, name) = repo.owner_and_name();
        let (owner, name) = (owner.to_owned(), name.to_owned());

        let result = state
            .github
            .impersonate_user(&login, |gh| async move { gh.get_repo_collaborators(&owner, &name).await })
            .await;

        match result {
            Ok(collaborators) => return Ok(Some(collaborators)),
            Err(GithubError::RepositoryBlocked) => {
                info!(repo = %repo.repo_name, "Repository is blocked");
                return Ok(None);
            }
            Err(GithubError::AccountSuspended) if retry < max_sync_retry => {
                retry += 1;
                debug!(%login, retry, "Owner was suspended again, retrying");
            }
            Err(GithubError::AccountSuspended) => {
                warn!(%login, "Owner keeps being suspended, giving up");
                return Ok(None);
            }
            Err(error) => return Err(error.into()),
        }
    }
}
