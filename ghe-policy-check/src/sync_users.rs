use async_trait::async_trait;
use github_api::GithubError;
use policy_store::User;
use policy_task::{ShutdownSignal, Task, run_every};
use time::OffsetDateTime;

use crate::PolicyState;

/// Refreshes the suspension state of one chunk of the users, least recently synced first.
pub async fn run_sync_users(state: &PolicyState) -> anyhow::Result<()> {
    let total = state.store.count_users().await?;
    let limit = state.conf().policy.polling_chunk(total);
    let now = OffsetDateTime::now_utc();

    for mut user in state.store.polling_users(limit).await? {
        if let Err(error) = sync_user(state, &mut user, now).await {
            warn!(user = %user.username, error = format!("{error:#}"), "Failed to sync user");
        }
    }

    Ok(())
}

async fn sync_user(state: &PolicyState, user: &mut User, now: OffsetDateTime) -> anyhow::Result<()> {
    info!(user = %user.username, "Syncing user");

    user.last_synced = Some(now);

    match state.github.get_user(&user.username).await {
        Ok(github_user) => user.suspended_at = github_user.suspended_at,
        // Left unsaved, so the user keeps its place in the polling order.
        Err(GithubError::NotFound(_)) => {
            debug!(user = %user.username, "User not found on GitHub");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    }

    state.store.save_user(user).await
}

pub struct UserSyncTask {
    state: PolicyState,
}

impl UserSyncTask {
    pub fn new(state: PolicyState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Task for UserSyncTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "user sync";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        user_sync_task(self.state, shutdown_signal).await;
        Ok(())
    }
}

#[instrument(skip_all)]
async fn user_sync_task(state: PolicyState, shutdown_signal: ShutdownSignal) {
    debug!("Task started");

    let period = state.conf().policy.polling_period();

    run_every(period, shutdown_signal, || {
        let state = state.clone();

        async move {
            if let Err(error) = run_sync_users(&state).await {
                error!(error = format!("{error:#}"), "User sync failed");
            }
        }
    })
    .await;

    debug!("Task terminated");
}
