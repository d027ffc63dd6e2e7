use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use policy_log::{LogDeleterTask, LoggerGuard};
use policy_task::{ChildTask, ShutdownHandle, ShutdownSignal};
use tokio::runtime::{self, Runtime};

use crate::PolicyState;
use crate::config::ConfHandle;
use crate::job_queue::{JobQueueCtx, JobQueueTask, JobRunnerTask};
use crate::listener::PolicyListener;
use crate::log::PolicyCheckLog;
use crate::repo_polling::{DefaultPollingPolicy, RepoPollingTask};
use crate::sync_users::UserSyncTask;

pub const SERVICE_NAME: &str = "ghe-policy-check";

#[allow(clippy::large_enum_variant)] // `Running` variant is bigger than `Stopped` but we don't care
enum ServiceState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct PolicyService {
    conf_handle: ConfHandle,
    state: ServiceState,
    _logger_guard: LoggerGuard,
}

impl PolicyService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard = policy_log::init::<PolicyCheckLog>(
            &conf.log_file,
            conf.verbosity_profile.to_log_filter(),
            conf.debug.log_directives.as_deref(),
        )
        .context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        let conf_file = conf_handle.get_conf_file();
        trace!(?conf_file);

        if !conf.debug.is_default() {
            warn!(
                ?conf.debug,
                "**DEBUG OPTIONS ARE ENABLED, PLEASE DO NOT USE IN PRODUCTION**",
            );
        }

        if conf.api_token.is_none() {
            warn!("No ApiToken configured, the REST API is open to anyone reaching the listener");
        }

        Ok(PolicyService {
            conf_handle,
            state: ServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf_handle = self.conf_handle.clone();

        // spawn_tasks needs to be run in the runtime in order to bind the sockets.
        let tasks = runtime.block_on(spawn_tasks(conf_handle))?;

        trace!("Tasks created");

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = ServiceState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("Attempted to stop the service, but it's already stopped");
            }
            ServiceState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("Stopping the service");

                shutdown_handle.signal();

                runtime.block_on(async move {
                    const MAX_COUNT: usize = 3;
                    let mut count = 0;

                    loop {
                        tokio::select! {
                            _ = shutdown_handle.all_closed() => {
                                debug!("All tasks are terminated");
                                break;
                            }
                            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                                count += 1;

                                if count >= MAX_COUNT {
                                    warn!("Terminate forcefully the lingering tasks");
                                    break;
                                } else {
                                    warn!("Termination of certain tasks is experiencing significant delays");
                                }
                            }
                        }
                    }
                });

                // Wait for 1 more second before forcefully shutting down the runtime
                runtime.shutdown_timeout(Duration::from_secs(1));

                self.state = ServiceState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: policy_task::Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = policy_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let conf = conf_handle.get_conf();

    let job_queue_ctx = JobQueueCtx::init(&conf.job_queue_database)
        .await
        .with_context(|| format!("failed to initialize job queue at {}", conf.job_queue_database))?;

    let state = PolicyState::open(conf_handle, job_queue_ctx.job_queue_handle.clone()).await?;

    let listener = PolicyListener::init_and_bind(conf.listener, state.clone())
        .with_context(|| format!("failed to initialize {}", conf.listener))?;

    let mut tasks = Tasks::new();

    tasks.register(listener);

    tasks.register(JobRunnerTask::new(&job_queue_ctx, state.clone()));

    tasks.register(JobQueueTask::new(job_queue_ctx));

    if conf.debug.disable_polling {
        warn!("Repository polling and user sync are disabled");
    } else {
        tasks.register(RepoPollingTask::new(state.clone(), Arc::new(DefaultPollingPolicy)));
        tasks.register(UserSyncTask::new(state));
    }

    tasks.register(LogDeleterTask::<PolicyCheckLog>::new(conf.log_file.clone()));

    Ok(tasks)
}
