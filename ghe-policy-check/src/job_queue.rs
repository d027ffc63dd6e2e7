use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use camino::Utf8Path;
use job_queue::{DynJobQueue, JobCtx, JobQueue, JobRunner, RetryPolicy, RunnerWaker, ScheduleFor};
use job_queue_libsql::libsql;
use policy_task::{ChildTask, ShutdownSignal, Task};
use time::OffsetDateTime;
use tokio::sync::{Notify, mpsc};

use crate::PolicyState;
use crate::jobs::{PolicyJob, PolicyJobReader};

const PUSH_ATTEMPTS: usize = 5;

pub struct JobQueueCtx {
    notify_runner: Arc<Notify>,
    runner_waker: RunnerWaker,
    queue: DynJobQueue,
    job_queue_rx: JobQueueReceiver,
    pub job_queue_handle: JobQueueHandle,
}

/// A serialized job on its way to the persistent queue.
#[derive(Debug)]
pub struct JobMessage {
    pub job_name: &'static str,
    pub job_def: String,
    pub retry_policy: RetryPolicy,
    pub schedule_for: ScheduleFor,
}

#[derive(Clone)]
pub struct JobQueueHandle(mpsc::Sender<JobMessage>);

pub type JobQueueReceiver = mpsc::Receiver<JobMessage>;

pub struct JobQueueTask {
    queue: DynJobQueue,
    job_queue_rx: JobQueueReceiver,
}

pub struct JobRunnerTask {
    notify_runner: Arc<Notify>,
    runner_waker: RunnerWaker,
    queue: DynJobQueue,
    state: PolicyState,
}

impl JobQueueCtx {
    pub async fn init(database_path: &Utf8Path) -> anyhow::Result<Self> {
        let notify_runner = Arc::new(Notify::new());

        let runner_waker = RunnerWaker::new({
            let notify_runner = Arc::clone(&notify_runner);
            move || notify_runner.notify_one()
        });

        let database = libsql::Builder::new_local(database_path.as_std_path())
            .build()
            .await
            .context("build database")?;

        let conn = database.connect().context("open database connection")?;

        let queue = job_queue_libsql::LibSqlJobQueue::builder()
            .runner_waker(runner_waker.clone())
            .conn(conn)
            .build();

        let queue = Arc::new(queue);

        queue.setup().await.context("database migration")?;

        queue
            .reset_claimed_jobs()
            .await
            .context("failed to reset claimed jobs")?;

        queue.clear_failed().await.context("failed to clear failed jobs")?;

        let (handle, rx) = JobQueueHandle::new();

        Ok(Self {
            notify_runner,
            runner_waker,
            queue,
            job_queue_rx: rx,
            job_queue_handle: handle,
        })
    }
}

impl JobQueueHandle {
    pub fn new() -> (Self, JobQueueReceiver) {
        let (tx, rx) = mpsc::channel(512);
        (Self(tx), rx)
    }

    pub async fn enqueue<J: PolicyJob>(&self, job: &J) -> anyhow::Result<()> {
        self.send(job, ScheduleFor::Now).await
    }

    pub async fn schedule<J: PolicyJob>(&self, job: &J, schedule_for: OffsetDateTime) -> anyhow::Result<()> {
        self.send(job, ScheduleFor::Once(schedule_for)).await
    }

    async fn send<J: PolicyJob>(&self, job: &J, schedule_for: ScheduleFor) -> anyhow::Result<()> {
        let job_def = serde_json::to_string(job).with_context(|| format!("failed to serialize {}", J::NAME))?;

        self.0
            .send(JobMessage {
                job_name: J::NAME,
                job_def,
                retry_policy: J::retry_policy(),
                schedule_for,
            })
            .await
            .context("couldn't enqueue job")
    }
}

impl JobQueueTask {
    pub fn new(ctx: JobQueueCtx) -> Self {
        Self {
            queue: ctx.queue,
            job_queue_rx: ctx.job_queue_rx,
        }
    }
}

#[async_trait]
impl Task for JobQueueTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "job queue";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        job_queue_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn job_queue_task(ctx: JobQueueTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    debug!("Task started");

    let JobQueueTask {
        queue,
        mut job_queue_rx,
    } = ctx;

    loop {
        tokio::select! {
            msg = job_queue_rx.recv() => {
                let Some(msg) = msg else {
                    debug!("All senders are dead");
                    break;
                };

                ChildTask::spawn({
                    let queue = Arc::clone(&queue);

                    async move {
                        for _ in 0..PUSH_ATTEMPTS {
                            match queue
                                .push_job_raw(msg.job_name, msg.job_def.clone(), msg.retry_policy, msg.schedule_for)
                                .await
                            {
                                Ok(()) => break,
                                Err(e) => {
                                    warn!(error = format!("{e:#}"), job_name = msg.job_name, "Failed to push job");
                                    tokio::time::sleep(Duration::from_secs(20)).await;
                                }
                            }
                        }
                    }
                })
                .detach();
            }
            () = shutdown_signal.wait() => break,
        }
    }

    debug!("Task terminated");

    Ok(())
}

impl JobRunnerTask {
    pub fn new(ctx: &JobQueueCtx, state: PolicyState) -> Self {
        Self {
            notify_runner: Arc::clone(&ctx.notify_runner),
            runner_waker: RunnerWaker::clone(&ctx.runner_waker),
            queue: Arc::clone(&ctx.queue),
            state,
        }
    }
}

#[async_trait]
impl Task for JobRunnerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "job runner";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        job_runner_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn job_runner_task(ctx: JobRunnerTask, mut shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    debug!("Task started");

    let JobRunnerTask {
        notify_runner,
        runner_waker,
        queue,
        state,
    } = ctx;

    let reader = PolicyJobReader::new(state);

    let spawn = |mut ctx: JobCtx, callback: job_queue::SpawnCallback| {
        tokio::spawn(async move {
            let result = ctx.job.run().await;
            (callback)(result).await;
        });
    };

    let sleep =
        |duration: Duration| (Box::new(tokio::time::sleep(duration)) as Box<dyn Future<Output = ()> + Send>).into();

    let wait_notified = {
        let notify_runner = Arc::clone(&notify_runner);
        move || {
            let notify_runner = Arc::clone(&notify_runner);
            (Box::new(async move { notify_runner.notified().await }) as Box<dyn Future<Output = ()> + Send>).into()
        }
    };

    let wait_notified_timeout = move |timeout: Duration| {
        let notify_runner = Arc::clone(&notify_runner);
        (Box::new(async move {
            tokio::select! {
                () = notify_runner.notified() => {}
                () = tokio::time::sleep(timeout) => {}
            }
        }) as Box<dyn Future<Output = ()> + Send>)
            .into()
    };

    let runner = JobRunner {
        queue,
        reader: &reader,
        spawn: &spawn,
        sleep: &sleep,
        wait_notified: &wait_notified,
        wait_notified_timeout: &wait_notified_timeout,
        waker: runner_waker,
        max_batch_size: 16,
    };

    tokio::select! {
        () = runner.run() => {}
        () = shutdown_signal.wait() => {}
    }

    debug!("Task terminated");

    Ok(())
}
