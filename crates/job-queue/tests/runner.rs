#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use job_queue::{
    DynJob, DynJobQueue, Job, JobCtx, JobQueueExt as _, JobReader, JobRunner, RetryPolicy, RunnerWaker, ScheduleFor,
    SpawnCallback,
};
use job_queue_libsql::{LibSqlJobQueue, libsql};
use tokio::sync::{Notify, mpsc};

static RUNS: AtomicUsize = AtomicUsize::new(0);

/// Fails on its first run, succeeds afterwards.
#[derive(serde::Serialize, serde::Deserialize)]
struct FlakyJob {
    label: String,
}

#[async_trait]
impl Job for FlakyJob {
    fn name(&self) -> &str {
        "flaky"
    }

    fn write_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::DEFAULT.with_backoff(Duration::ZERO)
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let run = RUNS.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(run > 0, "first run of {} fails", self.label);
        Ok(())
    }
}

struct Reader;

impl JobReader for Reader {
    fn read_json(&self, name: &str, json: &str) -> anyhow::Result<DynJob> {
        anyhow::ensure!(name == "flaky", "unknown job name: {name}");
        Ok(Box::new(serde_json::from_str::<FlakyJob>(json)?))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_job_is_retried_by_the_runner() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let notify = Arc::new(Notify::new());

    let waker = RunnerWaker::new({
        let notify = Arc::clone(&notify);
        move || notify.notify_one()
    });

    let conn = libsql::Builder::new_local(":memory:")
        .build()
        .await
        .unwrap()
        .connect()
        .unwrap();

    let queue = LibSqlJobQueue::builder().runner_waker(waker.clone()).conn(conn).build();
    let queue: DynJobQueue = Arc::new(queue);
    queue.setup().await.unwrap();

    let job: DynJob = Box::new(FlakyJob {
        label: "flaky".to_owned(),
    });
    queue.push_job(&job, ScheduleFor::Now).await.unwrap();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let runner = tokio::spawn({
        let queue = Arc::clone(&queue);
        let notify = Arc::clone(&notify);

        async move {
            let spawn = move |mut ctx: JobCtx, callback: SpawnCallback| {
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = ctx.job.run().await;
                    let succeeded = result.is_ok();
                    (callback)(result).await;
                    let _ = done_tx.send((ctx.failed_attempts, succeeded));
                });
            };

            let sleep = |duration: Duration| {
                (Box::new(tokio::time::sleep(duration)) as Box<dyn Future<Output = ()> + Send>).into()
            };

            let wait_notified = {
                let notify = Arc::clone(&notify);
                move || {
                    let notify = Arc::clone(&notify);
                    (Box::new(async move { notify.notified().await }) as Box<dyn Future<Output = ()> + Send>).into()
                }
            };

            let wait_notified_timeout = move |timeout: Duration| {
                let notify = Arc::clone(&notify);
                (Box::new(async move {
                    tokio::select! {
                        () = notify.notified() => {}
                        () = tokio::time::sleep(timeout) => {}
                    }
                }) as Box<dyn Future<Output = ()> + Send>)
                    .into()
            };

            JobRunner {
                queue,
                reader: &Reader,
                spawn: &spawn,
                sleep: &sleep,
                wait_notified: &wait_notified,
                wait_notified_timeout: &wait_notified_timeout,
                waker,
                max_batch_size: 4,
            }
            .run()
            .await;
        }
    });

    let first = tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, (0, false));

    let second = tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, (1, true));

    runner.abort();

    // Deleted after success.
    assert!(queue.next_scheduled_date().await.unwrap().is_none());
}
