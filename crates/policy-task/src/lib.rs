use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Resolves once every [`ShutdownSignal`] has been dropped.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// Aborts the running task when dropped.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    pub fn abort(&self) {
        self.0.abort()
    }

    /// Drop without aborting the task
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    ChildTask::spawn(task.run(shutdown_signal))
}

/// Calls `tick` once per `period` until shutdown is requested.
///
/// The first call happens right away. A call still in flight when the shutdown signal
/// fires is dropped at its next await point, so `tick` must be cancel-safe.
/// Ticks missed because `tick` ran longer than `period` are not replayed.
pub async fn run_every<F, Fut>(period: Duration, mut shutdown_signal: ShutdownSignal, mut tick: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = shutdown_signal.wait() => break,
        }

        tokio::select! {
            () = tick() => {}
            () = shutdown_signal.wait() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingTask {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Task for CountingTask {
        type Output = usize;

        const NAME: &'static str = "counting";

        async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
            let count = Arc::clone(&self.count);
            run_every(Duration::from_secs(60), shutdown_signal, move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
            self.count.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_every_ticks_until_shutdown() {
        let (handle, signal) = ShutdownHandle::new();
        let count = Arc::new(AtomicUsize::new(0));

        let child = spawn_task(
            CountingTask {
                count: Arc::clone(&count),
            },
            signal,
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        handle.signal();

        let ticks = child.join().await.unwrap();
        assert_eq!(ticks, 3);
        handle.all_closed().await;
    }

    #[tokio::test]
    async fn dropping_child_task_aborts_it() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let child = ChildTask::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        drop(child);
        assert!(rx.await.is_err());
    }
}
