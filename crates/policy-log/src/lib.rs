#[macro_use]
extern crate tracing;

use std::io;
use std::marker::PhantomData;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use policy_task::{ShutdownSignal, Task};
use tokio::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub trait StaticLogConfig {
    const MAX_LOG_FILES: usize;
    const LOG_FILE_PREFIX: &'static str;
}

pub struct LoggerGuard {
    _file_guard: WorkerGuard,
    _stdio_guard: WorkerGuard,
}

/// Folder holding the log files and the file name prefix identifying them.
struct LogLocation<'a> {
    folder: &'a Utf8Path,
    prefix: &'a str,
}

impl<'a> LogLocation<'a> {
    /// A directory path uses the default prefix, anything else is read as `<folder>/<prefix>`.
    fn resolve<C: StaticLogConfig>(path: &'a Utf8Path) -> anyhow::Result<Self> {
        if path.is_dir() {
            Ok(Self {
                folder: path,
                prefix: C::LOG_FILE_PREFIX,
            })
        } else {
            Ok(Self {
                folder: path.parent().context("invalid log path (parent)")?,
                prefix: path.file_name().context("invalid log path (file_name)")?,
            })
        }
    }

    fn owns(&self, file_name: &str) -> bool {
        file_name.starts_with(self.prefix) && file_name.contains("log")
    }
}

pub fn init<C: StaticLogConfig>(
    path: &Utf8Path,
    log_filter: &str,
    debug_filtering_directives: Option<&str>,
) -> anyhow::Result<LoggerGuard> {
    let location = LogLocation::resolve::<C>(path)?;

    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(location.prefix)
        .filename_suffix("log")
        .max_log_files(C::MAX_LOG_FILES)
        .build(location.folder)
        .context("couldn't create file appender")?;
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let mut env_filter =
        EnvFilter::try_new(log_filter).context("invalid built-in filtering directives (this is a bug)")?;

    for directive in debug_filtering_directives
        .into_iter()
        .flat_map(|directives| directives.split(','))
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
    {
        let directive = directive
            .parse()
            .with_context(|| format!("invalid log directive: {directive}"))?;
        env_filter = env_filter.add_directive(directive);
    }

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .try_init()
        .context("a global logger is already installed")?;

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}

/// Removes the log files older than `max_age` and returns how many were deleted.
pub async fn delete_old_log_files<C: StaticLogConfig>(path: &Utf8Path, max_age: Duration) -> anyhow::Result<usize> {
    let location = LogLocation::resolve::<C>(path)?;

    let mut read_dir = fs::read_dir(location.folder)
        .await
        .with_context(|| format!("couldn't read log folder {}", location.folder))?;

    let mut deleted = 0;

    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };

        if !location.owns(&file_name) {
            continue;
        }

        let age = entry
            .metadata()
            .await
            .and_then(|metadata| metadata.modified())
            .and_then(|time| time.elapsed().map_err(io::Error::other));

        match age {
            Ok(age) if age > max_age => {
                info!(file_name, "Delete log file");
                match fs::remove_file(entry.path()).await {
                    Ok(()) => deleted += 1,
                    Err(error) => warn!(%error, file_name, "Couldn't delete log file"),
                }
            }
            Ok(_) => trace!(file_name, "Keep this log file"),
            Err(error) => warn!(%error, file_name, "Couldn't retrieve metadata for file"),
        }
    }

    Ok(deleted)
}

/// Deletes log files older than 90 days, once a day.
pub struct LogDeleterTask<C: StaticLogConfig> {
    path: Utf8PathBuf,
    _phantom: PhantomData<C>,
}

impl<C: StaticLogConfig> LogDeleterTask<C> {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<C: StaticLogConfig + Send + Sync + 'static> Task for LogDeleterTask<C> {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "log deleter";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        log_deleter_task::<C>(self.path, shutdown_signal).await
    }
}

#[instrument(skip(shutdown_signal))]
async fn log_deleter_task<C: StaticLogConfig + Send + Sync + 'static>(
    path: Utf8PathBuf,
    shutdown_signal: ShutdownSignal,
) -> anyhow::Result<()> {
    const TASK_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24);
    const MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 90);

    debug!("Task started");

    policy_task::run_every(TASK_INTERVAL, shutdown_signal, || {
        let path = path.clone();
        async move {
            match delete_old_log_files::<C>(&path, MAX_AGE).await {
                Ok(deleted) => debug!(deleted, "Old log files cleaned up"),
                Err(error) => warn!(error = format!("{error:#}"), "Couldn't clean up log folder"),
            }
        }
    })
    .await;

    debug!("Task terminated");

    Ok(())
}
