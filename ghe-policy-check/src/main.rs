#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use ghe_policy_check::PolicyState;
use ghe_policy_check::commands::{self, CliAction};
use ghe_policy_check::config::ConfHandle;
use ghe_policy_check::job_queue::JobQueueHandle;
use ghe_policy_check::log::PolicyCheckLog;
use ghe_policy_check::service::PolicyService;
use tap::prelude::*;

#[allow(clippy::print_stdout)]
fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();

    let executable = args.next().context("executable name is missing from the environment")?;

    let action = commands::parse_args(args)?;

    match action {
        CliAction::ShowHelp => {
            println!(
                r#"HELP:

    Run:
        "{executable}"

    Initialize configuration only (will not override existing configuration):
        "{executable}" --config-init-only

    Link forks to their source repository:
        "{executable}" sync-forks [--created YYYY-MM-DDTHH:MM:SSZ]

    Delete the repositories GitHub no longer knows, refresh the visibility of the others:
        "{executable}" clean-repos

    Send a stored webhook delivery again:
        "{executable}" resend-event --url <URL> --path <FILE> --event <EVENT> [--key <KEY>]
"#
            )
        }
        CliAction::ConfigInitOnly => {
            let conf_file = ghe_policy_check::config::load_conf_file_or_generate_new()?;
            let conf_file_json =
                serde_json::to_string_pretty(&conf_file).context("couldn't represent config file as JSON")?;
            println!("{conf_file_json}");
        }
        CliAction::Run => {
            let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
            let mut service = PolicyService::load(conf_handle).context("Service loading failed")?;

            service
                .start()
                .tap_err(|error| error!(error = format!("{error:#}"), "Failed to start"))?;

            // Waiting for some stop signal (CTRL-C…)
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .context("failed to build the async runtime")?;
            rt.block_on(build_signals_fut())?;

            service.stop();
        }
        CliAction::SyncForks { created } => {
            run_command(|state| async move { commands::sync_forks::sync_forks(&state, created).await })?;
        }
        CliAction::CleanRepos => {
            let report = run_command(|state| async move { commands::clean_repos::clean_repos(&state).await })?;
            println!(
                "{} updated, {} deleted, {} skipped",
                report.updated, report.deleted, report.skipped
            );
        }
        CliAction::ResendEvent(args) => {
            let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
            let default_key = conf_handle.get_conf().github.webhook_key.clone();

            let status = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to build the async runtime")?
                .block_on(commands::resend_event::resend_event(&args, &default_key))?;

            println!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or_default());
        }
    }

    Ok(())
}

/// Runs a one-shot command against the configured database.
///
/// Commands don't enqueue jobs, so no job queue is started.
fn run_command<T, F, Fut>(command: F) -> anyhow::Result<T>
where
    F: FnOnce(PolicyState) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;
    let conf = conf_handle.get_conf();

    let _logger_guard = policy_log::init::<PolicyCheckLog>(
        &conf.log_file,
        conf.verbosity_profile.to_log_filter(),
        conf.debug.log_directives.as_deref(),
    )
    .context("failed to setup logger")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    rt.block_on(async move {
        let (job_queue_handle, _job_queue_rx) = JobQueueHandle::new();
        let state = PolicyState::open(conf_handle, job_queue_handle).await?;
        command(state).await
    })
    .tap_err(|error| error!(error = format!("{error:#}"), "Command failed"))
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream failed")?;
    let mut interrupt_signal =
        signal(SignalKind::interrupt()).context("failed to create interrupt signal stream failed")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
