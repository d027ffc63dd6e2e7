//! One-shot maintenance commands run from the command line.

pub mod clean_repos;
pub mod resend_event;
pub mod sync_forks;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub use self::resend_event::ResendEventArgs;

#[derive(Debug, PartialEq, Eq)]
pub enum CliAction {
    ShowHelp,
    Run,
    ConfigInitOnly,
    SyncForks { created: Option<OffsetDateTime> },
    CleanRepos,
    ResendEvent(ResendEventArgs),
}

/// Parses the arguments following the executable name.
pub fn parse_args<I>(args: I) -> anyhow::Result<CliAction>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();

    let action = match args.next().as_deref() {
        None => CliAction::Run,
        Some("--config-init-only") => CliAction::ConfigInitOnly,
        Some("sync-forks") => {
            let mut created = None;

            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--created" => {
                        let value = args.next().context("--created expects a date")?;
                        let date = OffsetDateTime::parse(&value, &Rfc3339)
                            .with_context(|| format!("invalid date for --created: {value}"))?;
                        created = Some(date);
                    }
                    _ => return Ok(CliAction::ShowHelp),
                }
            }

            CliAction::SyncForks { created }
        }
        Some("clean-repos") => match args.next() {
            None => CliAction::CleanRepos,
            Some(_) => CliAction::ShowHelp,
        },
        Some("resend-event") => {
            let mut url = None;
            let mut path = None;
            let mut event = None;
            let mut key = None;

            while let Some(arg) = args.next() {
                let slot = match arg.as_str() {
                    "--url" => &mut url,
                    "--path" => &mut path,
                    "--event" => &mut event,
                    "--key" => &mut key,
                    _ => return Ok(CliAction::ShowHelp),
                };

                *slot = Some(args.next().with_context(|| format!("{arg} expects a value"))?);
            }

            CliAction::ResendEvent(ResendEventArgs {
                url: url.context("--url is required")?,
                path: path.map(Utf8PathBuf::from).context("--path is required")?,
                event: event.context("--event is required")?,
                key,
            })
        }
        Some(_) => CliAction::ShowHelp,
    };

    Ok(action)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use rstest::rstest;
    use time::macros::datetime;

    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<CliAction> {
        parse_args(args.iter().map(|arg| (*arg).to_owned()))
    }

    #[rstest]
    #[case(&[], CliAction::Run)]
    #[case(&["--config-init-only"], CliAction::ConfigInitOnly)]
    #[case(&["help"], CliAction::ShowHelp)]
    #[case(&["--help"], CliAction::ShowHelp)]
    #[case(&["clean-repos"], CliAction::CleanRepos)]
    #[case(&["clean-repos", "now"], CliAction::ShowHelp)]
    #[case(&["sync-forks"], CliAction::SyncForks { created: None })]
    #[case(&["sync-forks", "--since"], CliAction::ShowHelp)]
    fn simple_actions(#[case] args: &[&str], #[case] expected: CliAction) {
        assert_eq!(parse(args).unwrap(), expected);
    }

    #[test]
    fn sync_forks_created_filter() {
        let action = parse(&["sync-forks", "--created", "2024-03-01T08:30:00Z"]).unwrap();

        assert_eq!(
            action,
            CliAction::SyncForks {
                created: Some(datetime!(2024-03-01 08:30:00 UTC))
            }
        );
    }

    #[test]
    fn sync_forks_rejects_malformed_date() {
        let error = parse(&["sync-forks", "--created", "yesterday"]).unwrap_err();
        assert!(error.to_string().contains("yesterday"));
    }

    #[test]
    fn resend_event_arguments() {
        let action = parse(&[
            "resend-event",
            "--event",
            "repository",
            "--url",
            "http://localhost:8000/webhooks/",
            "--path",
            "/tmp/event.json",
        ])
        .unwrap();

        assert_eq!(
            action,
            CliAction::ResendEvent(ResendEventArgs {
                url: "http://localhost:8000/webhooks/".to_owned(),
                path: Utf8PathBuf::from("/tmp/event.json"),
                event: "repository".to_owned(),
                key: None,
            })
        );
    }

    #[rstest]
    #[case(&["resend-event", "--path", "a.json", "--event", "ping"], "--url is required")]
    #[case(&["resend-event", "--url", "http://x", "--event", "ping"], "--path is required")]
    #[case(&["resend-event", "--url"], "--url expects a value")]
    fn resend_event_missing_values(#[case] args: &[&str], #[case] expected: &str) {
        let error = parse(args).unwrap_err();
        assert_eq!(error.to_string(), expected);
    }
}
