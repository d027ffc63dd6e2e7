use anyhow::Context as _;
use camino::Utf8PathBuf;
use github_api::signature::{SIGNATURE_HEADER, sign_sha1};
use reqwest::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResendEventArgs {
    pub url: String,
    pub path: Utf8PathBuf,
    pub event: String,
    /// Signing key, `GithubWebhookKey` when absent
    pub key: Option<String>,
}

/// Posts a stored webhook delivery again, signed like GitHub would sign it.
pub async fn resend_event(args: &ResendEventArgs, default_key: &str) -> anyhow::Result<StatusCode> {
    let raw = tokio::fs::read_to_string(&args.path)
        .await
        .with_context(|| format!("couldn't read {}", args.path))?;

    let payload: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON document", args.path))?;

    // Compact form, so the signature covers exactly what is sent.
    let body = serde_json::to_vec(&payload).context("failed to serialize the payload")?;

    let key = args.key.as_deref().unwrap_or(default_key);
    let signature = sign_sha1(key.as_bytes(), &body);

    debug!(url = %args.url, event = %args.event, "Resending webhook event");

    let response = reqwest::Client::new()
        .post(&args.url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, signature)
        .header("X-GitHub-Event", &args.event)
        .body(body)
        .send()
        .await
        .with_context(|| format!("failed to post the event to {}", args.url))?;

    Ok(response.status())
}
