//! GitHub webhook receiver.
//!
//! Deliveries are authenticated with the `X-Hub-Signature` HMAC, then routed to a handler
//! by event name and, optionally, by the `action` field of the payload.

mod handlers;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse as _, Response};
use futures::future::BoxFuture;
use github_api::signature::{SIGNATURE_HEADER, SignatureError, verify_signature};
use serde::de::DeserializeOwned;

use crate::PolicyState;
use crate::http::HttpError;

pub use self::handlers::default_dispatcher;

pub const EVENT_HEADER: &str = "X-GitHub-Event";

/// One webhook delivery
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// Lower-cased `X-GitHub-Event` header
    pub event: String,
    /// Lower-cased `action` field of the payload
    pub action: Option<String>,
    pub payload: serde_json::Value,
}

impl WebhookEvent {
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        T::deserialize(&self.payload).map_err(HttpError::bad_request().with_msg("unexpected payload").err())
    }
}

pub type WebhookHandler = Arc<dyn Fn(PolicyState, WebhookEvent) -> BoxFuture<'static, Result<Response, HttpError>> + Send + Sync>;

/// Wraps an async function into a [`WebhookHandler`].
pub fn handler<F, Fut>(f: F) -> WebhookHandler
where
    F: Fn(PolicyState, WebhookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HttpError>> + Send + 'static,
{
    Arc::new(move |state, event| Box::pin(f(state, event)))
}

enum EventHandlers {
    /// Handles the event whatever its action
    All(WebhookHandler),
    ByAction(HashMap<String, WebhookHandler>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("event {event} is already handled as a whole, can't register action {action}")]
    EventAlreadyHandled { event: String, action: String },
}

/// Registry of webhook handlers
#[derive(Default)]
pub struct WebhookDispatcher {
    events: HashMap<String, EventHandlers>,
}

impl WebhookDispatcher {
    /// Handles every action of `event`, replacing whatever was registered for it.
    pub fn on_event(&mut self, event: &str, handler: WebhookHandler) -> &mut Self {
        self.events.insert(event.to_lowercase(), EventHandlers::All(handler));
        self
    }

    /// Handles one action of `event`, replacing a previous handler for the same action.
    pub fn on_action(&mut self, event: &str, action: &str, handler: WebhookHandler) -> Result<&mut Self, RegistrationError> {
        let entry = self
            .events
            .entry(event.to_lowercase())
            .or_insert_with(|| EventHandlers::ByAction(HashMap::new()));

        match entry {
            EventHandlers::All(_) => {
                return Err(RegistrationError::EventAlreadyHandled {
                    event: event.to_lowercase(),
                    action: action.to_lowercase(),
                });
            }
            EventHandlers::ByAction(actions) => {
                actions.insert(action.to_lowercase(), handler);
            }
        }

        Ok(self)
    }

    pub fn handler_for(&self, event: &str, action: Option<&str>) -> Option<&WebhookHandler> {
        match self.events.get(&event.to_lowercase())? {
            EventHandlers::All(handler) => Some(handler),
            EventHandlers::ByAction(actions) => actions.get(&action?.to_lowercase()),
        }
    }
}

pub(crate) async fn post_webhook(
    State(state): State<PolicyState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let conf = state.conf();

    let signature = headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok());

    match verify_signature(conf.github.webhook_key.as_bytes(), signature, &body) {
        Ok(()) => {}
        Err(SignatureError::UnsupportedAlgorithm(_)) => {
            return Err(HttpError::not_implemented().msg("Operation not supported."));
        }
        Err(error) => return Err(HttpError::forbidden().with_msg("Permission denied.").err()(error)),
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| HttpError::bad_request().msg("missing event header"))?
        .to_lowercase();

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(HttpError::bad_request().with_msg("invalid JSON payload").err())?;

    let action = payload
        .get("action")
        .and_then(serde_json::Value::as_str)
        .map(str::to_lowercase);

    let Some(handler) = state.webhooks.handler_for(&event, action.as_deref()).cloned() else {
        debug!(%event, ?action, "Unhandled webhook");
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    info!(%event, ?action, "Handling webhook");

    handler(state, WebhookEvent { event, action, payload }).await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    async fn accepted(_: PolicyState, _: WebhookEvent) -> Result<Response, HttpError> {
        Ok(StatusCode::ACCEPTED.into_response())
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut dispatcher = WebhookDispatcher::default();
        dispatcher.on_action("Repository", "Created", handler(accepted)).unwrap();

        assert!(dispatcher.handler_for("repository", Some("created")).is_some());
        assert!(dispatcher.handler_for("REPOSITORY", Some("CREATED")).is_some());
        assert!(dispatcher.handler_for("repository", Some("deleted")).is_none());
        assert!(dispatcher.handler_for("repository", None).is_none());
        assert!(dispatcher.handler_for("team", Some("created")).is_none());
    }

    #[test]
    fn event_handler_covers_every_action() {
        let mut dispatcher = WebhookDispatcher::default();
        dispatcher.on_event("ping", handler(accepted));

        assert!(dispatcher.handler_for("ping", None).is_some());
        assert!(dispatcher.handler_for("ping", Some("whatever")).is_some());
    }

    #[test]
    fn action_on_a_fully_handled_event_is_rejected() {
        let mut dispatcher = WebhookDispatcher::default();
        dispatcher.on_event("fork", handler(accepted));

        let error = dispatcher.on_action("fork", "created", handler(accepted)).err().unwrap();
        assert_eq!(
            error,
            RegistrationError::EventAlreadyHandled {
                event: "fork".to_owned(),
                action: "created".to_owned(),
            }
        );
    }

    #[test]
    fn event_handler_replaces_action_handlers() {
        let mut dispatcher = WebhookDispatcher::default();
        dispatcher.on_action("team", "created", handler(accepted)).unwrap();
        dispatcher.on_event("team", handler(accepted));

        assert!(dispatcher.handler_for("team", Some("deleted")).is_some());
    }
}
