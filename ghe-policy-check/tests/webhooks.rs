#![allow(clippy::unwrap_used)]

use axum::body::Body;
use axum::http::{self, Request, StatusCode};
use ghe_policy_check::PolicyState;
use ghe_policy_check::job_queue::{JobMessage, JobQueueReceiver};
use github_api::signature::sign_sha1;
use http_body_util::BodyExt as _;
use mockito::{Matcher, Server};
use serde_json::json;
use tower::ServiceExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const WEBHOOK_KEY: &str = "webhook-secret";

fn init_logger() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .set_default()
}

fn config(api_url: &str) -> String {
    json!({
        "GithubApiUrl": api_url,
        "GithubAdminTokens": ["admin"],
        "GithubOwnerToken": "owner",
        "GithubOwnerUser": "ghe-admin",
        "GithubWebhookKey": WEBHOOK_KEY,
        "Classifications": [["Public", "public-data"], ["Secret", "secret-data"]]
    })
    .to_string()
}

async fn offline_state() -> (PolicyState, JobQueueReceiver) {
    PolicyState::mock(&config("http://127.0.0.1:1/api/v3")).await.unwrap()
}

fn delivery(event: &str, payload: &serde_json::Value) -> Request<Body> {
    let body = serde_json::to_vec(payload).unwrap();

    Request::builder()
        .method(http::Method::POST)
        .uri("/webhooks/")
        .header("X-GitHub-Event", event)
        .header("X-Hub-Signature", sign_sha1(WEBHOOK_KEY.as_bytes(), &body))
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}

async fn send(state: &PolicyState, request: Request<Body>) -> (StatusCode, String) {
    let response = ghe_policy_check::make_http_service(state.clone())
        .oneshot(request)
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();

    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn repository(id: i64, full_name: &str, owner_id: i64, owner_type: &str) -> serde_json::Value {
    let (owner, name) = full_name.split_once('/').unwrap();

    json!({
        "id": id,
        "name": name,
        "full_name": full_name,
        "owner": { "login": owner, "id": owner_id, "type": owner_type },
        "private": true,
        "visibility": "internal",
        "html_url": format!("https://github.example.com/{full_name}"),
        "size": 42,
        "topics": ["rust", "secret-data"]
    })
}

fn next_job(rx: &mut JobQueueReceiver) -> JobMessage {
    rx.try_recv().unwrap()
}

#[tokio::test]
async fn missing_signature_is_forbidden() {
    let _guard = init_logger();
    let (state, _rx) = offline_state().await;

    let request = Request::builder()
        .method(http::Method::POST)
        .uri("/webhooks/")
        .header("X-GitHub-Event", "ping")
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Permission denied.");
}

#[tokio::test]
async fn wrong_signature_is_forbidden() {
    let _guard = init_logger();
    let (state, _rx) = offline_state().await;

    let request = Request::builder()
        .method(http::Method::POST)
        .uri("/webhooks")
        .header("X-GitHub-Event", "ping")
        .header("X-Hub-Signature", sign_sha1(b"another key", b"{}"))
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, "Permission denied.");
}

#[tokio::test]
async fn unsupported_algorithm_is_not_implemented() {
    let _guard = init_logger();
    let (state, _rx) = offline_state().await;

    let request = Request::builder()
        .method(http::Method::POST)
        .uri("/webhooks/")
        .header("X-GitHub-Event", "ping")
        .header("X-Hub-Signature", "sha256=abcdef")
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body, "Operation not supported.");
}

#[tokio::test]
async fn ping_is_acknowledged() {
    let _guard = init_logger();
    let (state, _rx) = offline_state().await;

    let (status, _) = send(&state, delivery("ping", &json!({ "zen": "Keep it logically awesome." }))).await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unhandled_deliveries_have_no_content() {
    let _guard = init_logger();
    let (state, mut rx) = offline_state().await;

    let (status, _) = send(&state, delivery("deployment", &json!({ "action": "created" }))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&state, delivery("repository", &json!({ "action": "starred" }))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Only action handlers are registered for repository events.
    let (status, _) = send(&state, delivery("repository", &json!({}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn missing_event_header_is_a_bad_request() {
    let _guard = init_logger();
    let (state, _rx) = offline_state().await;

    let request = Request::builder()
        .method(http::Method::POST)
        .uri("/webhooks/")
        .header("X-Hub-Signature", sign_sha1(WEBHOOK_KEY.as_bytes(), b"{}"))
        .body(Body::from("{}"))
        .unwrap();

    let (status, _) = send(&state, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn user_repository_created() {
    let _guard = init_logger();
    let (state, mut rx) = offline_state().await;

    let payload = json!({
        "action": "created",
        "repository": repository(100, "alice/tool", 5, "User"),
    });

    let (status, _) = send(&state, delivery("repository", &payload)).await;
    assert_eq!(status, StatusCode::OK);

    let repo = state.store.get_repo_by_github_id(100).await.unwrap().unwrap();
    assert_eq!(repo.repo_name, "alice/tool");
    assert_eq!(repo.classification.as_deref(), Some("secret-data"));
    assert_eq!(repo.visibility.as_str(), "internal");
    assert_eq!(repo.size, 42);
    assert_eq!(repo.org_id, None);

    let owner = state.store.get_user(repo.owner_id).await.unwrap().unwrap();
    assert_eq!(owner.username, "alice");
    assert_eq!(owner.github_id, 5);

    let job = next_job(&mut rx);
    assert_eq!(job.job_name, "sync-repo-collaborators");
    assert!(job.job_def.contains(r#""github_id":100"#));
}

#[tokio::test]
async fn organization_repository_created() {
    let _guard = init_logger();
    let mut server = Server::new_async().await;

    let admins = server
        .mock("GET", "/orgs/acme/members")
        .match_query(Matcher::UrlEncoded("role".to_owned(), "admin".to_owned()))
        .match_header("authorization", "Bearer owner")
        .with_body(
            json!([
                { "login": "ghe-admin", "id": 1 },
                { "login": "bob", "id": 2 }
            ])
            .to_string(),
        )
        .create_async()
        .await;

    let (state, mut rx) = PolicyState::mock(&config(&server.url())).await.unwrap();

    let payload = json!({
        "action": "created",
        "repository": repository(200, "acme/service", 77, "Organization"),
    });

    let (status, _) = send(&state, delivery("repository", &payload)).await;
    assert_eq!(status, StatusCode::OK);

    let repo = state.store.get_repo_by_github_id(200).await.unwrap().unwrap();
    let org = state.store.get_org(repo.org_id.unwrap()).await.unwrap().unwrap();
    let owner = state.store.get_user(repo.owner_id).await.unwrap().unwrap();

    assert_eq!(org.org_name, "acme");
    assert_eq!(org.github_id, 77);
    assert_eq!(owner.username, "bob");

    assert_eq!(next_job(&mut rx).job_name, "sync-repo-collaborators");
    admins.assert_async().await;
}

#[tokio::test]
async fn repository_deleted_is_deferred_to_a_job() {
    let _guard = init_logger();
    let (state, mut rx) = offline_state().await;

    let payload = json!({
        "action": "deleted",
        "repository": repository(300, "alice/old", 5, "User"),
    });

    let (status, _) = send(&state, delivery("repository", &payload)).await;
    assert_eq!(status, StatusCode::OK);

    let job = next_job(&mut rx);
    assert_eq!(job.job_name, "delete-repository");
    assert_eq!(job.job_def, r#"{"github_id":300}"#);
}

#[tokio::test]
async fn malformed_payload_is_a_bad_request() {
    let _guard = init_logger();
    let (state, mut rx) = offline_state().await;

    let (status, _) = send(&state, delivery("repository", &json!({ "action": "deleted" }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn membership_removed_drops_the_member_and_resyncs_team_repositories() {
    let _guard = init_logger();
    let (state, mut rx) = offline_state().await;
    let store = &state.store;

    let owner = store.user_from_github(1, "ghe-admin", None).await.unwrap();
    let alice = store.user_from_github(5, "alice", None).await.unwrap();
    let org = store.org_from_github(77, "acme", owner.id).await.unwrap();
    let team = store.team_from_github(900, "Core", "core", org.id).await.unwrap();

    let repo = store
        .insert_repo(
            policy_store::NewRepo::builder()
                .repo_name("acme/service")
                .github_id(200)
                .owner_id(owner.id)
                .org_id(Some(org.id))
                .build(),
        )
        .await
        .unwrap();

    store.add_team_member(team.id, alice.id).await.unwrap();
    store.add_team_repo(team.id, repo.id).await.unwrap();

    let payload = json!({
        "action": "removed",
        "member": { "login": "alice", "id": 5 },
        "team": { "id": 900, "name": "Core", "slug": "core" },
        "organization": { "login": "acme", "id": 77 }
    });

    let (status, _) = send(&state, delivery("membership", &payload)).await;
    assert_eq!(status, StatusCode::OK);

    assert!(store.team_members(team.id).await.unwrap().is_empty());

    let job = next_job(&mut rx);
    assert_eq!(job.job_name, "sync-repo-collaborators");
    assert!(job.job_def.contains(r#""github_id":200"#));
}

#[tokio::test]
async fn team_lifecycle() {
    let _guard = init_logger();
    let (state, _rx) = offline_state().await;
    let store = &state.store;

    let owner = store.user_from_github(1, "ghe-admin", None).await.unwrap();
    store.org_from_github(77, "acme", owner.id).await.unwrap();

    let organization = json!({ "login": "acme", "id": 77 });

    let created = json!({
        "action": "created",
        "team": { "id": 900, "name": "Core", "slug": "core" },
        "organization": organization,
    });
    assert_eq!(send(&state, delivery("team", &created)).await.0, StatusCode::OK);

    let team = store.get_team_by_github_id(900).await.unwrap().unwrap();
    assert_eq!(team.team_slug, "core");

    let edited = json!({
        "action": "edited",
        "team": { "id": 900, "name": "Platform", "slug": "platform" },
        "organization": organization,
    });
    assert_eq!(send(&state, delivery("team", &edited)).await.0, StatusCode::OK);

    let team = store.get_team_by_github_id(900).await.unwrap().unwrap();
    assert_eq!(team.team_name, "Platform");
    assert_eq!(team.team_slug, "platform");

    let deleted = json!({
        "action": "deleted",
        "team": { "id": 900, "name": "Platform", "slug": "platform" },
        "organization": organization,
    });
    assert_eq!(send(&state, delivery("team", &deleted)).await.0, StatusCode::OK);

    assert!(store.get_team_by_github_id(900).await.unwrap().is_none());
}

#[tokio::test]
async fn fork_points_to_its_source() {
    let _guard = init_logger();
    let (state, mut rx) = offline_state().await;
    let store = &state.store;

    let alice = store.user_from_github(5, "alice", None).await.unwrap();
    let source = store
        .insert_repo(
            policy_store::NewRepo::builder()
                .repo_name("alice/tool")
                .github_id(100)
                .owner_id(alice.id)
                .build(),
        )
        .await
        .unwrap();

    let payload = json!({
        "forkee": repository(101, "carol/tool", 6, "User"),
        "repository": repository(100, "alice/tool", 5, "User"),
    });

    let (status, _) = send(&state, delivery("fork", &payload)).await;
    assert_eq!(status, StatusCode::OK);

    let fork = store.get_repo_by_github_id(101).await.unwrap().unwrap();
    assert_eq!(fork.fork_source_id, Some(source.id));

    assert_eq!(next_job(&mut rx).job_name, "sync-repo-collaborators");
}

#[tokio::test]
async fn custom_dispatcher_replaces_the_defaults() {
    use axum::response::IntoResponse as _;
    use ghe_policy_check::webhook::{WebhookDispatcher, handler};

    let _guard = init_logger();
    let (state, _rx) = offline_state().await;

    let mut dispatcher = WebhookDispatcher::default();
    dispatcher.on_event(
        "push",
        handler(|_, event| async move { Ok((StatusCode::ACCEPTED, event.payload["ref"].to_string()).into_response()) }),
    );

    let state = state.with_webhooks(dispatcher);

    let (status, body) = send(&state, delivery("push", &json!({ "ref": "refs/heads/main" }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, r#""refs/heads/main""#);

    // The default handlers are gone.
    let (status, _) = send(&state, delivery("ping", &json!({ "zen": "Keep it simple." }))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}
