#![allow(clippy::unwrap_used)]

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use expect_test::expect;
use ghe_policy_check::PolicyState;
use http_body_util::BodyExt as _;
use policy_store::{NewRepo, Visibility};
use serde_json::{Value, json};
use tower::ServiceExt as _;

fn config(api_token: Option<&str>) -> String {
    let mut config = json!({
        "GithubApiUrl": "http://127.0.0.1:1/api/v3",
        "GithubAdminTokens": ["admin"],
        "GithubOwnerToken": "owner",
        "GithubOwnerUser": "ghe-admin",
        "GithubWebhookKey": "secret"
    });

    if let Some(token) = api_token {
        config["ApiToken"] = json!(token);
    }

    config.to_string()
}

/// Two users, one organization owning two repositories, one team, one personal repository.
async fn seeded_state(api_token: Option<&str>) -> PolicyState {
    let (state, _rx) = PolicyState::mock(&config(api_token)).await.unwrap();
    let store = &state.store;

    let admin = store.user_from_github(1, "ghe-admin", None).await.unwrap();
    let alice = store.user_from_github(5, "alice", None).await.unwrap();

    let org = store.org_from_github(77, "acme", admin.id).await.unwrap();
    store.add_org_member(org.id, alice.id).await.unwrap();

    let team = store.team_from_github(900, "Core", "core", org.id).await.unwrap();
    store.add_team_member(team.id, alice.id).await.unwrap();

    let service = store
        .insert_repo(
            NewRepo::builder()
                .repo_name("acme/Service")
                .github_id(200)
                .owner_id(admin.id)
                .org_id(Some(org.id))
                .classification(Some("secret-data".to_owned()))
                .visibility(Visibility::Internal)
                .size(300)
                .build(),
        )
        .await
        .unwrap();

    store
        .insert_repo(
            NewRepo::builder()
                .repo_name("acme/docs")
                .github_id(201)
                .owner_id(admin.id)
                .org_id(Some(org.id))
                .visibility(Visibility::Public)
                .size(10)
                .build(),
        )
        .await
        .unwrap();

    store
        .insert_repo(
            NewRepo::builder()
                .repo_name("alice/service-fork")
                .github_id(100)
                .owner_id(alice.id)
                .fork_source_id(Some(service.id))
                .visibility(Visibility::Private)
                .size(150)
                .build(),
        )
        .await
        .unwrap();

    store.set_repo_collaborators(service.id, &[alice.id]).await.unwrap();
    store.add_team_repo(team.id, service.id).await.unwrap();

    state
}

async fn get(state: &PolicyState, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().uri(uri);

    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    let response = ghe_policy_check::make_http_service(state.clone())
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    (status, value)
}

fn names(listing: &Value, field: &str) -> Vec<String> {
    listing["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item[field].as_str().unwrap().to_owned())
        .collect()
}

#[tokio::test]
async fn health() {
    let state = seeded_state(Some("token")).await;

    // Health checks don't need the API token.
    let (status, body) = get(&state, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn repository_listing_envelope() {
    let state = seeded_state(None).await;

    let (status, body) = get(&state, "/api/v1/repos?ordering=github_id", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);
    assert_eq!(names(&body, "repo_name"), ["alice/service-fork", "acme/Service", "acme/docs"]);
}

#[tokio::test]
async fn repository_filters() {
    let state = seeded_state(None).await;

    let (_, body) = get(&state, "/api/v1/repos?repo_name__icontains=SERVICE&ordering=-size", None).await;
    assert_eq!(names(&body, "repo_name"), ["acme/Service", "alice/service-fork"]);

    let (_, body) = get(&state, "/api/v1/repos?size__gte=100&size__lte=200", None).await;
    assert_eq!(names(&body, "repo_name"), ["alice/service-fork"]);

    let (_, body) = get(&state, "/api/v1/repos?visibility=public", None).await;
    assert_eq!(names(&body, "repo_name"), ["acme/docs"]);

    let (_, body) = get(&state, "/api/v1/repos?owner__github_id=5", None).await;
    assert_eq!(names(&body, "repo_name"), ["alice/service-fork"]);

    let (_, body) = get(&state, "/api/v1/repos?classification=secret-data", None).await;
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn pagination_keeps_the_total_count() {
    let state = seeded_state(None).await;

    let (_, body) = get(&state, "/api/v1/repos?ordering=repo_name&limit=1&offset=1", None).await;

    assert_eq!(body["count"], 3);
    assert_eq!(names(&body, "repo_name"), ["acme/docs"]);
}

#[tokio::test]
async fn repository_detail_uses_local_ids() {
    let state = seeded_state(None).await;

    let repo = state.store.get_repo_by_github_id(200).await.unwrap().unwrap();
    let (status, body) = get(&state, &format!("/api/v1/repos/{}", repo.id), None).await;

    assert_eq!(status, StatusCode::OK);

    let mut body = body;
    for volatile in ["id", "owner", "org", "collaborators", "teams"] {
        assert!(body.get(volatile).is_some(), "{volatile} is missing");
        body.as_object_mut().unwrap().remove(volatile);
    }

    expect![[r#"
        {
          "classification": "secret-data",
          "description": null,
          "disabled": false,
          "fork_source": null,
          "github_id": 200,
          "html_url": null,
          "repo_name": "acme/Service",
          "size": 300,
          "visibility": "internal"
        }"#]]
    .assert_eq(&serde_json::to_string_pretty(&body).unwrap());

    let alice = state.store.get_user_by_username("alice").await.unwrap().unwrap();
    let (_, body) = get(&state, &format!("/api/v1/repos/{}", repo.id), None).await;
    assert_eq!(body["collaborators"], json!([alice.id]));
    assert_eq!(body["org"], json!(repo.org_id));
    assert_eq!(body["teams"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn fork_source_is_the_local_id() {
    let state = seeded_state(None).await;

    let source = state.store.get_repo_by_github_id(200).await.unwrap().unwrap();
    let fork = state.store.get_repo_by_github_id(100).await.unwrap().unwrap();

    let (_, body) = get(&state, &format!("/api/v1/repos?fork_source={}", source.id), None).await;
    assert_eq!(names(&body, "repo_name"), ["alice/service-fork"]);

    let (_, body) = get(&state, &format!("/api/v1/repos/{}", fork.id), None).await;
    assert_eq!(body["fork_source"], json!(source.id));
}

#[tokio::test]
async fn organizations_teams_and_users() {
    let state = seeded_state(None).await;

    let alice = state.store.get_user_by_username("alice").await.unwrap().unwrap();

    let (status, body) = get(&state, "/api/v1/orgs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body, "org_name"), ["acme"]);
    assert!(body["results"][0]["members"].as_array().unwrap().contains(&json!(alice.id)));

    let (_, body) = get(&state, "/api/v1/teams?team_slug=core", None).await;
    assert_eq!(names(&body, "team_name"), ["Core"]);
    assert_eq!(body["results"][0]["members"], json!([alice.id]));

    let (_, body) = get(&state, "/api/v1/users?ordering=-username", None).await;
    assert_eq!(names(&body, "username"), ["ghe-admin", "alice"]);

    let (status, body) = get(&state, &format!("/api/v1/users/{}", alice.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["github_id"], 5);
}

#[tokio::test]
async fn unknown_identifiers_are_not_found() {
    let state = seeded_state(None).await;

    for uri in [
        "/api/v1/repos/9999",
        "/api/v1/orgs/9999",
        "/api/v1/teams/9999",
        "/api/v1/users/9999",
    ] {
        let (status, _) = get(&state, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn invalid_query_is_a_bad_request() {
    let state = seeded_state(None).await;

    let (status, _) = get(&state, "/api/v1/repos?ordering=owner", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&state, "/api/v1/users?ordering=-password", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&state, "/api/v1/repos?visibility=secret", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn configured_token_is_required() {
    let state = seeded_state(Some("s3cr3t")).await;

    let (status, _) = get(&state, "/api/v1/repos", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&state, "/api/v1/repos", Some("guess")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = get(&state, "/api/v1/repos", Some("s3cr3t")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 3);
}

#[tokio::test]
async fn trailing_slashes_are_accepted() {
    let state = seeded_state(None).await;

    let repo = state.store.get_repo_by_github_id(200).await.unwrap().unwrap();
    let alice = state.store.get_user_by_username("alice").await.unwrap().unwrap();

    for collection in ["orgs", "repos", "teams", "users"] {
        for uri in [format!("/api/v1/{collection}"), format!("/api/v1/{collection}/")] {
            let (status, body) = get(&state, &uri, None).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert!(body["count"].as_u64().unwrap() > 0, "{uri}");
        }
    }

    let (status, body) = get(&state, "/api/v1/repos/?ordering=github_id&limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&body, "repo_name"), ["alice/service-fork"]);

    for uri in [format!("/api/v1/repos/{}", repo.id), format!("/api/v1/repos/{}/", repo.id)] {
        let (status, body) = get(&state, &uri, None).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body["repo_name"], "acme/Service");
    }

    let (status, body) = get(&state, &format!("/api/v1/users/{}/", alice.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");
}

#[tokio::test]
async fn token_comparison_needs_the_whole_token() {
    let state = seeded_state(Some("s3cr3t")).await;

    for guess in ["s3cr3", "s3cr3t-and-more", "S3CR3T"] {
        let (status, _) = get(&state, "/api/v1/repos/", Some(guess)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{guess:?}");
    }

    let (status, _) = get(&state, "/api/v1/repos/", Some(" s3cr3t ")).await;
    assert_eq!(status, StatusCode::OK);
}
