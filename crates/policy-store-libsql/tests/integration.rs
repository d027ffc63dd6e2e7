#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

//! Integration tests for the libSQL policy store.

use policy_store::{
    NewRepo, OrgFilter, Page, PolicyStore, RepoFilter, RepoOrderField, TeamFilter, User, UserFilter, Visibility,
};
use policy_store_libsql::LibSqlPolicyStore;
use time::OffsetDateTime;
use time::macros::datetime;

/// Opens a new store instance with migrations applied.
async fn open_store(path: &str) -> LibSqlPolicyStore {
    let store = LibSqlPolicyStore::open(path).await.expect("open store");
    store.setup().await.expect("setup store");
    store
}

async fn user(store: &LibSqlPolicyStore, github_id: i64, login: &str) -> User {
    store.user_from_github(github_id, login, None).await.expect("create user")
}

async fn repo(store: &LibSqlPolicyStore, github_id: i64, name: &str, owner: &User) -> policy_store::Repo {
    store
        .insert_repo(
            NewRepo::builder()
                .repo_name(format!("{}/{name}", owner.username))
                .github_id(github_id)
                .owner_id(owner.id)
                .build(),
        )
        .await
        .expect("insert repo")
}

#[tokio::test]
async fn setup_is_idempotent() {
    let tmp_dir = tempfile::TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("policy.db");
    let db_path = db_path.to_str().unwrap();

    let store = open_store(db_path).await;
    user(&store, 1, "alice").await;
    drop(store);

    // Reopening must not re-run the migrations on existing data.
    let store = open_store(db_path).await;
    assert_eq!(store.count_users().await.unwrap(), 1);
}

#[tokio::test]
async fn user_from_github_relinks_known_logins() {
    let store = open_store(":memory:").await;

    let alice = user(&store, 1, "alice").await;
    assert_eq!(alice.username, "alice");
    assert_eq!(alice.github_id, 1);

    // Same GitHub id: the existing record is returned untouched.
    let again = store.user_from_github(1, "renamed", None).await.unwrap();
    assert_eq!(again.id, alice.id);
    assert_eq!(again.username, "alice");

    // Same login, new GitHub id: the record is re-linked.
    let suspended_at = datetime!(2024-01-02 3:04:05 UTC);
    let relinked = store.user_from_github(2, "alice", Some(suspended_at)).await.unwrap();
    assert_eq!(relinked.id, alice.id);
    assert_eq!(relinked.github_id, 2);
    assert_eq!(relinked.suspended_at, Some(suspended_at));

    assert_eq!(store.count_users().await.unwrap(), 1);
}

#[tokio::test]
async fn users_are_polled_least_recently_synced_first() {
    let store = open_store(":memory:").await;

    let mut a = user(&store, 1, "a").await;
    let b = user(&store, 2, "b").await;
    let mut c = user(&store, 3, "c").await;

    a.last_synced = Some(datetime!(2024-01-02 0:00 UTC));
    store.save_user(&a).await.unwrap();
    c.last_synced = Some(datetime!(2024-01-01 0:00 UTC));
    store.save_user(&c).await.unwrap();

    let polled: Vec<_> = store
        .polling_users(10)
        .await
        .unwrap()
        .into_iter()
        .map(|user| user.username)
        .collect();

    assert_eq!(polled, ["b", "c", "a"]);

    let first = store.polling_users(1).await.unwrap();
    assert_eq!(first[0].id, b.id);
}

#[tokio::test]
async fn repos_round_trip() {
    let store = open_store(":memory:").await;
    let owner = user(&store, 1, "octo").await;

    let inserted = store
        .insert_repo(
            NewRepo::builder()
                .repo_name("octo/hello")
                .github_id(100)
                .owner_id(owner.id)
                .description(Some("Hello".to_owned()))
                .visibility(Visibility::Internal)
                .html_url(Some("https://ghe.example/octo/hello".to_owned()))
                .size(42)
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(inserted.classification, None);
    assert_eq!(inserted.classification_modified, inserted.created);
    assert!(!inserted.disabled);

    let mut repo = store.get_repo_by_github_id(100).await.unwrap().unwrap();
    assert_eq!(repo, inserted);

    let now = OffsetDateTime::now_utc();
    assert!(repo.set_classification(Some("secret".to_owned()), now));
    repo.disabled = true;
    repo.last_polling_check = Some(now);
    store.save_repo(&repo).await.unwrap();

    let stored = store.get_repo_by_name("octo/hello").await.unwrap().unwrap();
    assert_eq!(stored.classification.as_deref(), Some("secret"));
    assert!(stored.disabled);
    assert_eq!(stored.visibility, Visibility::Internal);
    assert_eq!(
        stored.last_polling_check.map(|t| t.unix_timestamp()),
        Some(now.unix_timestamp())
    );
}

#[tokio::test]
async fn duplicate_repo_names_are_rejected() {
    let store = open_store(":memory:").await;
    let owner = user(&store, 1, "octo").await;

    repo(&store, 1, "dup", &owner).await;

    let result = store
        .insert_repo(
            NewRepo::builder()
                .repo_name("octo/dup")
                .github_id(2)
                .owner_id(owner.id)
                .build(),
        )
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn polling_repos_come_never_checked_first() {
    let store = open_store(":memory:").await;
    let owner = user(&store, 1, "octo").await;

    let mut old = repo(&store, 1, "old", &owner).await;
    let never = repo(&store, 2, "never", &owner).await;
    let mut recent = repo(&store, 3, "recent", &owner).await;

    old.last_polling_check = Some(datetime!(2024-01-01 0:00 UTC));
    store.save_repo(&old).await.unwrap();
    recent.last_polling_check = Some(datetime!(2024-06-01 0:00 UTC));
    store.save_repo(&recent).await.unwrap();

    let ids: Vec<_> = store
        .polling_repos(2)
        .await
        .unwrap()
        .into_iter()
        .map(|repo| repo.id)
        .collect();

    assert_eq!(ids, [never.id, old.id]);
    assert_eq!(store.count_repos().await.unwrap(), 3);
}

#[tokio::test]
async fn deleting_an_owner_cascades() {
    let store = open_store(":memory:").await;
    let owner = user(&store, 1, "octo").await;
    let other = user(&store, 2, "other").await;

    let source = repo(&store, 1, "source", &owner).await;

    let fork = store
        .insert_repo(
            NewRepo::builder()
                .repo_name("other/source")
                .github_id(2)
                .owner_id(other.id)
                .fork_source_id(Some(source.id))
                .build(),
        )
        .await
        .unwrap();

    store.delete_user(owner.id).await.unwrap();

    assert!(store.get_repo(source.id).await.unwrap().is_none());

    // The fork survives, only the link to its source goes away.
    let fork = store.get_repo(fork.id).await.unwrap().unwrap();
    assert_eq!(fork.fork_source_id, None);
}

#[tokio::test]
async fn collaborators_are_replaced() {
    let store = open_store(":memory:").await;
    let owner = user(&store, 1, "octo").await;
    let a = user(&store, 2, "a").await;
    let b = user(&store, 3, "b").await;
    let c = user(&store, 4, "c").await;
    let repo = repo(&store, 1, "hello", &owner).await;

    store.set_repo_collaborators(repo.id, &[a.id, b.id]).await.unwrap();
    store.set_repo_collaborators(repo.id, &[b.id, c.id]).await.unwrap();

    let collaborators: Vec<_> = store
        .repo_collaborators(repo.id)
        .await
        .unwrap()
        .into_iter()
        .map(|user| user.username)
        .collect();
    assert_eq!(collaborators, ["b", "c"]);

    store.remove_repo_collaborator(repo.id, b.id).await.unwrap();
    store.add_repo_collaborator(repo.id, a.id).await.unwrap();
    store.add_repo_collaborator(repo.id, a.id).await.unwrap();

    let ids: Vec<_> = store
        .repo_collaborators(repo.id)
        .await
        .unwrap()
        .into_iter()
        .map(|user| user.id)
        .collect();
    assert_eq!(ids, [a.id, c.id]);

    store.set_repo_collaborators(repo.id, &[]).await.unwrap();
    assert!(store.repo_collaborators(repo.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn users_are_looked_up_by_github_ids() {
    let store = open_store(":memory:").await;
    user(&store, 10, "a").await;
    user(&store, 20, "b").await;

    let users = store.users_by_github_ids(&[20, 30]).await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].username, "b");

    assert!(store.users_by_github_ids(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn huge_github_id_lists_are_looked_up_in_chunks() {
    let store = open_store(":memory:").await;
    let first = user(&store, 3, "first").await;
    let last = user(&store, 1_199, "last").await;

    // More ids than SQLite accepts as bound variables in a single statement.
    let github_ids: Vec<i64> = (0..1_200).collect();

    let users = store.users_by_github_ids(&github_ids).await.unwrap();
    let ids: Vec<i64> = users.iter().map(|user| user.id).collect();

    assert_eq!(ids, [first.id, last.id]);
}

#[tokio::test]
async fn orgs_and_teams() {
    let store = open_store(":memory:").await;
    let owner = user(&store, 1, "boss").await;
    let member = user(&store, 2, "dev").await;

    let org = store.org_from_github(500, "acme", owner.id).await.unwrap();
    assert_eq!(store.org_from_github(500, "ignored", member.id).await.unwrap(), org);

    store.add_org_member(org.id, member.id).await.unwrap();
    assert_eq!(store.org_members(org.id).await.unwrap()[0].id, member.id);

    let team = store.team_from_github(900, "Core", "core", org.id).await.unwrap();
    store.add_team_member(team.id, member.id).await.unwrap();

    let repo = store
        .insert_repo(
            NewRepo::builder()
                .repo_name("acme/tool")
                .github_id(1)
                .owner_id(owner.id)
                .org_id(Some(org.id))
                .build(),
        )
        .await
        .unwrap();

    store.add_team_repo(team.id, repo.id).await.unwrap();

    assert_eq!(store.team_repos(team.id).await.unwrap()[0].id, repo.id);
    assert_eq!(store.repo_teams(repo.id).await.unwrap()[0].id, team.id);
    assert_eq!(store.org_repos(org.id).await.unwrap()[0].id, repo.id);

    let listing = store
        .list_orgs(
            &OrgFilter {
                owner_github_id: Some(1),
                ..OrgFilter::default()
            },
            Page::ALL,
        )
        .await
        .unwrap();
    assert_eq!(listing.count, 1);

    let listing = store
        .list_teams(
            &TeamFilter {
                team_slug: Some("core".to_owned()),
                ..TeamFilter::default()
            },
            Page::ALL,
        )
        .await
        .unwrap();
    assert_eq!(listing.results[0].team_name, "Core");

    // Deleting the organization takes its teams and repositories along.
    store.delete_org(org.id).await.unwrap();
    assert!(store.get_team(team.id).await.unwrap().is_none());
    assert!(store.get_repo(repo.id).await.unwrap().is_none());
    assert!(store.get_user(member.id).await.unwrap().is_some());
}

#[tokio::test]
async fn repo_listing_filters_orders_and_pages() {
    let store = open_store(":memory:").await;
    let octo = user(&store, 1, "octo").await;
    let other = user(&store, 2, "other").await;

    for (github_id, name, size) in [(1, "Alpha", 10), (2, "beta", 20), (3, "gamma_ray", 30)] {
        store
            .insert_repo(
                NewRepo::builder()
                    .repo_name(format!("octo/{name}"))
                    .github_id(github_id)
                    .owner_id(octo.id)
                    .size(size)
                    .build(),
            )
            .await
            .unwrap();
    }

    repo(&store, 4, "alphabet", &other).await;

    let listing = store
        .list_repos(
            &RepoFilter {
                repo_name_icontains: Some("ALPHA".to_owned()),
                ..RepoFilter::default()
            },
            Page::ALL,
        )
        .await
        .unwrap();
    assert_eq!(listing.count, 2);

    // `_` is not a wildcard.
    let listing = store
        .list_repos(
            &RepoFilter {
                repo_name_icontains: Some("a_r".to_owned()),
                ..RepoFilter::default()
            },
            Page::ALL,
        )
        .await
        .unwrap();
    assert_eq!(listing.count, 1);

    let listing = store
        .list_repos(
            &RepoFilter {
                owner_github_id: Some(1),
                size_gte: Some(15),
                ordering: Some("-size".parse().unwrap()),
                ..RepoFilter::default()
            },
            Page::ALL,
        )
        .await
        .unwrap();
    let names: Vec<_> = listing.results.iter().map(|repo| repo.repo_name.as_str()).collect();
    assert_eq!(names, ["octo/gamma_ray", "octo/beta"]);

    let listing = store
        .list_repos(
            &RepoFilter {
                ordering: Some(policy_store::Ordering {
                    field: RepoOrderField::RepoName,
                    descending: false,
                }),
                ..RepoFilter::default()
            },
            Page {
                limit: Some(2),
                offset: Some(1),
            },
        )
        .await
        .unwrap();
    assert_eq!(listing.count, 4);
    let names: Vec<_> = listing.results.iter().map(|repo| repo.repo_name.as_str()).collect();
    assert_eq!(names, ["octo/beta", "octo/gamma_ray"]);
}

#[tokio::test]
async fn user_listing_filters() {
    let store = open_store(":memory:").await;
    let mut a = user(&store, 1, "a").await;
    user(&store, 2, "b").await;

    a.email = Some("a@example.com".to_owned());
    store.save_user(&a).await.unwrap();

    let listing = store
        .list_users(
            &UserFilter {
                email: Some("a@example.com".to_owned()),
                ..UserFilter::default()
            },
            Page::ALL,
        )
        .await
        .unwrap();

    assert_eq!(listing.count, 1);
    assert_eq!(listing.results[0].id, a.id);
}

#[tokio::test]
async fn repos_created_since_are_ordered() {
    let store = open_store(":memory:").await;
    let owner = user(&store, 1, "octo").await;

    let first = repo(&store, 1, "first", &owner).await;
    let second = repo(&store, 2, "second", &owner).await;

    let all: Vec<_> = store
        .repos_created_since(None)
        .await
        .unwrap()
        .into_iter()
        .map(|repo| repo.id)
        .collect();
    assert_eq!(all, [first.id, second.id]);

    let recent = store.repos_created_since(Some(second.created)).await.unwrap();
    assert!(recent.iter().all(|repo| repo.created >= second.created));
    assert!(recent.iter().any(|repo| repo.id == second.id));

    let future = store
        .repos_created_since(Some(datetime!(2999-01-01 0:00 UTC)))
        .await
        .unwrap();
    assert!(future.is_empty());
}
