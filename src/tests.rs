//! Integration tests: the sync server on an ephemeral port, driven by devices.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use crate::channel::ApiClient;
use crate::config::Config;
use crate::db::{init_database, Repository};
use crate::errors::SessionError;
use crate::models::{now_ms, Character, Game, Role, Save};
use crate::session::{Mode, SessionManager, SessionState};
use crate::store::LocalStore;
use crate::sync::{DownloadFilter, SyncCount, SyncEngine};
use crate::{create_router, AppState};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("warn"))
        .with_test_writer()
        .try_init();
});

fn test_config(temp_dir: &TempDir, registered_users_limited: bool) -> Config {
    Config {
        db_path: temp_dir.path().join("server.sqlite"),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        log_level: "warn".to_string(),
        access_token_ttl: Duration::from_secs(600),
        refresh_token_ttl: Duration::from_secs(3600),
        registered_users_limited,
        password_hash_cost: 4,
        server_url: String::new(),
        store_path: temp_dir.path().join("device.sqlite"),
        request_timeout: Duration::from_secs(5),
        archive_grace: Duration::from_millis(50),
    }
}

async fn test_state(temp_dir: &TempDir, registered_users_limited: bool) -> AppState {
    let config = test_config(temp_dir, registered_users_limited);
    let pool = init_database(&config.db_path)
        .await
        .expect("Failed to init DB");
    AppState {
        repo: Arc::new(Repository::new(pool)),
        config: Arc::new(config),
    }
}

/// Test fixture for integration tests.
struct TestFixture {
    client: Client,
    base_url: String,
    temp_dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_limits(false).await
    }

    async fn with_limits(registered_users_limited: bool) -> Self {
        Lazy::force(&TRACING);
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let state = test_state(&temp_dir, registered_users_limited).await;
        let app = create_router(state);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");
        let base_url = format!("http://{}", addr);

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        TestFixture {
            client: Client::new(),
            base_url,
            temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A device with its own store, talking to this server.
    async fn device(&self, name: &str) -> Device {
        let path = self.temp_dir.path().join(format!("{}.sqlite", name));
        let store = LocalStore::open(&path).await.expect("Failed to open store");
        let channel =
            ApiClient::new(self.base_url.clone(), Duration::from_secs(5)).expect("client");
        let manager = Arc::new(SessionManager::new(channel));
        Device {
            engine: SyncEngine::new(store, manager.clone()),
            manager,
        }
    }

    /// Register over raw HTTP and return the `data` of the response.
    async fn register_raw(&self, username: &str) -> Value {
        let resp = self
            .client
            .post(self.url("/api/auth/register"))
            .json(&json!({
                "username": username,
                "email": format!("{}@example.com", username),
                "password": "hunter2"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        body["data"].clone()
    }
}

struct Device {
    engine: SyncEngine,
    manager: Arc<SessionManager>,
}

impl Device {
    fn store(&self) -> &LocalStore {
        self.engine.store()
    }

    async fn register(&self, username: &str) -> SessionState {
        let email = format!("{}@example.com", username);
        let (state, outcome) = self
            .manager
            .register(SessionState::default(), username, &email, "hunter2")
            .await
            .into_parts();
        outcome.expect("Failed to register");
        state
    }

    async fn login(&self, username: &str) -> SessionState {
        let (state, outcome) = self
            .manager
            .login(SessionState::default(), username, "hunter2")
            .await
            .into_parts();
        outcome.expect("Failed to login");
        state
    }
}

/// Let the millisecond clock move past anything written so far.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// A committed game with one character.
async fn seed_game(store: &LocalStore, name: &str) -> (Game, Character) {
    let mut game = Game::new(name);
    store.commit(&mut game).await.unwrap();
    let mut ch = Character::new(&game.meta.uuid, "Hero");
    store.commit(&mut ch).await.unwrap();
    (game, ch)
}

/// Force the next token check to go through the refresh endpoint.
fn expire_access(mut state: SessionState) -> SessionState {
    if let Some(tokens) = state.tokens.as_mut() {
        tokens.access_expires_at = 0;
    }
    state
}

#[tokio::test]
async fn test_health_check() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_router_rejects_missing_token() {
    let temp_dir = TempDir::new().unwrap();
    let app = create_router(test_state(&temp_dir, false).await);

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/sync/down?cutoffPoint=1970-01-01T00:00:00Z")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_access_token() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/api/auth/self"))
        .bearer_auth("a.1.not-a-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_register_validation_and_duplicates() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .post(fixture.url("/api/auth/register"))
        .json(&json!({"username": "ab", "email": "nope", "password": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let data = fixture.register_raw("Mallory").await;
    assert_eq!(data["user"]["username"], "mallory");
    assert_eq!(data["user"]["displayname"], "Mallory");
    assert_eq!(data["user"]["role"], "user");

    let resp = fixture
        .client
        .post(fixture.url("/api/auth/register"))
        .json(&json!({"username": "mallory", "email": "other@example.com", "password": "hunter2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Username is already taken");
}

#[tokio::test]
async fn test_login_and_connect() {
    let fixture = TestFixture::new().await;
    let first = fixture.device("first").await;
    first.register("alex").await;

    let second = fixture.device("second").await;
    let state = second.login("alex").await;
    assert!(state.is_online(true));

    let (state, outcome) = second.manager.connect(state).await.into_parts();
    let user = outcome.unwrap();
    assert_eq!(user.username, "alex");
    assert_eq!(state.role, Role::Normal);
    assert_eq!(state.profile.as_ref().map(|p| p.id), Some(user.id));

    let (state, outcome) = second
        .manager
        .login(SessionState::default(), "alex", "wrong-password")
        .await
        .into_parts();
    assert_eq!(
        outcome,
        Err(SessionError::Rejected("Invalid password".to_string()))
    );
    assert!(!state.is_bound());
    assert!(state.is_reachable());

    let (_, outcome) = second
        .manager
        .login(SessionState::default(), "nobody", "hunter2")
        .await
        .into_parts();
    assert_eq!(
        outcome,
        Err(SessionError::Rejected("User does not exist".to_string()))
    );
}

#[tokio::test]
async fn test_logout_ends_session_line() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    let state = device.register("alex").await;
    let access = state.tokens.as_ref().unwrap().access_token.clone();

    let (state, outcome) = device.manager.logout(state).await.into_parts();
    assert!(outcome.is_ok());
    assert!(state.tokens.is_none());
    assert!(state.profile.is_none());

    let resp = fixture
        .client
        .get(fixture.url("/api/auth/self"))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_refresh_reuse_kills_session() {
    let fixture = TestFixture::new().await;
    let data = fixture.register_raw("alex").await;
    let old_refresh = data["session"]["refreshToken"].as_str().unwrap().to_string();

    let resp = fixture
        .client
        .get(fixture.url("/api/auth/refresh"))
        .bearer_auth(&old_refresh)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let new_access = body["data"]["session"]["accessToken"].as_str().unwrap().to_string();
    let new_refresh = body["data"]["session"]["refreshToken"].as_str().unwrap().to_string();
    assert_ne!(new_refresh, old_refresh);

    let resp = fixture
        .client
        .get(fixture.url("/api/auth/self"))
        .bearer_auth(&new_access)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Presenting the rotated token again ends the session line
    let resp = fixture
        .client
        .get(fixture.url("/api/auth/refresh"))
        .bearer_auth(&old_refresh)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["message"],
        "Invalid refresh token. Either reused or invalidated."
    );

    let resp = fixture
        .client
        .get(fixture.url("/api/auth/self"))
        .bearer_auth(&new_access)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = fixture
        .client
        .get(fixture.url("/api/auth/refresh"))
        .bearer_auth(&new_refresh)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn test_single_flight_refresh_within_manager() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    let state = expire_access(device.register("alex").await);

    let (a, b) = tokio::join!(
        device.manager.ensure_fresh_access_token(state.clone()),
        device.manager.ensure_fresh_access_token(state.clone()),
    );
    let (state_a, access_a) = a.into_parts();
    let (_, access_b) = b.into_parts();
    let access_a = access_a.unwrap();
    assert_eq!(access_a, access_b.unwrap());

    // The session line survived: the rotated pair works against the server
    let (_, outcome) = device.manager.connect(state_a).await.into_parts();
    assert_eq!(outcome.unwrap().username, "alex");
}

#[tokio::test]
async fn test_concurrent_refresh_across_managers() {
    let fixture = TestFixture::new().await;
    let first = fixture.device("first").await;
    let second = fixture.device("second").await;
    let state = expire_access(first.register("alex").await);

    let (a, b) = tokio::join!(
        first.manager.ensure_fresh_access_token(state.clone()),
        second.manager.ensure_fresh_access_token(state.clone()),
    );
    let (state_a, outcome_a) = a.into_parts();
    let (state_b, outcome_b) = b.into_parts();

    assert_eq!(
        [outcome_a.is_ok(), outcome_b.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count(),
        1
    );

    let (winner, loser, loser_state) = if outcome_a.is_ok() {
        (state_a, outcome_b, state_b)
    } else {
        (state_b, outcome_a, state_a)
    };
    assert_eq!(loser, Err(SessionError::CouldNotLogin));
    assert!(loser_state.tokens.is_none());
    assert!(loser_state.profile.is_some());

    // The winner's fresh pair belongs to the dead session line too
    let (winner, outcome) = first.manager.connect(winner).await.into_parts();
    assert_eq!(outcome, Err(SessionError::CouldNotLogin));
    assert!(winner.tokens.is_none());
}

#[tokio::test]
async fn test_session_lines_listing_and_revocation() {
    let fixture = TestFixture::new().await;
    let laptop = fixture.device("laptop").await;
    let phone = fixture.device("phone").await;
    let laptop_state = laptop.register("alex").await;
    let phone_state = phone.login("alex").await;

    let (phone_state, outcome) = phone.manager.sessions(phone_state).await.into_parts();
    let sessions = outcome.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.iter().filter(|s| s.current).count(), 1);
    assert!(sessions.iter().all(|s| s.active_tokens == 1));
    let laptop_line = sessions.iter().find(|s| !s.current).unwrap().id;

    let (phone_state, outcome) = phone
        .manager
        .revoke_session(phone_state, laptop_line)
        .await
        .into_parts();
    assert!(outcome.is_ok());

    // The revoked line can no longer rotate its tokens
    let laptop_refresh = laptop_state.tokens.as_ref().unwrap().refresh_token.clone();
    let resp = fixture
        .client
        .get(fixture.url("/api/auth/refresh"))
        .bearer_auth(&laptop_refresh)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let (laptop_state, outcome) = laptop
        .manager
        .ensure_fresh_access_token(expire_access(laptop_state))
        .await
        .into_parts();
    assert_eq!(outcome, Err(SessionError::CouldNotLogin));
    assert!(laptop_state.tokens.is_none());

    // Another account's line is not ours to end
    let bob = fixture.register_raw("bob").await;
    let bob_line = bob["session"]["sessionId"].as_i64().unwrap();
    let (phone_state, outcome) = phone
        .manager
        .revoke_session(phone_state, bob_line)
        .await
        .into_parts();
    assert_eq!(
        outcome,
        Err(SessionError::Rejected("Session does not exist".to_string()))
    );
    assert!(phone_state.is_online(true));

    let resp = fixture
        .client
        .get(fixture.url("/api/auth/self"))
        .bearer_auth(bob["session"]["accessToken"].as_str().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let (_, outcome) = phone.manager.sessions(phone_state).await.into_parts();
    let sessions = outcome.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].current);
}

#[tokio::test]
async fn test_sync_requires_full_access() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    seed_game(device.store(), "Celeste").await;

    let run = device.engine.sync(SessionState::default(), 0).await;
    assert_eq!(run.report.uploaded.count, SyncCount::NotRun("not logged in".to_string()));
    assert_eq!(run.report.net_downloaded.as_i64(), -1);
    assert_eq!(device.store().last_commit().await.unwrap(), 0);

    let state = device.register("alex").await;
    let state = device.manager.set_mode(state, Mode::Offline);
    let run = device.engine.sync(state, 0).await;
    assert_eq!(run.report.uploaded.count, SyncCount::NotRun("offline mode".to_string()));
    assert_eq!(run.report.downloaded.count.ran(), None);

    let limited = TestFixture::with_limits(true).await;
    let device = limited.device("device").await;
    let state = device.register("alex").await;
    assert_eq!(state.role, Role::Restricted);
    let run = device.engine.sync_up(state, 0).await;
    assert_eq!(
        run.report.count,
        SyncCount::NotRun("account is restricted".to_string())
    );

    // The server refuses uploads from restricted accounts regardless
    let data = limited.register_raw("bob").await;
    let access = data["session"]["accessToken"].as_str().unwrap().to_string();
    let resp = limited
        .client
        .post(limited.url("/api/sync/up"))
        .bearer_auth(&access)
        .json(&json!({"games": [], "chars": [], "saves": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = limited
        .client
        .get(limited.url("/api/sync/down?cutoffPoint=1970-01-01T00:00:00Z"))
        .bearer_auth(&access)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_empty_upload_skips_network() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    let state = device.register("alex").await;

    let run = device.engine.sync_up(state, 0).await;
    assert_eq!(run.report.count, SyncCount::Ran(0));
    assert!(run.report.server_errors.is_empty());
}

#[tokio::test]
async fn test_reupload_is_idempotent() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    let state = device.register("alex").await;
    seed_game(device.store(), "Celeste").await;

    let run = device.engine.sync_up(state, 0).await;
    assert_eq!(run.report.count, SyncCount::Ran(2));
    let run = device.engine.sync_up(run.state, 0).await;
    assert_eq!(run.report.count, SyncCount::Ran(2));

    let other = fixture.device("other").await;
    let state = other.login("alex").await;
    let run = other
        .engine
        .sync_down(state, 0, DownloadFilter::default())
        .await;
    assert_eq!(run.report.count, SyncCount::Ran(2));
    assert_eq!(other.store().list::<Game>().await.unwrap().len(), 1);
    assert_eq!(other.store().list::<Character>().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_cutoff_filters_records() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    let state = device.register("alex").await;
    let (game, ch) = seed_game(device.store(), "Celeste").await;

    tick().await;
    let cutoff = now_ms();
    tick().await;

    let mut save = Save::from_payload(&game.meta.uuid, &ch.meta.uuid, "payload");
    device.store().commit(&mut save).await.unwrap();

    let run = device.engine.sync_up(state, cutoff).await;
    assert_eq!(run.report.count, SyncCount::Ran(1));
}

#[tokio::test]
async fn test_three_saves_one_rejected_by_server() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    let state = device.register("alex").await;
    let (game, ch) = seed_game(device.store(), "Celeste").await;
    let run = device.engine.sync(state, 0).await;
    let state = run.state;

    tick().await;
    let cutoff = now_ms();
    tick().await;

    let too_long = "x".repeat(101);
    for name in ["First", "Second", too_long.as_str()] {
        let mut save = Save::from_payload(&game.meta.uuid, &ch.meta.uuid, "payload");
        save.name = name.to_string();
        device.store().commit(&mut save).await.unwrap();
    }

    let run = device.engine.sync_up(state, cutoff).await;
    assert_eq!(run.report.server_errors.len(), 1);
    assert_eq!(run.report.count, SyncCount::Ran(2));
    assert!(run.report.dropped.is_empty());
    assert_eq!(run.report.server_errors[0]["collection"], "saves");
}

#[tokio::test]
async fn test_structurally_invalid_record_is_dropped_locally() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    let state = device.register("alex").await;
    let (game, _) = seed_game(device.store(), "Celeste").await;

    let mut broken = Character::new(&game.meta.uuid, "Broken");
    broken.meta.uuid = "not-a-uuid".to_string();
    device.store().commit(&mut broken).await.unwrap();

    let run = device.engine.sync_up(state, 0).await;
    assert_eq!(run.report.count, SyncCount::Ran(2));
    assert_eq!(run.report.dropped.len(), 1);
    assert_eq!(run.report.dropped[0].uuid, "not-a-uuid");
}

#[tokio::test]
async fn test_full_download_and_archive_filter() {
    let fixture = TestFixture::new().await;
    let writer = fixture.device("writer").await;
    let state = writer.register("alex").await;

    let mut kept = Game::new("Celeste");
    writer.store().commit(&mut kept).await.unwrap();
    let mut archived = Game::new("Braid");
    archived.meta.archive(now_ms());
    writer.store().commit(&mut archived).await.unwrap();
    let run = writer.engine.sync_up(state, 0).await;
    assert_eq!(run.report.count, SyncCount::Ran(2));
    let state = run.state;

    let reader = fixture.device("reader").await;
    let reader_state = reader.login("alex").await;
    let all = DownloadFilter {
        exclude_archived: false,
        ..DownloadFilter::default()
    };
    let run = reader.engine.sync_down(reader_state, 0, all).await;
    assert_eq!(run.report.count, SyncCount::Ran(2));
    let reader_state = run.state;

    let run = reader
        .engine
        .sync_down(reader_state, 0, DownloadFilter::default())
        .await;
    assert_eq!(run.report.count, SyncCount::Ran(1));
    let reader_state = run.state;

    tick().await;
    let cutoff = now_ms();
    tick().await;
    kept.name = "Celeste Classic".to_string();
    writer.store().commit(&mut kept).await.unwrap();
    let run = writer.engine.sync_up(state, cutoff).await;
    assert_eq!(run.report.count, SyncCount::Ran(1));

    let run = reader.engine.sync_down(reader_state, cutoff, all).await;
    assert_eq!(run.report.count, SyncCount::Ran(1));
    let local: Game = reader
        .store()
        .find_by_uuid(&kept.meta.uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.name, "Celeste Classic");
    assert!(local.meta.remote_id.is_some());

    let tombstone: Game = reader
        .store()
        .find_by_uuid(&archived.meta.uuid)
        .await
        .unwrap()
        .unwrap();
    assert!(tombstone.meta.archived);
    assert!(tombstone.meta.archived_at > 0);
}

#[tokio::test]
async fn test_downloaded_records_are_not_reuploaded() {
    let fixture = TestFixture::new().await;
    let writer = fixture.device("writer").await;
    let state = writer.register("alex").await;
    seed_game(writer.store(), "Celeste").await;
    let run = writer.engine.sync_since_last_commit(state).await;
    assert_eq!(run.report.uploaded.count, SyncCount::Ran(2));

    tick().await;
    let reader = fixture.device("reader").await;
    let state = reader.login("alex").await;
    let run = reader.engine.sync_since_last_commit(state).await;
    assert_eq!(run.report.uploaded.count, SyncCount::Ran(0));
    assert_eq!(run.report.downloaded.count, SyncCount::Ran(2));
    assert_eq!(run.report.net_downloaded, SyncCount::Ran(2));
    assert_eq!(
        reader.store().last_commit().await.unwrap(),
        run.report.started_at_ms
    );

    tick().await;
    let run = reader.engine.sync_since_last_commit(run.state).await;
    assert_eq!(run.report.uploaded.count, SyncCount::Ran(0));
    assert_eq!(run.report.downloaded.count, SyncCount::Ran(0));
}

#[tokio::test]
async fn test_incremental_sync_net_count() {
    let fixture = TestFixture::new().await;
    let writer = fixture.device("writer").await;
    let writer_state = writer.register("alex").await;
    let (mut game, _) = seed_game(writer.store(), "Celeste").await;
    let run = writer.engine.sync_since_last_commit(writer_state).await;
    let writer_state = run.state;

    tick().await;
    let reader = fixture.device("reader").await;
    let reader_state = reader.login("alex").await;
    let run = reader.engine.sync_since_last_commit(reader_state).await;
    let reader_state = run.state;
    tick().await;

    // One remote change, one local change
    game.name = "Celeste Classic".to_string();
    writer.store().commit(&mut game).await.unwrap();
    let run = writer.engine.sync_since_last_commit(writer_state).await;
    assert_eq!(run.report.uploaded.count, SyncCount::Ran(1));

    let mut ch = Character::new(&game.meta.uuid, "Madeline");
    reader.store().commit(&mut ch).await.unwrap();

    let run = reader.engine.sync_since_last_commit(reader_state).await;
    assert_eq!(run.report.uploaded.count, SyncCount::Ran(1));
    // The local character comes back down alongside the remote game change
    assert_eq!(run.report.downloaded.count, SyncCount::Ran(2));
    assert_eq!(run.report.net_downloaded, SyncCount::Ran(1));
}

#[tokio::test]
async fn test_unreachable_server_reports_not_run() {
    let fixture = TestFixture::new().await;
    let device = fixture.device("device").await;
    let state = device.register("alex").await;
    seed_game(device.store(), "Celeste").await;

    let channel = ApiClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
    let engine = SyncEngine::new(
        device.store().clone(),
        Arc::new(SessionManager::new(channel)),
    );

    let run = engine.sync(state, 0).await;
    assert_eq!(run.report.uploaded.count.ran(), None);
    assert_eq!(run.report.downloaded.count.ran(), None);
    assert!(!run.state.is_reachable());
    assert!(run.state.tokens.is_some());
    assert_eq!(engine.store().last_commit().await.unwrap(), 0);
}
