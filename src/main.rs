//! SugarBox command line
//!
//! `serve` runs the sync server; it is also what runs without a command.
//! The other commands act on the device store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sugarbox::archive::ArchiveCascade;
use sugarbox::channel::ApiClient;
use sugarbox::config::Config;
use sugarbox::db::{self, Repository};
use sugarbox::models::{Game, UserInfo};
use sugarbox::session::{self, SessionManager, SessionState, Transition};
use sugarbox::store::LocalStore;
use sugarbox::sync::SyncEngine;
use sugarbox::validation;
use sugarbox::{create_router, AppState};

type BoxError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(name = "sugarbox", about = "Offline-first save-game manager and sync server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync server
    Serve,
    /// Log this device in to an existing account
    Login { username: String, password: String },
    /// Create an account and log this device in
    Register {
        username: String,
        email: String,
        password: String,
    },
    /// Upload and download everything changed since the last sync
    Sync,
    /// Archive a game along with its characters and saves
    Archive {
        /// Uuid of the game
        game: String,
    },
    /// Check the device store for broken references
    Check {
        /// Fix what can be fixed and delete orphans
        #[arg(long)]
        repair: bool,
    },
    /// List the active session lines of the account
    Sessions,
    /// End a session line of the account, e.g. on a lost device
    Revoke {
        /// Session id as listed by `sessions`
        session: i64,
    },
    /// Write every record of the device store to a JSON file
    Export { path: PathBuf },
    /// Read records from a JSON export into the device store
    Import { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env();

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Login { username, password } => {
            authenticate(config, |manager, state| async move {
                manager.login(state, &username, &password).await
            })
            .await
        }
        Command::Register {
            username,
            email,
            password,
        } => {
            authenticate(config, |manager, state| async move {
                manager.register(state, &username, &email, &password).await
            })
            .await
        }
        Command::Sync => sync(config).await,
        Command::Archive { game } => archive(config, &game).await,
        Command::Check { repair } => check(config, repair).await,
        Command::Sessions => sessions(config).await,
        Command::Revoke { session } => revoke(config, session).await,
        Command::Export { path } => {
            let store = LocalStore::open(&config.store_path).await?;
            let count = store.export_to(&path).await?;
            tracing::info!("Exported {} records to {:?}", count, path);
            Ok(())
        }
        Command::Import { path } => {
            let store = LocalStore::open(&config.store_path).await?;
            let count = store.import_from(&path).await?;
            tracing::info!("Imported {} records from {:?}", count, path);
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<(), BoxError> {
    tracing::info!("Starting SugarBox sync server");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Bind address: {}", config.bind_addr);

    if config.registered_users_limited {
        tracing::warn!("New accounts are registered with the restricted role");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let repo = Arc::new(Repository::new(pool));

    // Create application state
    let state = AppState {
        repo,
        config: Arc::new(config.clone()),
    };

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Open the device store and the session manager talking to the configured server.
async fn open_device(config: &Config) -> Result<(LocalStore, Arc<SessionManager>), BoxError> {
    tracing::info!("Device store: {:?}", config.store_path);
    let store = LocalStore::open(&config.store_path).await?;
    let channel = ApiClient::new(config.server_url.clone(), config.request_timeout)?;
    Ok((store, Arc::new(SessionManager::new(channel))))
}

/// Persist whatever state a session operation left behind, then surface its outcome.
async fn finish<T>(store: &LocalStore, transition: Transition<T>) -> Result<T, BoxError> {
    let (state, outcome) = transition.into_parts();
    session::persist(store, &state).await?;
    Ok(outcome?)
}

async fn authenticate<F, Fut>(config: Config, sign_in: F) -> Result<(), BoxError>
where
    F: FnOnce(Arc<SessionManager>, SessionState) -> Fut,
    Fut: std::future::Future<Output = Transition<UserInfo>>,
{
    let (store, manager) = open_device(&config).await?;
    let state = session::load_persisted(&store).await;

    let transition = sign_in(manager, state).await;
    let user = finish(&store, transition).await?;
    tracing::info!("Signed in as {} ({})", user.username, user.role.as_str());
    Ok(())
}

async fn sessions(config: Config) -> Result<(), BoxError> {
    let (store, manager) = open_device(&config).await?;
    let state = session::load_persisted(&store).await;

    let sessions = finish(&store, manager.sessions(state).await).await?;
    for line in &sessions {
        tracing::info!(
            "Session {}{}: since {}, {} active token pairs",
            line.id,
            if line.current { " (this device)" } else { "" },
            line.created_at,
            line.active_tokens
        );
    }
    Ok(())
}

async fn revoke(config: Config, session_id: i64) -> Result<(), BoxError> {
    let (store, manager) = open_device(&config).await?;
    let state = session::load_persisted(&store).await;

    finish(&store, manager.revoke_session(state, session_id).await).await?;
    tracing::info!("Session {} revoked", session_id);
    Ok(())
}

async fn sync(config: Config) -> Result<(), BoxError> {
    let (store, manager) = open_device(&config).await?;
    let state: SessionState = session::load_persisted(&store).await;

    let (state, connected) = manager.connect(state).await.into_parts();
    if let Err(e) = connected {
        tracing::warn!("Could not connect: {}", e);
    }

    let engine = SyncEngine::new(store, manager);
    let run = engine.sync_since_last_commit(state).await;
    session::persist(engine.store(), &run.state).await?;

    let report = run.report;
    tracing::info!(
        "Sync from {}: uploaded {}, downloaded {} (net {})",
        report.cutoff_ms,
        report.uploaded.count,
        report.downloaded.count,
        report.net_downloaded
    );
    for dropped in &report.uploaded.dropped {
        tracing::warn!("Not uploaded: {}", dropped);
    }
    for error in &report.uploaded.server_errors {
        tracing::warn!("Rejected by server: {}", error);
    }
    for invalid in &report.downloaded.invalid {
        tracing::warn!("Invalid download: {}", invalid);
    }
    for failed in &report.downloaded.failed {
        tracing::warn!("Not stored: {}", failed);
    }
    Ok(())
}

/// Archive a game and wait out the grace period so its dependents are committed too.
async fn archive(config: Config, uuid: &str) -> Result<(), BoxError> {
    let store = LocalStore::open(&config.store_path).await?;
    let game: Game = store
        .find_by_uuid(uuid)
        .await?
        .ok_or_else(|| format!("no game {}", uuid))?;

    let cascade = ArchiveCascade::new(store, config.archive_grace);
    let pending = cascade.commit_game_archive(game).await?;
    let committed = pending.settle().await?;
    tracing::info!(
        "Archived game {} with {} characters and {} saves",
        uuid,
        committed.chars.len(),
        committed.saves.len()
    );
    Ok(())
}

async fn check(config: Config, repair: bool) -> Result<(), BoxError> {
    let store = LocalStore::open(&config.store_path).await?;

    if repair {
        let report = validation::repair(&store).await?;
        tracing::info!(
            "Repair fixed {} and deleted {} records",
            report.fixed,
            report.deleted
        );
        return Ok(());
    }

    let report = validation::consistency_pass(&store).await?;
    for issue in &report.issues {
        tracing::warn!("{}", issue);
    }
    tracing::info!(
        "Checked {} records, {} issues",
        report.checked,
        report.issues.len()
    );
    Ok(())
}
