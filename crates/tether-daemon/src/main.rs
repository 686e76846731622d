//! # tether-daemon
//!
//! Session manager binary. Wires settings, storage, the worker registry and
//! the HTTP/WebSocket server together, and offers a few admin subcommands
//! for the grant table.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tether_core::Identity;
use tether_session::transport::http_gateway::{HttpGatewayConfig, HttpGatewayFactory, WebhookRouter};
use tether_session::transport::scripted::{ScriptedBehavior, ScriptedTransportFactory};
use tether_session::{
    CommandGateway, GatewayConfig, GrantAuthorizer, PersistenceRetry, SessionRegistry,
    StatusPublisher, TransportFactory, WorkerDeps, WorkerPolicy,
};
use tether_server::{JwtVerifier, ServerConfig, TetherServer};
use tether_settings::{TetherSettings, TransportKind, tether_home};
use tether_store::{ConnectionConfig, TetherStore};
use tracing::{info, warn};

/// Operator connection session manager.
#[derive(Parser, Debug)]
#[command(name = "tether-daemon", about = "Operator connection session manager")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Path to the `SQLite` database (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Log filter, e.g. `info` or `tether_session=debug` (overrides settings).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/WebSocket server (default).
    Serve(ServeArgs),
    /// Allow a user to drive an operator identity.
    Grant(GrantArgs),
    /// Remove a user's access to an operator identity.
    Revoke(GrantArgs),
    /// Apply pending schema migrations and exit.
    Migrate,
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct GrantArgs {
    /// Authenticated user id (the token's `sub`).
    user: String,
    /// Operator identity.
    identity: String,
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Settings file, flag overrides applied, then validated.
fn load_settings(cli: &Cli) -> Result<TetherSettings> {
    let mut settings = match &cli.settings {
        Some(path) => tether_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => tether_settings::load_settings().context("Failed to load settings")?,
    };
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    if let Some(Command::Serve(args)) = &cli.command {
        if let Some(host) = &args.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = args.port {
            settings.server.port = port;
        }
    }
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

/// Database file: the flag wins, relative settings paths live under `~/.tether`.
fn resolve_db_path(cli: &Cli, settings: &TetherSettings) -> PathBuf {
    if let Some(path) = &cli.db_path {
        return path.clone();
    }
    let configured = PathBuf::from(&settings.database.path);
    if configured.is_absolute() {
        configured
    } else {
        tether_home().join(configured)
    }
}

fn open_store(path: &Path, settings: &TetherSettings) -> Result<Arc<TetherStore>> {
    ensure_parent_dir(path)?;
    let config = ConnectionConfig {
        pool_size: settings.database.pool_size,
        ..ConnectionConfig::default()
    };
    let pool = tether_store::new_file(&path.to_string_lossy(), &config)
        .with_context(|| format!("Failed to open database: {}", path.display()))?;
    let store = TetherStore::open(pool).context("Failed to migrate database")?;
    Ok(Arc::new(store))
}

fn parse_identity(raw: &str) -> Result<Identity> {
    let identity = Identity::from(raw);
    if !identity.is_valid() {
        bail!("invalid identity: {raw:?}");
    }
    Ok(identity)
}

// ─────────────────────────────────────────────────────────────────────────────
// Serve
// ─────────────────────────────────────────────────────────────────────────────

/// Message attached to projections left active by a previous process.
const RESTART_NOTE: &str = "process restarted";

/// Everything `serve` wires together, before binding.
struct Stack {
    server: TetherServer,
    publisher: Arc<StatusPublisher>,
    registry: Arc<SessionRegistry>,
    policy: Arc<WorkerPolicy>,
    shutdown_timeout: std::time::Duration,
}

fn build_stack(settings: &TetherSettings, store: Arc<TetherStore>) -> Result<Stack> {
    let (transports, webhooks): (Arc<dyn TransportFactory>, Option<Arc<WebhookRouter>>) =
        match settings.transport.kind {
            TransportKind::Scripted => {
                warn!("scripted transport in use; sessions pair automatically and never reach a real network");
                let factory: Arc<dyn TransportFactory> =
                    Arc::new(ScriptedTransportFactory::with_behavior(ScriptedBehavior::AutoPair));
                (factory, None)
            }
            TransportKind::HttpGateway => {
                let config = HttpGatewayConfig::from_settings(&settings.transport.gateway)
                    .context("Invalid gateway transport settings")?;
                let router = Arc::new(WebhookRouter::new());
                let factory: Arc<dyn TransportFactory> = Arc::new(
                    HttpGatewayFactory::new(config, Arc::clone(&router))
                        .context("Failed to build gateway client")?,
                );
                (factory, Some(router))
            }
        };

    let policy = Arc::new(WorkerPolicy::from_settings(settings));
    let publisher = Arc::new(StatusPublisher::new(
        store.clone(),
        settings.publisher.subscriber_buffer,
        PersistenceRetry::from(&settings.persistence),
    ));
    let registry = SessionRegistry::new(WorkerDeps {
        transports,
        credentials: store.clone(),
        sink: publisher.clone(),
        policy: Arc::clone(&policy),
    });
    let gateway = Arc::new(CommandGateway::new(
        Arc::clone(&registry),
        Arc::clone(&publisher),
        store.clone(),
        Arc::new(GrantAuthorizer::new(store)),
        GatewayConfig::from_settings(settings),
    ));

    if settings.auth.secret().is_err() {
        warn!("auth.jwtSecret is not set; every authenticated request will fail with a configuration error");
    }
    let verifier = JwtVerifier::from_settings(&settings.auth);
    let config = ServerConfig::from_settings(settings);
    let shutdown_timeout = config.shutdown_timeout();

    let mut server = TetherServer::new(config, gateway, verifier);
    if let Some(router) = webhooks {
        server = server.with_webhooks(router, settings.transport.gateway.api_key.clone());
    }
    match tether_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!(error = %e, "metrics recorder not installed"),
    }

    Ok(Stack {
        server,
        publisher,
        registry,
        policy,
        shutdown_timeout,
    })
}

async fn serve(settings: &TetherSettings, store: Arc<TetherStore>) -> Result<()> {
    let stack = build_stack(settings, store)?;
    let _ = stack
        .publisher
        .reset_stale(RESTART_NOTE)
        .await
        .context("Failed to reset stale session status")?;
    let (addr, handle) = stack
        .server
        .listen()
        .await
        .context("Failed to bind server")?;
    info!(
        transport = ?settings.transport.kind,
        "tether listening on http://{addr}"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("shutting down");
    stack
        .server
        .shutdown()
        .graceful_shutdown(
            &stack.registry,
            stack.policy.teardown_grace,
            vec![handle],
            Some(stack.shutdown_timeout),
        )
        .await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    tether_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let db_path = resolve_db_path(&cli, &settings);
    let store = open_store(&db_path, &settings)?;
    info!(path = %db_path.display(), "database ready");

    match cli.command {
        None => serve(&settings, store).await,
        Some(Command::Serve(_)) => serve(&settings, store).await,
        Some(Command::Grant(args)) => {
            let identity = parse_identity(&args.identity)?;
            let added = store
                .grant(&args.user, &identity)
                .context("Failed to write grant")?;
            info!(user = %args.user, %identity, added, "grant");
            Ok(())
        }
        Some(Command::Revoke(args)) => {
            let identity = parse_identity(&args.identity)?;
            let removed = store
                .revoke(&args.user, &identity)
                .context("Failed to remove grant")?;
            if !removed {
                warn!(user = %args.user, %identity, "no such grant");
            }
            Ok(())
        }
        Some(Command::Migrate) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::GrantStore;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::parse_from(["tether-daemon"]);
        assert!(cli.command.is_none());
        assert!(cli.settings.is_none());
    }

    #[test]
    fn cli_serve_overrides() {
        let cli = Cli::parse_from(["tether-daemon", "serve", "--host", "0.0.0.0", "--port", "8080"]);
        let Some(Command::Serve(args)) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(args.port, Some(8080));
    }

    #[test]
    fn cli_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["tether-daemon", "migrate", "--db-path", "/tmp/x.db"]);
        assert!(matches!(cli.command, Some(Command::Migrate)));
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/x.db")));
    }

    #[test]
    fn cli_grant_positional() {
        let cli = Cli::parse_from(["tether-daemon", "grant", "user-1", "op-1"]);
        let Some(Command::Grant(args)) = cli.command else {
            panic!("expected grant");
        };
        assert_eq!(args.user, "user-1");
        assert_eq!(args.identity, "op-1");
    }

    #[test]
    fn flag_overrides_apply_before_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"port":7000},"logging":{"level":"warn"}}"#).unwrap();
        let path_str = path.to_string_lossy().to_string();

        let cli = Cli::parse_from([
            "tether-daemon",
            "--settings",
            &path_str,
            "--log-level",
            "debug",
            "serve",
            "--port",
            "7001",
        ]);
        let settings = load_settings(&cli).unwrap();
        assert_eq!(settings.server.port, 7001);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let path_str = path.to_string_lossy().to_string();
        let cli = Cli::parse_from(["tether-daemon", "--settings", &path_str]);
        assert!(load_settings(&cli).is_err());
    }

    #[test]
    fn db_path_resolution() {
        let settings = TetherSettings::default();
        let cli = Cli::parse_from(["tether-daemon"]);
        assert_eq!(resolve_db_path(&cli, &settings), tether_home().join("tether.db"));

        let cli = Cli::parse_from(["tether-daemon", "--db-path", "/var/lib/t.db"]);
        assert_eq!(resolve_db_path(&cli, &settings), PathBuf::from("/var/lib/t.db"));

        let mut settings = TetherSettings::default();
        settings.database.path = "/srv/tether.db".into();
        let cli = Cli::parse_from(["tether-daemon"]);
        assert_eq!(resolve_db_path(&cli, &settings), PathBuf::from("/srv/tether.db"));
    }

    #[test]
    fn ensure_parent_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("tether.db");
        ensure_parent_dir(&path).unwrap();
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn identities_are_validated() {
        assert!(parse_identity("op-1").is_ok());
        assert!(parse_identity("").is_err());
        assert!(parse_identity(" padded ").is_err());
    }

    #[test]
    fn grant_then_revoke_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("db").join("t.db"), &TetherSettings::default()).unwrap();
        let identity = Identity::from("op-1");
        assert!(store.grant("user-1", &identity).unwrap());
        assert!(store.is_granted("user-1", &identity).unwrap());
        assert!(store.revoke("user-1", &identity).unwrap());
        assert!(!store.is_granted("user-1", &identity).unwrap());
    }

    #[test]
    fn gateway_transport_requires_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("t.db"), &TetherSettings::default()).unwrap();
        let mut settings = TetherSettings::default();
        settings.transport.kind = TransportKind::HttpGateway;
        assert!(build_stack(&settings, store).is_err());
    }

    #[tokio::test]
    async fn stale_sessions_read_idle_after_restart() {
        use tether_core::{ConnectionState, ProjectionStore, StatusProjection};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let store = open_store(&path, &TetherSettings::default()).unwrap();
        let _ = store
            .save(&StatusProjection {
                state: ConnectionState::Connected,
                ..StatusProjection::initial(Identity::from("u1"))
            })
            .unwrap();
        drop(store);

        let store = open_store(&path, &TetherSettings::default()).unwrap();
        let stack = build_stack(&TetherSettings::default(), store.clone()).unwrap();
        let reset = stack.publisher.reset_stale(RESTART_NOTE).await.unwrap();
        assert_eq!(reset, vec![Identity::from("u1")]);
        assert_eq!(
            store.load(&Identity::from("u1")).unwrap().unwrap().state,
            ConnectionState::Idle
        );
        assert_eq!(stack.registry.len(), 0);
    }

    #[tokio::test]
    async fn server_boots_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir.path().join("t.db"), &TetherSettings::default()).unwrap();
        let mut settings = TetherSettings::default();
        settings.server.port = 0;
        settings.auth.jwt_secret = Some("test-secret".into());

        let stack = build_stack(&settings, store).unwrap();
        let (addr, handle) = stack.server.listen().await.unwrap();

        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/v1/session/start"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);

        stack
            .server
            .shutdown()
            .graceful_shutdown(
                &stack.registry,
                stack.policy.teardown_grace,
                vec![handle],
                Some(std::time::Duration::from_secs(5)),
            )
            .await;
        assert!(stack.server.shutdown().is_shutting_down());
    }
}
