//! `diagramd` binary: CLI entry point, logging setup, and the
//! foreground server loop.
//!
//! Trimmed from `clawd::main`'s much larger subcommand surface
//! (service install, pairing, updates, task management are all
//! out of scope here — see DESIGN.md) down to the two commands this
//! domain actually needs.

use clap::{Parser, Subcommand};
use diagramd::authz::{AuthorizationData, Authorizer};
use diagramd::config::HubConfig;
use diagramd::error::HubError;
use diagramd::hub::{AuthorizationSource, Hub};
use diagramd::janitor::{self, CancelToken};
use diagramd::server::{self, AppState};
use diagramd::store::{InMemoryStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "diagramd", about = "Real-time collaborative diagram editing core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, env = "DIAGRAMD_PORT", global = true)]
    port: Option<u16>,

    #[arg(long, env = "DIAGRAMD_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "DIAGRAMD_LOG", global = true)]
    log: Option<String>,

    #[arg(long, env = "DIAGRAMD_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[arg(long, global = true)]
    quiet: bool,

    #[arg(long, global = true)]
    dev: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub and WebSocket server in the foreground (default).
    Serve,
    /// Environment check: port availability, log directory writability.
    Doctor,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Arc::new(HubConfig::new(cli.port, cli.data_dir.clone(), cli.log.clone(), cli.dev));

    setup_logging(&config.log, cli.log_file.as_deref(), cli.quiet);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Doctor => std::process::exit(run_doctor(&config)),
    }
}

/// Mirrors `clawd::main::setup_logging`: stdout always, optional daily
/// rolling file, non-fatal fallback to stdout-only on a bad log dir.
fn setup_logging(level: &str, log_file: Option<&std::path::Path>, quiet: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = (!quiet).then(|| fmt::layer().with_target(false));

    match log_file {
        Some(path) => match path.parent().map(std::fs::create_dir_all).transpose() {
            Ok(_) => {
                let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("diagramd.log");
                let file_appender = tracing_appender::rolling::daily(dir, name);
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Leaked deliberately: the guard must outlive the process
                // for buffered log lines to flush on exit, the same
                // trade-off `clawd::main::setup_logging` makes.
                Box::leak(Box::new(guard));
                tracing_subscriber::registry()
                    .with(filter)
                    .with(stdout_layer)
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();
            }
            Err(e) => {
                tracing_subscriber::registry().with(filter).with(stdout_layer).init();
                error!(err = %e, "failed to create log directory, falling back to stdout only");
            }
        },
        None => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
        }
    }
}

/// Authorization data source backed by flat files under
/// `{data_dir}/acl/{threat_model_id}.json` — a stand-in for whatever
/// upstream service owns threat-model ACLs in production. `dev_mode`
/// instead grants `everyone: writer` to every resource so `diagramd
/// serve --dev` works with zero setup.
struct FileAuthorizationSource {
    data_dir: PathBuf,
    dev_mode: bool,
}

#[async_trait::async_trait]
impl AuthorizationSource for FileAuthorizationSource {
    async fn load(&self, threat_model_id: Uuid) -> Result<AuthorizationData, HubError> {
        if self.dev_mode {
            return Ok(dev_mode_resource());
        }
        let path = self.data_dir.join("acl").join(format!("{threat_model_id}.json"));
        let contents = tokio::fs::read_to_string(&path).await.map_err(|_| HubError::NotFound)?;
        serde_json::from_str(&contents).map_err(|_| HubError::UpgradeFailed("malformed ACL file".to_string()))
    }
}

fn dev_mode_resource() -> AuthorizationData {
    use diagramd::authz::{AclEntry, AclPrincipal, Owner, ResourceType, Role};
    AuthorizationData {
        resource_type: ResourceType::ThreatModel,
        owner: Owner { provider: None, id: "dev".to_string() },
        acl: vec![AclEntry {
            principal: AclPrincipal::Group { provider: None, name: "everyone".to_string() },
            role: Role::Writer,
        }],
    }
}

async fn run_server(config: Arc<HubConfig>) {
    info!(port = config.port, data_dir = %config.data_dir.display(), dev_mode = config.dev_mode, "starting diagramd");

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let authz_source: Arc<dyn AuthorizationSource> =
        Arc::new(FileAuthorizationSource { data_dir: config.data_dir.clone(), dev_mode: config.dev_mode });
    let authorizer = Arc::new(Authorizer::default());
    let hub = Arc::new(Hub::new(store, authz_source, authorizer, Arc::clone(&config)));

    let cancel_token = CancelToken::new();
    let janitor_handle = janitor::start(Arc::clone(&hub), Arc::clone(&config), cancel_token.clone());

    let state = Arc::new(AppState { hub: Arc::clone(&hub), config: Arc::clone(&config), started_at: Instant::now() });
    let app = server::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(err = %e, %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "listening");

    let shutdown = shutdown_signal();
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(err = %e, "server error");
    }

    info!("shutting down, draining sessions");
    cancel_token.cancel();
    let _ = janitor_handle.await;
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn run_doctor(config: &HubConfig) -> i32 {
    let mut ok = true;

    match std::net::TcpListener::bind(("0.0.0.0", config.port)) {
        Ok(_) => println!("port {}: available", config.port),
        Err(e) => {
            println!("port {}: unavailable ({e})", config.port);
            ok = false;
        }
    }

    match std::fs::create_dir_all(&config.data_dir) {
        Ok(()) => println!("data dir {}: writable", config.data_dir.display()),
        Err(e) => {
            println!("data dir {}: not writable ({e})", config.data_dir.display());
            ok = false;
        }
    }

    if ok {
        println!("doctor: all checks passed");
        0
    } else {
        println!("doctor: one or more checks failed");
        1
    }
}
