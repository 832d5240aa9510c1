//! edgechat - session-persistent chat assistant server
//!
//! Serves the session HTTP surface backed by SQLite and an
//! OpenAI-compatible model endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use edgechat::config::Config;
use edgechat::orchestrator::ChatOrchestrator;
use edgechat::provider::OpenAiCompatibleModel;
use edgechat::rate_limit::{self, RateLimiter};
use edgechat::server::{self, AppState};
use edgechat::session::SessionRegistry;
use edgechat::tools::ToolRegistry;
use edgechat::db;

#[derive(Parser)]
#[command(name = "edgechat")]
#[command(about = "Session-persistent chat assistant with tool calling")]
struct Args {
    /// Bind address
    #[arg(long, env = "EDGECHAT_HOST")]
    host: Option<String>,

    /// HTTP port
    #[arg(long, env = "EDGECHAT_PORT")]
    port: Option<u16>,

    /// Database path (sqlite URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[arg(long, env = "MODEL_BASE_URL")]
    model_base_url: Option<String>,

    /// API key for the model endpoint
    #[arg(long, env = "MODEL_API_KEY", hide_env_values = true)]
    model_api_key: Option<String>,

    /// Model name
    #[arg(long, env = "MODEL_NAME")]
    model: Option<String>,

    /// Maximum model invocations per turn
    #[arg(long)]
    max_steps: Option<usize>,

    /// Requests allowed per client per window
    #[arg(long)]
    rate_limit: Option<u32>,

    /// Rate limit window in milliseconds
    #[arg(long)]
    rate_window_ms: Option<u64>,

    /// Turn off rate limiting
    #[arg(long)]
    no_rate_limit: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from ~/.edgechat/.env or current dir)
    let env_path = dirs::home_dir()
        .map(|h| h.join(".edgechat").join(".env"))
        .filter(|p| p.exists());
    if let Some(path) = env_path {
        let _ = dotenvy::from_path(&path);
    } else {
        let _ = dotenvy::dotenv();
    }

    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).init();

    // CLI args > env vars (handled by clap) > config file > defaults
    let mut config = Config::load();
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.database_url {
        config.database.database_url = url;
    }
    if let Some(url) = args.model_base_url {
        config.model.base_url = url;
    }
    if let Some(key) = args.model_api_key {
        config.model.api_key = Some(key);
    }
    if let Some(model) = args.model {
        config.model.model = model;
    }
    if let Some(steps) = args.max_steps {
        config.orchestrator.max_steps = steps;
    }
    if let Some(max) = args.rate_limit {
        config.rate_limit.max_requests = max;
    }
    if let Some(window) = args.rate_window_ms {
        config.rate_limit.window_ms = window;
    }
    if args.no_rate_limit {
        config.rate_limit.enabled = false;
    }

    ensure_sqlite_dir(&config.database.database_url)?;
    let pool = db::connect(&config.database.database_url, config.database.max_connections)
        .await
        .with_context(|| format!("opening {}", config.database.database_url))?;
    info!("Database: {}", config.database.database_url);

    let model = OpenAiCompatibleModel::new(&config.model)?;
    info!(model = %config.model.model, base_url = %config.model.base_url, "Model endpoint configured");

    let registry = Arc::new(ToolRegistry::with_builtins());
    let orchestrator = Arc::new(ChatOrchestrator::new(
        registry,
        Arc::new(model),
        config.orchestrator.clone(),
    ));

    let shutdown = CancellationToken::new();

    let rate_limiter = if config.rate_limit.enabled {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_requests,
            config.rate_limit.window_ms,
        ));
        rate_limit::spawn_sweeper(
            Arc::clone(&limiter),
            Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1)),
            shutdown.clone(),
        );
        info!(
            max_requests = config.rate_limit.max_requests,
            window_ms = config.rate_limit.window_ms,
            "Rate limiting enabled"
        );
        Some(limiter)
    } else {
        None
    };

    let state = AppState {
        sessions: Arc::new(SessionRegistry::new(pool)),
        orchestrator,
        rate_limiter,
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.server.host, config.server.port))?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        signal.cancel();
    });

    server::run(addr, state, shutdown).await
}

/// Create the parent directory of a file-backed SQLite URL
fn ensure_sqlite_dir(database_url: &str) -> Result<()> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    if path.starts_with(':') {
        return Ok(());
    }
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    Ok(())
}
