//! guest-runtime CLI entry point.
//!
//! Loads a compiled guest application and serves it over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use guest_runtime_common::ConfigFile;
use guest_runtime_server::{AppState, GuestServer, ServerConfig};

/// Serve a compiled WebAssembly guest application over HTTP.
#[derive(Debug, Parser)]
#[command(name = "guest-runtime", version, about)]
struct Args {
    /// Path to the guest binary. Overrides `[app] wasm` from the config file.
    wasm: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(short, long, env = "GUEST_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Interface to bind.
    #[arg(long, env = "GUEST_RUNTIME_HOST")]
    host: Option<String>,

    /// Port to bind.
    #[arg(short, long, env = "GUEST_RUNTIME_PORT")]
    port: Option<u16>,

    /// Directory the guest's file capabilities are confined to.
    #[arg(long, env = "GUEST_RUNTIME_SANDBOX_ROOT")]
    sandbox_root: Option<String>,

    /// Database connection string (`sqlite://path` or `sqlite::memory:`).
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Secret used by the guest's token helpers.
    #[arg(long, env = "GUEST_RUNTIME_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,

    /// Verbose host logging.
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose {
        "debug,guest_runtime=debug"
    } else {
        "info,guest_runtime=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);

    let mut file = match &args.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };

    let host = &mut file.runtime.host;
    if args.sandbox_root.is_some() {
        host.sandbox_root = args.sandbox_root;
    }
    if args.database_url.is_some() {
        host.database_url = args.database_url;
    }
    if args.token_secret.is_some() {
        host.token_secret = args.token_secret;
    }
    host.verbose |= args.verbose;

    let mut server_config =
        ServerConfig::from_file(&file.server, &file.admin).context("Invalid server configuration")?;
    if args.host.is_some() || args.port.is_some() {
        let ip = match &args.host {
            Some(host) => host
                .parse()
                .with_context(|| format!("Invalid host '{host}'. Expected an IP address"))?,
            None => server_config.bind_addr.ip(),
        };
        let port = args.port.unwrap_or(server_config.bind_addr.port());
        server_config = server_config.with_bind_addr(SocketAddr::new(ip, port));
    }

    let wasm = args
        .wasm
        .or_else(|| file.app.wasm.as_ref().map(PathBuf::from))
        .context("No guest binary given. Pass a path or set [app] wasm in the config file")?;

    info!(wasm = %wasm.display(), bind_addr = %server_config.bind_addr, "Configuration loaded");

    let state = AppState::from_file(&file.runtime, &wasm)
        .await
        .with_context(|| format!("Failed to load guest {}", wasm.display()))?;

    GuestServer::new(state, server_config).run().await?;

    Ok(())
}
