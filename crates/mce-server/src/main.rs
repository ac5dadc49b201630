mod actor;
mod config;
mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::BootConfig;

/// Managed Computation Engine server: persistent artifact storage and
/// memoized, dependency-aware Python expression evaluation over HTTP.
#[derive(Parser, Debug)]
#[command(name = "mce-server", about = "Managed Computation Engine HTTP server")]
struct Args {
    /// host:port to listen on (default 0.0.0.0:8085, or boot.ini's [other] listen key)
    listen: Option<String>,

    /// Path to the boot config INI file.
    #[arg(long, default_value = "boot.ini")]
    config: PathBuf,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let args = Args::parse();

    let boot = match BootConfig::load(&args.config).and_then(|c| c.with_listen_override(args.listen)) {
        Ok(boot) => boot,
        Err(e) => {
            tracing::error!(error = %e, "failed to load boot config");
            std::process::exit(1);
        }
    };

    let listen = boot.listen.clone();
    let actor = match actor::spawn(boot.engine_url.database.clone(), Duration::from_secs(boot.check_interval)) {
        Ok(actor) => Arc::new(actor),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize engine");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(serve(listen, actor));
    std::process::exit(exit_code);
}

async fn serve(listen: String, actor: Arc<actor::ActorHandle>) -> i32 {
    let state = http::AppState {
        actor,
        version: env!("CARGO_PKG_VERSION"),
    };
    let app = http::router(state);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, listen = %listen, "failed to bind listener");
            return 1;
        }
    };

    tracing::info!("MCE web application serving at {listen}");
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        tracing::error!(error = %e, "server error");
        return 1;
    }
    0
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
