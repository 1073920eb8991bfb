//!
//! almsgate server binary
//! ----------------------
//! Entry point for the almsgate session and authorization service. Supports
//! configuration via environment variables and CLI flags.

use std::env;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use almsgate::config::{has_flag, AppConfig};

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} [--http-port N] [--backend-url URL] [--backend-key KEY] [--cache-dir PATH|none] [--session-ttl SECS] [--client-idle SECS] [--dev-password PW]\n\nFlags:\n  --http-port N        HTTP listen port (default: 7878, env ALMSGATE_HTTP_PORT)\n  --backend-url URL    Hosted auth/profile backend base URL; omit for the built-in local provider (env ALMSGATE_BACKEND_URL)\n  --backend-key KEY    API key for the hosted backend (env ALMSGATE_BACKEND_KEY)\n  --cache-dir PATH     Directory for persisted session tokens; 'none' disables persistence (default: almsgate_cache, env ALMSGATE_CACHE_DIR)\n  --session-ttl SECS   Access token lifetime for the local provider (default: 3600, env ALMSGATE_SESSION_TTL_SECS)\n  --client-idle SECS   Idle time before a client context is retired (default: 1800, env ALMSGATE_CLIENT_IDLE_SECS)\n  --dev-password PW    Password for the seeded local super-admin (default: almsgate, env ALMSGATE_DEV_PASSWORD)\n  -h, --help           Show this help\n\nLocal mode seeds one account: admin@almsgate.local / --dev-password."
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        print_usage(&args[0]);
        return Ok(());
    }

    let cfg = AppConfig::from_env_and_args(&args);

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "almsgate starting: RUST_LOG='{}', http_port={}, backend={}, cache_dir={}, session_ttl={}s, client_idle={}s",
        rust_log,
        cfg.http_port,
        cfg.backend_url.as_deref().unwrap_or("<local>"),
        cfg.cache_dir.as_deref().unwrap_or("<disabled>"),
        cfg.session_ttl_secs,
        cfg.client_idle_secs
    );

    almsgate::server::run_with_config(cfg).await
}
