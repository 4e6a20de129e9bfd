use anyhow::Context;
use clap::Args;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::services::ServeDir;
use ultrametre_core::ledger::{DEFAULT_COMMITMENT, DEFAULT_LEDGER_WS_URL, DEFAULT_WATCH_ACCOUNT};
use ultrametre_core::serial::SystemPortOpener;
use ultrametre_core::{Bridge, BridgeConfig, LogSink, ReplyPolicy, SolanaAccountWatch};

use crate::state::AppState;

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(long, env = "ULTRAMETRE_PORT", default_value = "3000")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, env = "ULTRAMETRE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Serial device path
    #[arg(long, env = "ULTRAMETRE_SERIAL_PATH", default_value = "COM5")]
    pub serial_path: String,

    #[arg(long, env = "ULTRAMETRE_BAUD", default_value = "9600")]
    pub baud_rate: u32,

    /// Delay after opening the port before sending commands (ms)
    #[arg(long, default_value = "2000")]
    pub settle_ms: u64,

    /// How long each fetch attempt waits for a reply (ms)
    #[arg(long, default_value = "1500")]
    pub reply_timeout_ms: u64,

    /// Fetch attempts before giving up
    #[arg(long, default_value = "3")]
    pub reply_attempts: u32,

    /// Pause between fetch attempts (ms)
    #[arg(long, default_value = "400")]
    pub retry_delay_ms: u64,

    /// Ledger pub/sub websocket endpoint
    #[arg(long, env = "ULTRAMETRE_LEDGER_WS", default_value = DEFAULT_LEDGER_WS_URL)]
    pub ledger_ws_url: String,

    /// Account whose changes trigger the device
    #[arg(long, env = "ULTRAMETRE_WATCH_ACCOUNT", default_value = DEFAULT_WATCH_ACCOUNT)]
    pub watch_account: String,

    /// Commitment level for account notifications
    #[arg(long, default_value = DEFAULT_COMMITMENT)]
    pub commitment: String,

    /// Run without the ledger watch
    #[arg(long)]
    pub no_watch: bool,

    /// Directory of UI assets served for any non-API path
    #[arg(long, default_value = "public")]
    pub static_dir: String,
}

impl ServerArgs {
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            serial_path: self.serial_path.clone(),
            baud_rate: self.baud_rate,
            settle_delay: Duration::from_millis(self.settle_ms),
            reply: ReplyPolicy {
                per_attempt_timeout: Duration::from_millis(self.reply_timeout_ms),
                max_attempts: self.reply_attempts,
                inter_attempt_delay: Duration::from_millis(self.retry_delay_ms),
            },
        }
    }

    fn build_bridge(&self) -> Bridge {
        let bridge = Bridge::new(self.bridge_config(), Arc::new(SystemPortOpener))
            .with_sink(Arc::new(LogSink));

        if self.no_watch {
            log::info!("[server] Ledger watch disabled");
            return bridge;
        }
        bridge.with_ledger_watch(Arc::new(SolanaAccountWatch::new(
            self.ledger_ws_url.clone(),
            self.watch_account.clone(),
            self.commitment.clone(),
        )))
    }
}

/// Serve the API and UI until interrupted, then stop the bridge.
pub async fn run(args: ServerArgs) -> anyhow::Result<()> {
    let bridge = Arc::new(args.build_bridge());
    let state = Arc::new(AppState::new(bridge.clone()));

    let app = crate::state::api_routes()
        .fallback_service(ServeDir::new(&args.static_dir))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    log::info!(
        "[server] Listening on http://{} (device {} at {} baud)",
        addr,
        args.serial_path,
        args.baud_rate
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    bridge.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("[server] Shutting down...");
}
