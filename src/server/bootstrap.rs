use crate::config::BridgeConfig;
use crate::server::{self, BridgeState};
use crate::upstream::lifecycle;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
}

/// Bridge lifecycle: init → startup wait → probe fan-out → consolidate →
/// listen → retry ticker → shutdown.
///
/// The listener comes up after the initial probe round even when no
/// upstream is active; the retry ticker keeps trying to admit them.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = BridgeConfig::load(&args.config_path)?;
    let listen = args
        .listen
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.port));
    let startup_wait = config.startup_wait();

    let state = BridgeState::new(config)?;

    // Signal handling starts before the startup wait so an orchestrator can
    // still terminate the process during the delay.
    let shutdown = Arc::new(Notify::new());
    spawn_signal_listener(&shutdown);

    if !startup_wait.is_zero() {
        tracing::info!(
            "lifecycle: waiting {}ms before first probe",
            startup_wait.as_millis()
        );
        if lifecycle::sleep_or_shutdown(startup_wait, &shutdown).await {
            tracing::info!("server: shutdown requested during startup wait");
            return Ok(());
        }
    }

    if state.registry.is_empty() {
        tracing::warn!("lifecycle: no upstreams configured");
    } else {
        lifecycle::probe_all(&state).await;
    }
    state.refresh_view().await;

    let active = state
        .registry
        .snapshot()
        .await
        .iter()
        .filter(|s| s.active)
        .count();
    if active == 0 && !state.registry.is_empty() {
        tracing::warn!("lifecycle: no active upstreams, continuing to retry");
    } else {
        tracing::info!(
            "lifecycle: initial probe round complete, active={}/{}",
            active,
            state.registry.len()
        );
    }

    lifecycle::start_retry_loop(&state, &shutdown);

    // Blocks until shutdown is signalled and in-flight requests drain; a
    // bind failure propagates and exits non-zero.
    server::run_bridge_server(&listen, state, shutdown).await?;

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn spawn_signal_listener(shutdown: &Arc<Notify>) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

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
            _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
            _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
        }

        shutdown.notify_waiters();
    });
}
