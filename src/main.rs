//! PlayGrid backend server.
//!
//! Boots the shared store and bus, wires the ledger, session manager,
//! execution pool and payment adapters, spawns the background loops and
//! serves the HTTP/WebSocket surface until SIGTERM/SIGINT.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playgrid_backend::{
    api::{build_router, AppState},
    auth::TokenValidator,
    bus::Bus,
    ledger::LedgerService,
    models::Config,
    payments::{CryptoService, FlutterwaveClient, MomoService, TatumClient, WithdrawalService},
    pool::PoolManager,
    session::SessionManager,
    store::Store,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "playgrid_backend=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Arc::new(Config::from_env());
    info!(port = cfg.port, db = %cfg.database_path, "starting playgrid backend");

    let validator = Arc::new(
        TokenValidator::from_pem_file(&cfg.jwt_public_key_path, &cfg.jwt_issuer)
            .context("JWT validator init failed")?,
    );
    let store = Store::open(&cfg.database_path).context("open store")?;
    let bus = Bus::new();
    let ledger = LedgerService::new(store.clone(), bus.clone());

    let provider = Arc::new(FlutterwaveClient::new(
        cfg.provider_secret_key.clone(),
        cfg.provider_base_url.clone(),
        cfg.provider_transfer_base_url.clone(),
    ));
    let indexer = Arc::new(TatumClient::from_config(&cfg));

    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        bus.clone(),
        ledger.clone(),
        cfg.clone(),
    ));
    let momo = Arc::new(MomoService::new(
        store.clone(),
        bus.clone(),
        ledger.clone(),
        provider.clone(),
        cfg.clone(),
    ));
    let withdrawals = Arc::new(WithdrawalService::new(
        store.clone(),
        bus.clone(),
        ledger.clone(),
        provider.clone(),
        cfg.clone(),
    ));
    let crypto = CryptoService::new(
        store.clone(),
        bus.clone(),
        ledger.clone(),
        indexer,
        cfg.clone(),
    );
    let pool = PoolManager::new(bus.clone(), ledger.clone(), cfg.clone());

    // Background loops, all tied to the same shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let sessions = sessions.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { sessions.run_outcome_subscriber(rx).await });
    }
    {
        let sessions = sessions.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { sessions.run_stale_sweeper(rx).await });
    }
    tokio::spawn(pool.run(shutdown_rx.clone()));
    {
        let momo = momo.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { momo.run_deposit_poller(rx).await });
    }
    {
        let withdrawals = withdrawals.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { withdrawals.run_withdrawal_poller(rx).await });
    }
    tokio::spawn(crypto.clone().run_watcher(shutdown_rx));

    let app = build_router(AppState {
        cfg: cfg.clone(),
        bus,
        ledger,
        sessions,
        momo,
        crypto,
        withdrawals,
        validator,
    });

    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("bind port {}", cfg.port))?;
    info!(port = cfg.port, "playgrid backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down background tasks");
    let _ = shutdown_tx.send(true);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
