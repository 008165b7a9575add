//! Application startup and lifecycle management.

use crate::config::Config;
use crate::handlers;
use crate::services::categorize::CategorizationEngine;
use crate::services::connection::ConnectionService;
use crate::services::dashboard::DashboardService;
use crate::services::database::Database;
use crate::services::linker::TransactionLinker;
use crate::services::metrics::init_metrics;
use crate::services::store::BankingStore;
use crate::services::sync::SyncEngine;
use crate::services::xs2a::{BankGateway, Xs2aClient};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn BankingStore>,
    pub connections: Arc<ConnectionService>,
    pub sync: Arc<SyncEngine>,
    pub categorizer: Arc<CategorizationEngine>,
    pub linker: Arc<TransactionLinker>,
    pub dashboard: Arc<DashboardService>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application against Postgres and the live bank gateway.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let store: Arc<dyn BankingStore> = Arc::new(db);
        let gateway: Arc<dyn BankGateway> = Arc::new(Xs2aClient::new(Duration::from_secs(
            config.sync.request_timeout_secs,
        )));
        Self::build_with(config, store, gateway).await
    }

    /// Build with injected store and gateway. Used by tests to run the full
    /// HTTP surface against in-memory collaborators.
    pub async fn build_with(
        config: Config,
        store: Arc<dyn BankingStore>,
        gateway: Arc<dyn BankGateway>,
    ) -> Result<Self, AppError> {
        init_metrics();

        let connections = Arc::new(ConnectionService::new(store.clone(), gateway.clone()));
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            gateway.clone(),
            Duration::from_secs(config.sync.retry_max_elapsed_secs),
        ));
        let categorizer = Arc::new(CategorizationEngine::new(store.clone()));
        let linker = Arc::new(TransactionLinker::new(store.clone()));
        let dashboard = Arc::new(DashboardService::new(store.clone()));

        let state = AppState {
            config: config.clone(),
            store,
            connections,
            sync,
            categorizer,
            linker,
            dashboard,
        };

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid listen address: {}", e)))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::InternalError(e.into())
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| AppError::InternalError(e.into()))?
            .port();

        tracing::info!(port = port, "Banking service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the application state.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the application until SIGINT/SIGTERM.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let sweep = spawn_expiry_sweep(self.state.clone());
        let router = build_router(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        sweep.abort();
        tracing::info!("Banking service shutdown complete");
        Ok(())
    }
}

/// Background task that expires connections whose consent validity date
/// has passed, so stale connections are caught even without sync traffic.
fn spawn_expiry_sweep(state: AppState) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(state.config.sync.expiry_sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = state.connections.expire_overdue().await {
                tracing::warn!(error = %e, "Expiry sweep failed");
            }
        }
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/banking/config", post(handlers::config::set_provider_config))
        .route("/api/banking/consents", post(handlers::connections::create_consent))
        .route(
            "/api/banking/connections/:id",
            get(handlers::connections::list_connections)
                .delete(handlers::connections::revoke_connection),
        )
        .route(
            "/api/banking/connections/:id/status",
            put(handlers::connections::refresh_status),
        )
        .route(
            "/api/banking/connections/:id/accounts",
            get(handlers::accounts::list_accounts),
        )
        .route(
            "/api/banking/connections/:id/sync",
            post(handlers::connections::sync_connection),
        )
        .route(
            "/api/banking/accounts/:id/balances",
            get(handlers::accounts::get_balances),
        )
        .route(
            "/api/banking/accounts/:id/transactions",
            get(handlers::accounts::list_transactions),
        )
        .route(
            "/api/banking/transactions/:id/categorize",
            put(handlers::transactions::categorize_transaction),
        )
        .route(
            "/api/banking/transactions/:id/link",
            put(handlers::transactions::link_invoice),
        )
        .route(
            "/api/banking/companies/:company_id/category-rules",
            get(handlers::rules::list_rules)
                .post(handlers::rules::create_rule)
                .put(handlers::rules::update_rule),
        )
        .route(
            "/api/banking/companies/:company_id/dashboard",
            get(handlers::dashboard::get_dashboard),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
