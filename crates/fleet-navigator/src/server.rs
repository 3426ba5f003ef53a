use axum::{
    extract::{ConnectInfo, Path, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::{future::IntoFuture, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use fleet_core::{DeviceStore, IdentityFile, InMemoryStore, PairingCoordinator, SessionRegistry, SqliteStore};

use crate::admin::{self, AdminState};
use crate::config::NavigatorConfig;
use crate::gateway::{BusinessHandler, Gateway, LoggingHandler};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: NavigatorConfig,
    pub shutdown: watch::Receiver<bool>,
}

pub struct NavigatorServer {
    config: NavigatorConfig,
    gateway: Arc<Gateway>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl NavigatorServer {
    /// Load the identity and open the store. Business messages are only logged.
    pub fn new(config: NavigatorConfig) -> anyhow::Result<Self> {
        Self::with_handler(config, Arc::new(LoggingHandler))
    }

    pub fn with_handler(config: NavigatorConfig, handler: Arc<dyn BusinessHandler>) -> anyhow::Result<Self> {
        config.validate()?;

        let identity_file = IdentityFile::new(config.identity_path());
        let identity = identity_file.load_or_generate()?;
        info!(
            path = %identity_file.path().display(),
            public_key = %identity.sign_pub_b64(),
            "Navigator identity ready"
        );

        let store: Arc<dyn DeviceStore> = match config.database() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                info!(path = %path.display(), "Using SQLite trusted-device store");
                Arc::new(SqliteStore::new(&path)?)
            }
            None => {
                warn!("Using in-memory trusted-device store; pairings are lost on restart");
                Arc::new(InMemoryStore::new())
            }
        };

        let coordinator = Arc::new(PairingCoordinator::new(
            Arc::new(identity),
            store,
            Arc::new(SessionRegistry::new()),
            config.coordinator_config(),
        ));
        let gateway = Arc::new(Gateway::new(coordinator, handler));
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        Ok(Self {
            config,
            gateway,
            shutdown_tx,
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            gateway: Arc::clone(&self.gateway),
            config: self.config.clone(),
            shutdown: self.shutdown_tx.subscribe(),
        };
        let admin_state = AdminState {
            gateway: Arc::clone(&self.gateway),
            admin_token: self.config.admin_token.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/fleet-mate/ws/:mate_id", get(ws_handler_with_id))
            .route("/health", get(health_handler))
            .with_state(state)
            .nest("/api/pairing", admin::router(admin_state))
            .layer(TraceLayer::new_for_http())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        if self.config.admin_token.is_none() {
            warn!("No admin token configured; the pairing admin API is unauthenticated");
        }
        info!("fleet-navigator listening on {}", listener.local_addr()?);

        let app = self.router();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut drain_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        let timeout = self.config.shutdown_timeout();

        let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                Self::shutdown_signal(shutdown_rx).await;
                // Tell open sockets to close
                let _ = shutdown_tx.send(true);
            })
            .into_future();

        tokio::select! {
            result = server => result?,
            _ = async {
                while !*drain_rx.borrow_and_update() {
                    if drain_rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                tokio::time::sleep(timeout).await;
            } => {
                warn!("Graceful shutdown timed out after {:?}", timeout);
            }
        }

        info!("fleet-navigator stopped");
        Ok(())
    }

    async fn shutdown_signal(mut shutdown: watch::Receiver<bool>) {
        #[cfg(unix)]
        let mut sigterm = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::terminate()).ok()
        };

        tokio::select! {
            _ = async {
                #[cfg(unix)]
                {
                    if let Some(ref mut sigterm) = sigterm {
                        sigterm.recv().await;
                    } else {
                        std::future::pending::<()>().await;
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("Received SIGTERM, starting graceful shutdown");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, starting graceful shutdown");
            }
            _ = async {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            } => {
                info!("Shutdown requested");
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    upgrade(ws, addr, state, None)
}

async fn ws_handler_with_id(
    ws: WebSocketUpgrade,
    Path(mate_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    upgrade(ws, addr, state, Some(mate_id))
}

fn upgrade(
    ws: WebSocketUpgrade,
    addr: SocketAddr,
    state: AppState,
    path_id: Option<String>,
) -> impl IntoResponse {
    let max = state.config.max_frame_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| state.gateway.serve_socket(socket, addr, path_id, state.shutdown))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.gateway.connected_devices().len(),
    }))
}
