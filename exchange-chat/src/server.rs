use std::{
    future::{self, Future},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        ConnectInfo, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    audit::AuditLog,
    exchange::ExchangeService,
    rates::{HttpRateProvider, RateProvider},
    registry::{ConnectionHandle, DEFAULT_NAME},
    session::{ChatState, Inbound, Session},
};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub api_url: String,
    pub currencies: Vec<String>,
    /// `None` disables the audit trail.
    pub audit_log: Option<PathBuf>,
    pub fetch_timeout: Duration,
}

pub struct Server {
    listener: TcpListener,
    state: ChatState,
}

impl Server {
    /// Binds the listener and talks to the configured HTTP rate API.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let provider = HttpRateProvider::new(config.api_url.clone(), config.fetch_timeout)?;
        Self::bind_with_provider(config, Arc::new(provider)).await
    }

    pub async fn bind_with_provider(
        config: &ServerConfig,
        provider: Arc<dyn RateProvider>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;

        let mut exchange = ExchangeService::new(provider, config.currencies.clone());
        if let Some(path) = &config.audit_log {
            exchange = exchange.with_audit_log(AuditLog::new(path));
        }

        Ok(Self {
            listener,
            state: ChatState::new(exchange),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, state } = self;
        let app = router(state);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("server shutting down");
        })
        .await
        .context("server loop failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn router(state: ChatState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct JoinQuery {
    name: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<JoinQuery>,
    State(state): State<ChatState>,
) -> Response {
    let name = query
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_NAME.to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, peer, name, state))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, name: String, state: ChatState) {
    let (mut sink, stream) = socket.split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<String>();
    let handle = ConnectionHandle::new(state.registry.next_id(), name, Some(peer), outbound);
    let id = handle.id();

    // Drains until every clone of the handle is gone or the socket fails.
    tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if let Err(err) = sink.send(Message::Text(message)).await {
                debug!(id, error = %err, "failed to write to client");
                return;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = stream.filter_map(|event| {
        future::ready(match event {
            Ok(message) => to_inbound(message).map(Ok),
            Err(err) => Some(Err(err)),
        })
    });

    Session::new(handle, state).run(inbound).await;
}

fn to_inbound(message: Message) -> Option<Inbound> {
    match message {
        Message::Text(text) => Some(Inbound::Text(text)),
        Message::Close(_) => Some(Inbound::Close),
        // Pings are answered by the socket itself; binary frames are not chat.
        Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}
