//! WebSocket accept loop and upgrade handling for `/stream`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::{HOST, ORIGIN};
use tracing::{info, warn};

use crate::BoxError;
use crate::auth::AuthLookup;
use crate::client::{self, ClientMessage};
use crate::config::Config;
use crate::hub::Hub;
use crate::ip::IpProvider;
use crate::relay::TurnAuth;

pub const STREAM_PATH: &str = "/stream";

/// Binds the signaling listener, spawns the hub, and accepts connections
/// until the listener fails.
pub async fn run_server(
    config: Config,
    auth: Arc<dyn AuthLookup>,
    turn: Arc<dyn TurnAuth>,
    ips: Arc<dyn IpProvider>,
) -> Result<(), BoxError> {
    let bind = Config::bind_address(&config.server_address);
    let listener = TcpListener::bind(&bind).await?;
    info!(address = %bind, "signaling server listening");

    let config = Arc::new(config);
    let (hub_tx, hub_rx) = mpsc::unbounded_channel();
    tokio::spawn(Hub::new(config.clone(), turn, ips).run(hub_rx));

    loop {
        let (stream, peer) = listener.accept().await?;
        let config = config.clone();
        let auth = auth.clone();
        let hub_tx = hub_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = accept_client(stream, peer, &config, auth.as_ref(), hub_tx).await {
                warn!(%peer, "connection setup failed: {err}");
            }
        });
    }
}

async fn accept_client(
    stream: TcpStream,
    peer: SocketAddr,
    config: &Config,
    auth: &dyn AuthLookup,
    hub_tx: mpsc::UnboundedSender<ClientMessage>,
) -> Result<(), BoxError> {
    let mut identity = (crate::auth::GUEST.to_string(), false);
    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        if request.uri().path() != STREAM_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "not found"));
        }
        if !origin_allowed(request, config) {
            return Err(reject(StatusCode::FORBIDDEN, "origin not allowed"));
        }
        identity = auth.current_user(request.headers());
        Ok(response)
    })
    .await?;

    let (user, authenticated) = identity;
    info!(%peer, %user, authenticated, "websocket connection established");
    client::start(ws, peer.ip(), user, authenticated, hub_tx);
    Ok(())
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// A connection is allowed when it carries no Origin header, when the origin
/// host matches the Host header, or when the lowercased origin matches the
/// configured allow-list. An unparseable Origin is rejected.
fn origin_allowed(request: &Request, config: &Config) -> bool {
    let Some(origin) = request.headers().get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let Ok(origin_url) = url::Url::parse(origin) else {
        return false;
    };
    let request_host = request.headers().get(HOST).and_then(|v| v.to_str().ok());
    if let (Some(origin_host), Some(request_host)) = (origin_url.host_str(), request_host) {
        let origin_host = match origin_url.port() {
            Some(port) => format!("{origin_host}:{port}"),
            None => origin_host.to_string(),
        };
        if origin_host == request_host {
            return true;
        }
    }
    config.check_origin(origin)
}
