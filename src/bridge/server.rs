//! WebSocket endpoint
//!
//! Accepts upgrades on the configured listener, validates the Origin
//! against the allow-list, binds the socket to its HTTP session via the
//! session cookie, selects the protocol from the upgrade path, and hands
//! the connection to a Socket Bridge.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

use super::handler::{BridgeProtocol, BridgeServices, SocketBridge};
use super::http_session::cookie_value;

/// Upgrade paths served by the endpoint.
const SSH_PATHS: &[&str] = &["/ssh/socket.io", "/ssh"];
const TELNET_PATHS: &[&str] = &["/telnet/socket.io", "/telnet"];

pub struct WsServer;

impl WsServer {
    /// Bind the gateway listener. A bind failure is fatal (exit code 1).
    pub async fn bind(services: &Arc<BridgeServices>) -> Result<TcpListener, ConfigError> {
        let addr = format!(
            "{}:{}",
            services.config.listen.ip, services.config.listen.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ConfigError(format!("cannot bind {addr}: {e}")))?;
        info!(addr = %addr, "websocket endpoint listening");
        Ok(listener)
    }

    /// Accept loop. Runs until the listener is dropped.
    pub async fn run(listener: TcpListener, services: Arc<BridgeServices>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let services = services.clone();
                    tokio::spawn(async move {
                        handle_socket(services, stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
    }
}

fn origin_allowed(origin: Option<&str>, allow_list: &[String]) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    match origin {
        Some(origin) => allow_list.iter().any(|allowed| allowed == origin),
        // non-browser clients may omit Origin; the allow-list is a browser
        // protection, so absence passes
        None => true,
    }
}

fn protocol_for_path(path: &str) -> Option<BridgeProtocol> {
    if SSH_PATHS.iter().any(|p| path == *p) {
        Some(BridgeProtocol::Ssh)
    } else if TELNET_PATHS.iter().any(|p| path == *p) {
        Some(BridgeProtocol::Telnet)
    } else {
        None
    }
}

async fn handle_socket(services: Arc<BridgeServices>, stream: TcpStream, peer: SocketAddr) {
    // low-latency interactive traffic
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }

    let config = services.config.clone();
    let mut protocol: Option<BridgeProtocol> = None;
    let mut http_sid: Option<String> = None;
    let mut user_agent: Option<String> = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        protocol = protocol_for_path(path);
        if protocol.is_none() {
            debug!(path, "upgrade rejected: unknown path");
            return Err(ErrorResponse::new(Some("not found".to_string())));
        }

        let origin = request
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok());
        if !origin_allowed(origin, &config.origin) {
            warn!(?origin, "upgrade rejected: origin not allowed");
            return Err(ErrorResponse::new(Some("origin not allowed".to_string())));
        }

        http_sid = request
            .headers()
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(|header| cookie_value(header, &config.session.name));

        user_agent = request
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(response)
    };

    match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => {
            let protocol = match protocol {
                Some(protocol) => protocol,
                None => return,
            };
            info!(peer = %peer, ?protocol, "websocket connection accepted");
            SocketBridge::run(
                services,
                ws_stream,
                protocol,
                http_sid,
                Some(peer.ip().to_string()),
                user_agent,
            )
            .await;
        }
        Err(e) => {
            debug!(peer = %peer, "websocket handshake failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_selects_protocol() {
        assert_eq!(
            protocol_for_path("/ssh/socket.io"),
            Some(BridgeProtocol::Ssh)
        );
        assert_eq!(
            protocol_for_path("/telnet/socket.io"),
            Some(BridgeProtocol::Telnet)
        );
        assert_eq!(protocol_for_path("/metrics"), None);
    }

    #[test]
    fn origin_allow_list() {
        let allow = vec!["https://term.example".to_string()];
        assert!(origin_allowed(Some("https://term.example"), &allow));
        assert!(!origin_allowed(Some("https://evil.example"), &allow));
        assert!(origin_allowed(None, &allow));
        assert!(origin_allowed(Some("https://anything"), &[]));
    }
}
