//! Socket Bridge module
//!
//! The WebSocket endpoint, the per-socket bridge, the wire protocol, the
//! per-socket budgets, and the HTTP session link.

mod handler;
mod http_session;
mod limits;
mod protocol;
mod server;

pub use handler::{BridgeProtocol, BridgeServices, DisconnectReason, SocketBridge};
pub use http_session::{
    cookie_value, HeaderOverride, HttpSession, HttpSessionStore, SessionCredentials,
};
pub use limits::{
    command_permitted, escape_shell_arg, filter_env, RiskyMessage, SocketLimits, ENV_DENY_LIST,
    ENV_NAME_MAX, ENV_VALUE_MAX,
};
pub use protocol::{
    parse_client_message, AuthAction, AuthenticateRequest, AuthenticationStatus, ClientMessage,
    ControlAction, ExecStreamKind, ExecWireRequest, Permissions, ResizeRequest, ServerMessage,
    TerminalRequest, UiHeader, UiUpdate, WireError, MAX_COMMAND_LEN, MAX_TERMINAL_AXIS,
};
pub use server::WsServer;
