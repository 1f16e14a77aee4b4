//! SSH server module: the tunnel server and its per-connection handler.

mod handler;
mod server;

pub use handler::SshHandler;
pub use server::TunnelServer;

/// Wire-stable channel type names (§6). `heartbeat` is the only one an
/// agent opens inbound; `transport`/`access-point` are opened
/// server→agent and both ride on a forwarded-tcpip open rather than a
/// distinct SSH channel type (see `tunnel::site::Site::open_forwarded`
/// and DESIGN.md).
pub const CHANNEL_TYPE_HEARTBEAT: &str = "heartbeat";
pub const CHANNEL_TYPE_TRANSPORT: &str = "transport";
pub const CHANNEL_TYPE_ACCESS_POINT: &str = "access-point";
