//! Reverse-tunnel control plane: SSH host-certificate authentication,
//! per-site liveness tracking, a suffix-matching site registry, and the
//! join/CA surface that mints the certificates agents present.

pub mod ca;
pub mod config;
pub mod error;
pub mod key;
pub mod management;
pub mod ssh;
pub mod tunnel;

pub use ca::CertificateAuthority;
pub use error::{CaError, TunnelError};
pub use key::load_or_generate_server_key;
pub use ssh::{SshHandler, TunnelServer};
pub use tunnel::{Site, SiteRegistry, SiteStatus};
