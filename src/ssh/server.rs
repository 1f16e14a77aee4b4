//! SSH server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use russh::server::{Handler, Server};

use super::SshHandler;
use crate::ca::TrustOracle;
use crate::tunnel::SiteRegistry;

/// The main SSH server that creates handlers for each connection.
#[derive(Clone)]
pub struct TunnelServer {
    trust: Arc<TrustOracle>,
    registry: Arc<SiteRegistry>,
}

impl TunnelServer {
    pub fn new(trust: Arc<TrustOracle>, registry: Arc<SiteRegistry>) -> Self {
        Self { trust, registry }
    }
}

impl Server for TunnelServer {
    type Handler = SshHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!("new SSH connection from {:?}", peer_addr);
        SshHandler::new(self.trust.clone(), self.registry.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as Handler>::Error) {
        error!("session error: {:?}", error);
    }
}
