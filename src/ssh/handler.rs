//! Per-connection SSH handler (§4.3, §4.8): authenticates the agent via
//! host certificate, then dispatches the one inbound channel type agents
//! are allowed to open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::{info, warn};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::ssh_key::public::KeyData;

use crate::ca::TrustOracle;
use crate::error::TunnelError;
use crate::tunnel::{Site, SiteConnection, SiteRegistry};

use super::CHANNEL_TYPE_HEARTBEAT;

/// One per accepted SSH connection. `russh::server::Handler` only exposes
/// fixed channel-open hooks (`channel_open_session`, `channel_open_x11`,
/// `channel_open_direct_tcpip`), with no generic "dispatch on this
/// arbitrary channel type string" hook the way the source's Go SSH
/// library provides. The heartbeat channel (§6 `heartbeat`) is the only
/// type an agent ever opens inbound, so it is carried over the ordinary
/// `session` channel instead of a custom type. See DESIGN.md.
pub struct SshHandler {
    trust: Arc<TrustOracle>,
    registry: Arc<SiteRegistry>,
    peer_addr: SocketAddr,
    domain_name: Option<String>,
    site: Option<Arc<Site>>,
    heartbeat_channel_opened: bool,
}

impl SshHandler {
    pub fn new(trust: Arc<TrustOracle>, registry: Arc<SiteRegistry>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            trust,
            registry,
            peer_addr: peer_addr.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap()),
            domain_name: None,
            site: None,
            heartbeat_channel_opened: false,
        }
    }
}

#[async_trait]
impl Handler for SshHandler {
    type Error = TunnelError;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        self.domain_name = Some(user.to_string());

        let certificate = match public_key.key_data() {
            KeyData::Certificate(cert) => cert,
            _ => {
                warn!("auth rejected for '{}': key is not a certificate", user);
                return Ok(Auth::Reject { proceed_with_methods: None });
            }
        };

        if !self.trust.is_trusted(certificate.signature_key()).await {
            warn!("auth rejected for '{}': certificate signed by an untrusted authority", user);
            return Ok(Auth::Reject { proceed_with_methods: None });
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now < certificate.valid_after() || now > certificate.valid_before() {
            warn!("auth rejected for '{}': certificate outside its validity window", user);
            return Ok(Auth::Reject { proceed_with_methods: None });
        }

        if !certificate
            .valid_principals()
            .iter()
            .any(|principal| principal == user)
        {
            warn!(
                "auth rejected for '{}': user not among the certificate's principals {:?}",
                user,
                certificate.valid_principals()
            );
            return Ok(Auth::Reject { proceed_with_methods: None });
        }

        info!("auth accepted for principal '{}'", user);
        Ok(Auth::Accept)
    }

    /// The agent's single heartbeat channel rides on the standard
    /// `session` open (§4.8). A connection gets at most one.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.heartbeat_channel_opened {
            let reason = TunnelError::UnknownChannelType(format!(
                "a second {} channel on one connection",
                CHANNEL_TYPE_HEARTBEAT
            ));
            warn!(
                "rejecting channel from '{:?}': {}",
                self.domain_name, reason
            );
            return Ok(false);
        }

        let domain_name = match &self.domain_name {
            Some(name) => name.clone(),
            None => return Ok(false),
        };

        let site = self
            .registry
            .upsert(SiteConnection {
                domain_name,
                handle: Arc::new(session.handle()),
                peer_addr: self.peer_addr,
            })
            .await;

        let epoch = match site.try_claim_heartbeat_slot() {
            Some(epoch) => epoch,
            None => {
                warn!("site '{}' already has an active heartbeat channel", site.domain_name);
                return Ok(false);
            }
        };

        self.heartbeat_channel_opened = true;
        self.site = Some(site.clone());

        tokio::spawn(async move {
            site.handle_heartbeat(channel, epoch).await;
        });

        Ok(true)
    }

    /// `access-point`/`transport` channels are only ever opened
    /// server→agent (§4.8); an agent opening one inbound is rejected.
    async fn channel_open_direct_tcpip(
        &mut self,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let reason = TunnelError::UnknownChannelType(format!(
            "direct-tcpip:{}:{}",
            host_to_connect, port_to_connect
        ));
        warn!(
            "rejecting channel from '{:?}': {}",
            self.domain_name, reason
        );
        Ok(false)
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        info!(
            "channel {:?} closed on connection from '{:?}'",
            channel, self.domain_name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CertificateAuthority, InMemoryAuthorityStore};
    use russh_keys::ssh_key::certificate::{Builder as CertBuilder, CertType};
    use russh_keys::{Algorithm, PrivateKey};

    fn handler_with(authority: Arc<CertificateAuthority>) -> SshHandler {
        SshHandler::new(
            Arc::new(TrustOracle::new(authority)),
            Arc::new(SiteRegistry::new()),
            None,
        )
    }

    async fn host_cert_for(
        authority: &CertificateAuthority,
        principal: &str,
        valid_before: u64,
    ) -> (PrivateKey, PublicKey) {
        let node_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let host_ca = authority.host_ca_private_key().await.unwrap();

        let cert = CertBuilder::new(&mut rand::thread_rng(), CertType::Host, 0, valid_before, node_key.public_key())
            .and_then(|b| b.valid_principal(principal))
            .and_then(|b| b.sign(&host_ca))
            .unwrap();

        let public_key = PublicKey::from(cert);
        (node_key, public_key)
    }

    #[tokio::test]
    async fn accepts_a_certificate_signed_by_the_trusted_authority_with_matching_principal() {
        let authority = Arc::new(CertificateAuthority::new(Box::new(
            InMemoryAuthorityStore::new().unwrap(),
        )));
        let (_key, cert) = host_cert_for(&authority, "edge-a", u64::MAX).await;

        let mut handler = handler_with(authority);
        let result = handler.auth_publickey("edge-a", &cert).await.unwrap();
        assert!(matches!(result, Auth::Accept));
    }

    #[tokio::test]
    async fn rejects_when_the_declared_user_is_not_a_certificate_principal() {
        let authority = Arc::new(CertificateAuthority::new(Box::new(
            InMemoryAuthorityStore::new().unwrap(),
        )));
        let (_key, cert) = host_cert_for(&authority, "edge-a", u64::MAX).await;

        let mut handler = handler_with(authority);
        let result = handler.auth_publickey("edge-b", &cert).await.unwrap();
        assert!(matches!(result, Auth::Reject { .. }));
    }

    #[tokio::test]
    async fn rejects_a_certificate_signed_by_an_untrusted_authority() {
        let authority = Arc::new(CertificateAuthority::new(Box::new(
            InMemoryAuthorityStore::new().unwrap(),
        )));
        let stray_ca = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let node_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap();
        let cert = CertBuilder::new(&mut rand::thread_rng(), CertType::Host, 0, u64::MAX, node_key.public_key())
            .and_then(|b| b.valid_principal("edge-a"))
            .and_then(|b| b.sign(&stray_ca))
            .unwrap();

        let mut handler = handler_with(authority);
        let result = handler
            .auth_publickey("edge-a", &PublicKey::from(cert))
            .await
            .unwrap();
        assert!(matches!(result, Auth::Reject { .. }));
    }

    #[tokio::test]
    async fn rejects_a_non_certificate_key() {
        let authority = Arc::new(CertificateAuthority::new(Box::new(
            InMemoryAuthorityStore::new().unwrap(),
        )));
        let plain = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .unwrap()
            .public_key();

        let mut handler = handler_with(authority);
        let result = handler.auth_publickey("edge-a", &plain).await.unwrap();
        assert!(matches!(result, Auth::Reject { .. }));
    }
}
