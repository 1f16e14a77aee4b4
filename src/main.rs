//! Reverse-tunnel control plane entry point.
//!
//! Starts the SSH listener agents dial into (§4.8) and, alongside it, the
//! HTTP management API operators and provisioning tooling use to mint
//! join tokens and inspect site status (§4.7, §9).
//!
//! ## Usage
//! ```bash
//! TUNNEL_AUTHORITY_HOSTNAME=cluster.example cargo run
//! ```

use std::sync::Arc;
use std::time::Duration;

use log::info;

use tunnelgate::ca::{CertificateAuthority, InMemoryAuthorityStore, InMemoryTokenStore, TrustOracle};
use tunnelgate::management::{self, ManagementState};
use tunnelgate::tunnel::SiteRegistry;
use tunnelgate::{config, key, ssh};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    config::init();
    info!("starting reverse-tunnel control plane...");

    let host_key = key::load_or_generate_server_key()?;

    let authority = Arc::new(CertificateAuthority::new(Box::new(InMemoryAuthorityStore::new()?)));
    let trust = Arc::new(TrustOracle::new(authority.clone()));
    let registry = Arc::new(SiteRegistry::new());
    let tokens: Arc<dyn tunnelgate::ca::TokenStore> = Arc::new(InMemoryTokenStore::new());

    let management_state = Arc::new(ManagementState {
        registry: registry.clone(),
        authority: authority.clone(),
        tokens: tokens.clone(),
    });
    let management_addr = config::get().management_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = management::run_management_api(management_state, &management_addr).await {
            log::error!("management API exited: {}", e);
        }
    });

    let ssh_config = russh::server::Config {
        methods: russh::MethodSet::PUBLICKEY,
        server_id: russh::SshId::Standard("SSH-2.0-tunnelgate".to_string()),
        keys: vec![host_key],
        inactivity_timeout: Some(Duration::from_secs(1800)),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    };
    let ssh_config = Arc::new(ssh_config);

    let mut server = ssh::TunnelServer::new(trust, registry);
    let bind_addr = config::get().bind_addr.clone();
    info!("SSH tunnel listener on {}", bind_addr);

    use russh::server::Server;
    server.run_on_address(ssh_config, bind_addr).await?;

    Ok(())
}
