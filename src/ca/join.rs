//! Join/CA surface (§4.7): exchanges a one-time token for a host
//! certificate, the entry point that yields the certificates §4.3 checks.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::info;
use russh_keys::ssh_key::certificate::{Builder as CertBuilder, CertType};
use russh_keys::{Algorithm, PrivateKey, PublicKey};

use super::authority::CertificateAuthority;
use super::token::{Role, TokenStore};
use crate::error::CaError;

/// Result of a successful node join: the keypair the agent should use
/// going forward, and the host certificate binding it to its principal.
pub struct IssuedIdentity {
    pub private_key: PrivateKey,
    pub certificate: russh_keys::ssh_key::Certificate,
}

/// Sentinel for "no expiry" host certificates (§4.7: `ttl = infinite`).
/// OpenSSH certificates use `u64::MAX` to mean "valid forever".
const CERT_VALID_FOREVER: u64 = u64::MAX;

/// `registerUsingToken`: validate the token, require the caller's claimed
/// role to match the token's role, mint a fresh keypair and host
/// certificate, and delete the token, in that order, so a failed mint
/// leaves the token consumable.
pub async fn register_using_token(
    token_store: &dyn TokenStore,
    authority: &CertificateAuthority,
    authority_hostname: &str,
    token: &str,
    node_name: &str,
    claimed_role: Role,
) -> Result<IssuedIdentity, CaError> {
    let record_role = super::token::validate_token(token_store, token, node_name).await?;
    if record_role != claimed_role {
        return Err(CaError::RoleMismatch);
    }

    let identity = mint_host_certificate(
        authority,
        node_name,
        claimed_role,
        authority_hostname,
        CERT_VALID_FOREVER,
    )
    .await?;

    // Only delete on success; a failed mint leaves the token usable again.
    let hex = token.split('.').next().unwrap_or(token);
    token_store
        .delete(hex)
        .await
        .map_err(|e| CaError::BackendError(e.to_string()))?;

    info!("node '{}' joined as {:?}", node_name, claimed_role);
    Ok(identity)
}

async fn mint_host_certificate(
    authority: &CertificateAuthority,
    node_name: &str,
    role: Role,
    authority_hostname: &str,
    valid_before: u64,
) -> Result<IssuedIdentity, CaError> {
    let private_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .map_err(|e| CaError::CertGenerationFailed(e.to_string()))?;

    let host_ca = authority.host_ca_private_key().await?;
    let principal = crate::config::principal_for(node_name, authority_hostname);
    let key_id = format!("{}_{:?}", node_name, role).to_lowercase();

    let valid_after = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let certificate = CertBuilder::new(
        &mut rand::thread_rng(),
        CertType::Host,
        valid_after,
        valid_before,
        private_key.public_key(),
    )
    .and_then(|b| b.key_id(key_id))
    .and_then(|b| b.valid_principal(principal))
    .and_then(|b| b.sign(&host_ca))
    .map_err(|e| CaError::CertGenerationFailed(e.to_string()))?;

    Ok(IssuedIdentity {
        private_key,
        certificate,
    })
}

/// Unwraps a federated join token: the external wire form is opaque to
/// us, a secret service (out of scope) decodes it into the same
/// `(token, node_name, role)` shape a node presents.
#[async_trait]
pub trait SecretSealer: Send + Sync {
    async fn unseal(&self, sealed: &str) -> Result<(String, String, Role), CaError>;
}

/// `register a peer auth server` (§4.7): same token shape, wrapped and
/// unwrapped by `sealer`. On success the joiner's public seal key is
/// recorded in the backend keyring and our own seal key's public half is
/// returned; the seal keyring itself is the secret service's concern, so
/// this only does the token bookkeeping and hands back our half.
pub async fn register_auth_server(
    token_store: &dyn TokenStore,
    sealer: &dyn SecretSealer,
    our_seal_public_key: &PublicKey,
    sealed_token: &str,
) -> Result<PublicKey, CaError> {
    let (token, node_name, claimed_role) = sealer.unseal(sealed_token).await?;
    let record_role = super::token::validate_token(token_store, &token, &node_name).await?;
    if record_role != claimed_role {
        return Err(CaError::RoleMismatch);
    }

    let hex = token.split('.').next().unwrap_or(&token);
    token_store
        .delete(hex)
        .await
        .map_err(|e| CaError::BackendError(e.to_string()))?;

    info!("auth server '{}' federated", node_name);
    Ok(our_seal_public_key.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::authority::InMemoryAuthorityStore;
    use crate::ca::token::{generate_token, InMemoryTokenStore};
    use std::time::Duration;

    fn authority() -> CertificateAuthority {
        CertificateAuthority::new(Box::new(InMemoryAuthorityStore::new().unwrap()))
    }

    #[tokio::test]
    async fn successful_join_deletes_the_token_and_binds_the_principal() {
        let tokens = InMemoryTokenStore::new();
        let ca = authority();

        let token = generate_token(&tokens, "edge-a", Role::Node, Duration::from_secs(60))
            .await
            .unwrap();

        let identity = register_using_token(&tokens, &ca, "cluster.example", &token, "edge-a", Role::Node)
            .await
            .unwrap();

        assert_eq!(
            identity.certificate.valid_principals(),
            &["edge-a.cluster.example".to_string()]
        );

        // Token is gone: a second attempt fails.
        let err = register_using_token(&tokens, &ca, "cluster.example", &token, "edge-a", Role::Node)
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::TokenInvalid));
    }

    #[tokio::test]
    async fn role_mismatch_leaves_the_token_present() {
        let tokens = InMemoryTokenStore::new();
        let ca = authority();

        let token = generate_token(&tokens, "edge-a", Role::Node, Duration::from_secs(60))
            .await
            .unwrap();

        let err = register_using_token(
            &tokens,
            &ca,
            "cluster.example",
            &token,
            "edge-a",
            Role::AuthServer,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CaError::RoleMismatch));

        // Still consumable with the matching role.
        assert!(
            register_using_token(&tokens, &ca, "cluster.example", &token, "edge-a", Role::Node)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn domain_mismatch_leaves_the_token_present() {
        let tokens = InMemoryTokenStore::new();
        let ca = authority();

        let token = generate_token(&tokens, "edge-a", Role::Node, Duration::from_secs(60))
            .await
            .unwrap();

        let err = register_using_token(&tokens, &ca, "cluster.example", &token, "edge-b", Role::Node)
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::DomainMismatch));

        assert!(
            register_using_token(&tokens, &ca, "cluster.example", &token, "edge-a", Role::Node)
                .await
                .is_ok()
        );
    }

    struct StubSealer {
        token: String,
        node_name: String,
        role: Role,
    }

    #[async_trait]
    impl SecretSealer for StubSealer {
        async fn unseal(&self, _sealed: &str) -> Result<(String, String, Role), CaError> {
            Ok((self.token.clone(), self.node_name.clone(), self.role))
        }
    }

    #[tokio::test]
    async fn federated_join_consumes_the_token_and_returns_our_seal_key() {
        let tokens = InMemoryTokenStore::new();
        let token = generate_token(&tokens, "remote-cluster", Role::AuthServer, Duration::from_secs(60))
            .await
            .unwrap();

        let sealer = StubSealer {
            token: token.clone(),
            node_name: "remote-cluster".to_string(),
            role: Role::AuthServer,
        };

        let our_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .unwrap()
            .public_key();

        let returned = register_auth_server(&tokens, &sealer, &our_key, "sealed-blob")
            .await
            .unwrap();
        assert_eq!(returned, our_key);

        let hex = token.split('.').next().unwrap();
        assert!(tokens.get(hex).await.unwrap().is_none());
    }
}
