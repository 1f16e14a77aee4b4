//! Thin web sign-in surface (§4.7 `signIn`, §3 `Session`). The credential
//! check and session persistence backends are both out of scope (the web
//! service and its cookies, §1); this module only mints the certificate
//! and session record once a credential check passes.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngCore;
use russh_keys::{Algorithm, PrivateKey};

use super::authority::CertificateAuthority;
use crate::error::CaError;

/// Verifies a user's password against the web service. Out of scope to
/// implement here; a real deployment wires this to that service.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify(&self, user: &str, password: &str) -> Result<(), CaError>;
}

/// A web session: `(SID, PID)` plus the short-lived user certificate
/// minted alongside it. TTL fixed at 10 hours (§3, §6).
pub struct Session {
    /// Signed/opaque external handle.
    pub sid: String,
    /// Internal key used to look the session up in storage.
    pub pid: String,
    pub user: String,
    pub certificate: russh_keys::ssh_key::Certificate,
    pub private_key: PrivateKey,
    pub expires_at: Instant,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// `signIn(user, password)`: verify credentials, mint a user certificate
/// and session, and return it. Persistence of the session record is the
/// caller's job (out of scope here, same as the credential backend).
pub async fn sign_in(
    credentials: &dyn CredentialStore,
    authority: &CertificateAuthority,
    user: &str,
    password: &str,
    session_ttl: Duration,
) -> Result<Session, CaError> {
    credentials.verify(user, password).await?;

    let private_key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .map_err(|e| CaError::CertGenerationFailed(e.to_string()))?;
    let user_ca = authority.user_ca_private_key().await?;

    let valid_after = unix_now();
    let valid_before = valid_after + session_ttl.as_secs();

    let certificate = russh_keys::ssh_key::certificate::Builder::new(
        &mut rand::thread_rng(),
        russh_keys::ssh_key::certificate::CertType::User,
        valid_after,
        valid_before,
        private_key.public_key(),
    )
    .and_then(|b| b.valid_principal(user))
    .and_then(|b| b.sign(&user_ca))
    .map_err(|e| CaError::CertGenerationFailed(e.to_string()))?;

    Ok(Session {
        sid: random_hex(),
        pid: random_hex(),
        user: user.to_string(),
        certificate,
        private_key,
        expires_at: Instant::now() + session_ttl,
    })
}

fn random_hex() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::authority::InMemoryAuthorityStore;

    struct AlwaysOk;

    #[async_trait]
    impl CredentialStore for AlwaysOk {
        async fn verify(&self, _user: &str, _password: &str) -> Result<(), CaError> {
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl CredentialStore for AlwaysFails {
        async fn verify(&self, _user: &str, _password: &str) -> Result<(), CaError> {
            Err(CaError::InvalidCredentials)
        }
    }

    #[tokio::test]
    async fn successful_sign_in_mints_a_session() {
        let authority = CertificateAuthority::new(Box::new(InMemoryAuthorityStore::new().unwrap()));
        let session = sign_in(&AlwaysOk, &authority, "alice", "hunter2", Duration::from_secs(10 * 60 * 60))
            .await
            .unwrap();

        assert_eq!(session.user, "alice");
        assert!(!session.is_expired());
        assert_eq!(
            session.certificate.valid_principals(),
            &["alice".to_string()]
        );
    }

    #[tokio::test]
    async fn bad_credentials_reject_sign_in() {
        let authority = CertificateAuthority::new(Box::new(InMemoryAuthorityStore::new().unwrap()));
        let err = sign_in(&AlwaysFails, &authority, "alice", "wrong", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::InvalidCredentials));
    }
}
