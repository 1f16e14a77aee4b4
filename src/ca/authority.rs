//! Certificate authority: holds the local host/user CA keypairs and the
//! set of federated host CAs, and mints certificates for joining agents.

use std::sync::RwLock;

use async_trait::async_trait;
use log::info;
use russh_keys::{Algorithm, PrivateKey, PublicKey};

use crate::error::CaError;

/// Where CA key material and federated authority records live. The real
/// backend is a persistent KV store (out of scope, §1); this trait is the
/// seam, with an in-memory default good enough for a single process and
/// for tests.
#[async_trait]
pub trait AuthorityStore: Send + Sync {
    async fn host_ca(&self) -> Result<PrivateKey, CaError>;
    async fn user_ca(&self) -> Result<PrivateKey, CaError>;
    /// `passphrase` protects the key material at rest in a persistent
    /// backend (§4.7 `resetHostCA(passphrase)`); the in-memory store has
    /// nothing to encrypt and ignores it.
    async fn set_host_ca(&self, key: PrivateKey, passphrase: &str) -> Result<(), CaError>;
    /// See `set_host_ca`; same contract for the user CA.
    async fn set_user_ca(&self, key: PrivateKey, passphrase: &str) -> Result<(), CaError>;
    async fn federated_host_authorities(&self) -> Result<Vec<PublicKey>, CaError>;
    async fn add_federated_host_authority(&self, key: PublicKey) -> Result<(), CaError>;
}

/// In-memory `AuthorityStore`. Generates fresh host/user CA keys on first
/// use so a process can stand up without any external provisioning step.
pub struct InMemoryAuthorityStore {
    host_ca: RwLock<PrivateKey>,
    user_ca: RwLock<PrivateKey>,
    federated: RwLock<Vec<PublicKey>>,
}

impl InMemoryAuthorityStore {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            host_ca: RwLock::new(PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?),
            user_ca: RwLock::new(PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?),
            federated: RwLock::new(Vec::new()),
        })
    }
}

#[async_trait]
impl AuthorityStore for InMemoryAuthorityStore {
    async fn host_ca(&self) -> Result<PrivateKey, CaError> {
        Ok(self.host_ca.read().unwrap().clone())
    }

    async fn user_ca(&self) -> Result<PrivateKey, CaError> {
        Ok(self.user_ca.read().unwrap().clone())
    }

    async fn set_host_ca(&self, key: PrivateKey, _passphrase: &str) -> Result<(), CaError> {
        *self.host_ca.write().unwrap() = key;
        Ok(())
    }

    async fn set_user_ca(&self, key: PrivateKey, _passphrase: &str) -> Result<(), CaError> {
        *self.user_ca.write().unwrap() = key;
        Ok(())
    }

    async fn federated_host_authorities(&self) -> Result<Vec<PublicKey>, CaError> {
        Ok(self.federated.read().unwrap().clone())
    }

    async fn add_federated_host_authority(&self, key: PublicKey) -> Result<(), CaError> {
        self.federated.write().unwrap().push(key);
        Ok(())
    }
}

/// Owns the trusted authority set and the rotation operations in §4.7.
/// The tunnel core never caches what this reads; every authentication
/// re-derives the trusted set from `store` so rotation takes effect
/// immediately (§9, "Global CA state").
pub struct CertificateAuthority {
    store: Box<dyn AuthorityStore>,
}

impl CertificateAuthority {
    pub fn new(store: Box<dyn AuthorityStore>) -> Self {
        Self { store }
    }

    pub async fn host_ca_public_key(&self) -> Result<PublicKey, CaError> {
        Ok(self.store.host_ca().await?.public_key())
    }

    pub async fn host_ca_private_key(&self) -> Result<PrivateKey, CaError> {
        self.store.host_ca().await
    }

    pub async fn user_ca_private_key(&self) -> Result<PrivateKey, CaError> {
        self.store.user_ca().await
    }

    /// The union of the local host CA and every federated host CA,
    /// recomputed fresh on each call, never cached (§3, §9).
    pub async fn trusted_host_authorities(&self) -> Result<Vec<PublicKey>, CaError> {
        let mut authorities = vec![self.host_ca_public_key().await?];
        authorities.extend(self.store.federated_host_authorities().await?);
        Ok(authorities)
    }

    pub async fn add_federated_host_authority(&self, key: PublicKey) -> Result<(), CaError> {
        self.store.add_federated_host_authority(key).await
    }

    /// `resetHostCA(passphrase)`: generate a fresh host CA keypair.
    /// Existing certificates remain valid until their TTL; there is no
    /// revocation. `passphrase` is handed to the backing store so a
    /// persistent implementation can encrypt the key material with it.
    pub async fn reset_host_ca(&self, passphrase: &str) -> Result<(), CaError> {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .map_err(|e| CaError::BackendError(e.to_string()))?;
        info!("rotating host CA");
        self.store.set_host_ca(key, passphrase).await
    }

    /// `resetUserCA(passphrase)`: same, for the user CA.
    pub async fn reset_user_ca(&self, passphrase: &str) -> Result<(), CaError> {
        let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
            .map_err(|e| CaError::BackendError(e.to_string()))?;
        info!("rotating user CA");
        self.store.set_user_ca(key, passphrase).await
    }
}
