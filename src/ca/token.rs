//! Join tokens (§3, §4.7): one-shot credentials binding `(domain, role)`,
//! exchanged for a minted host certificate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngCore;

use crate::error::CaError;

/// The role a joining party claims: an edge agent (`Node`) or a
/// federating peer (`AuthServer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Node,
    AuthServer,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Node => "node",
            Role::AuthServer => "auth-server",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "node" => Some(Role::Node),
            "auth-server" => Some(Role::AuthServer),
            _ => None,
        }
    }
}

/// A stored join token record: opaque hex value plus the domain/role it
/// was minted for, and when it expires.
#[derive(Debug, Clone)]
pub struct JoinToken {
    pub hex: String,
    pub domain_name: String,
    pub role: Role,
    pub expires_at: Instant,
}

impl JoinToken {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Where join tokens live between minting and redemption. The real
/// backend is a persistent KV store with native TTL support (out of
/// scope); this trait is the seam.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn put(&self, token: JoinToken) -> Result<(), CaError>;
    async fn get(&self, hex: &str) -> Result<Option<JoinToken>, CaError>;
    /// Atomic with respect to `get`: a token can be deleted exactly once.
    async fn delete(&self, hex: &str) -> Result<(), CaError>;
}

#[derive(Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<String, JoinToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn put(&self, token: JoinToken) -> Result<(), CaError> {
        self.tokens.write().unwrap().insert(token.hex.clone(), token);
        Ok(())
    }

    async fn get(&self, hex: &str) -> Result<Option<JoinToken>, CaError> {
        let tokens = self.tokens.read().unwrap();
        Ok(tokens.get(hex).filter(|t| !t.is_expired()).cloned())
    }

    async fn delete(&self, hex: &str) -> Result<(), CaError> {
        self.tokens.write().unwrap().remove(hex);
        Ok(())
    }
}

/// Draw 16 random bytes, hex-encode, and wrap in the wire format
/// `<hex>.<role>` (§6). Persists `{token, domainName, role, ttl}`.
pub async fn generate_token(
    store: &dyn TokenStore,
    node_name: &str,
    role: Role,
    ttl: Duration,
) -> Result<String, CaError> {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex = hex::encode(bytes);

    store
        .put(JoinToken {
            hex: hex.clone(),
            domain_name: node_name.to_string(),
            role,
            expires_at: Instant::now() + ttl,
        })
        .await?;

    Ok(format!("{}.{}", hex, role.as_str()))
}

/// Split the external token, fetch its record, and fail with
/// `DomainMismatch` if the record's domain disagrees with `domain_name`.
/// Does not consume the token; that happens only on a successful join
/// (§3, §4.7).
pub async fn validate_token(
    store: &dyn TokenStore,
    token: &str,
    domain_name: &str,
) -> Result<Role, CaError> {
    let hex = split_hex(token)?;
    let record = store.get(hex).await?.ok_or(CaError::TokenInvalid)?;

    if record.domain_name != domain_name {
        return Err(CaError::DomainMismatch);
    }

    Ok(record.role)
}

fn split_hex(token: &str) -> Result<&str, CaError> {
    token.split('.').next().filter(|h| !h.is_empty()).ok_or(CaError::TokenInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_returns_the_generated_role() {
        let store = InMemoryTokenStore::new();
        let token = generate_token(&store, "edge-a", Role::Node, Duration::from_secs(3600))
            .await
            .unwrap();

        let role = validate_token(&store, &token, "edge-a").await.unwrap();
        assert_eq!(role, Role::Node);
    }

    #[tokio::test]
    async fn domain_mismatch_does_not_consume_the_token() {
        let store = InMemoryTokenStore::new();
        let token = generate_token(&store, "edge-a", Role::Node, Duration::from_secs(3600))
            .await
            .unwrap();

        let err = validate_token(&store, &token, "edge-b").await.unwrap_err();
        assert!(matches!(err, CaError::DomainMismatch));

        // Still present, still valid for the original domain.
        assert!(validate_token(&store, &token, "edge-a").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let store = InMemoryTokenStore::new();
        let err = validate_token(&store, "deadbeef.node", "edge-a").await.unwrap_err();
        assert!(matches!(err, CaError::TokenInvalid));
    }

    #[tokio::test]
    async fn malformed_wire_format_is_invalid() {
        let store = InMemoryTokenStore::new();
        let err = validate_token(&store, "", "edge-a").await.unwrap_err();
        assert!(matches!(err, CaError::TokenInvalid));
    }
}
