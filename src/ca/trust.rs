//! Trust oracle (§4.2): decides whether an offered SSH public key belongs
//! to a trusted host certificate authority.

use std::sync::Arc;

use russh_keys::PublicKey;

use super::authority::CertificateAuthority;

/// `isTrusted(publicKey) -> bool`. Loads the full trusted authority set
/// on every call (local host CA + federated host CAs) and does a
/// byte-equal comparison in SSH wire form. The set is small enough that a
/// linear scan is the right call.
pub struct TrustOracle {
    authority: Arc<CertificateAuthority>,
}

impl TrustOracle {
    pub fn new(authority: Arc<CertificateAuthority>) -> Self {
        Self { authority }
    }

    /// Returns `true` iff `key` byte-equals some authority in the current
    /// trusted set. Any failure reading the authority store is treated as
    /// fail-closed: an authority we can't load can't vouch for anything.
    pub async fn is_trusted(&self, key: &PublicKey) -> bool {
        let authorities = match self.authority.trusted_host_authorities().await {
            Ok(authorities) => authorities,
            Err(_) => return false,
        };

        authorities.iter().any(|authority| authority == key)
    }
}
