//! Certificate authority and join surface (§4.7): CA key custody, trust
//! decisions, join tokens, and the operations that turn a token into an
//! issued identity.

pub mod authority;
pub mod join;
pub mod token;
pub mod trust;
pub mod web;

pub use authority::{AuthorityStore, CertificateAuthority, InMemoryAuthorityStore};
pub use join::{register_auth_server, register_using_token, IssuedIdentity, SecretSealer};
pub use token::{generate_token, validate_token, InMemoryTokenStore, JoinToken, Role, TokenStore};
pub use trust::TrustOracle;
pub use web::{sign_in, CredentialStore, Session};
