//! Error types for the tunnel core and the join/CA surface.

use thiserror::Error;

/// Errors surfaced by the reverse-tunnel server and its per-site state.
///
/// The core never retries; every variant here is propagated verbatim to
/// whatever called into the tunnel (the SSH handler, the registry, a
/// proxy-side caller). Reconnection is the agent's job, re-dial is the
/// caller's.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Trust oracle, certificate, or principal check failed during auth.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The agent opened a channel type the server never expects inbound.
    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    /// Exact lookup against the site registry missed.
    #[error("site not found: {0}")]
    SiteNotFound(String),

    /// `dial` negotiation came back with a negative reply.
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),

    /// `dial` target is not in the edge's published server inventory.
    #[error("target unknown: {0}")]
    TargetUnknown(String),

    /// Upsert into the registry failed while admitting a new channel.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation attempted against a tunnel that is already gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// Underlying SSH protocol error.
    #[error("SSH protocol error: {0}")]
    SshError(#[from] russh::Error),

    /// I/O error (channel read/write, listener accept, key file access).
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Storage failure from a pluggable backend (token store, authority
    /// store). Propagated with context, never retried by the core.
    #[error("backend error: {0}")]
    BackendError(String),
}

/// Errors surfaced by the join/CA surface (§4.7).
#[derive(Debug, Error)]
pub enum CaError {
    /// Token string didn't parse, or no record exists for it.
    #[error("token invalid")]
    TokenInvalid,

    /// Token's embedded domain didn't match the one presented at join time.
    #[error("domain mismatch")]
    DomainMismatch,

    /// Token's embedded role didn't match the one presented at join time.
    #[error("role mismatch")]
    RoleMismatch,

    /// Certificate or key generation failed.
    #[error("certificate generation failed: {0}")]
    CertGenerationFailed(String),

    /// Credential check failed during `signIn`.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Storage failure from the token or authority backend.
    #[error("backend error: {0}")]
    BackendError(String),
}
