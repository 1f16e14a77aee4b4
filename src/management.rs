//! Management API: HTTP endpoints over the site registry and the join/CA
//! surface, for operators and provisioning tooling rather than agents.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::ca::{generate_token, register_using_token, CertificateAuthority, Role, TokenStore};
use crate::tunnel::{SiteRegistry, SiteStatus};

pub struct ManagementState {
    pub registry: Arc<SiteRegistry>,
    pub authority: Arc<CertificateAuthority>,
    pub tokens: Arc<dyn TokenStore>,
}

#[derive(Debug, Serialize)]
pub struct SiteResponse {
    pub domain_name: String,
    pub status: &'static str,
    pub last_heartbeat_unix: i64,
}

#[derive(Debug, Serialize)]
pub struct SitesListResponse {
    pub sites: Vec<SiteResponse>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct GenerateTokenRequest {
    pub node_name: String,
    pub role: String,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GenerateTokenResponse {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct HostAuthorityResponse {
    pub openssh_authorized_key: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetCaRequest {
    pub passphrase: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub token: String,
    pub node_name: String,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub openssh_private_key: String,
    pub openssh_certificate: String,
}

/// GET /ca/host-authority, the host CA's public key, in the form agents
/// pin as their `@cert-authority` trust anchor before joining.
async fn host_authority(
    State(state): State<Arc<ManagementState>>,
) -> Result<Json<HostAuthorityResponse>, (StatusCode, Json<ErrorResponse>)> {
    let key = state.authority.host_ca_public_key().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
    })?;

    Ok(Json(HostAuthorityResponse {
        openssh_authorized_key: key.to_openssh().unwrap_or_default(),
    }))
}

/// GET /sites: list every site the registry has ever seen, online or not.
async fn list_sites(State(state): State<Arc<ManagementState>>) -> Json<SitesListResponse> {
    let sites = state
        .registry
        .list()
        .into_iter()
        .map(|site| SiteResponse {
            domain_name: site.domain_name.clone(),
            status: match site.get_status() {
                SiteStatus::Online => "online",
                SiteStatus::Offline => "offline",
            },
            last_heartbeat_unix: site.last_heartbeat_unix(),
        })
        .collect();

    Json(SitesListResponse { sites })
}

/// DELETE /sites/:domain: force-disconnect a site's live connection. The
/// registry entry survives and reports offline (§3: sites are never
/// explicitly destroyed).
async fn disconnect_site(
    State(state): State<Arc<ManagementState>>,
    Path(domain_name): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    info!("management API: disconnect request for site '{}'", domain_name);

    match state.registry.get_exact(&domain_name) {
        Ok(site) => {
            site.disconnect("disconnected by administrator").await;
            Ok(Json(SuccessResponse {
                success: true,
                message: format!("site '{}' disconnected", domain_name),
            }))
        }
        Err(e) => {
            error!("management API: disconnect failed for '{}': {}", domain_name, e);
            Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("site not found: {}", domain_name),
                }),
            ))
        }
    }
}

/// POST /tokens: mint a join token for a not-yet-connected node (§4.7).
async fn issue_token(
    State(state): State<Arc<ManagementState>>,
    Json(req): Json<GenerateTokenRequest>,
) -> Result<Json<GenerateTokenResponse>, (StatusCode, Json<ErrorResponse>)> {
    let role = Role::parse(&req.role).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("unknown role '{}'", req.role),
            }),
        )
    })?;

    let ttl = Duration::from_secs(req.ttl_secs.unwrap_or_else(|| crate::config::get().join_token_ttl.as_secs()));

    let token = generate_token(state.tokens.as_ref(), &req.node_name, role, ttl)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: e.to_string() }),
            )
        })?;

    Ok(Json(GenerateTokenResponse { token }))
}

/// POST /join: trade a one-time join token for a host certificate
/// (§4.7 `registerUsingToken`). The wire surface an edge agent's
/// provisioning step actually calls; the real SSH handshake that follows
/// never touches this API.
async fn join_node(
    State(state): State<Arc<ManagementState>>,
    Json(req): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, (StatusCode, Json<ErrorResponse>)> {
    let role = Role::parse(&req.role).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("unknown role '{}'", req.role),
            }),
        )
    })?;

    let authority_hostname = crate::config::get().authority_hostname.clone();
    let identity = register_using_token(
        state.tokens.as_ref(),
        state.authority.as_ref(),
        &authority_hostname,
        &req.token,
        &req.node_name,
        role,
    )
    .await
    .map_err(|e| {
        let status = match &e {
            crate::CaError::TokenInvalid
            | crate::CaError::DomainMismatch
            | crate::CaError::RoleMismatch => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse { error: e.to_string() }))
    })?;

    let openssh_private_key = identity
        .private_key
        .to_openssh(russh_keys::ssh_key::LineEnding::LF)
        .map(|s| s.to_string())
        .unwrap_or_default();
    let openssh_certificate = identity.certificate.to_openssh().unwrap_or_default();

    Ok(Json(JoinResponse {
        openssh_private_key,
        openssh_certificate,
    }))
}

/// POST /ca/reset-host-ca: rotate the host CA keypair (§4.7
/// `resetHostCA(passphrase)`). Existing certificates remain valid until
/// their TTL; there is no revocation.
async fn reset_host_ca(
    State(state): State<Arc<ManagementState>>,
    Json(req): Json<ResetCaRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    state.authority.reset_host_ca(&req.passphrase).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
    })?;
    Ok(Json(SuccessResponse {
        success: true,
        message: "host CA rotated".to_string(),
    }))
}

/// POST /ca/reset-user-ca: rotate the user CA keypair (§4.7
/// `resetUserCA(passphrase)`).
async fn reset_user_ca(
    State(state): State<Arc<ManagementState>>,
    Json(req): Json<ResetCaRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    state.authority.reset_user_ca(&req.passphrase).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
    })?;
    Ok(Json(SuccessResponse {
        success: true,
        message: "user CA rotated".to_string(),
    }))
}

pub fn create_management_router(state: Arc<ManagementState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ca/host-authority", get(host_authority))
        .route("/sites", get(list_sites))
        .route("/sites/{domain}", delete(disconnect_site))
        .route("/tokens", post(issue_token))
        .route("/join", post(join_node))
        .route("/ca/reset-host-ca", post(reset_host_ca))
        .route("/ca/reset-user-ca", post(reset_user_ca))
        .layer(cors)
        .with_state(state)
}

pub async fn run_management_api(state: Arc<ManagementState>, addr: &str) -> anyhow::Result<()> {
    let router = create_management_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("management API listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
