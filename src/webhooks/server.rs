//! Validating admission endpoint for Etcd resources

use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::post};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::policies::{ValidationContext, validate_all};
use crate::crd::Etcd;

/// `admission.k8s.io/v1` AdmissionReview as sent by the API server
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub object: Option<serde_json::Value>,
    pub old_object: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
const ADMISSION_KIND: &str = "AdmissionReview";

pub fn create_webhook_router() -> Router {
    Router::new().route("/validate", post(validate_etcd))
}

pub(crate) async fn validate_etcd(Json(review): Json<AdmissionReview>) -> impl IntoResponse {
    let AdmissionReview {
        api_version,
        kind,
        request,
    } = review;
    match request {
        Some(request) => (
            StatusCode::OK,
            Json(envelope(api_version, kind, decide(request))),
        ),
        None => {
            warn!(%api_version, "AdmissionReview without a request");
            (
                StatusCode::BAD_REQUEST,
                Json(envelope(
                    api_version,
                    kind,
                    deny("", "AdmissionReview carries no request", None),
                )),
            )
        }
    }
}

/// Review one request
///
/// Deletions are never blocked. An unreadable stored object on update is
/// reviewed as a create, so immutability checks are skipped rather than
/// wedging the resource.
fn decide(request: AdmissionRequest) -> AdmissionResponse {
    let uid = request.uid.as_str();
    debug!(
        %uid,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        "Reviewing Etcd"
    );

    if request.operation == "DELETE" {
        return admit(uid);
    }

    let Some(object) = request.object else {
        return deny(uid, "request carries no object", None);
    };
    let etcd: Etcd = match serde_json::from_value(object) {
        Ok(etcd) => etcd,
        Err(e) => return deny(uid, &format!("object is not a valid Etcd: {e}"), None),
    };
    let stored: Option<Etcd> = request
        .old_object
        .and_then(|old| match serde_json::from_value(old) {
            Ok(etcd) => Some(etcd),
            Err(e) => {
                warn!(%uid, error = %e, "Stored Etcd unreadable, reviewing as create");
                None
            }
        });

    let ctx = ValidationContext::new(&etcd, stored.as_ref());
    let result = validate_all(&ctx);
    if result.allowed {
        info!(%uid, create = ctx.is_create(), "Etcd admitted");
        return admit(uid);
    }

    let reason = result.reason.unwrap_or_else(|| "ValidationFailed".to_string());
    let message = result.message.unwrap_or_else(|| reason.clone());
    warn!(%uid, %reason, %message, "Etcd refused");
    deny(uid, &message, Some(&reason))
}

fn admit(uid: &str) -> AdmissionResponse {
    AdmissionResponse {
        uid: uid.to_string(),
        allowed: true,
        status: None,
    }
}

fn deny(uid: &str, message: &str, reason: Option<&str>) -> AdmissionResponse {
    AdmissionResponse {
        uid: uid.to_string(),
        allowed: false,
        status: Some(AdmissionStatus {
            code: 403,
            message: message.to_string(),
            reason: reason.map(str::to_string),
        }),
    }
}

/// Wrap a response in the review envelope the request arrived in
fn envelope(api_version: String, kind: String, response: AdmissionResponse) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: if api_version.is_empty() {
            ADMISSION_API_VERSION.to_string()
        } else {
            api_version
        },
        kind: if kind.is_empty() {
            ADMISSION_KIND.to_string()
        } else {
            kind
        },
        response,
    }
}

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";

/// Serve `/validate` over TLS until the server fails
///
/// Certificate and key are PEM files, normally mounted from the webhook
/// serving secret.
pub async fn run_webhook_server(
    port: u16,
    cert_path: &str,
    key_path: &str,
) -> Result<(), WebhookError> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let app = create_webhook_router();

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "Webhook server listening");

    axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()))?;

    Ok(())
}

/// Errors that can occur when running the webhook server
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Webhook server error: {0}")]
    Server(String),
}
