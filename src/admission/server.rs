//! HTTPS surface of the admission webhook

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use kube::core::DynamicObject;
use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslAcceptor, SslMethod};
use openssl::x509::X509;
use std::any::Any;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::{Validator, VALIDATE_PATH};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

// =============================================================================
// Router
// =============================================================================

/// Shared state of the admission handlers
pub struct AdmissionState {
    pub validator: Validator,
    pub metrics: Arc<Metrics>,
    pub review_timeout: Duration,
}

impl AdmissionState {
    pub fn new(validator: Validator, metrics: Arc<Metrics>, review_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            validator,
            metrics,
            review_timeout,
        })
    }
}

/// Build the admission router
pub fn router(state: Arc<AdmissionState>) -> Router {
    guarded(Router::new().route(VALIDATE_PATH, post(validate)).with_state(state))
}

/// A panicking handler answers 500 and the process keeps serving
fn guarded(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "Admission handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error during admission review").into_response()
}

async fn validate(
    State(state): State<Arc<AdmissionState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected application/json").into_response();
    }
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty body").into_response();
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            debug!(error = %e, "Undecodable admission review");
            return (StatusCode::BAD_REQUEST, format!("invalid admission review: {}", e))
                .into_response();
        }
    };
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid admission review: {}", e))
                .into_response();
        }
    };

    let started = Instant::now();
    let kind = req.kind.kind.clone();
    let operation = format!("{:?}", req.operation).to_uppercase();
    match tokio::time::timeout(state.review_timeout, state.validator.review(&req)).await {
        Ok(response) => {
            state.metrics.record_admission(
                &kind,
                &operation,
                response.allowed,
                started.elapsed().as_secs_f64(),
            );
            (StatusCode::OK, Json(response.into_review())).into_response()
        }
        Err(_) => {
            warn!(kind = %kind, name = %req.name, "Admission review timed out");
            state.metrics.record_admission(
                &kind,
                &operation,
                false,
                started.elapsed().as_secs_f64(),
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "admission review timed out").into_response()
        }
    }
}

// =============================================================================
// TLS Listener
// =============================================================================

/// Acceptor for a PEM certificate chain and private key
pub fn tls_acceptor(cert_pem: &[u8], key_pem: &[u8]) -> Result<SslAcceptor> {
    let cert = X509::from_pem(cert_pem)?;
    let key = PKey::private_key_from_pem(key_pem)?;
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    builder.check_private_key()?;
    Ok(builder.build())
}

/// Serve `app` over TLS until `shutdown` fires. Connections in flight are
/// drained before returning.
pub async fn serve_tls(
    addr: SocketAddr,
    app: Router,
    acceptor: SslAcceptor,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Tls(format!("failed to bind admission server on {}: {}", addr, e)))?;
    info!("Admission webhook listening on https://{}", addr);

    let acceptor = Arc::new(acceptor);
    let connections = TaskTracker::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept admission connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            if let Err(e) = serve_connection(stream, &acceptor, app, shutdown).await {
                debug!(%peer, error = %e, "Admission connection ended with error");
            }
        });
    }

    info!(in_flight = connections.len(), "Admission webhook draining connections");
    connections.close();
    connections.wait().await;
    info!("Admission webhook stopped");
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    acceptor: &SslAcceptor,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let ssl = Ssl::new(acceptor.context())?;
    let mut tls = SslStream::new(ssl, stream)?;
    Pin::new(&mut tls)
        .accept()
        .await
        .map_err(|e| Error::Tls(format!("handshake failed: {}", e)))?;

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(tls), TowerToHyperService::new(app));
    tokio::pin!(conn);

    let cancelled = shutdown.cancelled();
    tokio::pin!(cancelled);
    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                return result.map_err(|e| Error::Tls(e.to_string()));
            }
            _ = &mut cancelled, if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
