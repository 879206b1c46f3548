//! HTTPS endpoint for the admission hooks, presenting whatever certificate the provider holds

use std::{fmt::Debug, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use rustls::ServerConfig;
use serde_json::{json, Value};
use snafu::{ResultExt, Snafu};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ca_bundle::WebhookKind, cert_provider::CertProvider, watch::sleep_or_cancel};

const CONTENT_TYPE_JSON: &str = "application/json";
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to configure TLS"))]
    ConfigureTls { source: rustls::Error },

    #[snafu(display("failed to bind to {address}"))]
    Bind {
        source: std::io::Error,
        address: SocketAddr,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Decides on admission reviews.
///
/// Reviews are passed through as JSON, their schema is up to the handler.
#[async_trait]
pub trait AdmissionHandler: Send + Sync {
    async fn review(&self, review: Value) -> Value;
}

/// Admits every request.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl AdmissionHandler for AllowAll {
    async fn review(&self, review: Value) -> Value {
        json!({
            "apiVersion": review.get("apiVersion").cloned().unwrap_or_else(|| json!("admission.k8s.io/v1")),
            "kind": "AdmissionReview",
            "response": {
                "uid": review.pointer("/request/uid").cloned().unwrap_or(Value::Null),
                "allowed": true,
            },
        })
    }
}

/// An admission hook served at `path`.
#[derive(Clone)]
pub struct Hook {
    pub path: String,
    pub kind: WebhookKind,
    pub handler: Arc<dyn AdmissionHandler>,
}

impl Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct HealthPaths {
    pub healthz: String,
    pub readyz: String,
}

/// Health probes plus one POST route per hook.
///
/// The readiness probe fails until `provider` holds a certificate.
pub fn router(provider: Arc<CertProvider>, health: &HealthPaths, hooks: &[Hook]) -> Router {
    let mut router = Router::new()
        .route(&health.healthz, get(|| async { "ok" }))
        .route(
            &health.readyz,
            get(move || async move {
                if provider.ready() {
                    (StatusCode::OK, "ok")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "serving certificate not loaded")
                }
            }),
        );
    for hook in hooks {
        let handler = hook.handler.clone();
        router = router.route(
            &hook.path,
            post(move |headers: HeaderMap, body: Bytes| review(handler, headers, body)),
        );
    }
    router
}

async fn review(handler: Arc<dyn AdmissionHandler>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(str::trim);
    if content_type != Some(CONTENT_TYPE_JSON) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("expected Content-Type {CONTENT_TYPE_JSON}"),
        )
            .into_response();
    }
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty admission review").into_response();
    }
    let review = match serde_json::from_slice::<Value>(&body) {
        Ok(review) => review,
        Err(err) => {
            debug!(error = &err as &dyn std::error::Error, "rejecting malformed admission review");
            return (
                StatusCode::BAD_REQUEST,
                format!("malformed admission review: {err}"),
            )
                .into_response();
        }
    };
    Json(handler.review(review).await).into_response()
}

/// Accepts TLS connections on `address` until `cancel` fires, then lets open connections
/// finish their in-flight requests.
pub async fn serve(
    address: SocketAddr,
    app: Router,
    provider: Arc<CertProvider>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut tls_config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context(ConfigureTlsSnafu)?
            .with_no_client_auth()
            .with_cert_resolver(provider);
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(address)
        .await
        .context(BindSnafu { address })?;
    info!(%address, "Serving webhooks");
    while let Some((stream, peer)) = next_connection(|| listener.accept(), cancel).await {
        tokio::spawn(serve_connection(
            acceptor.clone(),
            stream,
            peer,
            app.clone(),
            cancel.clone(),
        ));
    }
    info!(%address, "Stopped serving webhooks");
    Ok(())
}

/// Accepts the next connection, or returns [`None`] once `cancel` fires.
///
/// Accept errors (such as EMFILE) tend to persist for a while, so they are retried after a
/// delay instead of immediately.
async fn next_connection<C, F, Fut>(mut accept: F, cancel: &CancellationToken) -> Option<C>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<C>>,
{
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return None,
            accepted = accept() => accepted,
        };
        match accepted {
            Ok(conn) => return Some(conn),
            Err(err) => {
                warn!(error = &err as &dyn std::error::Error, "failed to accept connection");
                if sleep_or_cancel(ACCEPT_ERROR_DELAY, cancel).await {
                    return None;
                }
            }
        }
    }
}

async fn serve_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    cancel: CancellationToken,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(err) => {
            // Also happens while no certificate has been loaded yet
            debug!(%peer, error = &err as &dyn std::error::Error, "TLS handshake failed");
            return;
        }
    };
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(tls_stream), TowerToHyperService::new(app));
    tokio::pin!(conn);
    let res = tokio::select! {
        res = conn.as_mut() => res,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(err) = res {
        debug!(%peer, error = %err, "connection closed with error");
    }
}
