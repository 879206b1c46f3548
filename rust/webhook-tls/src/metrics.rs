//! Prometheus metrics for leadership and certificate rotation, served over plain HTTP

use std::{fmt::Debug, net::SocketAddr, sync::Arc};

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use snafu::{ResultExt, Snafu};
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cert_manager::ReconcileOutcome;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind metrics endpoint to {address}"))]
    Bind {
        source: std::io::Error,
        address: SocketAddr,
    },

    #[snafu(display("failed to serve metrics"))]
    Serve { source: std::io::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_fatal(&self) -> bool {
        true
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: String,
}

impl ResultLabels {
    fn of(success: bool) -> Self {
        Self {
            result: if success { "success" } else { "error" }.to_string(),
        }
    }
}

/// Handles to every metric this process exports.
///
/// Clones share the same registry, so each subsystem can hold its own copy.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    leader: Gauge,
    reconciles: Family<ResultLabels, Counter>,
    ca_rotations: Counter,
    cert_rotations: Counter,
    ca_bundle_syncs: Family<ResultLabels, Counter>,
    ca_expiry: Gauge,
    serving_cert_expiry: Gauge,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("leader", &self.leader.get())
            .finish_non_exhaustive()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let leader = Gauge::default();
        registry.register(
            "webhook_tls_leader",
            "Whether this replica currently holds the leader lease",
            leader.clone(),
        );

        // Counters get their _total suffix from the encoder
        let reconciles = Family::<ResultLabels, Counter>::default();
        registry.register(
            "webhook_tls_reconciles",
            "Certificate reconcile passes by result",
            reconciles.clone(),
        );
        let ca_rotations = Counter::default();
        registry.register(
            "webhook_tls_ca_rotations",
            "CA certificates provisioned by this replica",
            ca_rotations.clone(),
        );
        let cert_rotations = Counter::default();
        registry.register(
            "webhook_tls_cert_rotations",
            "Serving certificates provisioned by this replica",
            cert_rotations.clone(),
        );
        let ca_bundle_syncs = Family::<ResultLabels, Counter>::default();
        registry.register(
            "webhook_tls_ca_bundle_syncs",
            "CA bundle injections into the webhook configurations by result",
            ca_bundle_syncs.clone(),
        );

        let ca_expiry = Gauge::default();
        registry.register(
            "webhook_tls_ca_expiry_timestamp_seconds",
            "Expiry of the current CA certificate as a Unix timestamp",
            ca_expiry.clone(),
        );
        let serving_cert_expiry = Gauge::default();
        registry.register(
            "webhook_tls_serving_cert_expiry_timestamp_seconds",
            "Expiry of the certificate presented to clients as a Unix timestamp",
            serving_cert_expiry.clone(),
        );

        Self {
            registry: Arc::new(registry),
            leader,
            reconciles,
            ca_rotations,
            cert_rotations,
            ca_bundle_syncs,
            ca_expiry,
            serving_cert_expiry,
        }
    }

    pub fn set_leader(&self, leading: bool) {
        self.leader.set(i64::from(leading));
    }

    pub fn reconcile_succeeded(&self, outcome: &ReconcileOutcome) {
        self.reconciles.get_or_create(&ResultLabels::of(true)).inc();
        if outcome.ca_rotated {
            self.ca_rotations.inc();
        }
        if outcome.cert_rotated {
            self.cert_rotations.inc();
        }
    }

    pub fn reconcile_failed(&self) {
        self.reconciles.get_or_create(&ResultLabels::of(false)).inc();
    }

    pub fn ca_bundle_synced(&self, success: bool) {
        self.ca_bundle_syncs
            .get_or_create(&ResultLabels::of(success))
            .inc();
    }

    pub fn set_ca_expiry(&self, not_after: OffsetDateTime) {
        self.ca_expiry.set(not_after.unix_timestamp());
    }

    pub fn set_serving_cert_expiry(&self, not_after: OffsetDateTime) {
        self.serving_cert_expiry.set(not_after.unix_timestamp());
    }

    /// Renders every metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(err) = encode(&mut buffer, &self.registry) {
            error!(error = &err as &dyn std::error::Error, "failed to encode metrics");
            return String::new();
        }
        buffer
    }
}

/// A single GET route at `path` exposing `metrics`.
pub fn router(metrics: Metrics, path: &str) -> Router {
    Router::new()
        .route(path, get(scrape))
        .with_state(metrics)
}

async fn scrape(State(metrics): State<Metrics>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], metrics.encode())
}

/// Serves `app` on `address` until `cancel` fires.
pub async fn serve(address: SocketAddr, app: Router, cancel: &CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .context(BindSnafu { address })?;
    serve_on(listener, app, cancel).await
}

async fn serve_on(listener: TcpListener, app: Router, cancel: &CancellationToken) -> Result<()> {
    let address = listener.local_addr().context(ServeSnafu)?;
    info!(%address, "Serving metrics");
    let cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context(ServeSnafu)?;
    info!(%address, "Stopped serving metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tower::ServiceExt as _;

    use super::*;

    async fn scrape_path(app: Router, path: &str) -> (StatusCode, String, String) {
        let response = app
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|value| value.to_str().unwrap().to_string())
            .unwrap_or_default();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn records_leadership_and_rotations() {
        let metrics = Metrics::default();
        metrics.set_leader(true);
        metrics.reconcile_succeeded(&ReconcileOutcome {
            ca_rotated: true,
            ca_bundle_published: true,
            cert_rotated: true,
        });
        metrics.reconcile_succeeded(&ReconcileOutcome::default());
        metrics.reconcile_failed();
        metrics.ca_bundle_synced(true);
        metrics.set_ca_expiry(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap());

        let output = metrics.encode();
        assert!(output.contains("webhook_tls_leader 1\n"), "{output}");
        assert!(output.contains("webhook_tls_reconciles_total{result=\"success\"} 2\n"));
        assert!(output.contains("webhook_tls_reconciles_total{result=\"error\"} 1\n"));
        assert!(output.contains("webhook_tls_ca_rotations_total 1\n"));
        assert!(output.contains("webhook_tls_cert_rotations_total 1\n"));
        assert!(output.contains("webhook_tls_ca_bundle_syncs_total{result=\"success\"} 1\n"));
        assert!(output.contains("webhook_tls_ca_expiry_timestamp_seconds 1700000000\n"));
        assert!(output.contains("webhook_tls_serving_cert_expiry_timestamp_seconds 0\n"));

        // Clones report into the same registry
        metrics.clone().set_leader(false);
        assert!(metrics.encode().contains("webhook_tls_leader 0\n"));
    }

    #[tokio::test]
    async fn serves_metrics_at_the_default_path() {
        let metrics = Metrics::default();
        metrics.set_leader(true);
        let (status, content_type, body) =
            scrape_path(router(metrics.clone(), "/metrics"), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, CONTENT_TYPE);
        assert!(body.contains("webhook_tls_leader 1"));

        let (status, _, _) = scrape_path(router(metrics, "/metrics"), "/custom-metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_metrics_at_a_custom_path() {
        let app = router(Metrics::default(), "/custom-metrics");
        let (status, _, body) = scrape_path(app.clone(), "/custom-metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("webhook_tls_reconciles"));
        let (status, _, _) = scrape_path(app, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let cancel = cancel.clone();
            async move { serve_on(listener, router(Metrics::default(), "/metrics"), &cancel).await }
        });

        let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("webhook_tls_leader"));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("metrics server did not stop in time")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_failures_are_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap();
        let res = serve(
            address,
            router(Metrics::default(), "/metrics"),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(res, Err(Error::Bind { .. })));
    }
}
