//! Self-managed TLS for Kubernetes admission webhooks
//!
//! Every replica serves the admission hooks with the certificate found in the serving
//! certificate Secret ([`cert_provider`], [`server`]). A single elected replica
//! ([`leader_election`]) keeps the CA and the serving certificate fresh ([`cert_manager`]), and
//! propagates the CA into the webhook configurations that the API server reads ([`ca_bundle`]).
//! Leadership and rotation activity is exported over HTTP ([`metrics`]).

use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt as _;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::{
        admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
        coordination::v1::Lease,
        core::v1::{ConfigMap, Secret},
    },
    kube::{Api, Client},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    ca_bundle::CaBundleSyncer,
    cert_manager::CertManager,
    cert_provider::CertProvider,
    config::WebhookTlsConfig,
    leader_election::{LeaderElector, LeadershipHandler},
    metrics::Metrics,
    server::Hook,
    store::ObjectStore,
    watch::WatchBackoff,
};

pub mod ca_bundle;
pub mod cert_manager;
pub mod cert_provider;
pub mod config;
pub mod leader_election;
pub mod metrics;
pub mod pki;
pub mod server;
pub mod store;
pub mod watch;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("certificate provider failed"))]
    CertProvider { source: cert_provider::Error },

    #[snafu(display("webhook server failed"))]
    Server { source: server::Error },

    #[snafu(display("metrics server failed"))]
    Metrics { source: metrics::Error },

    #[snafu(display("certificate manager failed"))]
    CertManager { source: cert_manager::Error },

    #[snafu(display("CA bundle syncer failed"))]
    CaBundleSyncer { source: ca_bundle::Error },

    #[snafu(display("leader election failed"))]
    LeaderElection { source: store::Error },

    #[snafu(display("{task} task panicked"))]
    TaskPanicked { task: &'static str },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The stores that every subsystem reads from and writes to.
#[derive(Clone)]
pub struct Stores {
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    pub leases: Arc<dyn ObjectStore<Lease>>,
    pub mutating_webhooks: Arc<dyn ObjectStore<MutatingWebhookConfiguration>>,
    pub validating_webhooks: Arc<dyn ObjectStore<ValidatingWebhookConfiguration>>,
}

impl Stores {
    /// Namespaced objects live in `namespace`, webhook configurations are cluster-scoped.
    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self {
            secrets: Arc::new(Api::<Secret>::namespaced(client.clone(), namespace)),
            config_maps: Arc::new(Api::<ConfigMap>::namespaced(client.clone(), namespace)),
            leases: Arc::new(Api::<Lease>::namespaced(client.clone(), namespace)),
            mutating_webhooks: Arc::new(Api::<MutatingWebhookConfiguration>::all(client.clone())),
            validating_webhooks: Arc::new(Api::<ValidatingWebhookConfiguration>::all(client)),
        }
    }
}

/// Runs the webhook until `shutdown` fires or any subsystem fails permanently.
pub async fn run(
    client: Client,
    config: WebhookTlsConfig,
    hooks: Vec<Hook>,
    shutdown: CancellationToken,
) -> Result<()> {
    let stores = Stores::from_client(client, &config.namespace);
    run_with_stores(stores, config, hooks, shutdown).await
}

pub async fn run_with_stores(
    stores: Stores,
    config: WebhookTlsConfig,
    hooks: Vec<Hook>,
    shutdown: CancellationToken,
) -> Result<()> {
    let cancel = shutdown.child_token();
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<Error>();
    let mut tasks = Tasks {
        set: JoinSet::new(),
        fatal: fatal_tx,
    };
    let backoff = config.watch_backoff;
    let metrics = Metrics::default();

    let provider = Arc::new(
        CertProvider::new(
            stores.secrets.clone(),
            &config.namespace,
            &config.cert_manager.cert_secret_name,
        )
        .with_metrics(metrics.clone()),
    );
    tasks.spawn("certificate provider", {
        let provider = provider.clone();
        let cancel = cancel.clone();
        async move {
            provider
                .start(&cancel, backoff)
                .await
                .context(CertProviderSnafu)
        }
    });
    tasks.spawn("server", {
        let app = server::router(provider.clone(), &config.health, &hooks);
        let address = config.address;
        let cancel = cancel.clone();
        async move {
            server::serve(address, app, provider, &cancel)
                .await
                .context(ServerSnafu)
        }
    });

    if let Some(metrics_config) = &config.metrics {
        tasks.spawn("metrics", {
            let app = metrics::router(metrics.clone(), &metrics_config.path);
            let address = metrics_config.address;
            let cancel = cancel.clone();
            async move {
                metrics::serve(address, app, &cancel)
                    .await
                    .context(MetricsSnafu)
            }
        });
    }

    let leader_tasks = Arc::new(LeaderTasks {
        cert_manager: Arc::new(
            CertManager::new(
                stores.secrets.clone(),
                stores.config_maps.clone(),
                config.cert_manager.clone(),
            )
            .with_metrics(metrics.clone()),
        ),
        syncer: Arc::new(
            CaBundleSyncer::new(
                stores.config_maps.clone(),
                stores.mutating_webhooks.clone(),
                stores.validating_webhooks.clone(),
                &config.namespace,
                &config.cert_manager.ca_bundle_config_map_name,
                ca_bundle::determine_webhook_refs(
                    &config.name,
                    hooks.iter().map(|hook| hook.kind),
                ),
                config.ca_bundle_resync_interval,
            )
            .with_metrics(metrics.clone()),
        ),
        backoff,
        metrics,
        fatal: tasks.fatal.clone(),
        running: Mutex::new(None),
    });
    match config.leader_election.clone() {
        Some(leader_election) => {
            let elector = LeaderElector::new(stores.leases.clone(), leader_election);
            let cancel = cancel.clone();
            tasks.spawn("leader election", async move {
                // Each run covers one term, stand for election again until shut down
                while !cancel.is_cancelled() {
                    elector
                        .run(&cancel, leader_tasks.as_ref())
                        .await
                        .context(LeaderElectionSnafu)?;
                }
                Ok::<_, Error>(())
            });
        }
        None => {
            info!("Leader election is disabled, managing certificates unconditionally");
            let cancel = cancel.clone();
            tasks.spawn("certificate management", async move {
                manage_certificates(
                    &leader_tasks.cert_manager,
                    &leader_tasks.syncer,
                    leader_tasks.backoff,
                    &cancel,
                )
                .await
            });
        }
    }

    let result = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutdown requested");
            Ok(())
        }
        Some(err) = fatal_rx.recv() => {
            error!(error = &err as &dyn std::error::Error, "Shutting down after fatal error");
            Err(err)
        }
    };
    cancel.cancel();
    tasks.drain(config.drain_timeout).await;
    result
}

/// Tasks whose fatal errors are forwarded to one shared channel.
struct Tasks {
    set: JoinSet<()>,
    fatal: mpsc::UnboundedSender<Error>,
}

impl Tasks {
    fn spawn(
        &mut self,
        task: &'static str,
        fut: impl Future<Output = Result<()>> + Send + 'static,
    ) {
        let fatal = self.fatal.clone();
        self.set.spawn(async move {
            let res = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(res) => res,
                Err(_) => TaskPanickedSnafu { task }.fail(),
            };
            if let Err(err) = res {
                // The receiver is only gone once shutdown has begun
                let _ = fatal.send(err);
            }
        });
    }

    async fn drain(mut self, timeout: Duration) {
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.set.join_next().await {
                if let Err(err) = joined {
                    warn!(error = &err as &dyn std::error::Error, "task ended abnormally");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                timeout = ?timeout,
                remaining = self.set.len(),
                "tasks did not stop in time, aborting them"
            );
            self.set.abort_all();
        }
    }
}

/// The work that only the leader may do, restarted for every leadership term.
struct LeaderTasks {
    cert_manager: Arc<CertManager>,
    syncer: Arc<CaBundleSyncer>,
    backoff: WatchBackoff,
    metrics: Metrics,
    fatal: mpsc::UnboundedSender<Error>,
    running: Mutex<Option<JoinHandle<()>>>,
}

async fn manage_certificates(
    cert_manager: &CertManager,
    syncer: &CaBundleSyncer,
    backoff: WatchBackoff,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::try_join!(
        async { cert_manager.start(cancel).await.context(CertManagerSnafu) },
        async {
            syncer
                .start(cancel, backoff)
                .await
                .context(CaBundleSyncerSnafu)
        },
    )?;
    Ok(())
}

#[async_trait]
impl LeadershipHandler for LeaderTasks {
    async fn started_leading(&self, term: CancellationToken) {
        self.metrics.set_leader(true);
        let cert_manager = self.cert_manager.clone();
        let syncer = self.syncer.clone();
        let backoff = self.backoff;
        let fatal = self.fatal.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = manage_certificates(&cert_manager, &syncer, backoff, &term).await {
                let _ = fatal.send(err);
            }
        });
        *self.running.lock().await = Some(handle);
    }

    async fn stopped_leading(&self) {
        let running = self.running.lock().await.take();
        if let Some(handle) = running {
            if let Err(err) = handle.await {
                error!(error = &err as &dyn std::error::Error, "certificate management panicked");
                let _ = self.fatal.send(Error::TaskPanicked {
                    task: "certificate management",
                });
            }
        }
        self.metrics.set_leader(false);
    }
}
