//! Command line and environment configuration, and the defaults derived from the webhook name

use std::{
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
};

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::time::Duration;

use crate::{
    ca_bundle::{self, WebhookKind},
    cert_manager::CertManagerConfig,
    leader_election::LeaderElectionConfig,
    server::HealthPaths,
    watch::WatchBackoff,
};

const SERVICE_ACCOUNT_NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("webhook name must not be empty"))]
    EmptyName,

    #[snafu(display("at least one hook must be configured"))]
    NoHooks,

    #[snafu(display("invalid hook {hook:?}, expected \"<kind>:<path>\" with an absolute path"))]
    InvalidHook { hook: String },

    #[snafu(display("invalid kind for hook {hook:?}"))]
    InvalidHookKind {
        source: ca_bundle::Error,
        hook: String,
    },

    #[snafu(display("{what} refresh ({refresh}) must be shorter than its validity ({validity})"))]
    RefreshNotBelowValidity {
        what: &'static str,
        refresh: Duration,
        validity: Duration,
    },

    #[snafu(display("invalid metrics path {path:?}, expected an absolute path"))]
    InvalidMetricsPath { path: String },

    #[snafu(display("{shorter} ({shorter_value}) must be shorter than {longer} ({longer_value})"))]
    InvalidLeaseTiming {
        shorter: &'static str,
        shorter_value: Duration,
        longer: &'static str,
        longer_value: Duration,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The process cannot start with an invalid configuration.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// An admission hook as configured on the command line: `<kind>:<path>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookSpec {
    pub kind: WebhookKind,
    pub path: String,
}

impl FromStr for HookSpec {
    type Err = Error;

    fn from_str(hook: &str) -> Result<Self> {
        let (kind, path) = hook
            .split_once(':')
            .filter(|(_, path)| path.starts_with('/'))
            .context(InvalidHookSnafu { hook })?;
        Ok(Self {
            kind: WebhookKind::parse(kind).context(InvalidHookKindSnafu { hook })?,
            path: path.to_string(),
        })
    }
}

#[derive(clap::Args, Clone, Debug)]
pub struct WebhookTlsOpts {
    /// Logical name of the webhook, the names of all managed objects default to derivations of it
    #[arg(long, env = "WEBHOOK_NAME")]
    pub name: String,

    /// Namespace of the managed Secrets, ConfigMap and Lease [default: the pod's namespace]
    #[arg(long, env = "WEBHOOK_NAMESPACE")]
    pub namespace: Option<String>,

    /// Service that the API server calls the webhook through [default: <NAME>]
    #[arg(long, env = "WEBHOOK_SERVICE_NAME")]
    pub service_name: Option<String>,

    /// [default: <NAME>-ca]
    #[arg(long, env = "WEBHOOK_CA_SECRET_NAME")]
    pub ca_secret_name: Option<String>,

    /// [default: <NAME>-cert]
    #[arg(long, env = "WEBHOOK_CERT_SECRET_NAME")]
    pub cert_secret_name: Option<String>,

    /// [default: <NAME>-ca-bundle]
    #[arg(long, env = "WEBHOOK_CA_BUNDLE_CONFIG_MAP_NAME")]
    pub ca_bundle_config_map_name: Option<String>,

    /// Admission hooks to serve, as `<kind>:<path>` (for example `mutating:/mutate`)
    #[arg(long = "hook", env = "WEBHOOK_HOOKS", value_delimiter = ',')]
    pub hooks: Vec<HookSpec>,

    #[arg(long, env = "WEBHOOK_PORT", default_value_t = 8443)]
    pub port: u16,

    #[arg(long, env = "WEBHOOK_HEALTHZ_PATH", default_value = "/healthz")]
    pub healthz_path: String,

    #[arg(long, env = "WEBHOOK_READYZ_PATH", default_value = "/readyz")]
    pub readyz_path: String,

    #[arg(long, env = "KUBERNETES_CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    #[arg(long, env = "WEBHOOK_CA_VALIDITY", default_value = "2d")]
    pub ca_validity: Duration,

    /// Replace the CA once it expires within this window
    #[arg(long, env = "WEBHOOK_CA_REFRESH", default_value = "1d")]
    pub ca_refresh: Duration,

    #[arg(long, env = "WEBHOOK_CERT_VALIDITY", default_value = "1d")]
    pub cert_validity: Duration,

    /// Replace the serving certificate once it expires within this window
    #[arg(long, env = "WEBHOOK_CERT_REFRESH", default_value = "12h")]
    pub cert_refresh: Duration,

    /// How often the leader checks the certificates
    #[arg(long, env = "WEBHOOK_RECONCILE_INTERVAL", default_value = "1m")]
    pub reconcile_interval: Duration,

    /// How often the CA bundle is rewritten into the webhook configurations, even without changes
    #[arg(long, env = "WEBHOOK_CA_BUNDLE_RESYNC_INTERVAL", default_value = "5m")]
    pub ca_bundle_resync_interval: Duration,

    #[arg(long, env = "WEBHOOK_WATCH_BACKOFF_INITIAL", default_value = "1s")]
    pub watch_backoff_initial: Duration,

    #[arg(long, env = "WEBHOOK_WATCH_BACKOFF_MAX", default_value = "30s")]
    pub watch_backoff_max: Duration,

    /// Run the certificate manager on a single elected replica.
    /// Only disable this when running a single replica.
    #[arg(
        long,
        env = "WEBHOOK_LEADER_ELECTION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub leader_election: bool,

    /// [default: <NAME>-leader]
    #[arg(long, env = "WEBHOOK_LEASE_NAME")]
    pub lease_name: Option<String>,

    #[arg(long, env = "WEBHOOK_LEASE_DURATION", default_value = "30s")]
    pub lease_duration: Duration,

    #[arg(long, env = "WEBHOOK_RENEW_DEADLINE", default_value = "10s")]
    pub renew_deadline: Duration,

    #[arg(long, env = "WEBHOOK_RETRY_PERIOD", default_value = "5s")]
    pub retry_period: Duration,

    /// Serve Prometheus metrics over plain HTTP
    #[arg(
        long,
        env = "WEBHOOK_METRICS_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub metrics_enabled: bool,

    #[arg(long, env = "WEBHOOK_METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    #[arg(long, env = "WEBHOOK_METRICS_PATH", default_value = "/metrics")]
    pub metrics_path: String,

    /// How long to wait for tasks to wind down after shutdown was requested
    #[arg(long, env = "WEBHOOK_DRAIN_TIMEOUT", default_value = "5s")]
    pub drain_timeout: Duration,
}

/// Fully resolved and validated configuration.
#[derive(Clone, Debug)]
pub struct WebhookTlsConfig {
    pub name: String,
    pub namespace: String,
    pub address: SocketAddr,
    pub health: HealthPaths,
    pub hooks: Vec<HookSpec>,
    pub cert_manager: CertManagerConfig,
    pub ca_bundle_resync_interval: std::time::Duration,
    pub watch_backoff: WatchBackoff,
    /// [`None`] if leader election is disabled.
    pub leader_election: Option<LeaderElectionConfig>,
    /// [`None`] if the metrics endpoint is disabled.
    pub metrics: Option<MetricsConfig>,
    pub drain_timeout: std::time::Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsConfig {
    pub address: SocketAddr,
    pub path: String,
}

impl WebhookTlsOpts {
    /// Resolves the configuration against the environment of the current pod.
    pub fn resolve(self) -> Result<WebhookTlsConfig> {
        self.resolve_with(
            |var| std::env::var(var).ok(),
            || std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_PATH).ok(),
        )
    }

    fn resolve_with(
        self,
        env: impl Fn(&str) -> Option<String>,
        service_account_namespace: impl FnOnce() -> Option<String>,
    ) -> Result<WebhookTlsConfig> {
        let name = self.name.trim().to_string();
        ensure!(!name.is_empty(), EmptyNameSnafu);
        ensure!(!self.hooks.is_empty(), NoHooksSnafu);
        ensure!(
            self.ca_refresh < self.ca_validity,
            RefreshNotBelowValiditySnafu {
                what: "CA",
                refresh: self.ca_refresh,
                validity: self.ca_validity,
            }
        );
        ensure!(
            self.cert_refresh < self.cert_validity,
            RefreshNotBelowValiditySnafu {
                what: "certificate",
                refresh: self.cert_refresh,
                validity: self.cert_validity,
            }
        );
        if self.leader_election {
            ensure!(
                self.renew_deadline < self.lease_duration,
                InvalidLeaseTimingSnafu {
                    shorter: "renew deadline",
                    shorter_value: self.renew_deadline,
                    longer: "lease duration",
                    longer_value: self.lease_duration,
                }
            );
            ensure!(
                self.retry_period < self.renew_deadline,
                InvalidLeaseTimingSnafu {
                    shorter: "retry period",
                    shorter_value: self.retry_period,
                    longer: "renew deadline",
                    longer_value: self.renew_deadline,
                }
            );
        }

        if self.metrics_enabled {
            ensure!(
                self.metrics_path.starts_with('/'),
                InvalidMetricsPathSnafu {
                    path: self.metrics_path,
                }
            );
        }

        let non_empty = |value: Option<String>| value.filter(|value| !value.trim().is_empty());
        let namespace = non_empty(self.namespace)
            .or_else(|| non_empty(env("POD_NAMESPACE")))
            .or_else(|| non_empty(service_account_namespace()))
            .map_or_else(|| DEFAULT_NAMESPACE.to_string(), |ns| ns.trim().to_string());
        let identity = non_empty(env("POD_NAME"))
            .or_else(|| non_empty(env("HOSTNAME")))
            .unwrap_or_else(|| format!("{name}-{}", uuid::Uuid::new_v4()));

        let leader_election = self.leader_election.then(|| LeaderElectionConfig {
            lease_name: self
                .lease_name
                .unwrap_or_else(|| format!("{name}-leader")),
            identity,
            lease_duration: *self.lease_duration,
            renew_deadline: *self.renew_deadline,
            retry_period: *self.retry_period,
        });
        Ok(WebhookTlsConfig {
            address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            health: HealthPaths {
                healthz: self.healthz_path,
                readyz: self.readyz_path,
            },
            hooks: self.hooks,
            cert_manager: CertManagerConfig {
                namespace: namespace.clone(),
                service_name: self.service_name.unwrap_or_else(|| name.clone()),
                cluster_domain: self.cluster_domain,
                ca_secret_name: self
                    .ca_secret_name
                    .unwrap_or_else(|| format!("{name}-ca")),
                cert_secret_name: self
                    .cert_secret_name
                    .unwrap_or_else(|| format!("{name}-cert")),
                ca_bundle_config_map_name: self
                    .ca_bundle_config_map_name
                    .unwrap_or_else(|| format!("{name}-ca-bundle")),
                ca_validity: self.ca_validity,
                ca_refresh: self.ca_refresh,
                cert_validity: self.cert_validity,
                cert_refresh: self.cert_refresh,
                reconcile_interval: self.reconcile_interval,
            },
            ca_bundle_resync_interval: *self.ca_bundle_resync_interval,
            watch_backoff: WatchBackoff {
                initial: *self.watch_backoff_initial,
                max: *self.watch_backoff_max,
            },
            leader_election,
            metrics: self.metrics_enabled.then(|| MetricsConfig {
                address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.metrics_port)),
                path: self.metrics_path,
            }),
            drain_timeout: *self.drain_timeout,
            namespace,
            name,
        })
    }
}
