//! Owns the lifecycle of the CA and the serving certificate, while this replica is the leader

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{ConfigMap, Secret},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
        ByteString,
    },
    kube::runtime::reflector::ObjectRef,
    time::Duration,
};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    metrics::Metrics,
    pki::{self, CertifiedKeyPair},
    store::{self, retry_on_conflict, ObjectStore, DEFAULT_CONFLICT_ATTEMPTS},
    watch::sleep_or_cancel,
};

/// Key of the CA certificate inside the bundle ConfigMap.
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";
/// Records which CA signed the certificate stored in the serving certificate Secret.
pub const CA_FINGERPRINT_ANNOTATION: &str = "webhook-tls.stackable.tech/ca-fingerprint";
const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load CA {secret}"))]
    LoadCa {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to generate CA"))]
    GenerateCa { source: pki::Error },

    #[snafu(display("failed to save CA {secret}"))]
    SaveCa {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to publish CA bundle to {config_map}"))]
    PublishCaBundle {
        source: store::Error,
        config_map: ObjectRef<ConfigMap>,
    },

    #[snafu(display("failed to load serving certificate {secret}"))]
    LoadCertificate {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to generate serving certificate"))]
    GenerateCertificate { source: pki::Error },

    #[snafu(display("failed to save serving certificate {secret}"))]
    SaveCertificate {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to serialize certificate"))]
    SerializeCertificate { source: pki::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::LoadCa { source, .. }
            | Error::SaveCa { source, .. }
            | Error::PublishCaBundle { source, .. }
            | Error::LoadCertificate { source, .. }
            | Error::SaveCertificate { source, .. } => source.is_fatal(),
            Error::GenerateCa { source }
            | Error::GenerateCertificate { source }
            | Error::SerializeCertificate { source } => source.is_fatal(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CertManagerConfig {
    pub namespace: String,
    pub service_name: String,
    pub cluster_domain: String,
    pub ca_secret_name: String,
    pub cert_secret_name: String,
    pub ca_bundle_config_map_name: String,
    pub ca_validity: Duration,
    /// The CA is replaced once it expires within this window.
    pub ca_refresh: Duration,
    pub cert_validity: Duration,
    /// The serving certificate is replaced once it expires within this window.
    pub cert_refresh: Duration,
    pub reconcile_interval: Duration,
}

/// What a single [`CertManager::reconcile`] pass had to change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub ca_rotated: bool,
    pub ca_bundle_published: bool,
    pub cert_rotated: bool,
}

pub struct CertManager {
    secrets: Arc<dyn ObjectStore<Secret>>,
    config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    config: CertManagerConfig,
    metrics: Metrics,
}

impl Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CertManager {
    pub fn new(
        secrets: Arc<dyn ObjectStore<Secret>>,
        config_maps: Arc<dyn ObjectStore<ConfigMap>>,
        config: CertManagerConfig,
    ) -> Self {
        Self {
            secrets,
            config_maps,
            config,
            metrics: Metrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Reconciles once immediately, and then every `reconcile_interval` until `cancel` fires.
    ///
    /// Only fatal errors end the loop, anything else is retried on the next tick.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        info!(
            ca_secret = %self.ca_secret_ref(),
            cert_secret = %self.cert_secret_ref(),
            interval = %self.config.reconcile_interval,
            "Starting certificate manager"
        );
        loop {
            match self.reconcile().await {
                Ok(outcome) => debug!(?outcome, "Reconciled certificates"),
                Err(err) if err.is_fatal() => {
                    error!(
                        error = &err as &dyn std::error::Error,
                        "Certificate manager failed permanently"
                    );
                    return Err(err);
                }
                Err(err) => warn!(
                    error = &err as &dyn std::error::Error,
                    "Failed to reconcile certificates, retrying on next tick"
                ),
            }
            if sleep_or_cancel(*self.config.reconcile_interval, cancel).await {
                info!("Stopping certificate manager");
                return Ok(());
            }
        }
    }

    /// Brings the CA, its published bundle, and the serving certificate up to date.
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let res = self.reconcile_at(OffsetDateTime::now_utc()).await;
        match &res {
            Ok(outcome) => self.metrics.reconcile_succeeded(outcome),
            Err(_) => self.metrics.reconcile_failed(),
        }
        res
    }

    async fn reconcile_at(&self, now: OffsetDateTime) -> Result<ReconcileOutcome> {
        let (ca, ca_rotated) = self.load_or_create_ca(now).await?;
        self.metrics.set_ca_expiry(ca.not_after());
        let ca_bundle_published = self.publish_ca_bundle(&ca).await?;
        let cert_rotated = self.load_or_create_cert(&ca, ca_rotated, now).await?;
        Ok(ReconcileOutcome {
            ca_rotated,
            ca_bundle_published,
            cert_rotated,
        })
    }

    fn ca_secret_ref(&self) -> ObjectRef<Secret> {
        ObjectRef::new(&self.config.ca_secret_name).within(&self.config.namespace)
    }

    fn cert_secret_ref(&self) -> ObjectRef<Secret> {
        ObjectRef::new(&self.config.cert_secret_name).within(&self.config.namespace)
    }

    fn ca_bundle_ref(&self) -> ObjectRef<ConfigMap> {
        ObjectRef::new(&self.config.ca_bundle_config_map_name).within(&self.config.namespace)
    }

    async fn load_or_create_ca(&self, now: OffsetDateTime) -> Result<(CertifiedKeyPair, bool)> {
        let secret_ref = self.ca_secret_ref();
        let existing = self
            .secrets
            .get_opt(&self.config.ca_secret_name)
            .await
            .with_context(|_| LoadCaSnafu {
                secret: secret_ref.clone(),
            })?;
        let current = existing.as_ref().and_then(|secret| {
            CertifiedKeyPair::from_secret_data(secret.data.as_ref().unwrap_or(&BTreeMap::new()))
                .inspect_err(|err| {
                    warn!(
                        secret = %secret_ref,
                        error = err as &dyn std::error::Error,
                        "CA secret is invalid, replacing it"
                    )
                })
                .ok()
        });

        let cutoff_duration = self.config.ca_refresh;
        let cutoff = now + cutoff_duration;
        match current {
            Some(ca) if !ca.expires_within(now, cutoff_duration) => {
                debug!(
                    secret = %secret_ref,
                    %cutoff,
                    ca_expires_at = %ca.not_after(),
                    "CA is not close to expiring, will not initiate rotation"
                );
                return Ok((ca, false));
            }
            Some(ca) => info!(
                secret = %secret_ref,
                %cutoff,
                cutoff.duration = %cutoff_duration,
                ca_expires_at = %ca.not_after(),
                "Provisioning a new CA certificate, because the old one will soon expire"
            ),
            None if existing.is_none() => info!(
                secret = %secret_ref,
                "Provisioning a new CA certificate, because it could not be found"
            ),
            None => {}
        }

        let common_name = format!(
            "{}.{}-ca@{}",
            self.config.service_name,
            self.config.namespace,
            now.unix_timestamp()
        );
        let ca = pki::new_self_signed_ca(&common_name, self.config.ca_validity)
            .context(GenerateCaSnafu)?;
        let data = ca.to_secret_data().context(SerializeCertificateSnafu)?;
        self.save_secret(existing, &self.config.ca_secret_name, data, BTreeMap::new())
            .await
            .context(SaveCaSnafu { secret: secret_ref })?;
        info!(
            secret = %self.ca_secret_ref(),
            ca_expires_at = %ca.not_after(),
            "Saved new CA certificate"
        );
        Ok((ca, true))
    }

    /// Writes the CA certificate into the bundle ConfigMap, unless it is already there.
    async fn publish_ca_bundle(&self, ca: &CertifiedKeyPair) -> Result<bool> {
        let config_map_ref = self.ca_bundle_ref();
        let pem = ca
            .certificate_pem()
            .map(|pem| String::from_utf8_lossy(&pem).into_owned())
            .context(SerializeCertificateSnafu)?;
        let published =
            retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || self.write_ca_bundle(&pem))
                .await
                .context(PublishCaBundleSnafu {
                    config_map: config_map_ref.clone(),
                })?;
        if published {
            info!(config_map = %config_map_ref, "Published CA bundle");
        }
        Ok(published)
    }

    async fn write_ca_bundle(&self, pem: &str) -> store::Result<bool> {
        let name = &self.config.ca_bundle_config_map_name;
        match self.config_maps.get_opt(name).await? {
            Some(cm)
                if cm.data.as_ref().and_then(|data| data.get(CA_BUNDLE_KEY)).map(String::as_str)
                    == Some(pem) =>
            {
                Ok(false)
            }
            Some(mut cm) => {
                cm.data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(CA_BUNDLE_KEY.to_string(), pem.to_string());
                self.config_maps.replace(&cm).await?;
                Ok(true)
            }
            None => {
                self.config_maps
                    .create(&ConfigMap {
                        metadata: ObjectMeta {
                            name: Some(name.clone()),
                            namespace: Some(self.config.namespace.clone()),
                            ..ObjectMeta::default()
                        },
                        data: Some([(CA_BUNDLE_KEY.to_string(), pem.to_string())].into()),
                        ..ConfigMap::default()
                    })
                    .await?;
                Ok(true)
            }
        }
    }

    async fn load_or_create_cert(
        &self,
        ca: &CertifiedKeyPair,
        ca_rotated: bool,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let secret_ref = self.cert_secret_ref();
        let existing = self
            .secrets
            .get_opt(&self.config.cert_secret_name)
            .await
            .with_context(|_| LoadCertificateSnafu {
                secret: secret_ref.clone(),
            })?;
        let ca_fingerprint = ca.fingerprint().context(SerializeCertificateSnafu)?;

        let reason = match &existing {
            None => Some("it could not be found"),
            Some(_) if ca_rotated => Some("the CA was rotated"),
            Some(secret) => {
                let signed_by = secret
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|annotations| annotations.get(CA_FINGERPRINT_ANNOTATION));
                if signed_by != Some(&ca_fingerprint) {
                    Some("it was not signed by the current CA")
                } else {
                    match CertifiedKeyPair::from_secret_data(
                        secret.data.as_ref().unwrap_or(&BTreeMap::new()),
                    ) {
                        Err(err) => {
                            warn!(
                                secret = %secret_ref,
                                error = &err as &dyn std::error::Error,
                                "Serving certificate secret is invalid"
                            );
                            Some("it is invalid")
                        }
                        Ok(cert) if cert.expires_within(now, self.config.cert_refresh) => {
                            Some("it will soon expire")
                        }
                        Ok(cert) => {
                            debug!(
                                secret = %secret_ref,
                                cert_expires_at = %cert.not_after(),
                                "Serving certificate is up to date"
                            );
                            None
                        }
                    }
                }
            }
        };
        let Some(reason) = reason else {
            return Ok(false);
        };

        info!(
            secret = %secret_ref,
            "Provisioning a new serving certificate, because {reason}"
        );
        let dns_names = pki::service_dns_names(
            &self.config.service_name,
            &self.config.namespace,
            &self.config.cluster_domain,
        );
        let cert = pki::new_server_certificate(ca, &dns_names, self.config.cert_validity)
            .context(GenerateCertificateSnafu)?;
        let data = cert.to_secret_data().context(SerializeCertificateSnafu)?;
        self.save_secret(
            existing,
            &self.config.cert_secret_name,
            data,
            [(CA_FINGERPRINT_ANNOTATION.to_string(), ca_fingerprint)].into(),
        )
        .await
        .context(SaveCertificateSnafu {
            secret: secret_ref.clone(),
        })?;
        info!(
            secret = %secret_ref,
            cert_expires_at = %cert.not_after(),
            "Saved new serving certificate"
        );
        Ok(true)
    }

    /// Overwrites the data of `existing`, or creates the Secret if there was none.
    ///
    /// The write is conditional on `existing`'s resourceVersion, so a concurrent writer makes it
    /// fail rather than be overwritten.
    async fn save_secret(
        &self,
        existing: Option<Secret>,
        name: &str,
        data: BTreeMap<String, ByteString>,
        annotations: BTreeMap<String, String>,
    ) -> store::Result<Secret> {
        match existing {
            Some(secret) => {
                let mut metadata = secret.metadata;
                if !annotations.is_empty() {
                    metadata
                        .annotations
                        .get_or_insert_with(BTreeMap::new)
                        .extend(annotations);
                }
                self.secrets
                    .replace(&Secret {
                        metadata,
                        data: Some(data),
                        string_data: None,
                        type_: secret.type_.or_else(|| Some(SECRET_TYPE_TLS.to_string())),
                        ..secret
                    })
                    .await
            }
            None => {
                self.secrets
                    .create(&Secret {
                        metadata: ObjectMeta {
                            name: Some(name.to_string()),
                            namespace: Some(self.config.namespace.clone()),
                            annotations: (!annotations.is_empty()).then_some(annotations),
                            ..ObjectMeta::default()
                        },
                        data: Some(data),
                        type_: Some(SECRET_TYPE_TLS.to_string()),
                        ..Secret::default()
                    })
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stackable_operator::{
        k8s_openapi::{
            api::core::v1::{ConfigMap, Secret},
            apimachinery::pkg::apis::meta::v1::ObjectMeta,
            ByteString,
        },
        time::Duration,
    };

    use super::*;
    use crate::{pki::CertifiedKeyPair, store::memory::MemoryStore};

    struct Fixture {
        secrets: Arc<MemoryStore<Secret>>,
        config_maps: Arc<MemoryStore<ConfigMap>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                secrets: Arc::new(MemoryStore::new()),
                config_maps: Arc::new(MemoryStore::new()),
            }
        }

        fn manager(&self, tweak: impl FnOnce(&mut CertManagerConfig)) -> CertManager {
            let mut config = CertManagerConfig {
                namespace: "webhooks".to_string(),
                service_name: "hook".to_string(),
                cluster_domain: "cluster.local".to_string(),
                ca_secret_name: "hook-ca".to_string(),
                cert_secret_name: "hook-cert".to_string(),
                ca_bundle_config_map_name: "hook-ca-bundle".to_string(),
                ca_validity: Duration::from_days_unchecked(2),
                ca_refresh: Duration::from_days_unchecked(1),
                cert_validity: Duration::from_days_unchecked(1),
                cert_refresh: Duration::from_hours_unchecked(12),
                reconcile_interval: Duration::from_minutes_unchecked(1),
            };
            tweak(&mut config);
            CertManager::new(self.secrets.clone(), self.config_maps.clone(), config)
        }

        fn load(&self, name: &str) -> CertifiedKeyPair {
            CertifiedKeyPair::from_secret_data(&self.secrets.get(name).unwrap().data.unwrap())
                .unwrap()
        }

        fn bundle(&self) -> String {
            self.config_maps.get("hook-ca-bundle").unwrap().data.unwrap()[CA_BUNDLE_KEY].clone()
        }

        fn signed_by(&self) -> String {
            self.secrets.get("hook-cert").unwrap().metadata.annotations.unwrap()
                [CA_FINGERPRINT_ANNOTATION]
                .clone()
        }
    }

    #[tokio::test]
    async fn first_pass_provisions_everything() {
        let fixture = Fixture::new();
        let outcome = fixture.manager(|_| {}).reconcile().await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome {
                ca_rotated: true,
                ca_bundle_published: true,
                cert_rotated: true,
            }
        );

        let ca = fixture.load("hook-ca");
        let cert = fixture.load("hook-cert");
        assert!(cert.certificate.verify(&ca.private_key).unwrap());
        assert_eq!(fixture.signed_by(), ca.fingerprint().unwrap());
        assert_eq!(
            fixture.bundle().as_bytes(),
            ca.certificate_pem().unwrap().as_slice()
        );
        assert!(!fixture.bundle().contains("PRIVATE KEY"));
        let secret = fixture.secrets.get("hook-cert").unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("webhooks"));
    }

    #[tokio::test]
    async fn steady_state_performs_no_writes() {
        let fixture = Fixture::new();
        let manager = fixture.manager(|_| {});
        manager.reconcile().await.unwrap();
        let (secret_writes, config_map_writes) =
            (fixture.secrets.writes(), fixture.config_maps.writes());

        assert_eq!(
            manager.reconcile().await.unwrap(),
            ReconcileOutcome::default()
        );
        assert_eq!(fixture.secrets.writes(), secret_writes);
        assert_eq!(fixture.config_maps.writes(), config_map_writes);
    }

    #[tokio::test]
    async fn expiring_ca_cascades_to_the_serving_certificate() {
        let fixture = Fixture::new();
        fixture.manager(|_| {}).reconcile().await.unwrap();
        let old_ca = fixture.load("hook-ca").fingerprint().unwrap();
        let old_cert = fixture.load("hook-cert").fingerprint().unwrap();

        // Everything issued so far expires within the refresh window
        let outcome = fixture
            .manager(|config| config.ca_refresh = Duration::from_days_unchecked(3))
            .reconcile()
            .await
            .unwrap();
        assert!(outcome.ca_rotated && outcome.ca_bundle_published && outcome.cert_rotated);

        let new_ca = fixture.load("hook-ca");
        assert_ne!(new_ca.fingerprint().unwrap(), old_ca);
        assert_ne!(fixture.load("hook-cert").fingerprint().unwrap(), old_cert);
        assert_eq!(fixture.signed_by(), new_ca.fingerprint().unwrap());
        assert!(fixture
            .load("hook-cert")
            .certificate
            .verify(&new_ca.private_key)
            .unwrap());
        assert_eq!(
            fixture.bundle().as_bytes(),
            new_ca.certificate_pem().unwrap().as_slice()
        );
    }

    #[tokio::test]
    async fn expiring_serving_certificate_keeps_the_ca() {
        let fixture = Fixture::new();
        fixture.manager(|_| {}).reconcile().await.unwrap();
        let ca = fixture.load("hook-ca").fingerprint().unwrap();
        let cert = fixture.load("hook-cert").fingerprint().unwrap();

        let outcome = fixture
            .manager(|config| config.cert_refresh = Duration::from_days_unchecked(2))
            .reconcile()
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome {
                cert_rotated: true,
                ..ReconcileOutcome::default()
            }
        );
        assert_eq!(fixture.load("hook-ca").fingerprint().unwrap(), ca);
        assert_ne!(fixture.load("hook-cert").fingerprint().unwrap(), cert);
    }

    #[tokio::test]
    async fn certificate_from_another_ca_is_replaced() {
        let fixture = Fixture::new();
        let manager = fixture.manager(|_| {});
        manager.reconcile().await.unwrap();

        let mut secret = fixture.secrets.get("hook-cert").unwrap();
        secret
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(CA_FINGERPRINT_ANNOTATION.to_string(), "00".to_string());
        fixture.secrets.put(secret);

        assert!(manager.reconcile().await.unwrap().cert_rotated);
        assert_eq!(
            fixture.signed_by(),
            fixture.load("hook-ca").fingerprint().unwrap()
        );
    }

    #[tokio::test]
    async fn invalid_secrets_are_regenerated() {
        let fixture = Fixture::new();
        for name in ["hook-ca", "hook-cert"] {
            fixture.secrets.put(Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..ObjectMeta::default()
                },
                data: Some(
                    [
                        ("tls.crt".to_string(), ByteString(b"garbage".to_vec())),
                        ("tls.key".to_string(), ByteString(b"garbage".to_vec())),
                    ]
                    .into(),
                ),
                ..Secret::default()
            });
        }

        let outcome = fixture.manager(|_| {}).reconcile().await.unwrap();
        assert!(outcome.ca_rotated && outcome.cert_rotated);
        let ca = fixture.load("hook-ca");
        assert!(fixture
            .load("hook-cert")
            .certificate
            .verify(&ca.private_key)
            .unwrap());
    }

    #[tokio::test]
    async fn tampered_bundle_is_republished() {
        let fixture = Fixture::new();
        let manager = fixture.manager(|_| {});
        manager.reconcile().await.unwrap();

        let mut cm = fixture.config_maps.get("hook-ca-bundle").unwrap();
        cm.data
            .as_mut()
            .unwrap()
            .insert(CA_BUNDLE_KEY.to_string(), String::new());
        cm.data
            .as_mut()
            .unwrap()
            .insert("unrelated".to_string(), "kept".to_string());
        fixture.config_maps.put(cm);

        assert_eq!(
            manager.reconcile().await.unwrap(),
            ReconcileOutcome {
                ca_bundle_published: true,
                ..ReconcileOutcome::default()
            }
        );
        let data = fixture.config_maps.get("hook-ca-bundle").unwrap().data.unwrap();
        assert_eq!(
            data[CA_BUNDLE_KEY].as_bytes(),
            fixture.load("hook-ca").certificate_pem().unwrap().as_slice()
        );
        assert_eq!(data["unrelated"], "kept");
    }

    #[tokio::test]
    async fn store_errors_are_classified() {
        let fixture = Fixture::new();
        let manager = fixture.manager(|_| {});

        fixture.secrets.fail_next(409);
        let err = manager.reconcile().await.unwrap_err();
        assert!(!err.is_fatal());

        fixture.secrets.fail_next(403);
        let err = manager.reconcile().await.unwrap_err();
        assert!(err.is_fatal());

        // Nothing was written by the failed passes, and the next one recovers
        assert_eq!(fixture.secrets.writes(), 0);
        assert!(manager.reconcile().await.unwrap().cert_rotated);
    }

    #[tokio::test]
    async fn start_stops_on_cancellation() {
        let fixture = Fixture::new();
        let manager = fixture.manager(|_| {});
        let cancel = CancellationToken::new();
        cancel.cancel();
        manager.start(&cancel).await.unwrap();
        // The first pass always runs
        assert!(fixture.secrets.get("hook-cert").is_some());
    }

    #[tokio::test]
    async fn reconciles_are_counted() {
        let fixture = Fixture::new();
        let metrics = Metrics::default();
        let manager = fixture.manager(|_| {}).with_metrics(metrics.clone());
        manager.reconcile().await.unwrap();
        manager.reconcile().await.unwrap();
        fixture.secrets.fail_next(500);
        assert!(manager.reconcile().await.is_err());

        let output = metrics.encode();
        assert!(output.contains("webhook_tls_reconciles_total{result=\"success\"} 2\n"));
        assert!(output.contains("webhook_tls_reconciles_total{result=\"error\"} 1\n"));
        assert!(output.contains("webhook_tls_ca_rotations_total 1\n"));
        assert!(output.contains("webhook_tls_cert_rotations_total 1\n"));
        assert!(output.contains(&format!(
            "webhook_tls_ca_expiry_timestamp_seconds {}\n",
            fixture.load("hook-ca").not_after().unix_timestamp()
        )));
    }
}
