//! Serves the current certificate to the TLS layer, on every replica
//!
//! Only ever reads the serving certificate Secret, so it is safe to run regardless of leadership.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret, kube::runtime::reflector::ObjectRef,
};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    metrics::Metrics,
    pki::{self, CertifiedKeyPair},
    store::{self, ObjectStore},
    watch::{watch_object, WatchBackoff},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no serving certificate has been loaded yet"))]
    NotLoaded,

    #[snafu(display("failed to load serving certificate {secret}"))]
    LoadSecret {
        source: store::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("serving certificate {secret} is invalid"))]
    InvalidCertificate {
        source: pki::Error,
        secret: ObjectRef<Secret>,
    },

    #[snafu(display("failed to encode serving certificate"))]
    EncodeCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("serving certificate key is not supported by the TLS stack"))]
    UnsupportedKey { source: rustls::Error },

    #[snafu(display("failed to watch serving certificate"), context(false))]
    WatchSecret { source: store::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::LoadSecret { source, .. } | Error::WatchSecret { source } => source.is_fatal(),
            Error::NotLoaded
            | Error::InvalidCertificate { .. }
            | Error::EncodeCertificate { .. }
            | Error::UnsupportedKey { .. } => false,
        }
    }
}

/// An immutable, fully validated certificate and key, ready to be handed to rustls.
pub struct ServingCertificate {
    der: Vec<u8>,
    not_after: OffsetDateTime,
    certified_key: Arc<CertifiedKey>,
}

impl ServingCertificate {
    pub fn from_key_pair(key_pair: &CertifiedKeyPair) -> Result<Self> {
        let der = key_pair
            .certificate
            .to_der()
            .context(EncodeCertificateSnafu)?;
        let key_der = key_pair
            .private_key
            .private_key_to_pkcs8()
            .context(EncodeCertificateSnafu)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
            PrivatePkcs8KeyDer::from(key_der),
        ))
        .context(UnsupportedKeySnafu)?;
        Ok(Self {
            certified_key: Arc::new(CertifiedKey::new(
                vec![CertificateDer::from(der.clone())],
                signing_key,
            )),
            der,
            not_after: key_pair.not_after(),
        })
    }

    /// The DER encoding of the certificate, exactly as presented in the handshake.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }
}

impl Debug for ServingCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingCertificate")
            .field("subject", &self.certificate.subject_name())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

pub struct CertProvider {
    secrets: Arc<dyn ObjectStore<Secret>>,
    namespace: String,
    secret_name: String,
    // Only replaced whole, so handshakes never observe a certificate paired with another key
    current: RwLock<Option<Arc<ServingCertificate>>>,
    ready: AtomicBool,
    metrics: Metrics,
}

impl Debug for CertProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertProvider")
            .field("secret", &self.secret_ref())
            .field("ready", &self.ready())
            .finish_non_exhaustive()
    }
}

impl CertProvider {
    pub fn new(secrets: Arc<dyn ObjectStore<Secret>>, namespace: &str, secret_name: &str) -> Self {
        Self {
            secrets,
            namespace: namespace.to_string(),
            secret_name: secret_name.to_string(),
            current: RwLock::new(None),
            ready: AtomicBool::new(false),
            metrics: Metrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    fn secret_ref(&self) -> ObjectRef<Secret> {
        ObjectRef::new(&self.secret_name).within(&self.namespace)
    }

    /// Whether a valid certificate has been loaded, and TLS connections can be accepted.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn get_certificate(&self) -> Result<Arc<ServingCertificate>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotLoaded)
    }

    /// Loads the current certificate, and then follows every change until `cancel` fires.
    pub async fn start(&self, cancel: &CancellationToken, backoff: WatchBackoff) -> Result<()> {
        info!(secret = %self.secret_ref(), "Starting certificate provider");
        match self.load_certificate().await {
            Err(err) if err.is_fatal() => return Err(err),
            res => self.log_rejected(res),
        }
        watch_object(
            &*self.secrets,
            &self.secret_name,
            backoff,
            cancel,
            |secret| async move {
                self.log_rejected(self.on_secret_update(&secret));
                Ok::<_, Error>(())
            },
        )
        .await?;
        info!("Stopping certificate provider");
        Ok(())
    }

    fn log_rejected(&self, res: Result<()>) {
        if let Err(err) = res {
            warn!(
                secret = %self.secret_ref(),
                error = &err as &dyn std::error::Error,
                "Ignoring serving certificate, keeping the previous one"
            );
        }
    }

    /// Reads the Secret once. A Secret that does not exist yet is not an error.
    pub async fn load_certificate(&self) -> Result<()> {
        let secret = self
            .secrets
            .get_opt(&self.secret_name)
            .await
            .with_context(|_| LoadSecretSnafu {
                secret: self.secret_ref(),
            })?;
        match secret {
            Some(secret) => self.on_secret_update(&secret),
            None => {
                debug!(
                    secret = %self.secret_ref(),
                    "Serving certificate does not exist yet, waiting for it to be created"
                );
                Ok(())
            }
        }
    }

    /// Swaps in the certificate from `secret`, if it is complete and valid.
    ///
    /// Anything else is rejected and leaves the served certificate (and readiness) untouched.
    pub fn on_secret_update(&self, secret: &Secret) -> Result<()> {
        let key_pair =
            CertifiedKeyPair::from_secret_data(secret.data.as_ref().unwrap_or(&BTreeMap::new()))
                .with_context(|_| InvalidCertificateSnafu {
                    secret: self.secret_ref(),
                })?;
        let serving = Arc::new(ServingCertificate::from_key_pair(&key_pair)?);
        let unchanged = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|current| current.der == serving.der);
        if !unchanged {
            info!(
                secret = %self.secret_ref(),
                cert_expires_at = %serving.not_after(),
                "Serving new certificate"
            );
        }
        self.metrics.set_serving_cert_expiry(serving.not_after());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(serving);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }
}

impl ResolvesServerCert for CertProvider {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.get_certificate()
            .map(|serving| serving.certified_key())
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use stackable_operator::{
        k8s_openapi::{
            api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString,
        },
        time::Duration as CertDuration,
    };
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{pki, store::memory::MemoryStore};

    fn key_pair() -> CertifiedKeyPair {
        let ca = pki::new_self_signed_ca("test-ca", CertDuration::from_days_unchecked(2)).unwrap();
        pki::new_server_certificate(
            &ca,
            &pki::service_dns_names("hook", "webhooks", "cluster.local"),
            CertDuration::from_days_unchecked(1),
        )
        .unwrap()
    }

    fn secret(data: BTreeMap<String, ByteString>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("hook-cert".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..Secret::default()
        }
    }

    fn provider(store: &Arc<MemoryStore<Secret>>) -> CertProvider {
        CertProvider::new(store.clone(), "webhooks", "hook-cert")
    }

    fn served_der(provider: &CertProvider) -> Vec<u8> {
        provider.get_certificate().unwrap().der().to_vec()
    }

    #[test]
    fn not_ready_until_loaded() {
        let provider = provider(&Arc::new(MemoryStore::new()));
        assert!(!provider.ready());
        assert!(matches!(provider.get_certificate(), Err(Error::NotLoaded)));
    }

    #[test]
    fn swaps_in_valid_certificates() {
        let provider = provider(&Arc::new(MemoryStore::new()));
        let first = key_pair();
        provider
            .on_secret_update(&secret(first.to_secret_data().unwrap()))
            .unwrap();
        assert!(provider.ready());
        assert_eq!(served_der(&provider), first.certificate.to_der().unwrap());

        let second = key_pair();
        provider
            .on_secret_update(&secret(second.to_secret_data().unwrap()))
            .unwrap();
        let served = provider.get_certificate().unwrap();
        assert_eq!(served.der(), second.certificate.to_der().unwrap());
        assert_ne!(served.der(), first.certificate.to_der().unwrap());
        assert_eq!(
            served.certified_key().cert[0].as_ref(),
            second.certificate.to_der().unwrap().as_slice()
        );
    }

    #[test]
    fn rejects_incomplete_or_mismatched_material() {
        let provider = provider(&Arc::new(MemoryStore::new()));
        let good = key_pair();
        let other = key_pair();

        let mut missing_key = good.to_secret_data().unwrap();
        missing_key.remove(pki::SECRET_KEY_KEY);
        assert!(provider.on_secret_update(&secret(missing_key)).is_err());
        let mut garbage = good.to_secret_data().unwrap();
        garbage.insert(
            pki::SECRET_KEY_CERT.to_string(),
            ByteString(b"garbage".to_vec()),
        );
        assert!(provider.on_secret_update(&secret(garbage)).is_err());
        assert!(provider.on_secret_update(&Secret::default()).is_err());
        assert!(!provider.ready());

        provider
            .on_secret_update(&secret(good.to_secret_data().unwrap()))
            .unwrap();
        let mut mismatched = good.to_secret_data().unwrap();
        mismatched.insert(
            pki::SECRET_KEY_KEY.to_string(),
            other.to_secret_data().unwrap()[pki::SECRET_KEY_KEY].clone(),
        );
        let err = provider.on_secret_update(&secret(mismatched)).unwrap_err();
        assert!(!err.is_fatal());
        assert!(provider.ready());
        assert_eq!(served_der(&provider), good.certificate.to_der().unwrap());
    }

    #[tokio::test]
    async fn missing_secret_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        let provider = provider(&store);
        provider.load_certificate().await.unwrap();
        assert!(!provider.ready());

        store.put(secret(key_pair().to_secret_data().unwrap()));
        provider.load_certificate().await.unwrap();
        assert!(provider.ready());
    }

    #[tokio::test]
    async fn follows_rotations() {
        let store = Arc::new(MemoryStore::new());
        let provider = provider(&store);
        let cancel = CancellationToken::new();
        let first = key_pair();
        let second = key_pair();

        let (res, ()) = tokio::join!(provider.start(&cancel, WatchBackoff::default()), async {
            store.put(secret(first.to_secret_data().unwrap()));
            while !provider.ready() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            store.put(secret(second.to_secret_data().unwrap()));
            while served_der(&provider) != second.certificate.to_der().unwrap() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            cancel.cancel();
        });
        res.unwrap();
    }

    #[test]
    fn reports_the_served_certificate_expiry() {
        let metrics = Metrics::default();
        let provider = provider(&Arc::new(MemoryStore::new())).with_metrics(metrics.clone());
        let key_pair = key_pair();
        provider
            .on_secret_update(&secret(key_pair.to_secret_data().unwrap()))
            .unwrap();
        assert!(metrics.encode().contains(&format!(
            "webhook_tls_serving_cert_expiry_timestamp_seconds {}\n",
            key_pair.not_after().unix_timestamp()
        )));
    }
}
