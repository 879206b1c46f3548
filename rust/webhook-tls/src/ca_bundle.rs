//! Propagates the published CA bundle into the webhook configurations that must trust it

use std::{
    collections::BTreeSet,
    fmt::{Debug, Display},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            admissionregistration::v1::{
                MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
            },
            core::v1::ConfigMap,
        },
        ByteString,
    },
    kube::{runtime::reflector::ObjectRef, Resource},
};
use strum::EnumString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cert_manager::CA_BUNDLE_KEY,
    metrics::Metrics,
    store::{self, retry_on_conflict, ObjectStore, DEFAULT_CONFLICT_ATTEMPTS},
    watch::{sleep_or_cancel, watch_object, WatchBackoff},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unknown webhook kind {kind:?}, expected \"mutating\" or \"validating\""))]
    UnknownWebhookKind { kind: String },

    #[snafu(display("invalid webhook reference {reference:?}, expected \"<kind>:<name>\""))]
    InvalidWebhookRef { reference: String },

    #[snafu(display("failed to read CA bundle from {config_map}"))]
    ReadCaBundle {
        source: store::Error,
        config_map: ObjectRef<ConfigMap>,
    },

    #[snafu(display("failed to patch {webhook}"))]
    PatchMutatingWebhook {
        source: store::Error,
        webhook: ObjectRef<MutatingWebhookConfiguration>,
    },

    #[snafu(display("failed to patch {webhook}"))]
    PatchValidatingWebhook {
        source: store::Error,
        webhook: ObjectRef<ValidatingWebhookConfiguration>,
    },

    #[snafu(display("failed to watch CA bundle"), context(false))]
    WatchCaBundle { source: store::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::UnknownWebhookKind { .. } | Error::InvalidWebhookRef { .. } => true,
            Error::ReadCaBundle { source, .. }
            | Error::PatchMutatingWebhook { source, .. }
            | Error::PatchValidatingWebhook { source, .. }
            | Error::WatchCaBundle { source } => source.is_fatal(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum WebhookKind {
    Mutating,
    Validating,
}

impl WebhookKind {
    pub fn parse(kind: &str) -> Result<Self> {
        Self::from_str(kind).map_err(|_| Error::UnknownWebhookKind {
            kind: kind.to_string(),
        })
    }
}

/// A webhook configuration resource (cluster-scoped) that must trust our CA.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WebhookRef {
    pub name: String,
    pub kind: WebhookKind,
}

impl FromStr for WebhookRef {
    type Err = Error;

    /// Parses `<kind>:<name>`, such as `mutating:my-webhook`.
    fn from_str(reference: &str) -> Result<Self> {
        let (kind, name) = reference
            .split_once(':')
            .filter(|(_, name)| !name.is_empty())
            .context(InvalidWebhookRefSnafu { reference })?;
        Ok(Self {
            name: name.to_string(),
            kind: WebhookKind::parse(kind)?,
        })
    }
}

/// One reference per distinct kind, all named after the webhook itself.
pub fn determine_webhook_refs(
    name: &str,
    kinds: impl IntoIterator<Item = WebhookKind>,
) -> Vec<WebhookRef> {
    kinds
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|kind| WebhookRef {
            name: name.to_string(),
            kind,
        })
        .collect()
}

/// A webhook configuration whose entries each carry their own CA bundle.
trait WebhookConfiguration: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    /// Sets the CA bundle of every entry, returning the number of entries.
    fn set_ca_bundle(&mut self, bundle: &[u8]) -> usize;
}

impl WebhookConfiguration for MutatingWebhookConfiguration {
    fn set_ca_bundle(&mut self, bundle: &[u8]) -> usize {
        let webhooks = self.webhooks.get_or_insert_with(Vec::new);
        for webhook in webhooks.iter_mut() {
            webhook.client_config.ca_bundle = Some(ByteString(bundle.to_vec()));
        }
        webhooks.len()
    }
}

impl WebhookConfiguration for ValidatingWebhookConfiguration {
    fn set_ca_bundle(&mut self, bundle: &[u8]) -> usize {
        let webhooks = self.webhooks.get_or_insert_with(Vec::new);
        for webhook in webhooks.iter_mut() {
            webhook.client_config.ca_bundle = Some(ByteString(bundle.to_vec()));
        }
        webhooks.len()
    }
}

/// Reads `name` fresh and writes `bundle` into all of its entries.
///
/// Returns `None` if the configuration does not exist (yet), which is not an error.
async fn write_ca_bundle<K: WebhookConfiguration>(
    store: &dyn ObjectStore<K>,
    name: &str,
    bundle: &[u8],
) -> store::Result<Option<usize>> {
    let Some(mut webhook) = store.get_opt(name).await? else {
        return Ok(None);
    };
    let entries = webhook.set_ca_bundle(bundle);
    store.replace(&webhook).await?;
    Ok(Some(entries))
}

pub struct CaBundleSyncer {
    config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    mutating_webhooks: Arc<dyn ObjectStore<MutatingWebhookConfiguration>>,
    validating_webhooks: Arc<dyn ObjectStore<ValidatingWebhookConfiguration>>,
    namespace: String,
    config_map_name: String,
    refs: Vec<WebhookRef>,
    resync_interval: Duration,
    metrics: Metrics,
}

impl Debug for CaBundleSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaBundleSyncer")
            .field("config_map", &self.config_map_ref())
            .field("refs", &self.refs)
            .finish_non_exhaustive()
    }
}

impl CaBundleSyncer {
    pub fn new(
        config_maps: Arc<dyn ObjectStore<ConfigMap>>,
        mutating_webhooks: Arc<dyn ObjectStore<MutatingWebhookConfiguration>>,
        validating_webhooks: Arc<dyn ObjectStore<ValidatingWebhookConfiguration>>,
        namespace: &str,
        config_map_name: &str,
        refs: Vec<WebhookRef>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            config_maps,
            mutating_webhooks,
            validating_webhooks,
            namespace: namespace.to_string(),
            config_map_name: config_map_name.to_string(),
            refs,
            resync_interval,
            metrics: Metrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    fn config_map_ref(&self) -> ObjectRef<ConfigMap> {
        ObjectRef::new(&self.config_map_name).within(&self.namespace)
    }

    /// Syncs on every change of the CA bundle ConfigMap (starting with its current state), and
    /// every `resync_interval` to undo edits made by others, until `cancel` fires.
    pub async fn start(&self, cancel: &CancellationToken, backoff: WatchBackoff) -> Result<()> {
        info!(
            config_map = %self.config_map_ref(),
            webhooks = ?self.refs,
            "Starting CA bundle syncer"
        );
        let watch = watch_object(
            &*self.config_maps,
            &self.config_map_name,
            backoff,
            cancel,
            |cm| async move { self.log_transient(self.sync_from_config_map(&cm).await) },
        );
        let resync = async {
            while !sleep_or_cancel(self.resync_interval, cancel).await {
                self.log_transient(self.sync_ca_bundle().await)?;
            }
            Ok::<_, Error>(())
        };
        tokio::try_join!(watch, resync)?;
        info!("Stopping CA bundle syncer");
        Ok(())
    }

    fn log_transient(&self, res: Result<()>) -> Result<()> {
        match res {
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(
                    config_map = %self.config_map_ref(),
                    error = &err as &dyn std::error::Error,
                    "Failed to sync CA bundle, will retry"
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Reads the CA bundle ConfigMap and syncs its contents, if any.
    pub async fn sync_ca_bundle(&self) -> Result<()> {
        let config_map = self
            .config_maps
            .get_opt(&self.config_map_name)
            .await
            .with_context(|_| ReadCaBundleSnafu {
                config_map: self.config_map_ref(),
            })?;
        match config_map {
            Some(cm) => self.sync_from_config_map(&cm).await,
            None => {
                debug!(
                    config_map = %self.config_map_ref(),
                    "CA bundle has not been published yet, nothing to sync"
                );
                Ok(())
            }
        }
    }

    /// Writes the bundle from `cm` into every referenced webhook configuration.
    ///
    /// A missing or empty bundle is skipped rather than wiping the bundle that the webhooks
    /// currently trust. All references are attempted, the first failure is returned.
    pub async fn sync_from_config_map(&self, cm: &ConfigMap) -> Result<()> {
        let bundle = cm
            .data
            .as_ref()
            .and_then(|data| data.get(CA_BUNDLE_KEY))
            .filter(|bundle| !bundle.is_empty());
        let Some(bundle) = bundle else {
            debug!(
                config_map = %self.config_map_ref(),
                key = CA_BUNDLE_KEY,
                "CA bundle is empty, nothing to sync"
            );
            return Ok(());
        };

        let mut first_error = None;
        for webhook in &self.refs {
            if let Err(err) = self.patch_webhook(webhook, bundle.as_bytes()).await {
                warn!(
                    webhook = %webhook.name,
                    kind = %webhook.kind,
                    error = &err as &dyn std::error::Error,
                    "Failed to patch webhook configuration"
                );
                first_error.get_or_insert(err);
            }
        }
        self.metrics.ca_bundle_synced(first_error.is_none());
        first_error.map_or(Ok(()), Err)
    }

    pub async fn patch_webhook(&self, webhook: &WebhookRef, bundle: &[u8]) -> Result<()> {
        match webhook.kind {
            WebhookKind::Mutating => self.patch_mutating_webhook(&webhook.name, bundle).await,
            WebhookKind::Validating => self.patch_validating_webhook(&webhook.name, bundle).await,
        }
    }

    pub async fn patch_mutating_webhook(&self, name: &str, bundle: &[u8]) -> Result<()> {
        let webhook = ObjectRef::<MutatingWebhookConfiguration>::new(name);
        let entries = retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || {
            write_ca_bundle(&*self.mutating_webhooks, name, bundle)
        })
        .await
        .context(PatchMutatingWebhookSnafu {
            webhook: webhook.clone(),
        })?;
        log_patched(&webhook, entries);
        Ok(())
    }

    pub async fn patch_validating_webhook(&self, name: &str, bundle: &[u8]) -> Result<()> {
        let webhook = ObjectRef::<ValidatingWebhookConfiguration>::new(name);
        let entries = retry_on_conflict(DEFAULT_CONFLICT_ATTEMPTS, || {
            write_ca_bundle(&*self.validating_webhooks, name, bundle)
        })
        .await
        .context(PatchValidatingWebhookSnafu {
            webhook: webhook.clone(),
        })?;
        log_patched(&webhook, entries);
        Ok(())
    }
}

fn log_patched(webhook: &dyn Display, entries: Option<usize>) {
    match entries {
        Some(entries) => info!(%webhook, entries, "Updated CA bundle of webhook configuration"),
        None => debug!(%webhook, "Webhook configuration does not exist, skipping"),
    }
}
