//! Minimal get/create/replace/watch access to Kubernetes objects
//!
//! Every write is conditional on the `resourceVersion` carried in the object's metadata,
//! so concurrent writers (such as two replicas that briefly both believe they lead) lose
//! with a [`Error::Conflict`] rather than silently overwriting each other.

use std::{fmt::Debug, future::Future};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt as _, TryStreamExt as _};
use serde::{de::DeserializeOwned, Serialize};
use snafu::Snafu;
use stackable_operator::kube::{
    self,
    api::{Api, PostParams},
    runtime::{watcher, WatchStreamExt as _},
    Resource,
};
use tracing::debug;

#[cfg(test)]
pub mod memory;

/// Number of attempts [`retry_on_conflict`] makes by default.
pub const DEFAULT_CONFLICT_ATTEMPTS: usize = 5;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{object} was modified concurrently"))]
    Conflict { object: String },

    #[snafu(display("{object} does not exist"))]
    NotFound { object: String },

    #[snafu(display("failed to access {object}"))]
    Api { source: kube::Error, object: String },

    #[snafu(display("failed to watch {object}"))]
    Watch {
        source: watcher::Error,
        object: String,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Whether retrying can never succeed, because the credentials we run with are rejected.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Conflict { .. } | Error::NotFound { .. } => false,
            Error::Api { source, .. } => kube_error_is_fatal(source),
            Error::Watch { source, .. } => match source {
                watcher::Error::InitialListFailed(err) | watcher::Error::WatchStartFailed(err) => {
                    kube_error_is_fatal(err)
                }
                _ => false,
            },
        }
    }
}

fn kube_error_is_fatal(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(response) => response.code == 401 || response.code == 403,
        kube::Error::Auth(_) => true,
        _ => false,
    }
}

fn classify_kube_error(err: kube::Error, object: String) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 409 => Error::Conflict { object },
        kube::Error::Api(response) if response.code == 404 => Error::NotFound { object },
        source => Error::Api { source, object },
    }
}

/// Human-readable reference to an object, used in errors and logs.
pub fn describe<K: Resource<DynamicType = ()>>(name: &str) -> String {
    format!("{}/{name}", K::kind(&()))
}

/// Access to the objects of one kind within one namespace (or cluster scope).
#[async_trait]
pub trait ObjectStore<K: Send + Sync>: Send + Sync {
    /// Fetches the object, returning [`None`] if it does not exist.
    async fn get_opt(&self, name: &str) -> Result<Option<K>>;

    /// Creates the object, failing with [`Error::Conflict`] if it already exists.
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replaces the object, conditional on the `resourceVersion` in its metadata.
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Streams the object named `name` every time it is applied (created or modified).
    ///
    /// The stream surfaces transport errors but keeps going afterwards, the caller decides how
    /// long to back off.
    fn watch(&self, name: &str) -> BoxStream<'static, Result<K>>;
}

#[async_trait]
impl<K> ObjectStore<K> for Api<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        Api::<K>::get_opt(self, name)
            .await
            .map_err(|err| classify_kube_error(err, describe::<K>(name)))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        Api::<K>::create(self, &PostParams::default(), obj)
            .await
            .map_err(|err| classify_kube_error(err, describe::<K>(&name)))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        Api::<K>::replace(self, &name, &PostParams::default(), obj)
            .await
            .map_err(|err| classify_kube_error(err, describe::<K>(&name)))
    }

    fn watch(&self, name: &str) -> BoxStream<'static, Result<K>> {
        let object = describe::<K>(name);
        watcher(
            self.clone(),
            watcher::Config::default().fields(&format!("metadata.name={name}")),
        )
        .applied_objects()
        .map_err(move |source| Error::Watch {
            source,
            object: object.clone(),
        })
        .boxed()
    }
}

/// Runs a read-modify-write cycle `f` until it stops conflicting, at most `attempts` times.
///
/// `f` must re-read the object on every call, otherwise it keeps writing the same stale version.
pub async fn retry_on_conflict<T, F, Fut>(attempts: usize, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Err(err) if err.is_conflict() && attempt < attempts => {
                debug!(attempt, error = %err, "write conflicted, retrying with a fresh read");
                attempt += 1;
            }
            res => return res,
        }
    }
}
