//! In-memory [`ObjectStore`] with the optimistic concurrency semantics of the Kubernetes API

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt as _};
use stackable_operator::kube::{self, error::ErrorResponse, runtime::watcher, Resource};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{classify_kube_error, describe, Error, ObjectStore, Result};

pub struct MemoryStore<K> {
    state: Mutex<State<K>>,
    updates: broadcast::Sender<K>,
    writes: AtomicUsize,
}

struct State<K> {
    objects: BTreeMap<String, K>,
    next_version: u64,
    injected_failures: Vec<u16>,
    injected_watch_failures: Vec<u16>,
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_objects([])
    }

    /// Seeds the store, without counting the seeded objects as writes.
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let (updates, _) = broadcast::channel(64);
        let store = Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                next_version: 1,
                injected_failures: Vec::new(),
                injected_watch_failures: Vec::new(),
            }),
            updates,
            writes: AtomicUsize::new(0),
        };
        for obj in objects {
            store.put(obj);
        }
        store
    }

    /// Stores `obj` unconditionally, as another client editing the object would.
    pub fn put(&self, mut obj: K) {
        let mut state = self.state.lock().unwrap();
        let name = obj.meta().name.clone().unwrap();
        obj.meta_mut().resource_version = Some(state.next_version.to_string());
        state.next_version += 1;
        state.objects.insert(name, obj.clone());
        let _ = self.updates.send(obj);
    }

    pub fn get(&self, name: &str) -> Option<K> {
        self.state.lock().unwrap().objects.get(name).cloned()
    }

    /// Number of successful creates and replaces issued through [`ObjectStore`].
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes the next store operation fail with an API error carrying `code`.
    pub fn fail_next(&self, code: u16) {
        self.state.lock().unwrap().injected_failures.push(code);
    }

    /// Makes the next [`ObjectStore::watch`] fail to start with an API error carrying `code`.
    ///
    /// The failed watch yields that one error and then ends.
    pub fn fail_next_watch(&self, code: u16) {
        self.state.lock().unwrap().injected_watch_failures.push(code);
    }

    fn take_injected_failure(state: &mut State<K>, object: &str) -> Result<()> {
        if state.injected_failures.is_empty() {
            return Ok(());
        }
        let code = state.injected_failures.remove(0);
        Err(classify_kube_error(injected_api_error(code), object.to_string()))
    }

    fn commit(&self, state: &mut State<K>, name: String, mut obj: K) -> K {
        obj.meta_mut().resource_version = Some(state.next_version.to_string());
        state.next_version += 1;
        state.objects.insert(name, obj.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        let _ = self.updates.send(obj.clone());
        obj
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        let mut state = self.state.lock().unwrap();
        Self::take_injected_failure(&mut state, &describe::<K>(name))?;
        Ok(state.objects.get(name).cloned())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let object = describe::<K>(&name);
        let mut state = self.state.lock().unwrap();
        Self::take_injected_failure(&mut state, &object)?;
        if state.objects.contains_key(&name) {
            return Err(Error::Conflict { object });
        }
        Ok(self.commit(&mut state, name, obj.clone()))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let object = describe::<K>(&name);
        let mut state = self.state.lock().unwrap();
        Self::take_injected_failure(&mut state, &object)?;
        let Some(current) = state.objects.get(&name) else {
            return Err(Error::NotFound { object });
        };
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(Error::Conflict { object });
        }
        Ok(self.commit(&mut state, name, obj.clone()))
    }

    fn watch(&self, name: &str) -> BoxStream<'static, Result<K>> {
        let injected = {
            let mut state = self.state.lock().unwrap();
            (!state.injected_watch_failures.is_empty())
                .then(|| state.injected_watch_failures.remove(0))
        };
        if let Some(code) = injected {
            return futures::stream::once(futures::future::ready(Err(Error::Watch {
                source: watcher::Error::WatchStartFailed(injected_api_error(code)),
                object: describe::<K>(name),
            })))
            .boxed();
        }
        // Subscribe before snapshotting, so that no update can fall between the two
        let updates = self.updates.subscribe();
        let initial = self.get(name);
        let name = name.to_string();
        futures::stream::iter(initial.map(Ok))
            .chain(BroadcastStream::new(updates).filter_map(move |update| {
                let matches = update
                    .ok()
                    .filter(|obj| obj.meta().name.as_deref() == Some(name.as_str()));
                async move { matches.map(Ok) }
            }))
            .boxed()
    }
}

fn injected_api_error(code: u16) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "injected failure".to_string(),
        reason: "Injected".to_string(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use futures::StreamExt as _;
    use stackable_operator::k8s_openapi::{
        api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::MemoryStore;
    use crate::store::{Error, ObjectStore};

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let store = MemoryStore::with_objects([config_map("a")]);
        let first = store.get_opt("a").await.unwrap().unwrap();
        let second = first.clone();
        store.replace(&first).await.unwrap();
        assert!(matches!(
            store.replace(&second).await,
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            store.create(&config_map("a")).await,
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            store.replace(&config_map("b")).await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn watch_starts_with_current_state() {
        let store = MemoryStore::with_objects([config_map("a")]);
        let mut events = store.watch("a");
        store.put(config_map("b"));
        store.put(config_map("a"));
        let first = events.next().await.unwrap().unwrap();
        let second = events.next().await.unwrap().unwrap();
        assert_eq!(first.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(second.metadata.resource_version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn injected_watch_failure_ends_the_stream() {
        let store = MemoryStore::with_objects([config_map("a")]);
        store.fail_next_watch(403);
        let mut events = store.watch("a");
        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Watch { .. }));
        assert!(err.is_fatal());
        assert!(events.next().await.is_none());

        // Only the next watch is affected
        let mut events = store.watch("a");
        assert!(events.next().await.unwrap().is_ok());
    }
}
