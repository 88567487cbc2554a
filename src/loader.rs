//! Keyed batch loading over an [`Executor`].
//!
//! A [`KeyedBatchLoader`] collects the keys requested within one cooperative
//! scheduler turn, deduplicates them, and asks its [`KeyedResolver`] to turn
//! the distinct keys into a single upstream request. The combined result is
//! then fanned back out so every caller receives the value and the errors
//! that belong to its own key.

use std::hash::Hash;
use std::sync::Arc;

use displaydoc::Display;
use indexmap::IndexMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::error::FetchError;
use crate::executor::ExecutionRequest;
use crate::executor::Executor;
use crate::graphql;
use crate::graphql::ErrorExtension;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::json_ext::Value;

/// Domain seam of a [`KeyedBatchLoader`]: how keys become one upstream
/// request, and how the combined result maps back to per-key values.
pub trait KeyedResolver<K, V>: Send + Sync + 'static {
    /// Build the single upstream request that loads all of `keys` at once.
    /// The keys are distinct and in first-request order.
    fn request_from_keys(&self, keys: &[K]) -> Result<ExecutionRequest, FetchError>;

    /// Extract one value per key from the combined response data, in key
    /// order. A key the upstream did not resolve maps to `None`.
    fn values_from_result(&self, data: &Option<Value>, keys: &[K]) -> Vec<Option<V>>;
}

/// Failure of a single [`KeyedBatchLoader::load`] call.
#[derive(Error, Display, Debug, Clone)]
pub enum LoadError {
    /// upstream batched call failed: {0}
    Fetch(FetchError),
    /// upstream returned errors for this key
    Graphql(Vec<graphql::Error>),
}

impl ErrorExtension for LoadError {}

type LoadResult<V> = Result<Option<V>, LoadError>;
type LoadSender<V> = oneshot::Sender<LoadResult<V>>;

/// Batches keyed lookups arriving within one cooperative turn into a single
/// upstream call, deduplicating keys across callers.
///
/// Clones share the same pending batch, so one loader per upstream entity
/// type is the intended shape.
pub struct KeyedBatchLoader<K, V> {
    executor: Arc<dyn Executor>,
    resolver: Arc<dyn KeyedResolver<K, V>>,
    batch: Arc<Mutex<IndexMap<K, Vec<LoadSender<V>>>>>,
}

impl<K, V> Clone for KeyedBatchLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            resolver: self.resolver.clone(),
            batch: self.batch.clone(),
        }
    }
}

impl<K, V> KeyedBatchLoader<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Create a loader that resolves keys through `resolver` and executes the
    /// resolver's requests on `executor`.
    pub fn new(executor: Arc<dyn Executor>, resolver: Arc<dyn KeyedResolver<K, V>>) -> Self {
        Self {
            executor,
            resolver,
            batch: Default::default(),
        }
    }

    /// Load the value for one key, batching with every other key requested in
    /// the same scheduler turn.
    ///
    /// A `None` key short-circuits to `Ok(None)` without touching the batch.
    pub async fn load(&self, key: Option<K>) -> LoadResult<V> {
        let Some(key) = key else {
            return Ok(None);
        };
        let receiver = {
            let mut batch = self.batch.lock();
            let spawn_flush = batch.is_empty();
            let (sender, receiver) = oneshot::channel();
            batch.entry(key).or_default().push(sender);
            if spawn_flush {
                self.spawn_flush();
            }
            receiver
        };
        await_settlement(receiver).await
    }

    /// Load the values for several keys in one go, preserving input order in
    /// the output. Duplicate keys resolve to the same single upstream lookup.
    pub async fn load_many(&self, keys: Vec<K>) -> Vec<LoadResult<V>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let receivers: Vec<_> = {
            let mut batch = self.batch.lock();
            let spawn_flush = batch.is_empty();
            let receivers = keys
                .into_iter()
                .map(|key| {
                    let (sender, receiver) = oneshot::channel();
                    batch.entry(key).or_default().push(sender);
                    receiver
                })
                .collect();
            if spawn_flush {
                self.spawn_flush();
            }
            receivers
        };

        let mut results = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            results.push(await_settlement(receiver).await);
        }
        results
    }

    fn spawn_flush(&self) {
        let loader = self.clone();
        tokio::spawn(async move {
            // One cooperative turn to let concurrent loads join the batch.
            tokio::task::yield_now().await;
            let batch = std::mem::take(&mut *loader.batch.lock());
            loader.flush(batch).await;
        });
    }

    async fn flush(&self, batch: IndexMap<K, Vec<LoadSender<V>>>) {
        if batch.is_empty() {
            return;
        }
        let keys: Vec<K> = batch.keys().cloned().collect();
        tracing::debug!(size = keys.len(), "flushing keyed batch");

        let request = match self.resolver.request_from_keys(&keys) {
            Ok(request) => request,
            Err(error) => {
                settle_all(batch, Err(LoadError::Fetch(error)));
                return;
            }
        };
        let response = match self.executor.execute(request).await {
            Ok(response) => response,
            Err(error) => {
                settle_all(
                    batch,
                    Err(LoadError::Fetch(FetchError::SubrequestBatchingError {
                        reason: error.to_string(),
                    })),
                );
                return;
            }
        };

        let mut values = self.resolver.values_from_result(&response.data, &keys);
        values.truncate(keys.len());
        values.resize_with(keys.len(), || None);

        let mut key_errors: Vec<Vec<graphql::Error>> = vec![Vec::new(); keys.len()];
        for error in response.errors {
            match attribute_key_error(&error, keys.len()) {
                Some((index, relocated)) => key_errors[index].push(relocated),
                None => {
                    for errors in key_errors.iter_mut() {
                        errors.push(error.clone());
                    }
                }
            }
        }

        for (((_, senders), value), errors) in batch.into_iter().zip(values).zip(key_errors) {
            let result = if errors.is_empty() {
                Ok(value)
            } else {
                Err(LoadError::Graphql(errors))
            };
            for sender in senders {
                if sender.send(result.clone()).is_err() {
                    tracing::debug!("load dropped before receiving its value");
                }
            }
        }
    }
}

async fn await_settlement<V>(receiver: oneshot::Receiver<LoadResult<V>>) -> LoadResult<V> {
    receiver.await.unwrap_or_else(|_| {
        Err(LoadError::Fetch(FetchError::SubrequestBatchingError {
            reason: "batch flush dropped before completion".to_string(),
        }))
    })
}

fn settle_all<K, V: Clone>(
    batch: IndexMap<K, Vec<LoadSender<V>>>,
    result: LoadResult<V>,
) {
    for (_, senders) in batch {
        for sender in senders {
            let _ = sender.send(result.clone());
        }
    }
}

/// Attribute a combined-result error to a single key.
///
/// Upstream batched lookups return list-shaped data, so an error below the
/// list names its key by list index: either `[field, index, ..rest]` or
/// `[index, ..rest]`. The returned error keeps only the `rest` of the path,
/// the part that is meaningful relative to one key's value.
fn attribute_key_error(error: &graphql::Error, count: usize) -> Option<(usize, graphql::Error)> {
    let path = error.path.as_ref()?;
    let (index, rest) = match path.0.as_slice() {
        [PathElement::Key(_), PathElement::Index(index), rest @ ..] => (*index, rest),
        [PathElement::Index(index), rest @ ..] => (*index, rest),
        _ => return None,
    };
    if index >= count {
        return None;
    }
    let mut relocated = error.clone();
    relocated.path = Some(Path(rest.to_vec()));
    Some((index, relocated))
}
