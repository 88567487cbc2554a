//! Windowed batching on top of a transport executor.
//!
//! [`BatchingExecutor`] collects requests that arrive within one cooperative
//! scheduler turn into per-operation-kind groups, merges each group through
//! [`crate::merge`], executes the merged request once on the inner
//! [`Executor`], and settles every constituent with its share of the combined
//! response via [`crate::split`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use apollo_compiler::ast;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use tower::BoxError;

use crate::context::Context;
use crate::error::FetchError;
use crate::graphql;
use crate::graphql::ResponseStream;
use crate::merge::merge_operations;
use crate::signal;
use crate::signal::AbortSignal;
use crate::split::split_response;

/// GraphQL operation kind. Requests of different kinds never share a batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub const fn default_type_name(&self) -> &'static str {
        match self {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.default_type_name())
    }
}

impl FromStr for OperationKind {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(OperationKind::Query),
            "mutation" => Ok(OperationKind::Mutation),
            "subscription" => Ok(OperationKind::Subscription),
            other => Err(FetchError::MalformedRequest {
                reason: format!("unknown operation kind {other:?}"),
            }),
        }
    }
}

impl From<OperationKind> for ast::OperationType {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Query => ast::OperationType::Query,
            OperationKind::Mutation => ast::OperationType::Mutation,
            OperationKind::Subscription => ast::OperationType::Subscription,
        }
    }
}

impl From<ast::OperationType> for OperationKind {
    fn from(operation_type: ast::OperationType) -> Self {
        match operation_type {
            ast::OperationType::Query => OperationKind::Query,
            ast::OperationType::Mutation => OperationKind::Mutation,
            ast::OperationType::Subscription => OperationKind::Subscription,
        }
    }
}

/// One request on its way to the transport, together with the cross-cutting
/// state the transport needs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The wire request.
    pub request: graphql::Request,
    /// What kind of operation the request resolves to.
    pub operation_kind: OperationKind,
    /// Context shared between the caller and the transport.
    pub context: Context,
    /// Cancellation source for this request, if any.
    pub signal: Option<AbortSignal>,
}

#[buildstructor::buildstructor]
impl ExecutionRequest {
    /// This is the constructor (or builder) to use when constructing an
    /// `ExecutionRequest`.
    #[builder(visibility = "pub")]
    fn new(
        request: graphql::Request,
        operation_kind: Option<OperationKind>,
        context: Option<Context>,
        signal: Option<AbortSignal>,
    ) -> Self {
        Self {
            request,
            operation_kind: operation_kind.unwrap_or_default(),
            context: context.unwrap_or_default(),
            signal,
        }
    }
}

/// Transport seam: executes one GraphQL request against an upstream service.
pub trait Executor: Send + Sync + 'static {
    /// Execute a request to a single response.
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> BoxFuture<'static, Result<graphql::Response, BoxError>>;

    /// Execute a request to a response stream. The default wraps [`execute`]
    /// in a one-element stream, for transports without native streaming.
    ///
    /// [`execute`]: Executor::execute
    fn execute_stream(
        &self,
        request: ExecutionRequest,
    ) -> BoxFuture<'static, Result<ResponseStream, BoxError>> {
        let response = self.execute(request);
        Box::pin(async move {
            let response = response.await?;
            Ok(stream::once(async move { response }).boxed() as ResponseStream)
        })
    }
}

struct Waiter {
    request: ExecutionRequest,
    sender: oneshot::Sender<Result<graphql::Response, FetchError>>,
}

/// Batches requests arriving within one cooperative turn into a single
/// upstream call per operation kind.
///
/// Cloning is cheap and clones share the same pending groups, so one
/// `BatchingExecutor` per upstream service is the intended shape.
#[derive(Clone)]
pub struct BatchingExecutor {
    inner: Arc<dyn Executor>,
    groups: Arc<Mutex<HashMap<OperationKind, Vec<Waiter>>>>,
}

impl BatchingExecutor {
    /// Wrap a transport executor with windowed batching.
    pub fn new(inner: Arc<dyn Executor>) -> Self {
        Self {
            inner,
            groups: Default::default(),
        }
    }

    /// Execute one request, transparently batching it with any other request
    /// of the same operation kind that arrives in the same scheduler turn.
    ///
    /// Subscriptions bypass batching entirely and go straight to the inner
    /// executor.
    pub async fn call(&self, request: ExecutionRequest) -> Result<graphql::Response, BoxError> {
        let kind = request.operation_kind;
        if kind == OperationKind::Subscription {
            return self.inner.execute(request).await;
        }

        let (sender, receiver) = oneshot::channel();
        let spawn_flush = {
            let mut groups = self.groups.lock();
            let group = groups.entry(kind).or_default();
            group.push(Waiter { request, sender });
            group.len() == 1
        };
        if spawn_flush {
            let executor = self.clone();
            tokio::spawn(async move {
                // One cooperative turn: whatever is already scheduled on the
                // runtime gets its chance to enqueue before the flush drains
                // the group.
                tokio::task::yield_now().await;
                let waiters = executor
                    .groups
                    .lock()
                    .remove(&kind)
                    .unwrap_or_default();
                executor.flush_group(kind, waiters).await;
            });
        }

        let result = receiver
            .await
            .map_err(|_| FetchError::SubrequestBatchingError {
                reason: "batch flush dropped before completion".to_string(),
            })?;
        Ok(result?)
    }

    /// Execute a subscription to a response stream, bypassing batching.
    pub fn subscribe(
        &self,
        request: ExecutionRequest,
    ) -> BoxFuture<'static, Result<ResponseStream, BoxError>> {
        self.inner.execute_stream(request)
    }

    async fn flush_group(&self, kind: OperationKind, waiters: Vec<Waiter>) {
        if waiters.is_empty() {
            return;
        }
        tracing::debug!(kind = %kind, size = waiters.len(), "flushing batch window");

        let (requests, senders): (Vec<_>, Vec<_>) = waiters
            .into_iter()
            .map(|waiter| (waiter.request, waiter.sender))
            .unzip();
        let signal = signal::combine(
            requests
                .iter()
                .filter_map(|request| request.signal.clone())
                .collect(),
        );

        let merged = match merge_operations(requests) {
            Ok(merged) => merged,
            Err(error) => {
                for sender in senders {
                    let _ = sender.send(Err(error.clone()));
                }
                return;
            }
        };
        let (mut request, count) = merged.into_parts();
        request.signal = signal.clone();
        debug_assert_eq!(count, senders.len());

        match self.execute_guarded(request, signal).await {
            Ok(response) => {
                // A singleton window was passed through unaliased, so the
                // combined response already is the constituent's own.
                let responses = if count == 1 {
                    vec![response]
                } else {
                    split_response(response, count)
                };
                for (response, sender) in responses.into_iter().zip_eq(senders) {
                    if sender.send(Ok(response)).is_err() {
                        tracing::debug!("batch constituent dropped before receiving its response");
                    }
                }
            }
            Err(error) => {
                for sender in senders {
                    if sender.send(Err(error.clone())).is_err() {
                        tracing::debug!("batch constituent dropped before receiving its error");
                    }
                }
            }
        }
    }

    async fn execute_guarded(
        &self,
        request: ExecutionRequest,
        signal: Option<AbortSignal>,
    ) -> Result<graphql::Response, FetchError> {
        let execute = self.inner.execute(request);
        let Some(signal) = signal else {
            return execute.await.map_err(transport_error);
        };
        if signal.aborted() {
            return Err(abort_error(&signal));
        }
        tokio::select! {
            biased;
            _ = signal.wait() => Err(abort_error(&signal)),
            result = execute => result.map_err(transport_error),
        }
    }
}

/// A `BatchingExecutor` is itself an [`Executor`], so batching layers and
/// loaders stack on top of one another.
impl Executor for BatchingExecutor {
    fn execute(
        &self,
        request: ExecutionRequest,
    ) -> BoxFuture<'static, Result<graphql::Response, BoxError>> {
        let executor = self.clone();
        Box::pin(async move { executor.call(request).await })
    }

    fn execute_stream(
        &self,
        request: ExecutionRequest,
    ) -> BoxFuture<'static, Result<ResponseStream, BoxError>> {
        if request.operation_kind == OperationKind::Subscription {
            return self.subscribe(request);
        }
        let executor = self.clone();
        Box::pin(async move {
            let response = executor.call(request).await?;
            Ok(stream::once(async move { response }).boxed() as ResponseStream)
        })
    }
}

fn transport_error(error: BoxError) -> FetchError {
    FetchError::SubrequestBatchingError {
        reason: error.to_string(),
    }
}

fn abort_error(signal: &AbortSignal) -> FetchError {
    FetchError::BatchAborted {
        reason: signal
            .reason()
            .map(|reason| reason.to_string())
            .unwrap_or_else(|| "aborted".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use serde_json_bytes::json;
    use test_log::test;

    use super::*;
    use crate::json_ext::Object;
    use crate::signal::AbortController;

    /// Answers every top-level field with its own field name, under the
    /// field's response key, and counts upstream calls.
    #[derive(Default)]
    struct EchoExecutor {
        calls: AtomicUsize,
    }

    impl Executor for EchoExecutor {
        fn execute(
            &self,
            request: ExecutionRequest,
        ) -> BoxFuture<'static, Result<graphql::Response, BoxError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let query = request.request.query.unwrap_or_default();
            Box::pin(async move {
                let document = ast::Document::parse(&query, "upstream.graphql")
                    .map_err(|errors| errors.to_string())?;
                let mut data = Object::new();
                for definition in &document.definitions {
                    let ast::Definition::OperationDefinition(operation) = definition else {
                        continue;
                    };
                    for selection in &operation.selection_set {
                        if let ast::Selection::Field(field) = selection {
                            let key = field.alias.as_ref().unwrap_or(&field.name);
                            data.insert(key.as_str().to_string(), json!(field.name.as_str()));
                        }
                    }
                }
                Ok(graphql::Response::builder()
                    .data(serde_json_bytes::Value::Object(data))
                    .build())
            })
        }
    }

    struct FailingExecutor;

    impl Executor for FailingExecutor {
        fn execute(
            &self,
            _request: ExecutionRequest,
        ) -> BoxFuture<'static, Result<graphql::Response, BoxError>> {
            Box::pin(async { Err("connection reset".into()) })
        }
    }

    struct PendingExecutor;

    impl Executor for PendingExecutor {
        fn execute(
            &self,
            _request: ExecutionRequest,
        ) -> BoxFuture<'static, Result<graphql::Response, BoxError>> {
            Box::pin(futures::future::pending())
        }
    }

    fn query_request(query: &str) -> ExecutionRequest {
        ExecutionRequest::builder()
            .request(graphql::Request::builder().query(query.to_string()).build())
            .build()
    }

    #[test(tokio::test)]
    async fn coalesces_one_window_into_one_upstream_call() {
        let inner = Arc::new(EchoExecutor::default());
        let executor = BatchingExecutor::new(inner.clone());

        let (first, second) = tokio::join!(
            executor.call(query_request("{ topProducts }")),
            executor.call(query_request("{ me }")),
        );

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.unwrap().data,
            Some(json!({ "topProducts": "topProducts" }))
        );
        assert_eq!(second.unwrap().data, Some(json!({ "me": "me" })));
    }

    #[test(tokio::test)]
    async fn separates_windows_by_operation_kind() {
        let inner = Arc::new(EchoExecutor::default());
        let executor = BatchingExecutor::new(inner.clone());

        let mutation = ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query("mutation { set }".to_string())
                    .build(),
            )
            .operation_kind(OperationKind::Mutation)
            .build();
        let (first, second) = tokio::join!(
            executor.call(query_request("{ me }")),
            executor.call(mutation),
        );

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.unwrap().data, Some(json!({ "me": "me" })));
        assert_eq!(second.unwrap().data, Some(json!({ "set": "set" })));
    }

    #[test(tokio::test)]
    async fn singleton_window_keeps_its_response_untouched() {
        struct CannedExecutor;

        impl Executor for CannedExecutor {
            fn execute(
                &self,
                _request: ExecutionRequest,
            ) -> BoxFuture<'static, Result<graphql::Response, BoxError>> {
                Box::pin(async {
                    Ok(graphql::Response::builder()
                        .data(json!({ "me": { "id": "1" } }))
                        .errors(vec![
                            graphql::Error::builder()
                                .message("partial failure")
                                .path(crate::json_ext::Path::from("me/name"))
                                .extension_code("DOWNSTREAM")
                                .build(),
                        ])
                        .build())
                })
            }
        }

        let executor = BatchingExecutor::new(Arc::new(CannedExecutor));
        let response = executor
            .call(query_request("{ me { id name } }"))
            .await
            .unwrap();

        assert_eq!(response.data, Some(json!({ "me": { "id": "1" } })));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(
            response.errors[0].path,
            Some(crate::json_ext::Path::from("me/name"))
        );
    }

    #[test(tokio::test)]
    async fn later_windows_flush_separately() {
        let inner = Arc::new(EchoExecutor::default());
        let executor = BatchingExecutor::new(inner.clone());

        executor.call(query_request("{ a }")).await.unwrap();
        executor.call(query_request("{ b }")).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test(tokio::test)]
    async fn subscriptions_bypass_batching() {
        let inner = Arc::new(EchoExecutor::default());
        let executor = BatchingExecutor::new(inner.clone());

        let subscription = ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query("subscription { events }".to_string())
                    .build(),
            )
            .operation_kind(OperationKind::Subscription)
            .build();
        let response = executor.call(subscription).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.data, Some(json!({ "events": "events" })));
    }

    #[test(tokio::test)]
    async fn subscriptions_forward_while_a_query_window_is_open() {
        let inner = Arc::new(EchoExecutor::default());
        let executor = BatchingExecutor::new(inner.clone());

        let subscription = ExecutionRequest::builder()
            .request(
                graphql::Request::builder()
                    .query("subscription { events }".to_string())
                    .build(),
            )
            .operation_kind(OperationKind::Subscription)
            .build();
        let (first, second, third) = tokio::join!(
            executor.call(query_request("{ a }")),
            executor.call(query_request("{ b }")),
            executor.call(subscription),
        );

        // One merged call for the query window, one individual call for the
        // subscription.
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.unwrap().data, Some(json!({ "a": "a" })));
        assert_eq!(second.unwrap().data, Some(json!({ "b": "b" })));
        assert_eq!(third.unwrap().data, Some(json!({ "events": "events" })));
    }

    #[test(tokio::test)]
    async fn transport_failure_reaches_every_constituent() {
        let executor = BatchingExecutor::new(Arc::new(FailingExecutor));

        let (first, second) = tokio::join!(
            executor.call(query_request("{ a }")),
            executor.call(query_request("{ b }")),
        );

        for result in [first, second] {
            let error = result.unwrap_err().to_string();
            assert!(error.contains("connection reset"), "{error}");
        }
    }

    #[test(tokio::test)]
    async fn merge_failure_reaches_every_constituent() {
        let inner = Arc::new(EchoExecutor::default());
        let executor = BatchingExecutor::new(inner.clone());

        let (first, second) = tokio::join!(
            executor.call(query_request("{ a }")),
            executor.call(query_request("not graphql")),
        );

        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        for result in [first, second] {
            let error = result.unwrap_err().to_string();
            assert!(error.contains("failed to parse"), "{error}");
        }
    }

    #[test(tokio::test)]
    async fn abort_settles_the_whole_window() {
        let executor = BatchingExecutor::new(Arc::new(PendingExecutor));
        let controller = AbortController::new();

        let first = ExecutionRequest::builder()
            .request(graphql::Request::builder().query("{ a }".to_string()).build())
            .signal(controller.signal())
            .build();
        let second = query_request("{ b }");

        let first = executor.call(first);
        let second = executor.call(second);
        let abort = async {
            // Let the window flush and the upstream call start before
            // aborting it.
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            controller.abort("client went away");
        };
        let (first, second, _) = tokio::join!(first, second, abort);

        for result in [first, second] {
            let error = result.unwrap_err().to_string();
            assert!(error.contains("client went away"), "{error}");
        }
    }
}
